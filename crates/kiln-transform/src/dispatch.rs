use kiln_config::TransformConfig;
use kiln_module::{flags, MethodDef, Reader, TypeDef, Visibility, Writer};

use crate::element::{attribute_matches, Element, ElementKind};
use crate::pipeline::{Pass, PassContext};
use crate::predicate::{ModulePredicate, NamePattern, Predicate};
use crate::widen::COMPILER_GENERATED;
use crate::TransformError;

/// Name of the injected trampoline method.
pub const HOOK_METHOD: &str = "DirectCallHook";

pub const CONSTRUCTOR_ERROR: &str = "Primary constructor in main class must be public";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub hook: String,
    pub arity: u8,
    /// Index of the target method in the declaring type.
    pub method_index: u16,
}

/// Hook name and arity to method index, stored as the trampoline's body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchTable {
    pub entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    /// Every user-declared method of `ty` is a dispatch target.
    pub fn for_type(ty: &TypeDef) -> Result<Self, TransformError> {
        let mut entries = Vec::new();
        for (index, method) in ty.methods.iter().enumerate() {
            if method.is_constructor()
                || method.is_special_name()
                || method
                    .attributes
                    .iter()
                    .any(|attr| attribute_matches(attr, COMPILER_GENERATED))
            {
                continue;
            }
            let method_index = u16::try_from(index)
                .map_err(|_| TransformError::InvalidDispatchTable("too many methods".into()))?;
            let arity = u8::try_from(method.params.len()).map_err(|_| {
                TransformError::InvalidDispatchTable(format!("{} has too many parameters", method.name))
            })?;
            entries.push(DispatchEntry {
                hook: method.name.clone(),
                arity,
                method_index,
            });
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, hook: &str, arity: u8) -> Option<u16> {
        self.entries
            .iter()
            .find(|entry| entry.hook == hook && entry.arity == arity)
            .map(|entry| entry.method_index)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransformError> {
        let mut writer = Writer::default();
        writer.write_count(self.entries.len(), "dispatch table")?;
        for entry in &self.entries {
            writer.write_string(&entry.hook)?;
            writer.write_u1(entry.arity);
            writer.write_u2(entry.method_index);
        }
        Ok(writer.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransformError> {
        let mut reader = Reader::new(bytes);
        let count = reader.read_u2()? as usize;
        let mut entries = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            entries.push(DispatchEntry {
                hook: reader.read_string()?,
                arity: reader.read_u1()?,
                method_index: reader.read_u2()?,
            });
        }
        reader.ensure_empty()?;
        Ok(Self { entries })
    }
}

/// Injects a [`HOOK_METHOD`] trampoline into each plugin entry type.
///
/// Entry types are those in the plugin namespace named after one of the units
/// being built. An entry type with a non-public parameterless constructor
/// fails its unit and is left untouched.
pub struct FastDispatch {
    module_predicates: Vec<ModulePredicate>,
    predicates: Vec<Predicate>,
}

impl FastDispatch {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            module_predicates: vec![ModulePredicate::Switch {
                name: "fast_dispatch",
                enabled: config.fast_dispatch,
            }],
            predicates: vec![
                Predicate::Namespace {
                    pattern: NamePattern::Equals(config.plugin_namespace.clone()),
                    inverse: false,
                },
                Predicate::UnitEntryPoint,
            ],
        }
    }
}

impl Pass for FastDispatch {
    fn name(&self) -> &'static str {
        "fast-dispatch"
    }

    fn module_predicates(&self) -> &[ModulePredicate] {
        &self.module_predicates
    }

    fn visits(&self, kind: ElementKind) -> bool {
        kind == ElementKind::Type
    }

    fn predicates(&self, _kind: ElementKind) -> &[Predicate] {
        &self.predicates
    }

    fn rewrite(
        &self,
        element: &mut Element<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<bool, TransformError> {
        let ty = &mut *element.ty;

        let hidden_constructor = ty.methods.iter().any(|method| {
            method.is_constructor()
                && !method.is_static()
                && method.params.is_empty()
                && method.visibility() != Visibility::Public
        });
        if hidden_constructor {
            tracing::warn!(target: "kiln.transform", unit = %ty.name, "{CONSTRUCTOR_ERROR}");
            cx.fail_unit(ty.name.clone(), CONSTRUCTOR_ERROR);
            return Ok(false);
        }

        if ty.method(HOOK_METHOD).is_some() {
            return Ok(false);
        }

        let table = DispatchTable::for_type(ty)?;
        let mut hook = MethodDef::new(HOOK_METHOD, flags::PUBLIC);
        hook.params = vec![
            "System.String".to_owned(),
            "System.Object&".to_owned(),
            "System.Object[]".to_owned(),
        ];
        hook.return_type = "System.Boolean".to_owned();
        hook.attributes = vec![COMPILER_GENERATED.to_owned()];
        hook.body = table.encode()?;

        tracing::trace!(target: "kiln.transform", ty = %ty.full_name(), hooks = table.entries.len(), "injected dispatch trampoline");
        ty.methods.push(hook);
        Ok(true)
    }
}
