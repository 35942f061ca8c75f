use kiln_config::TransformConfig;
use kiln_module::{TypeDef, Visibility};

use crate::element::{Element, ElementKind, Target};
use crate::pipeline::{Pass, PassContext};
use crate::predicate::{ModulePredicate, Predicate};
use crate::TransformError;

pub const COMPILER_GENERATED: &str = "System.Runtime.CompilerServices.CompilerGeneratedAttribute";
pub const EXTENSION: &str = "System.Runtime.CompilerServices.ExtensionAttribute";

/// Promotes non-public types, fields, methods and property accessors to public.
///
/// Only runs when `allow_widening` is set, and never on modules whose name
/// starts with a denylisted prefix.
pub struct VisibilityWidening {
    module_predicates: Vec<ModulePredicate>,
    predicates: Vec<Predicate>,
}

impl VisibilityWidening {
    pub fn new(config: &TransformConfig) -> Self {
        let mut module_predicates = vec![ModulePredicate::Switch {
            name: "allow_widening",
            enabled: config.allow_widening,
        }];
        module_predicates.extend(ModulePredicate::deny_prefixes(&config.denylist));

        let predicates = vec![
            Predicate::Visibility {
                public: false,
                is_static: None,
            },
            Predicate::SkipSpecialName,
            Predicate::Attribute {
                name: COMPILER_GENERATED.to_owned(),
                present: false,
            },
            Predicate::Attribute {
                name: EXTENSION.to_owned(),
                present: false,
            },
            Predicate::NotIgnored(config.ignored_names.clone()),
        ];

        Self {
            module_predicates,
            predicates,
        }
    }
}

impl Pass for VisibilityWidening {
    fn name(&self) -> &'static str {
        "visibility-widening"
    }

    fn module_predicates(&self) -> &[ModulePredicate] {
        &self.module_predicates
    }

    fn visits(&self, kind: ElementKind) -> bool {
        matches!(
            kind,
            ElementKind::Type | ElementKind::Property | ElementKind::Field | ElementKind::Method
        )
    }

    fn predicates(&self, _kind: ElementKind) -> &[Predicate] {
        &self.predicates
    }

    fn rewrite(
        &self,
        element: &mut Element<'_>,
        _cx: &mut PassContext<'_>,
    ) -> Result<bool, TransformError> {
        let ty = &mut *element.ty;
        match element.target {
            Target::Type => Ok(widen(&mut ty.flags)),
            Target::Field(i) => Ok(widen(&mut ty.fields[i].flags)),
            Target::Method(i) => Ok(widen(&mut ty.methods[i].flags)),
            Target::Property(i) => {
                let property = &ty.properties[i];
                let accessors: Vec<String> = property
                    .getter
                    .iter()
                    .chain(property.setter.iter())
                    .cloned()
                    .collect();
                let name = property.name.clone();
                let mut changed = false;
                for accessor in accessors {
                    changed |= widen_accessor(ty, &name, &accessor)?;
                }
                Ok(changed)
            }
            Target::Event(_) => Ok(false),
        }
    }
}

fn widen(flags: &mut u16) -> bool {
    if Visibility::from_flags(*flags) == Visibility::Public {
        return false;
    }
    *flags = Visibility::Public.apply(*flags);
    true
}

fn widen_accessor(ty: &mut TypeDef, property: &str, accessor: &str) -> Result<bool, TransformError> {
    let method = ty
        .method_mut(accessor)
        .ok_or_else(|| TransformError::MissingAccessor {
            member: property.to_owned(),
            accessor: accessor.to_owned(),
        })?;
    Ok(widen(&mut method.flags))
}
