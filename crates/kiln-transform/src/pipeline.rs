use kiln_config::TransformConfig;
use kiln_module::{ModuleImage, TypeDef};

use crate::dispatch::FastDispatch;
use crate::element::{Element, ElementKind, Target};
use crate::predicate::{ModulePredicate, Predicate};
use crate::widen::VisibilityWidening;
use crate::TransformError;

/// Error reported against a single unit by a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    pub unit: String,
    pub message: String,
}

/// State shared by all passes during one [`Pipeline::apply`] call.
pub struct PassContext<'a> {
    pub module_name: &'a str,
    /// Names of the units compiled into the module.
    pub units: &'a [String],
    unit_errors: Vec<UnitError>,
}

impl<'a> PassContext<'a> {
    pub fn new(module_name: &'a str, units: &'a [String]) -> Self {
        Self {
            module_name,
            units,
            unit_errors: Vec::new(),
        }
    }

    pub fn fail_unit(&mut self, unit: impl Into<String>, message: impl Into<String>) {
        self.unit_errors.push(UnitError {
            unit: unit.into(),
            message: message.into(),
        });
    }
}

/// A rule-gated rewrite over a module image.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checked once per module. Any rejection skips the whole pass.
    fn module_predicates(&self) -> &[ModulePredicate] {
        &[]
    }

    fn visits(&self, kind: ElementKind) -> bool;

    /// Checked in order for every visited element of `kind`; all must accept.
    fn predicates(&self, kind: ElementKind) -> &[Predicate];

    /// Rewrite one element. Returns whether the element was changed.
    fn rewrite(
        &self,
        element: &mut Element<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<bool, TransformError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    /// Image to load: rewritten when any pass changed something, otherwise the input.
    pub bytes: Vec<u8>,
    pub rewritten: bool,
    pub total: usize,
    pub per_pass: Vec<(&'static str, usize)>,
    pub unit_errors: Vec<UnitError>,
    /// Types on which a pass failed part-way.
    pub failures: usize,
}

impl TransformOutcome {
    fn unchanged(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            rewritten: false,
            total: 0,
            per_pass: Vec::new(),
            unit_errors: Vec::new(),
            failures: 0,
        }
    }
}

/// Ordered, statically registered list of passes.
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    /// Visibility widening followed by fast-dispatch injection.
    pub fn standard(config: &TransformConfig) -> Self {
        Self::new(vec![
            Box::new(VisibilityWidening::new(config)),
            Box::new(FastDispatch::new(config)),
        ])
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.iter().map(|pass| pass.name())
    }

    /// Run every pass over `bytes`.
    ///
    /// Never fails: an unreadable image, a failing pass or a failed
    /// re-serialization all fall back to the best bytes available.
    pub fn apply(&self, bytes: &[u8], units: &[String]) -> TransformOutcome {
        let mut image = match ModuleImage::parse(bytes) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(target: "kiln.transform", error = %err, "module image unreadable; skipping transformation");
                return TransformOutcome::unchanged(bytes);
            }
        };

        let module_name = image.name.clone();
        let mut cx = PassContext::new(&module_name, units);
        let mut per_pass = Vec::with_capacity(self.passes.len());
        let mut total = 0;
        let mut failures = 0;

        for pass in &self.passes {
            let pass = pass.as_ref();
            if let Some(rejected) = pass
                .module_predicates()
                .iter()
                .find(|predicate| !predicate.accepts(&module_name))
            {
                tracing::trace!(target: "kiln.transform", pass = pass.name(), module = %module_name, ?rejected, "pass not applicable");
                per_pass.push((pass.name(), 0));
                continue;
            }

            let mut count = 0;
            for ty in &mut image.types {
                failures += visit_type_guarded(pass, ty, &mut cx, &mut count);
            }
            tracing::debug!(target: "kiln.transform", pass = pass.name(), module = %module_name, count, "pass finished");
            per_pass.push((pass.name(), count));
            total += count;
        }

        let unit_errors = cx.unit_errors;
        if total == 0 {
            return TransformOutcome {
                per_pass,
                unit_errors,
                failures,
                ..TransformOutcome::unchanged(bytes)
            };
        }

        match image.to_bytes() {
            Ok(rewritten) => TransformOutcome {
                bytes: rewritten,
                rewritten: true,
                total,
                per_pass,
                unit_errors,
                failures,
            },
            Err(err) => {
                tracing::warn!(target: "kiln.transform", module = %module_name, error = %err, "failed to write transformed module; using original image");
                TransformOutcome {
                    per_pass,
                    unit_errors,
                    failures: failures + 1,
                    ..TransformOutcome::unchanged(bytes)
                }
            }
        }
    }
}

/// Visits `ty` and its nested types, logging failures per type. Returns the
/// number of types on which the pass failed.
fn visit_type_guarded(
    pass: &dyn Pass,
    ty: &mut TypeDef,
    cx: &mut PassContext<'_>,
    count: &mut usize,
) -> usize {
    let mut failures = 0;
    if let Err(err) = visit_members(pass, ty, cx, count) {
        tracing::warn!(
            target: "kiln.transform",
            pass = pass.name(),
            ty = %ty.full_name(),
            error = %err,
            "pass failed on type"
        );
        failures += 1;
    }
    for nested in &mut ty.nested {
        failures += visit_type_guarded(pass, nested, cx, count);
    }
    failures
}

fn visit_members(
    pass: &dyn Pass,
    ty: &mut TypeDef,
    cx: &mut PassContext<'_>,
    count: &mut usize,
) -> Result<(), TransformError> {
    visit(pass, Element::new(ty, Target::Type), cx, count)?;
    for i in 0..ty.properties.len() {
        visit(pass, Element::new(ty, Target::Property(i)), cx, count)?;
    }
    for i in 0..ty.fields.len() {
        visit(pass, Element::new(ty, Target::Field(i)), cx, count)?;
    }
    for i in 0..ty.methods.len() {
        visit(pass, Element::new(ty, Target::Method(i)), cx, count)?;
    }
    for i in 0..ty.events.len() {
        visit(pass, Element::new(ty, Target::Event(i)), cx, count)?;
    }
    Ok(())
}

fn visit(
    pass: &dyn Pass,
    mut element: Element<'_>,
    cx: &mut PassContext<'_>,
    count: &mut usize,
) -> Result<(), TransformError> {
    let kind = element.kind();
    if !pass.visits(kind) {
        return Ok(());
    }
    if !pass
        .predicates(kind)
        .iter()
        .all(|predicate| predicate.accepts(&element, cx))
    {
        return Ok(());
    }
    if pass.rewrite(&mut element, cx)? {
        *count += 1;
    }
    Ok(())
}
