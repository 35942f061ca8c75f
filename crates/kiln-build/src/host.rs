use std::sync::Arc;

use crate::module::CompiledModule;

/// Final state of one unit after a load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: String,
    /// `None` when the unit compiled and the host accepted it.
    pub error: Option<String>,
    /// Module the unit was loaded from.
    pub module: Option<String>,
}

impl UnitReport {
    pub fn loaded(unit: impl Into<String>, module: &CompiledModule) -> Self {
        Self {
            unit: unit.into(),
            error: None,
            module: Some(module.name.clone()),
        }
    }

    pub fn failed(unit: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            error: Some(error.into()),
            module: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The process that consumes compiled units.
///
/// Callbacks run on the coordinator task and must not block.
pub trait BuildHost: Send + Sync {
    /// A unit finished loading, successfully or not.
    fn unit_changed(&self, report: UnitReport);

    /// Hand `module` to the host for `unit`. Returning `false` rejects the
    /// unit; the host is expected to have reported why through its own logs.
    fn load_requested(&self, unit: &str, module: &Arc<CompiledModule>) -> bool;

    /// `unit` is being taken down, either on request or because something it
    /// requires went away.
    fn unload_requested(&self, unit: &str);
}
