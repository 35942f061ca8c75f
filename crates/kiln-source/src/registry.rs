use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::unit::{CacheState, ScriptUnit};
use crate::SourceError;

pub type UnitRef = Arc<Mutex<ScriptUnit>>;

/// One [`ScriptUnit`] per name, for the lifetime of the registry.
///
/// Names are keyed without underscores, so `My_Plugin` and `MyPlugin` share a
/// unit.
#[derive(Debug)]
pub struct UnitRegistry {
    directory: PathBuf,
    units: RwLock<HashMap<String, UnitRef>>,
}

impl UnitRegistry {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            units: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn get(&self, name: &str) -> Option<UnitRef> {
        self.units.read().get(&key(name)).cloned()
    }

    pub fn get_or_create(&self, name: &str) -> UnitRef {
        let key = key(name);
        if let Some(unit) = self.units.read().get(&key) {
            return unit.clone();
        }
        self.units
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ScriptUnit::new(&self.directory, name))))
            .clone()
    }

    /// Snapshot of all known units.
    pub fn all(&self) -> Vec<UnitRef> {
        self.units.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`ScriptUnit::cache_lines`] for a shared unit. The lock is only taken to
/// snapshot the cache stamp and to store the result, never across the read.
pub fn refresh_unit(
    unit: &UnitRef,
    defines: &[String],
    lock_retry: Duration,
) -> Result<CacheState, SourceError> {
    let source = unit.lock().source();
    let read = source.read(defines, lock_retry)?;
    Ok(unit.lock().store(read))
}

fn key(name: &str) -> String {
    name.replace('_', "")
}
