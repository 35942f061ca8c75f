use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kiln_config::KilnConfig;
use kiln_source::{ReferenceCache, SourceAnalyzer, UnitRef, UnitRegistry};
use kiln_transform::Pipeline;
use parking_lot::RwLock;

use crate::module::CompiledModule;
use crate::BuildError;

/// Everything a build needs, shared between the coordinator and the sessions
/// it prepares in the background.
///
/// Host state (loading/loaded units) is only written by the coordinator;
/// sessions read it while folding dependencies.
pub struct BuildContext {
    config: KilnConfig,
    registry: UnitRegistry,
    cache: Arc<ReferenceCache>,
    analyzer: SourceAnalyzer,
    pipeline: Arc<Pipeline>,
    modules: RwLock<HashMap<String, Arc<CompiledModule>>>,
    host: RwLock<HostView>,
}

#[derive(Debug, Default)]
struct HostView {
    loading: HashSet<String>,
    loaded: HashSet<String>,
}

impl BuildContext {
    pub fn new(config: KilnConfig) -> Result<Self, BuildError> {
        let cache = Arc::new(ReferenceCache::new(
            config.paths.libraries_dir(),
            config.cache.idle_eviction(),
        ));
        let analyzer = SourceAnalyzer::new(&config, cache.clone())?;
        let pipeline = Arc::new(Pipeline::standard(&config.transform));
        Ok(Self {
            registry: UnitRegistry::new(config.paths.plugins_dir()),
            cache,
            analyzer,
            pipeline,
            modules: RwLock::new(HashMap::new()),
            host: RwLock::new(HostView::default()),
            config,
        })
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn unit(&self, name: &str) -> UnitRef {
        self.registry.get_or_create(name)
    }

    pub fn cache(&self) -> &Arc<ReferenceCache> {
        &self.cache
    }

    pub fn analyzer(&self) -> &SourceAnalyzer {
        &self.analyzer
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Latest module `unit` was compiled into.
    pub fn module_for(&self, unit: &str) -> Option<Arc<CompiledModule>> {
        self.modules.read().get(unit).cloned()
    }

    /// Latest module for `unit`, unless its sources changed since.
    pub fn fresh_module(&self, unit: &str) -> Option<Arc<CompiledModule>> {
        self.module_for(unit).filter(|module| !module.is_outdated())
    }

    pub(crate) fn record_module(&self, module: &Arc<CompiledModule>) {
        let mut modules = self.modules.write();
        for unit in &module.units {
            modules.insert(unit.clone(), module.clone());
        }
    }

    /// Forget the compiled module of `unit` so the next load recompiles it.
    pub(crate) fn forget_module(&self, unit: &str) -> bool {
        self.modules.write().remove(unit).is_some()
    }

    pub fn is_loading(&self, unit: &str) -> bool {
        self.host.read().loading.contains(unit)
    }

    pub fn is_loaded(&self, unit: &str) -> bool {
        self.host.read().loaded.contains(unit)
    }

    pub fn loaded_units(&self) -> Vec<String> {
        let mut units: Vec<_> = self.host.read().loaded.iter().cloned().collect();
        units.sort();
        units
    }

    pub(crate) fn loading_units(&self) -> Vec<String> {
        let mut units: Vec<_> = self.host.read().loading.iter().cloned().collect();
        units.sort();
        units
    }

    /// `false` if the unit was already loading.
    pub(crate) fn set_loading(&self, unit: &str, loading: bool) -> bool {
        let mut host = self.host.write();
        if loading {
            host.loading.insert(unit.to_owned())
        } else {
            host.loading.remove(unit)
        }
    }

    pub(crate) fn set_loaded(&self, unit: &str, loaded: bool) -> bool {
        let mut host = self.host.write();
        if loaded {
            host.loaded.insert(unit.to_owned())
        } else {
            host.loaded.remove(unit)
        }
    }
}
