use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kiln_source::ReferenceCache;
use kiln_transform::{Pipeline, UnitError};
use tokio::sync::OnceCell;

/// Output of one successful session.
#[derive(Debug)]
pub struct CompiledModule {
    pub name: String,
    pub image: Arc<[u8]>,
    pub symbols: Option<Arc<[u8]>>,
    /// Units compiled into this module, sorted.
    pub units: Vec<String>,
    pub compiled_at: SystemTime,
    pub duration: Duration,
    /// Script path and its modification time when it was compiled.
    sources: Vec<(PathBuf, Option<SystemTime>)>,
    loaded: OnceCell<Arc<LoadedModule>>,
}

/// A module after the transformation pipeline ran over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub bytes: Arc<[u8]>,
    pub rewritten: bool,
    pub unit_errors: Vec<UnitError>,
}

impl LoadedModule {
    pub fn error_for(&self, unit: &str) -> Option<&str> {
        self.unit_errors
            .iter()
            .find(|error| error.unit == unit)
            .map(|error| error.message.as_str())
    }
}

impl CompiledModule {
    pub fn new(
        name: impl Into<String>,
        image: Vec<u8>,
        symbols: Vec<u8>,
        units: Vec<String>,
        sources: Vec<(PathBuf, Option<SystemTime>)>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            symbols: (!symbols.is_empty()).then(|| symbols.into()),
            units,
            compiled_at: SystemTime::now(),
            duration,
            sources,
            loaded: OnceCell::new(),
        }
    }

    pub fn is_batch(&self) -> bool {
        self.units.len() > 1
    }

    /// Whether any contributing script changed on disk since compilation.
    pub fn is_outdated(&self) -> bool {
        self.sources.iter().any(|(path, compiled)| {
            let current = std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
            current != *compiled
        })
    }

    /// The transformed image, if [`CompiledModule::load`] has finished.
    pub fn loaded(&self) -> Option<&Arc<LoadedModule>> {
        self.loaded.get()
    }

    /// Run the transformation pipeline over the image, once.
    ///
    /// Concurrent callers wait for the same run. A rewritten image is pinned in
    /// `cache` so dependents compile against it.
    pub async fn load(&self, pipeline: Arc<Pipeline>, cache: &ReferenceCache) -> Arc<LoadedModule> {
        self.loaded
            .get_or_init(|| async {
                let image = self.image.clone();
                let units = self.units.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || pipeline.apply(&image, &units)).await;
                let loaded = match outcome {
                    Ok(outcome) => {
                        tracing::debug!(
                            target: "kiln.module",
                            module = %self.name,
                            rewritten = outcome.total,
                            failures = outcome.failures,
                            "transformed module"
                        );
                        LoadedModule {
                            bytes: outcome.bytes.into(),
                            rewritten: outcome.rewritten,
                            unit_errors: outcome.unit_errors,
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "kiln.module", module = %self.name, error = %err, "transformation aborted; using compiled image");
                        LoadedModule {
                            bytes: self.image.clone(),
                            rewritten: false,
                            unit_errors: Vec::new(),
                        }
                    }
                };
                if loaded.rewritten {
                    cache.insert_pinned(self.cache_path(cache), loaded.bytes.clone());
                }
                Arc::new(loaded)
            })
            .await
            .clone()
    }

    /// Image dependents should link against: the transformed one when present.
    pub fn reference_image(&self, cache: &ReferenceCache) -> Arc<[u8]> {
        if self.loaded.get().is_some_and(|loaded| loaded.rewritten) {
            if let Ok(bytes) = cache.load(&self.cache_path(cache)) {
                return bytes;
            }
        }
        self.image.clone()
    }

    fn cache_path(&self, cache: &ReferenceCache) -> PathBuf {
        cache.libraries_dir().join(&self.name)
    }
}
