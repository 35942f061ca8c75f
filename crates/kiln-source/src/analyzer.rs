use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_config::KilnConfig;

use crate::cache::ReferenceCache;
use crate::marker::{Marker, MarkerTable};
use crate::unit::{script_path, ScriptUnit};
use crate::SourceError;

/// Recovers requires, references and include files from cached source lines.
#[derive(Debug, Clone)]
pub struct SourceAnalyzer {
    markers: MarkerTable,
    cache: Arc<ReferenceCache>,
    include_dir: PathBuf,
    extensions: Vec<String>,
    ignored_references: Vec<String>,
}

#[derive(Default)]
struct Analysis {
    requires: BTreeSet<String>,
    references: BTreeSet<String>,
    include_paths: BTreeSet<PathBuf>,
}

impl SourceAnalyzer {
    pub fn new(config: &KilnConfig, cache: Arc<ReferenceCache>) -> Result<Self, regex::Error> {
        Ok(Self {
            markers: MarkerTable::new(
                &config.compiler.host_namespace,
                &config.compiler.foreign_dialects,
            )?,
            cache,
            include_dir: config.paths.include_dir(),
            extensions: config.compiler.extensions.clone(),
            ignored_references: config.compiler.ignored_references.clone(),
        })
    }

    pub fn markers(&self) -> &MarkerTable {
        &self.markers
    }

    pub fn cache(&self) -> &Arc<ReferenceCache> {
        &self.cache
    }

    /// Recompute `unit.requires`, `unit.references` and `unit.include_paths`.
    ///
    /// On failure the sets hold whatever was found before the failing line.
    pub fn analyze(&self, unit: &mut ScriptUnit) -> Result<(), SourceError> {
        let mut analysis = Analysis::default();
        let result = self
            .scan(unit, &mut analysis)
            .and_then(|()| self.resolve_extensions(unit, &mut analysis));

        unit.requires = analysis.requires;
        unit.references = analysis.references;
        unit.include_paths = analysis.include_paths;

        if let Err(err) = &result {
            tracing::error!(target: "kiln.source", unit = %unit.name, error = %err, "analysis failed");
        }
        result
    }

    /// Reference failures are held back until the entry point has been
    /// checked, so a misnamed script reports the mismatch.
    fn scan(&self, unit: &ScriptUnit, analysis: &mut Analysis) -> Result<(), SourceError> {
        let mut in_namespace = false;
        let mut unresolved: Option<SourceError> = None;
        for line in &unit.lines {
            let line = line.trim();
            let marker = self.markers.classify(line, in_namespace);
            if marker == Marker::ForeignDialect {
                return Err(SourceError::ForeignDialect {
                    script: unit.name.clone(),
                });
            }
            if line.is_empty() {
                continue;
            }

            match marker {
                Marker::Filler => continue,
                Marker::EntryPoint(class) => {
                    if class != unit.name {
                        return Err(SourceError::NameMismatch {
                            script: unit.name.clone(),
                            class: class.to_owned(),
                        });
                    }
                    break;
                }
                // First real line inside the namespace that isn't the entry point.
                Marker::Other if in_namespace => break,
                Marker::Requires(dependency) => {
                    analysis.requires.insert(dependency.to_owned());
                    if !script_path(&unit.directory, dependency).is_file() {
                        return Err(SourceError::MissingDependency(dependency.to_owned()));
                    }
                }
                Marker::Reference(reference) => {
                    if self.is_ignored_reference(reference) {
                        tracing::warn!(target: "kiln.source", unit = %unit.name, reference, "ignored unnecessary reference");
                    } else {
                        match self.add_reference(analysis, reference) {
                            Ok(()) => {
                                tracing::info!(target: "kiln.source", unit = %unit.name, reference, "added reference");
                            }
                            Err(err) => {
                                unresolved.get_or_insert(err);
                            }
                        }
                    }
                }
                Marker::Using(namespace) => {
                    let library = self.markers.library_name(namespace);
                    let added = if !library.is_empty() && self.cache.library_exists(&library) {
                        self.add_reference(analysis, &library)
                    } else {
                        self.add_reference(analysis, namespace)
                    };
                    if let Err(err) = added {
                        unresolved.get_or_insert(err);
                    }
                }
                Marker::PluginNamespace => in_namespace = true,
                Marker::Other | Marker::ForeignDialect => {}
            }
        }
        unresolved.map_or(Ok(()), Err)
    }

    fn is_ignored_reference(&self, reference: &str) -> bool {
        let host_prefix = format!("{}.", self.markers.host());
        reference.starts_with(&host_prefix)
            || self
                .ignored_references
                .iter()
                .any(|ignored| reference.contains(ignored.as_str()))
    }

    /// Libraries missing from disk are only acceptable inside the host namespace.
    fn add_reference(&self, analysis: &mut Analysis, name: &str) -> Result<(), SourceError> {
        let host_prefix = format!("{}.", self.markers.host());
        if !self.cache.library_exists(name) && !name.starts_with(&host_prefix) {
            return Err(SourceError::MissingReference(name.to_owned()));
        }
        analysis.references.insert(name.to_owned());
        Ok(())
    }

    /// Extension references must name a loaded extension or ship an include file.
    fn resolve_extensions(&self, unit: &ScriptUnit, analysis: &mut Analysis) -> Result<(), SourceError> {
        for reference in &analysis.references {
            let Some((full, name)) = self.markers.extension_reference(reference) else {
                continue;
            };
            if self.extensions.iter().any(|ext| ext == name) {
                continue;
            }
            let include = self.include_dir.join(format!("Ext.{name}.cs"));
            if include.is_file() {
                analysis.include_paths.insert(include);
                continue;
            }
            return Err(SourceError::ExtensionNotLoaded {
                reference: full.to_owned(),
                unit: unit.name.clone(),
            });
        }
        Ok(())
    }
}
