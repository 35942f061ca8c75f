//! Script units and their static analysis.
//!
//! - [`ScriptUnit`]: one `<Name>.cs` file with cached lines and analysis results
//! - [`UnitRegistry`]: one unit per name
//! - [`SourceAnalyzer`]: marker-driven discovery of requires, references and includes
//! - [`ReferenceCache`]: library bytes keyed by path, with idle eviction

mod analyzer;
mod cache;
mod marker;
mod registry;
mod unit;

pub use analyzer::SourceAnalyzer;
pub use cache::{library_file_name, ReferenceCache};
pub use marker::{Marker, MarkerTable};
pub use registry::{refresh_unit, UnitRef, UnitRegistry};
pub use unit::{escape_symbol, script_path, CacheState, ScriptRead, ScriptSource, ScriptUnit};

/// Per-unit failure. The `Display` text is what gets reported for the unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Plugin filename {script}.cs must match the main class {class} (should be {class}.cs)")]
    NameMismatch { script: String, class: String },

    #[error("Plugin {script}.cs is written for a different plugin host dialect")]
    ForeignDialect { script: String },

    #[error("Referenced assembly does not exist: {0}")]
    MissingReference(String),

    #[error("{reference} is referenced by {unit} plugin but is not loaded")]
    ExtensionNotLoaded { reference: String, unit: String },

    #[error("Plugin file was deleted")]
    Deleted,

    #[error("No data contained in .cs file")]
    Empty,

    #[error("Unable to read plugin file: {0}")]
    Unreadable(String),
}
