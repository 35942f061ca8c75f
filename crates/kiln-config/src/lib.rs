//! Configuration model for the kiln build pipeline.
//!
//! Every section is optional in TOML; missing keys fall back to the defaults
//! documented on each field. Unknown keys are rejected so typos surface early.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct KilnConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KilnConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig {
                root: root.into(),
                ..PathsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load a config file from TOML.
    ///
    /// Relative paths in `[paths]` are resolved against the directory that
    /// contains the config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: KilnConfig = toml::from_str(&text)?;
        if config.paths.root.is_relative() {
            if let Some(parent) = path.parent() {
                config.paths.root = parent.join(&config.paths.root);
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message only; the rendered snippet can echo config values.
        ConfigError::Toml(err.message().to_owned())
    }
}

/// Host directory layout. Unset directories are derived from `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "PathsConfig::default_root")]
    pub root: PathBuf,
    /// Directory holding script units (`<Name>.cs`).
    #[serde(default)]
    pub plugins: Option<PathBuf>,
    /// Directory holding shared include files. Defaults to `<plugins>/include`.
    #[serde(default)]
    pub include: Option<PathBuf>,
    /// Directory holding resolvable libraries (`<Name>.dll`).
    #[serde(default)]
    pub libraries: Option<PathBuf>,
    #[serde(default)]
    pub logs: Option<PathBuf>,
    #[serde(default)]
    pub data: Option<PathBuf>,
    #[serde(default)]
    pub config: Option<PathBuf>,
}

impl PathsConfig {
    fn default_root() -> PathBuf {
        PathBuf::from(".")
    }

    fn resolve(&self, configured: &Option<PathBuf>, fallback: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.root.join(path),
            None => self.root.join(fallback),
        }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.resolve(&self.plugins, "plugins")
    }

    pub fn include_dir(&self) -> PathBuf {
        match &self.include {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.root.join(path),
            None => self.plugins_dir().join("include"),
        }
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.resolve(&self.libraries, "libraries")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(&self.logs, "logs")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.data, "data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.resolve(&self.config, "config")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            plugins: None,
            include: None,
            libraries: None,
            logs: None,
            data: None,
            config: None,
        }
    }
}

/// Out-of-process build worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker executable. Compilation requests fail with "worker unavailable"
    /// when unset.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Extra arguments appended after the launch arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for the worker's ready signal after spawning it.
    #[serde(default = "WorkerConfig::default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Quiet period with no outstanding jobs after which the worker is stopped.
    #[serde(default = "WorkerConfig::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long a graceful shutdown may take before the worker is killed.
    #[serde(default = "WorkerConfig::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "WorkerConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence from the worker longer than this is treated as a crash.
    #[serde(default = "WorkerConfig::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Delay between SIGTERM and SIGKILL when force-terminating the worker tree.
    #[serde(default = "WorkerConfig::default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    #[serde(default = "default_true")]
    pub allow_unsafe: bool,

    #[serde(default)]
    pub use_standard_libraries: bool,

    #[serde(default = "default_true")]
    pub force: bool,
}

impl WorkerConfig {
    fn default_startup_timeout_ms() -> u64 {
        10_000
    }

    fn default_idle_timeout_ms() -> u64 {
        60_000
    }

    fn default_shutdown_grace_ms() -> u64 {
        10_000
    }

    fn default_heartbeat_interval_ms() -> u64 {
        5_000
    }

    fn default_heartbeat_timeout_ms() -> u64 {
        30_000
    }

    fn default_kill_grace_ms() -> u64 {
        250
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            startup_timeout_ms: Self::default_startup_timeout_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout_ms(),
            kill_grace_ms: Self::default_kill_grace_ms(),
            allow_unsafe: true,
            use_standard_libraries: false,
            force: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Source analysis and job defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerConfig {
    /// Root namespace of the plugin host (`Oxide.Core`, `Oxide.Plugins`, ...).
    #[serde(default = "CompilerConfig::default_host_namespace")]
    pub host_namespace: String,

    /// Namespaces of other plugin host dialects. A unit declaring
    /// `namespace <dialect>.Plugins` is rejected.
    #[serde(default = "CompilerConfig::default_foreign_dialects")]
    pub foreign_dialects: Vec<String>,

    /// Libraries linked into every session when present on disk.
    #[serde(default = "CompilerConfig::default_references")]
    pub default_references: Vec<String>,

    /// Explicit `// Reference:` names containing one of these are ignored.
    #[serde(default = "CompilerConfig::default_ignored_references")]
    pub ignored_references: Vec<String>,

    /// Names of host extensions that are currently loaded.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Preprocessor symbols prepended to every unit as `#define`.
    #[serde(default)]
    pub defines: Vec<String>,

    #[serde(default = "CompilerConfig::default_target")]
    pub target: String,

    #[serde(default = "CompilerConfig::default_platform")]
    pub platform: String,

    #[serde(default = "CompilerConfig::default_language_version")]
    pub language_version: String,

    #[serde(default = "CompilerConfig::default_encoding")]
    pub encoding: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub stdlib: bool,

    /// Sleep between attempts while a script is locked by another process.
    #[serde(default = "CompilerConfig::default_lock_retry_ms")]
    pub lock_retry_ms: u64,

    /// Pause before re-reading scripts that changed during preparation.
    #[serde(default = "CompilerConfig::default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl CompilerConfig {
    fn default_host_namespace() -> String {
        "Oxide".to_owned()
    }

    fn default_foreign_dialects() -> Vec<String> {
        vec!["uMod".to_owned()]
    }

    fn default_references() -> Vec<String> {
        [
            "mscorlib",
            "Oxide.Core",
            "Oxide.CSharp",
            "System",
            "System.Core",
            "System.Data",
            "System.Xml",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }

    fn default_ignored_references() -> Vec<String> {
        vec!["Newtonsoft.Json".to_owned(), "protobuf-net".to_owned()]
    }

    fn default_target() -> String {
        "library".to_owned()
    }

    fn default_platform() -> String {
        "anycpu".to_owned()
    }

    fn default_language_version() -> String {
        "13".to_owned()
    }

    fn default_encoding() -> String {
        "utf-8".to_owned()
    }

    fn default_lock_retry_ms() -> u64 {
        50
    }

    fn default_settle_delay_ms() -> u64 {
        100
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            host_namespace: Self::default_host_namespace(),
            foreign_dialects: Self::default_foreign_dialects(),
            default_references: Self::default_references(),
            ignored_references: Self::default_ignored_references(),
            extensions: Vec::new(),
            defines: Vec::new(),
            target: Self::default_target(),
            platform: Self::default_platform(),
            language_version: Self::default_language_version(),
            encoding: Self::default_encoding(),
            debug: false,
            stdlib: false,
            lock_retry_ms: Self::default_lock_retry_ms(),
            settle_delay_ms: Self::default_settle_delay_ms(),
        }
    }
}

/// Post-build module rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Opt-in switch for the visibility-widening pass.
    #[serde(default)]
    pub allow_widening: bool,

    /// Modules whose name starts with one of these are never widened.
    #[serde(default = "TransformConfig::default_denylist")]
    pub denylist: Vec<String>,

    /// Member names the widening pass leaves untouched.
    #[serde(default)]
    pub ignored_names: Vec<String>,

    #[serde(default = "default_true")]
    pub fast_dispatch: bool,

    /// Namespace in which plugin entry types live.
    #[serde(default = "TransformConfig::default_plugin_namespace")]
    pub plugin_namespace: String,
}

impl TransformConfig {
    fn default_denylist() -> Vec<String> {
        [
            "0Harmony",
            "System",
            "Microsoft",
            "mscorlib",
            "Unity",
            "Mono",
            "netstandard",
            "Oxide",
            "MySql.Data",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }

    fn default_plugin_namespace() -> String {
        "Oxide.Plugins".to_owned()
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            allow_widening: false,
            denylist: Self::default_denylist(),
            ignored_names: Vec::new(),
            fast_dispatch: true,
            plugin_namespace: Self::default_plugin_namespace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Unpinned library entries not read for this long are evicted.
    #[serde(default = "CacheConfig::default_idle_eviction_ms")]
    pub idle_eviction_ms: u64,
}

impl CacheConfig {
    fn default_idle_eviction_ms() -> u64 {
        5 * 60 * 1000
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_eviction_ms: Self::default_idle_eviction_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level for all kiln crates.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" | "information" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`.
    ///
    /// `level` may be either a simple level (`info`, `debug`, ...) or a full
    /// `EnvFilter` directive string. If `RUST_LOG` is set, it is merged into the
    /// resulting filter.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }

    /// Level name understood by the worker process (`Logging:Level`).
    pub fn worker_level(&self) -> &'static str {
        match Self::normalize_level_directives(&self.level).as_str() {
            "trace" => "Trace",
            "debug" => "Debug",
            "warn" => "Warning",
            "error" => "Error",
            _ => "Information",
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileGuardWriter<'a> {
    guard: MutexGuard<'a, File>,
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileGuardWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileGuardWriter {
            guard: self.file.lock(),
        }
    }
}

impl Write for FileGuardWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// This function is safe to call multiple times; only the first call installs a
/// global subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if config.stderr {
            // `cargo test` output capture only works for the stdlib's print macros.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                );
            } else {
                make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
            }
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(FileMakeWriter {
                file: Arc::new(Mutex::new(file)),
            }));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();

        if config.file.is_some() && !config.stderr {
            tracing::debug!(target: "kiln.config", "logging to file only");
        }
    });
}
