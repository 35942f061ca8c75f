use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;

use crate::SourceError;

/// Upper bound on read attempts while a script is locked by another process.
const MAX_LOCKED_READ_ATTEMPTS: u32 = 200;
const MAX_LOCK_BACKOFF: Duration = Duration::from_secs(1);

/// One script source file, `<directory>/<name>.cs`.
///
/// Content fields are refreshed by [`ScriptUnit::cache_lines`] whenever the
/// on-disk modification time moves; analysis results are recomputed by the
/// analyzer on every preparation.
#[derive(Debug, Clone)]
pub struct ScriptUnit {
    pub name: String,
    pub directory: PathBuf,
    pub lines: Vec<String>,
    pub encoding: &'static str,
    pub modified_at: Option<SystemTime>,
    pub cached_at: Option<SystemTime>,
    pub requires: BTreeSet<String>,
    pub references: BTreeSet<String>,
    pub include_paths: BTreeSet<PathBuf>,
    pub error: Option<String>,
    reads: u32,
}

/// Result of [`ScriptUnit::cache_lines`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unchanged,
    Reloaded,
}

impl ScriptUnit {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            lines: Vec::new(),
            encoding: "utf-8",
            modified_at: None,
            cached_at: None,
            requires: BTreeSet::new(),
            references: BTreeSet::new(),
            include_paths: BTreeSet::new(),
            error: None,
            reads: 0,
        }
    }

    pub fn script_path(&self) -> PathBuf {
        script_path(&self.directory, &self.name)
    }

    /// Current on-disk modification time, if the file exists.
    pub fn current_modified(&self) -> Option<SystemTime> {
        fs::metadata(self.script_path())
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Whether the file changed since its lines were last cached.
    pub fn has_been_modified(&self) -> bool {
        self.reads == 0 || self.current_modified() != self.cached_at
    }

    /// Number of times the source has actually been read from disk.
    pub fn read_count(&self) -> u32 {
        self.reads
    }

    pub fn clear_analysis(&mut self) {
        self.requires.clear();
        self.references.clear();
        self.include_paths.clear();
    }

    /// Cached source joined back into a single buffer for the worker.
    pub fn source_bytes(&self) -> Vec<u8> {
        self.lines.join("\n").into_bytes()
    }

    /// Re-read the script if its modification time moved since the last read.
    ///
    /// `defines` are prepended as `#define` lines. Shared units should go
    /// through [`crate::refresh_unit`] so the read happens outside the lock.
    pub fn cache_lines(
        &mut self,
        defines: &[String],
        lock_retry: Duration,
    ) -> Result<CacheState, SourceError> {
        let read = self.source().read(defines, lock_retry)?;
        Ok(self.store(read))
    }

    /// What a read needs to know about the unit, detached from it.
    pub fn source(&self) -> ScriptSource {
        ScriptSource {
            name: self.name.clone(),
            path: self.script_path(),
            cached_at: (self.reads > 0).then_some(self.cached_at),
        }
    }

    /// Apply the outcome of [`ScriptSource::read`].
    pub fn store(&mut self, read: ScriptRead) -> CacheState {
        self.modified_at = read.modified;
        let Some(lines) = read.lines else {
            return CacheState::Unchanged;
        };
        self.lines = lines;
        self.cached_at = read.modified;
        self.reads += 1;
        CacheState::Reloaded
    }
}

/// Path and cache stamp of a unit, for reading without holding the unit.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    name: String,
    path: PathBuf,
    /// `Some` once the unit has been read at least once.
    cached_at: Option<Option<SystemTime>>,
}

/// Result of [`ScriptSource::read`]; `lines` is `None` when nothing changed.
#[derive(Debug, Clone)]
pub struct ScriptRead {
    modified: Option<SystemTime>,
    lines: Option<Vec<String>>,
}

impl ScriptSource {
    /// Read the script unless its modification time still matches the cached
    /// one. While another process holds the file, the read is retried with a
    /// growing pause; any other failure is final.
    pub fn read(&self, defines: &[String], lock_retry: Duration) -> Result<ScriptRead, SourceError> {
        let mut waiting = false;
        let mut attempt = 0;
        loop {
            let modified = match fs::metadata(&self.path) {
                Ok(meta) => meta.modified().ok(),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(target: "kiln.source", unit = %self.name, "script no longer exists");
                    return Err(SourceError::Deleted);
                }
                Err(err) => return Err(SourceError::Unreadable(err.to_string())),
            };
            if self.cached_at == Some(modified) {
                return Ok(ScriptRead {
                    modified,
                    lines: None,
                });
            }

            match read_source(&self.path) {
                Ok(text) => {
                    let lines = defines
                        .iter()
                        .map(|symbol| format!("#define {}", escape_symbol(symbol)))
                        .chain(text.lines().map(str::to_owned))
                        .collect();
                    return Ok(ScriptRead {
                        modified,
                        lines: Some(lines),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(SourceError::Deleted),
                Err(err) if is_held_by_another_process(&err) => {
                    attempt += 1;
                    if attempt >= MAX_LOCKED_READ_ATTEMPTS {
                        return Err(SourceError::Unreadable(err.to_string()));
                    }
                    if !waiting {
                        waiting = true;
                        tracing::warn!(target: "kiln.source", unit = %self.name, error = %err, "waiting for another application to stop using script");
                    }
                    std::thread::sleep((lock_retry * attempt).min(MAX_LOCK_BACKOFF));
                }
                Err(err) => return Err(SourceError::Unreadable(err.to_string())),
            }
        }
    }
}

/// Sharing and lock violations clear up once the other process lets go.
fn is_held_by_another_process(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    const WINDOWS_SHARING_ERRORS: [i32; 2] = [32, 33];
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    ) || (cfg!(windows) && err.raw_os_error().is_some_and(|code| WINDOWS_SHARING_ERRORS.contains(&code)))
}

pub fn script_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.cs"))
}

fn read_source(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    // Editors on some platforms write a BOM.
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    String::from_utf8(bytes.to_vec()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// `#define` only accepts identifier characters.
pub fn escape_symbol(symbol: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\d]").expect("symbol escape regex should compile"))
        .replace_all(symbol, "_")
        .into_owned()
}
