use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kiln_module::ModuleImage;
use kiln_proto::{CompilerFile, CompilerJob};
use kiln_source::{escape_symbol, refresh_unit, SourceError, UnitRef};
use kiln_supervisor::{JobResponse, SupervisorError};
use parking_lot::Mutex;

use crate::context::BuildContext;
use crate::module::CompiledModule;

/// Also the wire message id of the session's job.
pub type SessionId = u32;

const MAX_SETTLE_ROUNDS: usize = 50;

/// References of referenced libraries that are never pulled in.
const SKIPPED_TRANSITIVE_REFERENCES: [&str; 2] = ["Newtonsoft.Json", "Rust.Workshop"];

/// Units waiting to be prepared, shared with the coordinator until sealed.
///
/// Entries are keyed by unit identity so the coordinator never has to lock a
/// unit to queue it.
#[derive(Debug, Default)]
struct Intake {
    queue: VecDeque<Queued>,
    queued: HashSet<usize>,
    sealed: bool,
}

#[derive(Debug)]
struct Queued {
    unit: UnitRef,
    /// Asked for by the coordinator rather than pulled in as a dependency.
    requested: bool,
}

fn identity(unit: &UnitRef) -> usize {
    Arc::as_ptr(unit) as usize
}

impl Intake {
    fn push(&mut self, unit: UnitRef, requested: bool) -> bool {
        if !self.queued.insert(identity(&unit)) {
            return false;
        }
        self.queue.push_back(Queued { unit, requested });
        true
    }

    fn pop(&mut self) -> Option<Queued> {
        let entry = self.queue.pop_front()?;
        self.queued.remove(&identity(&entry.unit));
        Some(entry)
    }
}

/// Coordinator-side handle used to add units to a session while it is being
/// prepared.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    intake: Arc<Mutex<Intake>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue `unit` for preparation. Returns `false` once the session is
    /// sealed; the caller must then start a new session.
    pub fn add(&self, unit: &UnitRef) -> bool {
        let mut intake = self.intake.lock();
        if intake.sealed {
            return false;
        }
        if intake.push(unit.clone(), true) {
            tracing::debug!(target: "kiln.session", session = self.id, "unit joined session in preparation");
        }
        true
    }

    pub fn is_sealed(&self) -> bool {
        self.intake.lock().sealed
    }
}

/// Requires and references of one unit as of its last analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitLinks {
    pub requires: BTreeSet<String>,
    pub references: BTreeSet<String>,
}

/// Result of a finished session, keyed by unit name.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub id: SessionId,
    pub module: Option<Arc<CompiledModule>>,
    /// Units that compiled cleanly into `module`.
    pub compiled: Vec<String>,
    pub failed: BTreeMap<String, String>,
    /// Units pulled in only for a unit that then failed.
    pub dropped: Vec<String>,
    pub duration: Duration,
}

/// One batch build request and the closure of its dependencies.
pub struct CompilationSession {
    id: SessionId,
    ctx: Arc<BuildContext>,
    intake: Arc<Mutex<Intake>>,
    units: Vec<UnitRef>,
    /// Units queued by the coordinator rather than pulled in as a dependency.
    requested: BTreeSet<String>,
    failed: BTreeMap<String, String>,
    dropped: BTreeSet<String>,
    /// Requirements satisfied by already compiled, fresh modules.
    referenced_modules: BTreeSet<String>,
    references: BTreeMap<String, CompilerFile>,
    links: BTreeMap<String, UnitLinks>,
    name: String,
    started: Option<Instant>,
}

impl CompilationSession {
    pub fn new(id: SessionId, ctx: Arc<BuildContext>, units: &[UnitRef]) -> (Self, SessionHandle) {
        let mut intake = Intake::default();
        for unit in units {
            intake.push(unit.clone(), true);
        }
        let intake = Arc::new(Mutex::new(intake));
        let session = Self {
            id,
            ctx,
            intake: intake.clone(),
            units: Vec::new(),
            requested: BTreeSet::new(),
            failed: BTreeMap::new(),
            dropped: BTreeSet::new(),
            referenced_modules: BTreeSet::new(),
            references: BTreeMap::new(),
            links: BTreeMap::new(),
            name: String::new(),
            started: None,
        };
        (session, SessionHandle { id, intake })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Names of the units currently in the session, in preparation order
    /// until [`CompilationSession::prepare`] sorts them.
    pub fn unit_names(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.lock().name.clone()).collect()
    }

    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failed
    }

    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    /// Analysis results of every unit prepared by this session, including
    /// the ones that failed.
    pub fn links(&self) -> &BTreeMap<String, UnitLinks> {
        &self.links
    }

    /// Drain the intake: read and analyze every unit, fold in dependencies and
    /// resolve references, then seal the session. Blocks on file I/O.
    pub fn prepare(&mut self) {
        self.references.clear();
        self.referenced_modules.clear();
        self.add_default_references();

        while let Some(Queued { unit, requested }) = self.next_queued() {
            if requested {
                self.requested.insert(unit.lock().name.clone());
            }
            self.prepare_unit(unit);
            self.cache_modified_scripts();
        }

        self.units.sort_by_cached_key(|unit| unit.lock().name.clone());
        tracing::debug!(
            target: "kiln.session",
            session = self.id,
            units = ?self.unit_names(),
            failed = self.failed.len(),
            "session prepared"
        );
    }

    /// Pops the next queued unit, sealing the session once nothing is left.
    fn next_queued(&self) -> Option<Queued> {
        let mut intake = self.intake.lock();
        let unit = intake.pop();
        if unit.is_none() {
            intake.sealed = true;
        }
        unit
    }

    fn contains(&self, name: &str) -> bool {
        self.units.iter().any(|unit| unit.lock().name == name)
    }

    fn add_default_references(&mut self) {
        let cache = self.ctx.cache().clone();
        for name in &self.ctx.config().compiler.default_references {
            if !cache.library_exists(name) {
                continue;
            }
            match cache.load_library(name) {
                Ok(bytes) => {
                    let file = kiln_source::library_file_name(name);
                    tracing::trace!(target: "kiln.session", session = self.id, reference = %file, "added default reference");
                    self.references
                        .insert(file.clone(), CompilerFile::new(file, bytes.to_vec()));
                }
                Err(err) => {
                    tracing::warn!(target: "kiln.session", reference = %name, error = %err, "failed to read default reference");
                }
            }
        }
    }

    fn prepare_unit(&mut self, unit: UnitRef) {
        let name = unit.lock().name.clone();
        if self.contains(&name) {
            return;
        }
        // Queued again after being failed or dropped earlier in this preparation.
        self.failed.remove(&name);
        self.dropped.remove(&name);

        let compiler = &self.ctx.config().compiler;
        let cached = refresh_unit(&unit, &compiler.defines, compiler.lock_retry()).and_then(|_| {
            let mut guard = unit.lock();
            guard.error = None;
            let mut source = guard.lines.iter().skip(compiler.defines.len());
            if source.all(|line| line.trim().is_empty()) {
                Err(SourceError::Empty)
            } else {
                Ok(())
            }
        });
        if let Err(err) = cached {
            unit.lock().clear_analysis();
            self.links.insert(name.clone(), UnitLinks::default());
            tracing::warn!(target: "kiln.session", session = self.id, unit = %name, error = %err, "unit removed from session");
            self.remove_unit(&name, Some(err.to_string()));
            return;
        }

        self.units.push(unit.clone());
        let (analysis, links) = {
            let mut guard = unit.lock();
            let analysis = self.ctx.analyzer().analyze(&mut guard);
            let links = UnitLinks {
                requires: guard.requires.clone(),
                references: guard.references.clone(),
            };
            (analysis, links)
        };
        self.links.insert(name.clone(), links.clone());
        if let Err(err) = analysis {
            self.remove_unit(&name, Some(err.to_string()));
            return;
        }

        let UnitLinks {
            requires,
            references,
        } = links;
        for reference in &references {
            if let Err(message) = self.add_reference(reference) {
                tracing::error!(target: "kiln.session", session = self.id, unit = %name, reference = %reference, "{message}");
                self.remove_unit(&name, Some(message));
                return;
            }
        }
        for dependency in requires {
            self.add_dependency(&dependency);
        }

        // Loaded units built against this one have to be rebuilt with it.
        for loaded in self.ctx.loaded_units() {
            let requires_this = self
                .ctx
                .registry()
                .get(&loaded)
                .as_ref()
                .is_some_and(|unit| unit.lock().requires.contains(&name));
            if requires_this {
                self.add_dependency(&loaded);
            }
        }
    }

    /// Libraries missing on disk were already vetted by analysis and are kept
    /// as symbolic references.
    fn add_reference(&mut self, name: &str) -> Result<(), String> {
        let file = kiln_source::library_file_name(name);
        if self.references.contains_key(&file) {
            return Ok(());
        }
        let cache = self.ctx.cache().clone();
        if !cache.library_exists(name) {
            return Ok(());
        }
        let bytes = cache
            .load_library(name)
            .map_err(|err| format!("Referenced assembly is invalid: {name} ({err})"))?;
        self.references
            .insert(file.clone(), CompilerFile::new(file, bytes.to_vec()));

        // A library that is itself a module image brings its own references.
        let Ok(image) = ModuleImage::parse(&bytes) else {
            return Ok(());
        };
        for reference in &image.references {
            if SKIPPED_TRANSITIVE_REFERENCES
                .iter()
                .any(|skipped| reference.starts_with(skipped))
            {
                continue;
            }
            if !cache.library_exists(reference) {
                tracing::warn!(target: "kiln.session", session = self.id, reference = %reference, library = %name, "reference of referenced library not found");
                continue;
            }
            if let Err(message) = self.add_reference(reference) {
                tracing::warn!(target: "kiln.session", session = self.id, reference = %reference, library = %name, "{message}");
            }
        }
        Ok(())
    }

    fn add_dependency(&mut self, name: &str) {
        if self.ctx.is_loading(name) || self.contains(name) {
            return;
        }
        let unit = self.ctx.unit(name);
        let name = unit.lock().name.clone();

        if let Some(module) = self.ctx.fresh_module(&name) {
            self.referenced_modules.insert(name);
            if !self.references.contains_key(&module.name) {
                let image = module.reference_image(self.ctx.cache());
                self.references.insert(
                    module.name.clone(),
                    CompilerFile::new(module.name.clone(), image.to_vec()),
                );
            }
            return;
        }

        if self.intake.lock().push(unit, false) {
            tracing::debug!(target: "kiln.session", session = self.id, unit = %name, "dependency folded into session");
        }
    }

    /// Remove `name` and, transitively, the dependencies that were pulled in
    /// only for it. `error` is `None` for units dropped by that cascade.
    fn remove_unit(&mut self, name: &str, error: Option<String>) {
        let removed = self.units.iter().position(|unit| unit.lock().name == name);
        let removed = removed.map(|index| self.units.remove(index));
        {
            let mut intake = self.intake.lock();
            let Intake { queue, queued, .. } = &mut *intake;
            queue.retain(|entry| {
                let keep = entry.unit.lock().name != name;
                if !keep {
                    queued.remove(&identity(&entry.unit));
                }
                keep
            });
        }

        match error {
            Some(error) => {
                if let Some(unit) = self.ctx.registry().get(name) {
                    unit.lock().error = Some(error.clone());
                }
                self.failed.insert(name.to_owned(), error);
            }
            None => {
                self.dropped.insert(name.to_owned());
            }
        }

        let Some(removed) = removed else {
            return;
        };
        let requires = removed.lock().requires.clone();
        let orphans: Vec<String> = self
            .units
            .iter()
            .map(|unit| unit.lock())
            .filter(|unit| requires.contains(&unit.name) && !self.requested.contains(&unit.name))
            .map(|unit| unit.name.clone())
            .collect();
        for orphan in orphans {
            let still_required = self
                .units
                .iter()
                .any(|unit| unit.lock().requires.contains(&orphan));
            if !still_required {
                tracing::debug!(target: "kiln.session", session = self.id, unit = %orphan, removed = %name, "dropping dependency nothing else needs");
                self.remove_unit(&orphan, None);
            }
        }
    }

    /// Re-read scripts that changed while the session was being prepared,
    /// until they stop moving.
    fn cache_modified_scripts(&mut self) {
        let compiler = self.ctx.config().compiler.clone();
        for round in 0..MAX_SETTLE_ROUNDS {
            let modified: Vec<UnitRef> = self
                .units
                .iter()
                .filter(|unit| unit.lock().has_been_modified())
                .cloned()
                .collect();
            if modified.is_empty() {
                return;
            }
            for unit in modified {
                let result = refresh_unit(&unit, &compiler.defines, compiler.lock_retry());
                if let Err(err) = result {
                    let name = unit.lock().name.clone();
                    self.remove_unit(&name, Some(err.to_string()));
                }
            }
            tracing::debug!(target: "kiln.session", session = self.id, round, "scripts changed during preparation");
            std::thread::sleep(compiler.settle_delay());
        }
    }

    fn includes_required(&self, name: &str) -> bool {
        self.referenced_modules.contains(name)
            || self
                .units
                .iter()
                .any(|unit| {
                    let unit = unit.lock();
                    unit.name == name && unit.error.is_none()
                })
    }

    /// Stamp the start time and build the job for the worker. `None` when no
    /// unit has source left to compile.
    pub fn job(&mut self) -> Option<CompilerJob> {
        self.started = Some(Instant::now());
        let now = SystemTime::now();
        self.name = output_name(&self.unit_names(), now);

        let mut source_files = Vec::new();
        let mut included = BTreeSet::new();
        let mut empty = Vec::new();
        for unit in &self.units {
            let unit = unit.lock();
            let source = unit.source_bytes();
            if unit.lines.is_empty() || source.is_empty() {
                tracing::error!(target: "kiln.session", session = self.id, unit = %unit.name, "ignoring unit, file is empty");
                empty.push(unit.name.clone());
                continue;
            }
            for include in &unit.include_paths {
                if !included.insert(include.clone()) {
                    continue;
                }
                match std::fs::read(include) {
                    Ok(data) if !data.is_empty() => {
                        tracing::info!(target: "kiln.session", session = self.id, include = %include.display(), "adding include file");
                        source_files.push(CompilerFile::new(file_name(include), data));
                    }
                    Ok(_) => {
                        tracing::warn!(target: "kiln.session", include = %include.display(), "ignoring empty include file");
                    }
                    Err(err) => {
                        tracing::warn!(target: "kiln.session", include = %include.display(), error = %err, "failed to read include file");
                    }
                }
            }
            source_files.push(CompilerFile::new(file_name(&unit.script_path()), source));
        }
        for name in empty {
            self.remove_unit(&name, Some(SourceError::Empty.to_string()));
        }
        if self.units.is_empty() {
            return None;
        }

        let compiler = &self.ctx.config().compiler;
        Some(CompilerJob {
            output_file: self.name.clone(),
            source_files,
            reference_files: self.references.values().cloned().collect(),
            stdlib: compiler.stdlib,
            target: compiler.target.clone(),
            platform: compiler.platform.clone(),
            language_version: compiler.language_version.clone(),
            encoding: compiler.encoding.clone(),
            debug: compiler.debug,
            preprocessor: compiler.defines.iter().map(|symbol| escape_symbol(symbol)).collect(),
        })
    }

    /// Fold the worker's answer into per-unit results.
    pub fn completed(mut self, response: Result<JobResponse, SupervisorError>) -> SessionOutcome {
        let duration = self.started.map(|started| started.elapsed()).unwrap_or_default();
        let mut outcome = SessionOutcome {
            id: self.id,
            duration,
            ..SessionOutcome::default()
        };

        match response {
            Ok(response) => {
                self.attribute_diagnostics(&response);
                let module_units: Vec<String> = self
                    .units
                    .iter()
                    .map(|unit| unit.lock())
                    .filter(|unit| unit.error.is_none())
                    .map(|unit| unit.name.clone())
                    .collect();

                if response.has_module() && !module_units.is_empty() {
                    let sources = self
                        .units
                        .iter()
                        .map(|unit| unit.lock())
                        .filter(|unit| unit.error.is_none())
                        .map(|unit| (unit.script_path(), unit.cached_at))
                        .collect();
                    let module = CompiledModule::new(
                        self.name.clone(),
                        response.result.data,
                        response.result.symbols,
                        module_units.clone(),
                        sources,
                        duration,
                    );
                    outcome.module = Some(Arc::new(module));
                    outcome.compiled = module_units;
                    for unit in &self.units {
                        let unit = unit.lock();
                        if let Some(error) = &unit.error {
                            self.failed.insert(unit.name.clone(), error.clone());
                        }
                    }
                } else {
                    for unit in &self.units {
                        let mut unit = unit.lock();
                        let reason = unit
                            .error
                            .clone()
                            .unwrap_or_else(|| "compiler produced no module".to_owned());
                        let error = format!("Failed to compile: {reason}");
                        unit.error = Some(error.clone());
                        self.failed.insert(unit.name.clone(), error);
                    }
                }
            }
            Err(err) => {
                let error = err.to_string();
                tracing::error!(target: "kiln.session", session = self.id, error = %error, "session failed");
                for unit in &self.units {
                    let mut unit = unit.lock();
                    unit.error = Some(error.clone());
                    self.failed.insert(unit.name.clone(), error.clone());
                }
            }
        }

        outcome.failed = self.failed;
        outcome.dropped = self.dropped.into_iter().collect();
        outcome
    }

    fn attribute_diagnostics(&mut self, response: &JobResponse) {
        let plugins_dir = format!(
            "{}{}",
            self.ctx.config().paths.plugins_dir().display(),
            std::path::MAIN_SEPARATOR
        );
        for diagnostic in response.errors() {
            let script = diagnostic.script_name();
            let Some(unit) = self
                .units
                .iter()
                .find(|unit| unit.lock().name == script)
                .cloned()
            else {
                tracing::error!(target: "kiln.session", session = self.id, file = %diagnostic.file, message = %diagnostic.message, "unable to attribute compiler error");
                continue;
            };

            let requires = unit.lock().requires.clone();
            let missing: Vec<&str> = requires
                .iter()
                .filter(|name| !self.includes_required(name))
                .map(String::as_str)
                .collect();
            let error = if missing.is_empty() {
                diagnostic.message.trim().replace(&plugins_dir, "")
            } else {
                format!("Missing dependencies: {}", missing.join(","))
            };
            tracing::error!(target: "kiln.session", session = self.id, unit = %script, code = %diagnostic.code, "{error}");
            if let Some(hint) = diagnostic.hint() {
                tracing::error!(target: "kiln.session", session = self.id, unit = %script, "{hint}");
            }
            unit.lock().error = Some(error);
        }
    }
}

/// `<Unit>` for a single unit, `plugins_` for a batch, then the time in
/// 100 ns ticks and `.dll`.
pub fn output_name(units: &[String], now: SystemTime) -> String {
    let ticks = now
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_nanos() / 100)
        .unwrap_or_default();
    match units {
        [single] => format!("{single}{ticks}.dll"),
        _ => format!("plugins_{ticks}.dll"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
