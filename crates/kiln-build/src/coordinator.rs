use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kiln_proto::CompilerJob;
use kiln_source::UnitRef;
use kiln_supervisor::{BuildSupervisor, JobResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::context::BuildContext;
use crate::host::{BuildHost, UnitReport};
use crate::module::{CompiledModule, LoadedModule};
use crate::session::{CompilationSession, SessionHandle, SessionId, SessionOutcome, UnitLinks};

/// Delay between the first request of a batch and the session it opens.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

enum Request {
    Compile(String),
    IncludeChanged(String),
    Unloading(String),
    Shutdown(oneshot::Sender<()>),
}

/// A session back from the blocking pool, with everything the coordinator
/// needs read out of its units.
struct Prepared {
    session: CompilationSession,
    units: Vec<String>,
    links: BTreeMap<String, UnitLinks>,
    job: Option<CompilerJob>,
}

enum Event {
    Prepared(Box<Prepared>),
    Compiled(SessionOutcome),
    Loaded {
        unit: String,
        module: Arc<CompiledModule>,
        loaded: Arc<LoadedModule>,
    },
}

enum Wake {
    Request(Option<Request>),
    Event(Event),
    Tick,
}

/// Handle to the coordinator task, the single owner of host-visible build
/// state.
pub struct BuildCoordinator {
    requests: mpsc::UnboundedSender<Request>,
    ctx: Arc<BuildContext>,
}

impl BuildCoordinator {
    pub fn start(
        ctx: Arc<BuildContext>,
        supervisor: Arc<BuildSupervisor>,
        host: Arc<dyn BuildHost>,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let actor = Coordinator {
            ctx: ctx.clone(),
            supervisor,
            host,
            events_tx,
            accepting: None,
            batch: Vec::new(),
            batch_due: None,
            awaiting: BTreeMap::new(),
            deferred: BTreeSet::new(),
            links: BTreeMap::new(),
            next_session: 0,
        };
        tokio::spawn(actor.run(rx, events));
        Self { requests, ctx }
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    /// Compile `unit` (and whatever it requires) and hand it to the host.
    pub fn request_compile(&self, unit: impl Into<String>) {
        let _ = self.requests.send(Request::Compile(unit.into()));
    }

    /// An include file changed; rebuild every unit referencing it.
    pub fn include_changed(&self, name: impl Into<String>) {
        let _ = self.requests.send(Request::IncludeChanged(name.into()));
    }

    /// The host is unloading `unit` on its own.
    pub fn unloading(&self, unit: impl Into<String>) {
        let _ = self.requests.send(Request::Unloading(unit.into()));
    }

    /// Stop the coordinator and its worker. Loads still in flight are dropped.
    pub async fn shutdown(self) {
        let (done, stopped) = oneshot::channel();
        if self.requests.send(Request::Shutdown(done)).is_ok() {
            let _ = stopped.await;
        }
    }
}

struct Coordinator {
    ctx: Arc<BuildContext>,
    supervisor: Arc<BuildSupervisor>,
    host: Arc<dyn BuildHost>,
    events_tx: mpsc::UnboundedSender<Event>,
    /// Session still in preparation that new requests can join.
    accepting: Option<SessionHandle>,
    batch: Vec<UnitRef>,
    batch_due: Option<Instant>,
    /// Compiled units waiting for a requirement that is still loading.
    awaiting: BTreeMap<String, Arc<CompiledModule>>,
    /// Reloads postponed while the unit or one of its dependents is loading.
    deferred: BTreeSet<String>,
    /// Requires and references per unit from the latest preparation. Units
    /// are never locked from the actor; a preparation may be holding them.
    links: BTreeMap<String, UnitLinks>,
    next_session: SessionId,
}

impl Coordinator {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            let wake = tokio::select! {
                request = requests.recv() => Wake::Request(request),
                Some(event) = events.recv() => Wake::Event(event),
                _ = sleep_until_opt(self.batch_due) => Wake::Tick,
            };

            match wake {
                Wake::Request(Some(Request::Compile(unit))) => self.request_compile(&unit),
                Wake::Request(Some(Request::IncludeChanged(name))) => self.include_changed(&name),
                Wake::Request(Some(Request::Unloading(unit))) => {
                    self.ctx.set_loaded(&unit, false);
                    self.unload_dependents(&unit);
                }
                Wake::Request(Some(Request::Shutdown(done))) => {
                    self.supervisor.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Wake::Request(None) => {
                    self.supervisor.shutdown().await;
                    return;
                }
                Wake::Event(Event::Prepared(prepared)) => self.on_prepared(*prepared),
                Wake::Event(Event::Compiled(outcome)) => self.on_session_complete(outcome),
                Wake::Event(Event::Loaded {
                    unit,
                    module,
                    loaded,
                }) => self.on_loaded(&unit, &module, &loaded),
                Wake::Tick => self.on_tick(),
            }
        }
    }

    fn request_compile(&mut self, name: &str) {
        if self.should_defer(name) {
            tracing::debug!(target: "kiln.coordinator", unit = %name, "reload deferred while a load is in flight");
            self.deferred.insert(name.to_owned());
            return;
        }
        self.ctx.set_loading(name, true);

        if let Some(module) = self.ctx.fresh_module(name) {
            tracing::debug!(target: "kiln.coordinator", unit = %name, module = %module.name, "reusing compiled module");
            self.on_compiled(name, module);
            return;
        }

        let unit = self.ctx.unit(name);
        if let Some(handle) = &self.accepting {
            if handle.add(&unit) {
                return;
            }
            self.accepting = None;
        }
        if self.batch.is_empty() {
            self.batch_due = Some(Instant::now() + TICK_INTERVAL);
        }
        self.batch.push(unit);
    }

    fn should_defer(&self, name: &str) -> bool {
        if self.ctx.is_loading(name) {
            return true;
        }
        self.ctx
            .loading_units()
            .iter()
            .any(|loading| self.requires_of(loading).contains(name))
    }

    fn on_tick(&mut self) {
        self.batch_due = None;
        self.ctx.cache().evict_idle();
        if self.batch.is_empty() {
            return;
        }

        self.next_session = self.next_session.wrapping_add(1).max(1);
        let units = std::mem::take(&mut self.batch);
        let (mut session, handle) =
            CompilationSession::new(self.next_session, self.ctx.clone(), &units);
        tracing::debug!(target: "kiln.coordinator", session = handle.id(), units = units.len(), "opening session");
        self.accepting = Some(handle);

        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            session.prepare();
            let job = session.job();
            let prepared = Prepared {
                units: session.unit_names(),
                links: session.links().clone(),
                job,
                session,
            };
            let _ = events.send(Event::Prepared(Box::new(prepared)));
        });
    }

    fn on_prepared(&mut self, prepared: Prepared) {
        let Prepared {
            session,
            units,
            links,
            job,
        } = prepared;
        if self
            .accepting
            .as_ref()
            .is_some_and(|handle| handle.id() == session.id())
        {
            self.accepting = None;
        }
        self.links.extend(links);
        for name in &units {
            self.ctx.set_loading(name, true);
            self.deferred.remove(name);
        }

        let Some(job) = job else {
            // Nothing left to compile, so no unit is touched here.
            let outcome = session.completed(Ok(JobResponse::default()));
            self.on_session_complete(outcome);
            return;
        };

        tracing::info!(target: "kiln.coordinator", session = session.id(), units = ?units, "compiling");
        let supervisor = self.supervisor.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let response = supervisor.compile(session.id(), job).await;
            let outcome = session.completed(response);
            let _ = events.send(Event::Compiled(outcome));
        });
    }

    fn on_session_complete(&mut self, outcome: SessionOutcome) {
        if let Some(module) = &outcome.module {
            self.ctx.record_module(module);
            tracing::info!(
                target: "kiln.coordinator",
                session = outcome.id,
                module = %module.name,
                units = ?outcome.compiled,
                elapsed_ms = outcome.duration.as_millis() as u64,
                "compiled successfully"
            );
        }

        for (name, error) in &outcome.failed {
            tracing::error!(target: "kiln.coordinator", unit = %name, "error while compiling: {error}");
            self.fail(name, error.clone());
            self.loading_completed(name);
        }
        for name in &outcome.dropped {
            self.loading_completed(name);
        }
        if let Some(module) = outcome.module {
            for name in &outcome.compiled {
                self.on_compiled(name, module.clone());
            }
        }
    }

    fn requires_of(&self, name: &str) -> BTreeSet<String> {
        self.links
            .get(name)
            .map(|links| links.requires.clone())
            .unwrap_or_default()
    }

    fn on_compiled(&mut self, name: &str, module: Arc<CompiledModule>) {
        let requires = self.requires_of(name);

        // Requirements being reloaded must not stay live under the new build.
        for required in &requires {
            if self.ctx.is_loaded(required) && self.ctx.is_loading(required) {
                self.unload(required);
            }
        }

        let missing: Vec<&str> = requires
            .iter()
            .filter(|required| !self.ctx.is_loaded(required))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let loading: Vec<&str> = missing
                .iter()
                .copied()
                .filter(|required| self.ctx.is_loading(required))
                .collect();
            if loading.is_empty() {
                let error = format!("Missing dependencies: {}", missing.join(","));
                tracing::error!(target: "kiln.coordinator", unit = %name, "{error}");
                self.fail(name, error);
                self.loading_completed(name);
            } else {
                tracing::debug!(target: "kiln.coordinator", unit = %name, waiting_for = ?loading, "waiting for requirements to load");
                self.awaiting.insert(name.to_owned(), module);
            }
            return;
        }

        if self.ctx.is_loaded(name) {
            self.unload(name);
        }

        let pipeline = self.ctx.pipeline().clone();
        let ctx = self.ctx.clone();
        let events = self.events_tx.clone();
        let unit = name.to_owned();
        tokio::spawn(async move {
            let loaded = module.load(pipeline, ctx.cache()).await;
            let _ = events.send(Event::Loaded {
                unit,
                module,
                loaded,
            });
        });
    }

    fn on_loaded(&mut self, name: &str, module: &Arc<CompiledModule>, loaded: &LoadedModule) {
        if let Some(error) = loaded.error_for(name) {
            self.fail(name, error.to_owned());
        } else if self.host.load_requested(name, module) {
            self.ctx.set_loaded(name, true);
            tracing::info!(target: "kiln.coordinator", unit = %name, module = %module.name, "loaded");
            self.host.unit_changed(UnitReport::loaded(name, module));
        } else {
            self.fail(name, format!("Host refused to load {name}"));
        }
        self.loading_completed(name);
    }

    fn fail(&mut self, name: &str, error: String) {
        self.host.unit_changed(UnitReport::failed(name, error));
    }

    fn loading_completed(&mut self, name: &str) {
        self.ctx.set_loading(name, false);

        let waiting: Vec<String> = self
            .awaiting
            .keys()
            .filter(|unit| self.requires_of(unit).contains(name))
            .cloned()
            .collect();
        for unit in waiting {
            if let Some(module) = self.awaiting.remove(&unit) {
                self.on_compiled(&unit, module);
            }
        }

        let ready: Vec<String> = self
            .deferred
            .iter()
            .filter(|unit| !self.should_defer(unit))
            .cloned()
            .collect();
        for unit in ready {
            self.deferred.remove(&unit);
            self.request_compile(&unit);
        }
    }

    /// Ask the host to unload `name` and everything loaded on top of it.
    fn unload(&mut self, name: &str) {
        if !self.ctx.set_loaded(name, false) {
            return;
        }
        tracing::debug!(target: "kiln.coordinator", unit = %name, "unloading");
        self.host.unload_requested(name);
        self.unload_dependents(name);
    }

    fn unload_dependents(&mut self, name: &str) {
        for dependent in self.ctx.loaded_units() {
            if self.requires_of(&dependent).contains(name) {
                self.unload(&dependent);
            }
        }
    }

    fn include_changed(&mut self, name: &str) {
        let reference = format!("{}.{name}", self.ctx.config().compiler.host_namespace);
        let affected: Vec<String> = self
            .links
            .iter()
            .filter(|(_, links)| links.references.contains(&reference))
            .map(|(unit, _)| unit.clone())
            .collect();
        for unit in affected {
            tracing::info!(target: "kiln.coordinator", unit = %unit, include = %reference, "reloading because it references an updated include file");
            self.ctx.forget_module(&unit);
            self.request_compile(&unit);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
