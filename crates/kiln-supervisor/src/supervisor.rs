use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use kiln_config::WorkerConfig;
use kiln_proto::{CompilerJob, MessageId, MessageType, WireMessage, WorkerFailure};
use kiln_transport::{ChannelEvent, TransportChannel};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};

use crate::launcher::{WorkerLauncher, WorkerProcess};
use crate::{JobResponse, SupervisorError, WorkerState};

const COMMAND_QUEUE_DEPTH: usize = 64;

type Reply = oneshot::Sender<Result<JobResponse, SupervisorError>>;

enum Command {
    Compile {
        id: MessageId,
        job: Box<CompilerJob>,
        reply: Reply,
    },
    StopWorker {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the supervisor task.
///
/// Dropping every handle shuts the worker down gracefully.
pub struct BuildSupervisor {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WorkerState>,
}

impl BuildSupervisor {
    /// Spawn the supervisor task. The worker itself is not started until the
    /// first job arrives.
    pub fn start(config: WorkerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state) = watch::channel(WorkerState::Stopped);
        let actor = Supervisor {
            config,
            launcher,
            state: state_tx,
            generation: 0,
            worker: None,
            queued: VecDeque::new(),
            pending: HashMap::new(),
            idle_since: None,
        };
        tokio::spawn(actor.run(rx));
        Self { commands, state }
    }

    /// Send one job and wait for its response.
    ///
    /// `id` must not collide with another outstanding job.
    pub async fn compile(
        &self,
        id: MessageId,
        job: CompilerJob,
    ) -> Result<JobResponse, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Compile {
                id,
                job: Box::new(job),
                reply,
            })
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        response.await.map_err(|_| SupervisorError::Stopped)?
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Gracefully stop the current worker, if any. The next job starts a new one.
    pub async fn stop_worker(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::StopWorker { done }).await.is_ok() {
            let _ = stopped.await;
        }
    }

    /// Stop the worker and end the supervisor task. Later jobs fail with
    /// [`SupervisorError::Stopped`].
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = stopped.await;
        }
    }
}

struct Worker {
    channel: TransportChannel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    process: Box<dyn WorkerProcess>,
    ready: bool,
    started_at: Instant,
    last_seen: Instant,
    last_heartbeat: Instant,
}

enum Wake {
    Command(Option<Command>),
    Channel(Option<ChannelEvent>),
    Exited(Option<i32>),
    Timer,
}

struct Supervisor {
    config: WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    state: watch::Sender<WorkerState>,
    generation: u64,
    worker: Option<Worker>,
    /// Jobs accepted before the worker's ready handshake, in arrival order.
    queued: VecDeque<WireMessage>,
    pending: HashMap<MessageId, Reply>,
    idle_since: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            let wake = match self.worker.as_mut() {
                // Frames already read win over the exit notice.
                Some(worker) => tokio::select! {
                    biased;
                    event = worker.events.recv() => Wake::Channel(event),
                    command = commands.recv() => Wake::Command(command),
                    code = worker.process.wait() => Wake::Exited(code),
                    _ = sleep_until_opt(deadline) => Wake::Timer,
                },
                None => tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    _ = sleep_until_opt(deadline) => Wake::Timer,
                },
            };

            match wake {
                Wake::Command(Some(Command::Compile { id, job, reply })) => {
                    self.submit(id, *job, reply).await;
                }
                Wake::Command(Some(Command::StopWorker { done })) => {
                    self.stop_worker("stop requested").await;
                    let _ = done.send(());
                }
                Wake::Command(Some(Command::Shutdown { done })) => {
                    self.stop_worker("shutting down").await;
                    let _ = done.send(());
                    return;
                }
                Wake::Command(None) => {
                    self.stop_worker("all handles dropped").await;
                    return;
                }
                Wake::Channel(Some(ChannelEvent::Message(message))) => {
                    self.on_message(message).await;
                }
                Wake::Channel(Some(ChannelEvent::Closed(err))) => {
                    let reason = match err {
                        Some(err) => format!("channel closed: {err}"),
                        None => "channel closed".to_owned(),
                    };
                    self.crash(&reason).await;
                }
                Wake::Channel(None) => self.crash("channel closed").await,
                Wake::Exited(code) => {
                    self.drain_after_exit().await;
                    let reason = match code {
                        Some(code) => format!("worker exited with code {code}"),
                        None => "worker exited".to_owned(),
                    };
                    self.crash(&reason).await;
                }
                Wake::Timer => self.on_timer().await,
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(target: "kiln.supervisor", from = ?previous, to = ?state, "worker state changed");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let worker = self.worker.as_ref()?;
        if !worker.ready {
            return Some(worker.started_at + self.config.startup_timeout());
        }
        let mut deadline = (worker.last_heartbeat + self.config.heartbeat_interval())
            .min(worker.last_seen + self.config.heartbeat_timeout());
        if let Some(idle_since) = self.idle_since {
            deadline = deadline.min(idle_since + self.config.idle_timeout());
        }
        Some(deadline)
    }

    async fn submit(&mut self, id: MessageId, job: CompilerJob, reply: Reply) {
        if self.pending.contains_key(&id) {
            tracing::warn!(target: "kiln.supervisor", id, "rejecting job with an outstanding id");
            let _ = reply.send(Err(SupervisorError::DuplicateId(id)));
            return;
        }
        let message = match WireMessage::job(id, &job) {
            Ok(message) => message,
            Err(err) => {
                let _ = reply.send(Err(SupervisorError::Protocol(format!(
                    "failed to encode job: {err}"
                ))));
                return;
            }
        };

        self.pending.insert(id, reply);
        self.idle_since = None;

        if self.worker.is_none() && !self.spawn_worker() {
            return;
        }

        let ready = self.worker.as_ref().is_some_and(|worker| worker.ready);
        if ready {
            self.set_state(WorkerState::Busy);
            self.send(message).await;
        } else {
            tracing::debug!(target: "kiln.supervisor", id, "queueing job until worker is ready");
            self.queued.push_back(message);
        }
    }

    fn spawn_worker(&mut self) -> bool {
        self.generation += 1;
        let channel_id = format!("kiln-{}-{}", std::process::id(), self.generation);
        self.set_state(WorkerState::Starting);

        match self.launcher.launch(&channel_id) {
            Ok(connection) => {
                let (channel, events) = TransportChannel::start(connection.reader, connection.writer);
                let now = Instant::now();
                tracing::info!(
                    target: "kiln.supervisor",
                    generation = self.generation,
                    pid = ?connection.process.id(),
                    "started build worker"
                );
                self.worker = Some(Worker {
                    channel,
                    events,
                    process: connection.process,
                    ready: false,
                    started_at: now,
                    last_seen: now,
                    last_heartbeat: now,
                });
                true
            }
            Err(err) => {
                tracing::error!(target: "kiln.supervisor", error = %err, "failed to start build worker");
                self.set_state(WorkerState::Crashed);
                self.fail_outstanding(&format!("failed to start worker: {err}"));
                false
            }
        }
    }

    async fn send(&mut self, message: WireMessage) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        if let Err(err) = worker.channel.send(message).await {
            self.crash(&format!("failed to send to worker: {err}")).await;
        }
    }

    async fn on_message(&mut self, message: WireMessage) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        worker.last_seen = Instant::now();

        match message.kind {
            MessageType::Ready if !worker.ready => {
                worker.ready = true;
                tracing::info!(
                    target: "kiln.supervisor",
                    generation = self.generation,
                    queued = self.queued.len(),
                    "build worker ready"
                );
                self.send(WireMessage::ready()).await;
                while let Some(job) = self.queued.pop_front() {
                    self.send(job).await;
                }
                self.settle_state();
            }
            MessageType::Ready => {
                tracing::debug!(target: "kiln.supervisor", "ignoring repeated ready signal");
            }
            MessageType::Data => {
                let id = message.id;
                let response = JobResponse::from_message(message);
                self.complete(id, response);
            }
            MessageType::Error => {
                let id = message.id;
                let response = match WorkerFailure::decode(&message.data) {
                    Ok(failure) => Err(SupervisorError::Worker(failure.message)),
                    Err(err) => Err(SupervisorError::Protocol(format!(
                        "invalid failure payload: {err}"
                    ))),
                };
                self.complete(id, response);
            }
            MessageType::Heartbeat => {}
            MessageType::Shutdown | MessageType::Unknown => {
                tracing::debug!(target: "kiln.supervisor", kind = ?message.kind, "ignoring unexpected message");
            }
        }
    }

    fn complete(&mut self, id: MessageId, response: Result<JobResponse, SupervisorError>) {
        match self.pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(response);
            }
            None => {
                tracing::warn!(target: "kiln.supervisor", id, "protocol anomaly: response for unknown job dropped");
            }
        }
        self.settle_state();
    }

    /// Ready or Busy depending on what is outstanding.
    fn settle_state(&mut self) {
        if self.worker.as_ref().map_or(true, |worker| !worker.ready) {
            return;
        }
        if self.pending.is_empty() {
            if self.idle_since.is_none() {
                self.idle_since = Some(Instant::now());
            }
            self.set_state(WorkerState::Ready);
        } else {
            self.idle_since = None;
            self.set_state(WorkerState::Busy);
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let Some(worker) = self.worker.as_mut() else {
            return;
        };

        if !worker.ready {
            if now >= worker.started_at + self.config.startup_timeout() {
                let reason = format!(
                    "worker did not signal ready within {}ms",
                    self.config.startup_timeout_ms
                );
                self.crash(&reason).await;
            }
            return;
        }

        if now >= worker.last_seen + self.config.heartbeat_timeout() {
            let reason = format!(
                "no heartbeat from worker for {}ms",
                self.config.heartbeat_timeout_ms
            );
            self.crash(&reason).await;
            return;
        }

        if let Some(idle_since) = self.idle_since {
            if self.pending.is_empty() && now >= idle_since + self.config.idle_timeout() {
                self.stop_worker("idle").await;
                return;
            }
        }

        if now >= worker.last_heartbeat + self.config.heartbeat_interval() {
            worker.last_heartbeat = now;
            self.send(WireMessage::heartbeat()).await;
        }
    }

    /// Tear the worker down hard and fail everything outstanding. The next job
    /// starts a fresh worker.
    /// Delivers whatever the worker wrote before it exited. The read loop
    /// gets `kill_grace` per frame to catch up before the exit is a crash.
    async fn drain_after_exit(&mut self) {
        let grace = self.config.kill_grace();
        loop {
            let Some(worker) = self.worker.as_mut() else {
                return;
            };
            match timeout(grace, worker.events.recv()).await {
                Ok(Some(ChannelEvent::Message(message))) => self.on_message(message).await,
                _ => return,
            }
        }
    }

    async fn crash(&mut self, reason: &str) {
        tracing::warn!(
            target: "kiln.supervisor",
            reason,
            outstanding = self.pending.len(),
            "build worker unavailable"
        );
        self.set_state(WorkerState::Crashed);
        if let Some(mut worker) = self.worker.take() {
            worker.process.terminate().await;
            worker.channel.close().await;
        }
        self.fail_outstanding(reason);
    }

    async fn stop_worker(&mut self, reason: &str) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        tracing::info!(target: "kiln.supervisor", reason, "stopping build worker");
        self.set_state(WorkerState::Stopping);

        if worker.channel.send(WireMessage::shutdown()).await.is_ok() {
            match timeout(self.config.shutdown_grace(), worker.process.wait()).await {
                Ok(code) => {
                    tracing::debug!(target: "kiln.supervisor", code = ?code, "build worker exited");
                }
                Err(_) => {
                    tracing::warn!(
                        target: "kiln.supervisor",
                        grace_ms = self.config.shutdown_grace_ms,
                        "build worker ignored shutdown; terminating"
                    );
                    worker.process.terminate().await;
                }
            }
        } else {
            worker.process.terminate().await;
        }
        worker.channel.close().await;

        self.fail_outstanding(reason);
        self.set_state(WorkerState::Stopped);
    }

    fn fail_outstanding(&mut self, reason: &str) {
        self.queued.clear();
        self.idle_since = None;
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(SupervisorError::WorkerUnavailable(reason.to_owned())));
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
