//! Supervision of the out-of-process build worker.
//!
//! [`BuildSupervisor`] owns exactly one worker process at a time. It starts the
//! worker lazily on the first job, queues jobs until the worker's ready
//! handshake, matches responses to jobs by message id, stops the worker after
//! an idle period, and fails every outstanding job when the worker dies.

use kiln_proto::{parse_diagnostics, CompileResult, Diagnostic, MessageId, Severity, WireMessage};

mod launcher;
mod process;
mod supervisor;

pub use launcher::{
    worker_environment, BoxFuture, ProcessLauncher, Unconfigured, WorkerConnection,
    WorkerLauncher, WorkerProcess,
};
pub use supervisor::BuildSupervisor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// The worker crashed, timed out, or could not be started.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Job-level failure reported by the worker.
    #[error("{0}")]
    Worker(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session {0} is already outstanding")]
    DuplicateId(MessageId),

    #[error("build supervisor has shut down")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Stopping,
    Crashed,
}

/// A worker's answer to one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResponse {
    pub result: CompileResult,
    /// Compiler output, one diagnostic per line.
    pub stdout: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl JobResponse {
    pub(crate) fn from_message(message: WireMessage) -> Result<Self, SupervisorError> {
        let result = CompileResult::decode(&message.data)
            .map_err(|err| SupervisorError::Protocol(format!("invalid compile result: {err}")))?;
        let stdout = message.extra_data.unwrap_or_default();
        let diagnostics = parse_diagnostics(&stdout);
        Ok(Self {
            result,
            stdout,
            diagnostics,
        })
    }

    /// Whether the worker produced a module image.
    pub fn has_module(&self) -> bool {
        !self.result.data.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == Severity::Error)
    }
}
