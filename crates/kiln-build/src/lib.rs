//! Build sessions and the coordinator that schedules them.
//!
//! A [`BuildCoordinator`] owns the host-visible state: which units are loading
//! and loaded, which session is still accepting units, and which loads wait on
//! requirements. Session preparation and module transformation run on the
//! blocking pool and report back to the coordinator's loop.

mod context;
mod coordinator;
mod host;
mod module;
mod session;

pub use context::BuildContext;
pub use coordinator::{BuildCoordinator, TICK_INTERVAL};
pub use host::{BuildHost, UnitReport};
pub use module::{CompiledModule, LoadedModule};
pub use session::{
    output_name, CompilationSession, SessionHandle, SessionId, SessionOutcome, UnitLinks,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid marker pattern: {0}")]
    Markers(#[from] regex::Error),
}
