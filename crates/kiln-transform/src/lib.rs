//! Post-build rewriting of compiled module images.
//!
//! A [`Pipeline`] holds an ordered list of [`Pass`]es. Each pass is gated by
//! module-level and per-element [`Predicate`]s; elements are visited type by
//! type (the type, then its properties, fields, methods and events, then its
//! nested types).

mod dispatch;
mod element;
mod pipeline;
mod predicate;
mod widen;

pub use dispatch::{DispatchEntry, DispatchTable, FastDispatch, CONSTRUCTOR_ERROR, HOOK_METHOD};
pub use element::{Element, ElementKind, Target};
pub use pipeline::{Pass, PassContext, Pipeline, TransformOutcome, UnitError};
pub use predicate::{ModulePredicate, NamePattern, Predicate};
pub use widen::{VisibilityWidening, COMPILER_GENERATED, EXTENSION};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("module image: {0}")]
    Module(#[from] kiln_module::Error),

    #[error("accessor {accessor} of {member} not found")]
    MissingAccessor { member: String, accessor: String },

    #[error("invalid dispatch table: {0}")]
    InvalidDispatchTable(String),
}
