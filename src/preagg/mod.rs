//! The pre-aggregation subsystem.
//!
//! Builds, schedules, refreshes and tears down materialized copies of
//! expensive semantic queries inside the embedded cache engine, and exposes
//! cache results through [`RecordReader`].
//!
//! Entry point is [`PreAggregationManager`]; the supporting registries
//! ([`TableMapping`], the task registry) are owned by it exclusively.

mod export;
mod manager;
mod mapping;
mod reader;
mod task;

pub use export::ExportLocation;
pub use manager::PreAggregationManager;
pub use mapping::{TableBinding, TableMapping};
pub use reader::RecordReader;
pub use task::{DefinitionOutcome, RefreshTask, TaskSnapshot, TaskStatus};

use crate::engine::EngineError;
use crate::planner::PlanError;

/// Result type for pre-aggregation operations.
pub type PreAggregationResult<T> = Result<T, PreAggregationError>;

/// Errors surfaced by the pre-aggregation subsystem.
///
/// Per-pipeline materialization failures are *not* represented here — they
/// are isolated inside the pipeline and recorded as failed table bindings.
#[derive(Debug, thiserror::Error)]
pub enum PreAggregationError {
    /// A refresh was requested while one is already running for the schema.
    /// The only user error the refresh path surfaces synchronously.
    #[error("pre-aggregation refresh is already running; catalog: {catalog}, schema: {schema}")]
    AlreadyRunning { catalog: String, schema: String },

    #[error("refresh task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}
