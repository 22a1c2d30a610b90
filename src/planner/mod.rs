//! Capability seams toward the backend warehouse.
//!
//! The pre-aggregation manager consumes three external capabilities, one
//! implementation per backend warehouse, selected once at startup and bundled
//! into a [`Connector`]:
//!
//! - [`QueryRewriter`] — rewrites a semantic query into neutral SQL against
//!   the manifest's model.
//! - [`DialectConverter`] — converts neutral SQL into the backend's native
//!   dialect.
//! - [`ExportService`] — executes native SQL on the backend and exports the
//!   result set to an intermediate location the cache engine can load from.
//!
//! None of these are implemented here; the gateway wires in one per
//! configured backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::manifest::{Manifest, SessionContext};
use crate::preagg::ExportLocation;

/// Result type for planner and export operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors surfaced by the backend-facing capabilities.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The semantic query could not be rewritten against the model.
    #[error("query rewrite failed: {0}")]
    Rewrite(String),

    /// Neutral SQL could not be converted to the backend dialect.
    #[error("dialect conversion failed: {0}")]
    Convert(String),

    /// The backend failed to execute or export the native query.
    #[error("export failed: {0}")]
    Export(String),
}

/// Rewrites a semantic query into neutral SQL.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(
        &self,
        sql: &str,
        context: &SessionContext,
        manifest: &Manifest,
    ) -> PlanResult<String>;
}

/// Converts neutral SQL into backend-native SQL.
#[async_trait]
pub trait DialectConverter: Send + Sync {
    async fn convert(&self, sql: &str, context: &SessionContext) -> PlanResult<String>;
}

/// Executes native SQL on the backend and exports the results.
#[async_trait]
pub trait ExportService: Send + Sync {
    /// Materialize `native_sql` and export the result set.
    ///
    /// Returns `None` when the backend materialized the result server-side
    /// and there is nothing to load into the cache engine.
    async fn materialize(
        &self,
        catalog: &str,
        schema: &str,
        name: &str,
        native_sql: &str,
    ) -> PlanResult<Option<ExportLocation>>;

    /// Delete an export location and its files.
    async fn release(&self, location: &ExportLocation) -> PlanResult<()>;
}

/// The per-backend capability bundle, selected once at startup.
#[derive(Clone)]
pub struct Connector {
    pub rewriter: Arc<dyn QueryRewriter>,
    pub converter: Arc<dyn DialectConverter>,
    pub export: Arc<dyn ExportService>,
}

impl Connector {
    pub fn new(
        rewriter: Arc<dyn QueryRewriter>,
        converter: Arc<dyn DialectConverter>,
        export: Arc<dyn ExportService>,
    ) -> Self {
        Self {
            rewriter,
            converter,
            export,
        }
    }
}
