//! Embedded analytical cache engine.
//!
//! Pre-aggregated tables live inside an embedded engine owned by this
//! process. The manager talks to it through the [`CacheEngine`] trait:
//! DDL for creating/loading physical tables, quiet drops for best-effort
//! cleanup, and parametrized queries returning a forward-only
//! [`QueryStream`].
//!
//! The bundled implementation is [`SqliteCacheEngine`], a dedicated blocking
//! thread owning the database connection and serving commands over a channel
//! (see `client.rs`).

mod client;
mod types;

pub use client::SqliteCacheEngine;
pub use types::{Column, NativeType, Value, WireType};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur talking to the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine command loop has stopped.
    #[error("cache engine is shut down")]
    Closed,

    /// A reply channel closed before the engine answered.
    #[error("cache engine reply channel closed unexpectedly")]
    ChannelClosed,

    /// A timestamp column held a value that is not a valid date-time.
    #[error("invalid timestamp value: {0}")]
    InvalidTimestamp(String),

    /// A value could not be coerced to its column's wire type.
    #[error("Unsupported value: {value}")]
    UnsupportedValue { value: String },
}

impl EngineError {
    /// Build the diagnostic error for a value that cannot be coerced.
    pub fn unsupported(value: &Value) -> Self {
        EngineError::UnsupportedValue {
            value: value.to_string(),
        }
    }
}

/// Client interface to the embedded cache engine.
#[async_trait]
pub trait CacheEngine: Send + Sync {
    /// Execute a DDL/DML statement.
    async fn execute_ddl(&self, sql: &str) -> EngineResult<()>;

    /// Drop a physical table, swallowing and logging any failure.
    async fn drop_table_quietly(&self, table: &str);

    /// Execute a query with positional parameters.
    async fn query(&self, sql: &str, params: Vec<Value>) -> EngineResult<QueryStream>;
}

/// Row queue depth per query. The engine thread blocks once the reader
/// falls this far behind, so a large result set is never fully buffered.
const ROW_QUEUE_DEPTH: usize = 256;

/// A forward-only, single-pass result cursor.
///
/// Column types are resolved once at open; rows arrive over a bounded channel
/// fed by the engine, which waits for the reader to drain. Not restartable.
pub struct QueryStream {
    columns: Vec<Column>,
    rows: mpsc::Receiver<EngineResult<Vec<Value>>>,
}

impl QueryStream {
    /// Create a stream and the sender half that feeds it.
    pub fn channel(columns: Vec<Column>) -> (mpsc::Sender<EngineResult<Vec<Value>>>, Self) {
        let (tx, rx) = mpsc::channel(ROW_QUEUE_DEPTH);
        (tx, Self { columns, rows: rx })
    }

    /// The result columns, in positional order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Pull the next row. `None` once the result set is exhausted.
    pub async fn fetch(&mut self) -> Option<EngineResult<Vec<Value>>> {
        self.rows.recv().await
    }

    /// Release the cursor. The engine stops feeding rows once the channel
    /// closes.
    pub fn close(&mut self) {
        self.rows.close();
    }
}
