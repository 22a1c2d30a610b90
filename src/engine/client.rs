//! SQLite-backed cache engine client.
//!
//! `rusqlite::Connection` is single-threaded, so the engine runs it on a
//! dedicated blocking thread and serves commands over a channel: callers send
//! an [`EngineCommand`] with a oneshot reply, the loop answers in arrival
//! order. Query results are fed row by row into the stream's channel so the
//! reader side stays forward-only and single-pass.
//!
//! Dropping the client closes the command channel, which ends the loop and
//! the thread.

use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::types::{Column, NativeType, Value};
use super::{CacheEngine, EngineError, EngineResult, QueryStream};

/// Command channel depth. Callers awaiting `send` provide backpressure.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Accepted text layouts for timestamp columns.
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

enum EngineCommand {
    ExecuteDdl {
        sql: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    DropTableQuietly {
        table: String,
        reply: oneshot::Sender<()>,
    },
    Query {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<EngineResult<QueryStream>>,
    },
}

/// Cache engine backed by an embedded SQLite database.
pub struct SqliteCacheEngine {
    commands: mpsc::Sender<EngineCommand>,
    _loop_thread: std::thread::JoinHandle<()>,
}

impl SqliteCacheEngine {
    /// Open an engine backed by a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        Ok(Self::start(conn))
    }

    /// Open an in-memory engine (also used by tests).
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::start(conn))
    }

    fn start(conn: Connection) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let loop_thread = std::thread::Builder::new()
            .name("cache-engine".to_string())
            .spawn(move || run_command_loop(conn, rx))
            .expect("failed to spawn cache engine thread");
        Self {
            commands: tx,
            _loop_thread: loop_thread,
        }
    }

    async fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

#[async_trait::async_trait]
impl CacheEngine for SqliteCacheEngine {
    async fn execute_ddl(&self, sql: &str) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ExecuteDdl {
            sql: sql.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn drop_table_quietly(&self, table: &str) {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .send(EngineCommand::DropTableQuietly {
                table: table.to_string(),
                reply,
            })
            .await;
        if sent.is_err() {
            warn!(table = %table, "cache engine is shut down; cannot drop table");
            return;
        }
        let _ = rx.await;
    }

    async fn query(&self, sql: &str, params: Vec<Value>) -> EngineResult<QueryStream> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Query {
            sql: sql.to_string(),
            params,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// The engine thread: owns the connection, answers commands until every
/// client handle is dropped.
fn run_command_loop(conn: Connection, mut commands: mpsc::Receiver<EngineCommand>) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            EngineCommand::ExecuteDdl { sql, reply } => {
                let result = conn.execute_batch(&sql).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineCommand::DropTableQuietly { table, reply } => {
                let sql = format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\""));
                if let Err(e) = conn.execute_batch(&sql) {
                    warn!(table = %table, error = %e, "failed to drop cache table");
                } else {
                    debug!(table = %table, "dropped cache table");
                }
                let _ = reply.send(());
            }
            EngineCommand::Query { sql, params, reply } => {
                run_query(&conn, &sql, params, reply);
            }
        }
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: Vec<Value>,
    reply: oneshot::Sender<EngineResult<QueryStream>>,
) {
    let mut statement = match conn.prepare(sql) {
        Ok(statement) => statement,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };

    // Wire types are fixed for the stream's lifetime, resolved here once.
    let columns: Vec<Column> = statement
        .columns()
        .iter()
        .map(|c| Column {
            name: c.name().to_string(),
            native_type: NativeType::from_decl(c.decl_type()),
        })
        .collect();

    let mut rows = match statement.query(rusqlite::params_from_iter(params)) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };

    let (row_tx, stream) = QueryStream::channel(columns.clone());
    if reply.send(Ok(stream)).is_err() {
        // Caller went away before the stream opened.
        return;
    }

    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let decoded = decode_row(&columns, row);
                let stop = decoded.is_err();
                // Blocks when the reader lags; the queue bounds how much of
                // the result set sits in memory.
                if row_tx.blocking_send(decoded).is_err() || stop {
                    // Reader closed the stream, or the row was undecodable.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = row_tx.blocking_send(Err(e.into()));
                break;
            }
        }
    }
}

fn decode_row(columns: &[Column], row: &rusqlite::Row<'_>) -> EngineResult<Vec<Value>> {
    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let raw = row.get_ref(index)?;
        values.push(decode_value(column.native_type, raw)?);
    }
    Ok(values)
}

fn decode_value(native_type: NativeType, raw: ValueRef<'_>) -> EngineResult<Value> {
    let value = match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => match native_type {
            NativeType::Boolean => Value::Bool(v != 0),
            _ => Value::Int(v),
        },
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match native_type {
                NativeType::Timestamp => Value::Timestamp(parse_timestamp(&text)?),
                _ => Value::Text(text),
            }
        }
    };
    Ok(value)
}

fn parse_timestamp(text: &str) -> EngineResult<NaiveDateTime> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(parsed);
        }
    }
    Err(EngineError::InvalidTimestamp(text.to_string()))
}
