//! Cache result reader.
//!
//! Adapts a cache-engine [`QueryStream`] into the gateway's row-iterator
//! abstraction. Wire types are resolved once at open and fixed for the
//! reader's lifetime. The single value transform applied per row: timestamp
//! columns convert the engine's native local date-time into epoch
//! microseconds in UTC, so downstream wire encoding never depends on an
//! implicit local time zone.

use chrono::NaiveDateTime;

use crate::engine::{EngineError, EngineResult, QueryStream, Value, WireType};

/// Forward-only reader over a cache query result.
///
/// Finite, single-pass, not restartable. [`RecordReader::close`] consumes the
/// reader, so a double close is unrepresentable.
pub struct RecordReader {
    wire_types: Vec<WireType>,
    column_names: Vec<String>,
    stream: QueryStream,
}

impl RecordReader {
    /// Open a reader over an engine stream, resolving wire types once.
    pub fn open(stream: QueryStream) -> Self {
        let wire_types = stream
            .columns()
            .iter()
            .map(|column| column.native_type.to_wire_type())
            .collect();
        let column_names = stream
            .columns()
            .iter()
            .map(|column| column.name.clone())
            .collect();
        Self {
            wire_types,
            column_names,
            stream,
        }
    }

    /// The wire type of each result column, in positional order.
    pub fn wire_types(&self) -> &[WireType] {
        &self.wire_types
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Pull and coerce the next row. `None` once the result set is
    /// exhausted.
    pub async fn next_row(&mut self) -> Option<EngineResult<Vec<Value>>> {
        let row = match self.stream.fetch().await? {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        let coerced: EngineResult<Vec<Value>> = row
            .into_iter()
            .zip(self.wire_types.iter())
            .map(|(value, wire_type)| coerce(*wire_type, value))
            .collect();
        Some(coerced)
    }

    /// Release the underlying cursor.
    pub fn close(mut self) {
        self.stream.close();
    }
}

fn coerce(wire_type: WireType, value: Value) -> EngineResult<Value> {
    match (wire_type, value) {
        (WireType::Timestamp, Value::Timestamp(datetime)) => {
            Ok(Value::Int(epoch_micros(datetime)))
        }
        (WireType::Timestamp, Value::Null) => Ok(Value::Null),
        (WireType::Timestamp, other) => Err(EngineError::unsupported(&other)),
        (_, value) => Ok(value),
    }
}

/// Native local date-time → epoch microseconds at UTC.
fn epoch_micros(datetime: NaiveDateTime) -> i64 {
    let instant = datetime.and_utc();
    instant.timestamp() * 1_000_000 + i64::from(instant.timestamp_subsec_nanos()) / 1_000
}
