//! Value and type model for the cache engine.
//!
//! `NativeType` is the engine's own column type code, resolved once per query
//! from column metadata. `WireType` is what the gateway's wire protocol
//! speaks; the mapping between the two is fixed and total.

use std::fmt;

use chrono::NaiveDateTime;

/// A single cell value moving between the cache engine and the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// The engine's native local date-time, no time zone attached.
    Timestamp(NaiveDateTime),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

/// The cache engine's column type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Boolean,
    BigInt,
    Double,
    Decimal,
    Varchar,
    Blob,
    Date,
    Timestamp,
    /// Column with no declared type (computed expressions); values pass
    /// through untransformed.
    Unknown,
}

impl NativeType {
    /// Resolve a declared column type to an engine type code.
    pub fn from_decl(decl: Option<&str>) -> Self {
        let Some(decl) = decl else {
            return NativeType::Unknown;
        };
        let upper = decl.to_ascii_uppercase();
        if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
            NativeType::Timestamp
        } else if upper.contains("DATE") {
            NativeType::Date
        } else if upper.contains("BOOL") {
            NativeType::Boolean
        } else if upper.contains("INT") {
            NativeType::BigInt
        } else if upper.contains("DEC") || upper.contains("NUMERIC") {
            NativeType::Decimal
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            NativeType::Double
        } else if upper.contains("BLOB") {
            NativeType::Blob
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            NativeType::Varchar
        } else {
            NativeType::Unknown
        }
    }

    /// The wire type this engine type is served as.
    pub fn to_wire_type(self) -> WireType {
        match self {
            NativeType::Boolean => WireType::Bool,
            NativeType::BigInt => WireType::Int8,
            NativeType::Double => WireType::Float8,
            NativeType::Decimal => WireType::Numeric,
            NativeType::Varchar | NativeType::Unknown => WireType::Varchar,
            NativeType::Blob => WireType::Bytea,
            NativeType::Date => WireType::Date,
            NativeType::Timestamp => WireType::Timestamp,
        }
    }
}

/// The relational wire protocol's column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Bool,
    Int8,
    Float8,
    Numeric,
    Varchar,
    Bytea,
    Date,
    /// Served as epoch microseconds in UTC.
    Timestamp,
}

/// A result column: name plus resolved engine type.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub native_type: NativeType,
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef as SqlValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*v))),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(SqlValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(SqlValueRef::Blob(v)),
            Value::Timestamp(v) => ToSqlOutput::Owned(SqlValue::Text(
                v.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            )),
        })
    }
}
