//! Table mapping registry: definition → current physical table (or error).

use dashmap::DashMap;

use crate::manifest::SchemaKey;

/// The current physical state of one pre-aggregation definition.
///
/// Exactly one of `table_name` / `error` is set after any completed refresh
/// cycle; bindings are replaced wholesale, never field-patched, so readers
/// never observe a half-written entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    table_name: Option<String>,
    error: Option<String>,
    created_at_millis: i64,
}

impl TableBinding {
    /// Binding for a successfully materialized table.
    pub fn ready(table_name: impl Into<String>, created_at_millis: i64) -> Self {
        Self {
            table_name: Some(table_name.into()),
            error: None,
            created_at_millis,
        }
    }

    /// Binding for a failed materialization.
    pub fn failed(error: impl Into<String>, created_at_millis: i64) -> Self {
        Self {
            table_name: None,
            error: Some(error.into()),
            created_at_millis,
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.table_name.is_some()
    }

    pub fn created_at_millis(&self) -> i64 {
        self.created_at_millis
    }
}

/// Concurrent registry of table bindings.
///
/// Individual entries are atomic; no cross-entry transactions. Callers never
/// need their own locking.
#[derive(Debug, Default)]
pub struct TableMapping {
    entries: DashMap<SchemaKey, TableBinding>,
}

impl TableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the binding for a key wholesale.
    pub fn put(&self, key: SchemaKey, binding: TableBinding) {
        self.entries.insert(key, binding);
    }

    pub fn remove(&self, key: &SchemaKey) {
        self.entries.remove(key);
    }

    pub fn get(&self, key: &SchemaKey) -> Option<TableBinding> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every binding belonging to one catalog/schema pair.
    pub fn entries_for_schema(&self, catalog: &str, schema: &str) -> Vec<(SchemaKey, TableBinding)> {
        self.entries
            .iter()
            .filter(|entry| entry.key().in_schema(catalog, schema))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Resolve a definition to its queryable physical table.
    ///
    /// `None` when the definition has never completed a cycle; `Some(Err)`
    /// carries the stored error text when the last cycle failed.
    pub fn resolved_table(&self, key: &SchemaKey) -> Option<Result<String, String>> {
        self.get(key).map(|binding| match binding.table_name() {
            Some(table) => Ok(table.to_string()),
            None => Err(binding
                .error()
                .unwrap_or("pre-aggregation has not completed")
                .to_string()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
