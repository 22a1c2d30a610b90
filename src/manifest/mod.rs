//! Semantic-model manifest types.
//!
//! The manifest enumerates the pre-aggregation definitions for one
//! catalog/schema pair. It is loaded once (typically from JSON shipped by the
//! gateway's deployment pipeline) and never mutated; the manager only reads
//! it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for manifest loading.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to parse manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The semantic-model manifest for one catalog/schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub catalog: String,
    pub schema: String,

    /// Pre-aggregation definitions, in manifest order.
    #[serde(default)]
    pub pre_aggregations: Vec<PreAggregationDefinition>,
}

impl Manifest {
    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The pre-aggregation definitions in this manifest.
    pub fn definitions(&self) -> &[PreAggregationDefinition] {
        &self.pre_aggregations
    }

    /// Registry key for one of this manifest's definitions.
    pub fn key_for(&self, definition_name: &str) -> SchemaKey {
        SchemaKey::new(&self.catalog, &self.schema, definition_name)
    }
}

/// One pre-aggregation: a named semantic query materialized on a schedule.
///
/// Immutable; owned by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAggregationDefinition {
    name: String,

    /// The semantic query this pre-aggregation materializes, as understood by
    /// the gateway's planner (usually `SELECT * FROM <model>`).
    source_query: String,

    /// Fixed delay between the end of one refresh and the start of the next.
    refresh_seconds: u64,
}

impl PreAggregationDefinition {
    pub fn new(
        name: impl Into<String>,
        source_query: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source_query: source_query.into(),
            refresh_seconds: refresh_interval.as_secs(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_query(&self) -> &str {
        &self.source_query
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }
}

/// (catalog, schema, definition name) — the registry key type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    pub catalog: String,
    pub schema: String,
    pub name: String,
}

impl SchemaKey {
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Whether this key belongs to the given catalog/schema pair.
    pub fn in_schema(&self, catalog: &str, schema: &str) -> bool {
        self.catalog == catalog && self.schema == schema
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.name)
    }
}

/// Session context passed to the planner and dialect converter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub catalog: String,
    pub schema: String,
}

impl SessionContext {
    pub fn builder() -> SessionContextBuilder {
        SessionContextBuilder::default()
    }
}

/// Builder for [`SessionContext`].
#[derive(Debug, Default)]
pub struct SessionContextBuilder {
    catalog: Option<String>,
    schema: Option<String>,
}

impl SessionContextBuilder {
    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn build(self) -> SessionContext {
        SessionContext {
            catalog: self.catalog.unwrap_or_default(),
            schema: self.schema.unwrap_or_default(),
        }
    }
}
