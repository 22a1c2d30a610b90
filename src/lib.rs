//! # Stratum
//!
//! A pre-aggregation engine for semantic-layer query gateways.
//!
//! Stratum materializes expensive semantic-layer queries into an embedded
//! analytical cache engine and keeps those copies fresh on a fixed-delay
//! schedule, so the gateway can answer repeated queries from the cache
//! instead of the backend warehouse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Manifest (pre-aggregation definitions)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [manager]
//! ┌─────────────────────────────────────────────────────────┐
//! │   PreAggregationManager (pipelines + refresh schedule)   │
//! └─────────────────────────────────────────────────────────┘
//!         │                │                     │
//!         ▼ [rewrite]      ▼ [export]            ▼ [load]
//! ┌──────────────┐ ┌───────────────┐ ┌──────────────────────┐
//! │ QueryRewriter│ │ ExportService │ │ CacheEngine (SQLite) │
//! │ + Converter  │ │  (warehouse)  │ │   physical tables    │
//! └──────────────┘ └───────────────┘ └──────────────────────┘
//!                                               │
//!                                               ▼ [serve]
//! ┌─────────────────────────────────────────────────────────┐
//! │     TableMapping + RecordReader (query the cache)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager owns all mutable state: the table mapping (definition →
//! physical table or error), the refresh-task registry, the scheduled-job
//! handles, and the set of in-flight export locations. Nothing is persisted;
//! a restart rebuilds every pre-aggregation from the manifest.

pub mod config;
pub mod engine;
pub mod manifest;
pub mod planner;
pub mod preagg;

pub use engine::{CacheEngine, EngineError, SqliteCacheEngine};
pub use manifest::{Manifest, PreAggregationDefinition, SchemaKey, SessionContext};
pub use planner::{Connector, DialectConverter, ExportService, QueryRewriter};
pub use preagg::{
    ExportLocation, PreAggregationError, PreAggregationManager, RecordReader, TableBinding,
    TableMapping, TaskSnapshot, TaskStatus,
};
