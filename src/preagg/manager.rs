//! Pre-aggregation manager.
//!
//! Orchestrates the per-definition materialization pipelines, the fixed-delay
//! refresh schedule, the refresh-task registry and temp-export cleanup.
//!
//! # Failure isolation
//!
//! A materialization pipeline never lets an error escape: any failure is
//! recorded as an error binding in the table mapping and the partially built
//! table is dropped quietly. Sibling pipelines and the owning cycle always
//! run to completion. The only caller-visible error from the refresh path is
//! the "already running" guard.
//!
//! # Serialization
//!
//! `refresh_lock` guards the check-then-teardown-then-launch sequence so at
//! most one full refresh per schema is in flight. Everything else (table
//! mapping, task registry, export set) is an independently thread-safe
//! container; no transactions span them. A teardown racing an in-flight
//! pipeline is resolved by a per-schema generation: `remove_schema` bumps it
//! before tearing down, the pipeline validates it after publishing.

use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Settings, StorageSettings};
use crate::engine::{CacheEngine, Value};
use crate::manifest::{Manifest, PreAggregationDefinition, SchemaKey, SessionContext};
use crate::planner::Connector;

use super::mapping::{TableBinding, TableMapping};
use super::reader::RecordReader;
use super::task::{DefinitionOutcome, RefreshTask, TaskSnapshot};
use super::{ExportLocation, PreAggregationError, PreAggregationResult};

/// Orchestrator for materialized pre-aggregations.
///
/// Owns all mutable subsystem state. Construct once per process with
/// [`PreAggregationManager::new`] and share via the returned `Arc`.
pub struct PreAggregationManager {
    /// Handle to ourselves for the tasks we spawn; weak so a scheduled job
    /// never keeps the manager alive past its last strong reference.
    self_ref: Weak<Self>,

    engine: Arc<dyn CacheEngine>,
    connector: Connector,
    storage: StorageSettings,
    refresh_enabled: bool,

    mapping: TableMapping,
    tasks: DashMap<String, Arc<RefreshTask>>,
    scheduled: DashMap<SchemaKey, JoinHandle<()>>,
    exports_in_flight: DashSet<ExportLocation>,

    /// Per-schema teardown generation. `remove_schema` bumps it before it
    /// starts tearing down; pipelines that launched under an older generation
    /// undo their own publishes (see [`Self::materialize`]).
    generations: DashMap<(String, String), u64>,

    /// Guards check-then-teardown-then-launch; the single critical section.
    refresh_lock: Mutex<()>,
}

impl PreAggregationManager {
    pub fn new(engine: Arc<dyn CacheEngine>, connector: Connector, settings: &Settings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            engine,
            connector,
            storage: settings.storage.clone(),
            refresh_enabled: settings.refresh.enabled,
            mapping: TableMapping::new(),
            tasks: DashMap::new(),
            scheduled: DashMap::new(),
            exports_in_flight: DashSet::new(),
            generations: DashMap::new(),
            refresh_lock: Mutex::new(()),
        })
    }

    /// The table mapping, for the gateway's query-rewrite path.
    pub fn table_mapping(&self) -> &TableMapping {
        &self.mapping
    }

    /// Tear down the schema's current state and launch a fresh cycle.
    ///
    /// Fails with [`PreAggregationError::AlreadyRunning`] when a refresh task
    /// for this schema is still in progress; the existing table mapping is
    /// left untouched in that case. Returns as soon as the cycle is launched.
    pub async fn refresh(&self, manifest: &Arc<Manifest>) -> PreAggregationResult<()> {
        self.launch(manifest).await.map(|_| ())
    }

    /// Launch a refresh cycle and return its task immediately (RUNNING).
    pub async fn create_task(&self, manifest: &Arc<Manifest>) -> PreAggregationResult<TaskSnapshot> {
        let task = self.launch(manifest).await?;
        Ok(task.snapshot())
    }

    /// Launch a refresh cycle and wait for every initial materialization to
    /// finish, returning the final task snapshot.
    pub async fn create_task_and_wait(
        &self,
        manifest: &Arc<Manifest>,
    ) -> PreAggregationResult<TaskSnapshot> {
        let task = self.launch(manifest).await?;
        task.wait_until_done().await;
        self.get_task(task.id())
            .ok_or_else(|| PreAggregationError::TaskNotFound(task.id().to_string()))
    }

    /// Non-blocking scan of the task registry.
    pub fn list_tasks(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        in_progress: Option<bool>,
    ) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|task| catalog.map_or(true, |c| task.catalog == c))
            .filter(|task| schema.map_or(true, |s| task.schema == s))
            .filter(|task| in_progress.map_or(true, |p| task.in_progress() == p))
            .collect()
    }

    pub fn get_task(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(id).map(|entry| entry.value().snapshot())
    }

    /// Whether a recurring refresh job is installed for this key.
    pub fn scheduled_refresh_exists(&self, key: &SchemaKey) -> bool {
        self.scheduled.contains_key(key)
    }

    /// Execute a query directly against the cache engine.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> PreAggregationResult<RecordReader> {
        let stream = self.engine.query(sql, params).await?;
        Ok(RecordReader::open(stream))
    }

    /// Cancel the schema's recurring jobs, drop its bound tables
    /// (best-effort) and clear its registry entries. Idempotent.
    ///
    /// A pipeline still in flight for this schema notices the generation bump
    /// when it finishes and retracts whatever it published, so the teardown
    /// is complete even when it races an initial materialization.
    pub async fn remove_schema(&self, catalog: &str, schema: &str) {
        *self
            .generations
            .entry((catalog.to_string(), schema.to_string()))
            .or_insert(0) += 1;

        self.scheduled.retain(|key, handle| {
            if key.in_schema(catalog, schema) {
                handle.abort();
                false
            } else {
                true
            }
        });

        for (key, binding) in self.mapping.entries_for_schema(catalog, schema) {
            if let Some(table) = binding.table_name() {
                self.engine.drop_table_quietly(table).await;
            }
            self.mapping.remove(&key);
        }
    }

    /// Delete one tracked export location. No-op when the location was
    /// already released; the set's atomic remove guards the double delete.
    pub async fn release_one(&self, location: &ExportLocation) {
        if self.exports_in_flight.remove(location).is_none() {
            return;
        }
        if let Err(e) = self.connector.export.release(location).await {
            warn!(location = %location, error = %e, "failed to delete export location");
        } else {
            debug!(location = %location, "deleted export location");
        }
    }

    /// Drain and delete every tracked export location.
    pub async fn clean_all(&self) {
        let locations: Vec<ExportLocation> = self
            .exports_in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for location in locations {
            self.release_one(&location).await;
        }
    }

    /// Stop every recurring job and clean up tracked export locations.
    /// Called once at process teardown.
    pub async fn shutdown(&self) {
        for entry in self.scheduled.iter() {
            entry.value().abort();
        }
        self.scheduled.clear();
        self.clean_all().await;
    }

    /// The guarded check-then-teardown-then-launch sequence.
    async fn launch(&self, manifest: &Arc<Manifest>) -> PreAggregationResult<Arc<RefreshTask>> {
        let _guard = self.refresh_lock.lock().await;

        let running = self.tasks.iter().any(|entry| {
            let task = entry.value();
            task.catalog() == manifest.catalog
                && task.schema() == manifest.schema
                && task.in_progress()
        });
        if running {
            return Err(PreAggregationError::AlreadyRunning {
                catalog: manifest.catalog.clone(),
                schema: manifest.schema.clone(),
            });
        }

        self.remove_schema(&manifest.catalog, &manifest.schema).await;

        let task = Arc::new(RefreshTask::new(&manifest.catalog, &manifest.schema));
        self.tasks.insert(task.id().to_string(), Arc::clone(&task));
        info!(
            catalog = %manifest.catalog,
            schema = %manifest.schema,
            task = task.id(),
            definitions = manifest.definitions().len(),
            "launching refresh cycle"
        );
        self.spawn_cycle(manifest, &task);
        Ok(task)
    }

    /// Start one independent pipeline per definition; the cycle is DONE once
    /// every initial run completes, whatever the individual outcomes.
    fn spawn_cycle(&self, manifest: &Arc<Manifest>, task: &Arc<RefreshTask>) {
        let generation = self.generation(&manifest.catalog, &manifest.schema);
        let initial_runs: Vec<JoinHandle<()>> = manifest
            .definitions()
            .iter()
            .cloned()
            .map(|definition| {
                let weak = self.self_ref.clone();
                let manifest = Arc::clone(manifest);
                tokio::spawn(async move {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    let published = manager.materialize(&manifest, &definition, generation).await;
                    if published && manager.refresh_enabled {
                        manager.install_recurring(&manifest, definition, generation);
                    }
                })
            })
            .collect();

        let weak = self.self_ref.clone();
        let manifest = Arc::clone(manifest);
        let task = Arc::clone(task);
        tokio::spawn(async move {
            futures::future::join_all(initial_runs).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            task.complete(manager.collect_outcomes(&manifest));
            debug!(task = task.id(), "refresh cycle complete");
        });
    }

    /// One materialization pipeline. Never propagates an error; returns
    /// whether a ready binding was published.
    ///
    /// The binding is published first and the generation checked second;
    /// a racing `remove_schema` bumps the generation before it scans the
    /// mapping, so one of the two sides always sees the other's write and
    /// the stale binding is retracted.
    async fn materialize(
        &self,
        manifest: &Manifest,
        definition: &PreAggregationDefinition,
        generation: u64,
    ) -> bool {
        let key = manifest.key_for(definition.name());
        let table = physical_table_name(definition.name());
        let created_at = Utc::now().timestamp_millis();

        match self.try_materialize(manifest, definition, &table).await {
            Ok(()) => {
                let previous = self
                    .mapping
                    .get(&key)
                    .and_then(|binding| binding.table_name().map(str::to_string));
                self.mapping
                    .put(key.clone(), TableBinding::ready(&table, created_at));
                if self.generation(&manifest.catalog, &manifest.schema) != generation {
                    // The schema was torn down while this pipeline ran.
                    self.mapping.remove(&key);
                    self.engine.drop_table_quietly(&table).await;
                    return false;
                }
                if let Some(previous) = previous {
                    // Superseded by the new table; readers opened against it
                    // before the swap have already resolved their name.
                    self.engine.drop_table_quietly(&previous).await;
                }
                info!(definition = %key, table = %table, "pre-aggregation refreshed");
                true
            }
            Err(e) => {
                self.engine.drop_table_quietly(&table).await;
                let message = format!(
                    "Failed to refresh pre-aggregation {}: {e}",
                    definition.name()
                );
                error!(definition = %key, error = %e, "pre-aggregation refresh failed");
                self.mapping
                    .put(key.clone(), TableBinding::failed(message, created_at));
                if self.generation(&manifest.catalog, &manifest.schema) != generation {
                    self.mapping.remove(&key);
                }
                false
            }
        }
    }

    /// Rewrite → convert → export → load. Errors from any step bubble to
    /// [`Self::materialize`], which records them.
    async fn try_materialize(
        &self,
        manifest: &Manifest,
        definition: &PreAggregationDefinition,
        table: &str,
    ) -> PreAggregationResult<()> {
        let context = SessionContext::builder()
            .catalog(&manifest.catalog)
            .schema(&manifest.schema)
            .build();

        let neutral = self
            .connector
            .rewriter
            .rewrite(definition.source_query(), &context, manifest)
            .await?;
        let native = self.connector.converter.convert(&neutral, &context).await?;

        let exported = self
            .connector
            .export
            .materialize(&manifest.catalog, &manifest.schema, definition.name(), &native)
            .await?;

        // None: the backend materialized server-side, nothing to load.
        if let Some(location) = exported {
            self.exports_in_flight.insert(location.clone());
            let statement =
                self.storage
                    .load_statement(&location.path, &location.file_pattern, table);
            let loaded = self.engine.execute_ddl(&statement).await;
            // The export is deleted whether or not the load succeeded.
            self.release_one(&location).await;
            loaded?;
        }
        Ok(())
    }

    /// Install the fixed-delay recurring job for one definition. The delay is
    /// measured from completion of the previous run, so slow refreshes never
    /// overlap.
    fn install_recurring(
        &self,
        manifest: &Arc<Manifest>,
        definition: PreAggregationDefinition,
        generation: u64,
    ) {
        let key = manifest.key_for(definition.name());
        let interval = definition.refresh_interval();
        let weak = self.self_ref.clone();
        let job_manifest = Arc::clone(manifest);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.materialize(&job_manifest, &definition, generation).await;
            }
        });

        if let Some(stale) = self.scheduled.insert(key.clone(), handle) {
            stale.abort();
        }
        // A teardown racing this install either finds the handle in the map
        // and aborts it, or bumped the generation before we read it here.
        if self.generation(&manifest.catalog, &manifest.schema) != generation {
            if let Some((_, handle)) = self.scheduled.remove(&key) {
                handle.abort();
            }
        }
    }

    /// Current teardown generation for a catalog/schema pair.
    fn generation(&self, catalog: &str, schema: &str) -> u64 {
        self.generations
            .get(&(catalog.to_string(), schema.to_string()))
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    fn collect_outcomes(&self, manifest: &Manifest) -> Vec<DefinitionOutcome> {
        manifest
            .definitions()
            .iter()
            .map(|definition| {
                let binding = self.mapping.get(&manifest.key_for(definition.name()));
                DefinitionOutcome {
                    name: definition.name().to_string(),
                    table_name: binding
                        .as_ref()
                        .and_then(|b| b.table_name().map(str::to_string)),
                    error: binding.as_ref().and_then(|b| b.error().map(str::to_string)),
                    refresh_seconds: definition.refresh_interval().as_secs(),
                    created_at_millis: binding.map(|b| b.created_at_millis()).unwrap_or_default(),
                }
            })
            .collect()
    }
}

/// Globally unique physical table name; names are never reused across runs
/// so an in-flight reader of the previous table is never disturbed.
fn physical_table_name(definition_name: &str) -> String {
    format!("{}_{}", definition_name, Uuid::new_v4().simple())
}
