//! Refresh task registry types.
//!
//! A task tracks one full-schema refresh cycle from launch to completion.
//! Tasks are kept in memory for later inspection and never deleted; DONE is
//! terminal and tracks orchestration completion, not data-quality success.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle status of a refresh task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Done,
}

/// Per-definition outcome recorded when a cycle completes.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionOutcome {
    pub name: String,
    pub table_name: Option<String>,
    pub error: Option<String>,
    pub refresh_seconds: u64,
    pub created_at_millis: i64,
}

/// Read-only view of a task, safe to hand out from any read path.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub catalog: String,
    pub schema: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<DefinitionOutcome>,
}

impl TaskSnapshot {
    pub fn in_progress(&self) -> bool {
        self.status == TaskStatus::Running
    }
}

/// One full-schema refresh cycle.
pub struct RefreshTask {
    id: String,
    catalog: String,
    schema: String,
    started_at: DateTime<Utc>,
    status: watch::Sender<TaskStatus>,
    outcomes: std::sync::RwLock<Vec<DefinitionOutcome>>,
}

impl RefreshTask {
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>) -> Self {
        let (status, _) = watch::channel(TaskStatus::Running);
        Self {
            id: Uuid::new_v4().to_string(),
            catalog: catalog.into(),
            schema: schema.into(),
            started_at: Utc::now(),
            status,
            outcomes: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn in_progress(&self) -> bool {
        *self.status.borrow() == TaskStatus::Running
    }

    /// Record the per-definition outcomes and mark the task DONE.
    pub fn complete(&self, outcomes: Vec<DefinitionOutcome>) {
        {
            let mut slot = self.outcomes.write().unwrap_or_else(|e| e.into_inner());
            *slot = outcomes;
        }
        self.status.send_replace(TaskStatus::Done);
    }

    /// Suspend until the task reaches DONE.
    pub async fn wait_until_done(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while *rx.borrow_and_update() != TaskStatus::Done {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let outcomes = self
            .outcomes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        TaskSnapshot {
            id: self.id.clone(),
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
            status: *self.status.borrow(),
            started_at: self.started_at,
            outcomes,
        }
    }
}
