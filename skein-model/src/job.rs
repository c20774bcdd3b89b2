use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::entity::{ConnectionId, JobId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are write-once; the job store rejects transitions
    /// out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-job outcome counters. Every emitted entity lands in exactly one of
/// inserted/updated/kept/skipped/failed; deleted counts disappearance
/// deletes applied at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub inserted: u64,
    pub updated: u64,
    pub kept: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
}

impl SyncCounters {
    pub fn total_seen(&self) -> u64 {
        self.inserted + self.updated + self.kept + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub connection_id: ConnectionId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub counters: SyncCounters,
}

impl SyncJob {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            counters: SyncCounters::default(),
        }
    }
}

/// Persistent configuration binding one source to a destination collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConnection {
    pub id: ConnectionId,
    pub tenant_id: String,
    pub name: String,
    pub source_kind: String,
    /// Reference into the credential store; resolution is outside the
    /// engine, connectors receive the resolved value.
    pub auth_ref: Option<String>,
    /// Logical vector-store namespace this connection writes into. Several
    /// connections may share one collection.
    pub collection_id: String,
    pub config: serde_json::Value,
    /// Five-field cron expression, if the connection runs on a schedule.
    pub schedule: Option<String>,
    /// For incremental-pull sources: the source-side field the cursor
    /// tracks. Opaque to the engine.
    pub cursor_field: Option<String>,
}

impl SyncConnection {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        source_kind: impl Into<String>,
        collection_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            source_kind: source_kind.into(),
            auth_ref: None,
            collection_id: collection_id.into(),
            config: serde_json::Value::Null,
            schedule: None,
            cursor_field: None,
        }
    }
}

/// Connector-defined resumption token, persisted by the orchestrator on
/// successful completion and threaded back into the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
