use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hashbrown::HashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use skein_db::{JobStore, StoreError};
use skein_model::{JobId, JobStatus, SyncCounters, SyncJob};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Server-sent event shapes for live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    State {
        job_id: JobId,
        status: JobStatus,
    },
    Progress {
        job_id: JobId,
        counters: SyncCounters,
        entities_by_kind: BTreeMap<String, u64>,
    },
    Error {
        job_id: JobId,
        kind: String,
        message: String,
    },
    Done {
        job_id: JobId,
        status: JobStatus,
        counters: SyncCounters,
    },
    Heartbeat {
        job_id: JobId,
    },
}

/// Per-process fan-out of job progress events. Best-effort for live
/// subscribers: a slow consumer lags and drops, it never blocks the job.
/// Terminal state goes through `persist_terminal`, which writes the job row
/// before the final events are published.
#[derive(Default)]
pub struct ProgressBus {
    channels: Mutex<HashMap<JobId, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, job_id: JobId) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, job_id: JobId, event: ProgressEvent) {
        // No receivers is fine; events before the first subscriber are lost
        // by design.
        let _ = self.sender(job_id).send(event);
    }

    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<ProgressEvent> {
        self.sender(job_id).subscribe()
    }

    /// Persist the terminal job row, then emit the final error (if any) and
    /// the done event, then retire the channel.
    pub fn persist_terminal(
        &self,
        jobs: &JobStore,
        job_id: JobId,
        status: JobStatus,
        error: Option<(String, String)>,
        counters: SyncCounters,
    ) -> Result<SyncJob, StoreError> {
        let job = jobs.transition(
            job_id,
            status,
            error.as_ref().map(|(_, message)| message.clone()),
            Some(counters),
        )?;

        if let Some((kind, message)) = error {
            self.publish(
                job_id,
                ProgressEvent::Error {
                    job_id,
                    kind,
                    message,
                },
            );
        }
        self.publish(
            job_id,
            ProgressEvent::Done {
                job_id,
                status,
                counters,
            },
        );
        self.channels.lock().unwrap().remove(&job_id);
        Ok(job)
    }
}

/// Live counters for one in-flight job. The orchestrator's tasks increment
/// these; nothing else writes them. Progress events are published at most
/// every `publish_every` processed entities to keep the bus quiet on large
/// jobs.
pub struct SyncProgress {
    job_id: JobId,
    bus: Arc<ProgressBus>,
    publish_every: u64,
    inserted: AtomicU64,
    updated: AtomicU64,
    kept: AtomicU64,
    skipped: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    by_kind: Mutex<HashMap<String, u64>>,
    last_published: AtomicU64,
    last_event_at: Mutex<Instant>,
}

impl SyncProgress {
    pub fn new(job_id: JobId, bus: Arc<ProgressBus>, publish_every: u64) -> Self {
        Self {
            job_id,
            bus,
            publish_every: publish_every.max(1),
            inserted: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            kept: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            by_kind: Mutex::new(HashMap::new()),
            last_published: AtomicU64::new(0),
            last_event_at: Mutex::new(Instant::now()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    fn bump_kind(&self, kind: &str) {
        let mut by_kind = self.by_kind.lock().unwrap();
        *by_kind.entry_ref(kind).or_insert(0) += 1;
    }

    pub fn record_inserted(&self, kind: &str, n: u64) {
        self.inserted.fetch_add(n, Ordering::Relaxed);
        for _ in 0..n {
            self.bump_kind(kind);
        }
        self.maybe_publish();
    }

    pub fn record_updated(&self, kind: &str, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
        for _ in 0..n {
            self.bump_kind(kind);
        }
        self.maybe_publish();
    }

    pub fn record_kept(&self, kind: &str, n: u64) {
        self.kept.fetch_add(n, Ordering::Relaxed);
        for _ in 0..n {
            self.bump_kind(kind);
        }
        self.maybe_publish();
    }

    pub fn record_skipped(&self, kind: &str, reason: &str) {
        debug!("Entity of kind {kind} dead-lettered: {reason}");
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.bump_kind(kind);
        self.maybe_publish();
    }

    pub fn record_deleted(&self, n: u64) {
        self.deleted.fetch_add(n, Ordering::Relaxed);
        self.maybe_publish();
    }

    pub fn record_failed(&self, kind: &str, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
        for _ in 0..n {
            self.bump_kind(kind);
        }
        self.maybe_publish();
    }

    pub fn counters(&self) -> SyncCounters {
        SyncCounters {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn entities_by_kind(&self) -> BTreeMap<String, u64> {
        self.by_kind
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn maybe_publish(&self) {
        let total = self.counters().total_seen();
        let last = self.last_published.load(Ordering::Relaxed);
        if total >= last + self.publish_every
            && self
                .last_published
                .compare_exchange(last, total, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.publish_progress();
        }
    }

    pub fn publish_progress(&self) {
        *self.last_event_at.lock().unwrap() = Instant::now();
        self.bus.publish(
            self.job_id,
            ProgressEvent::Progress {
                job_id: self.job_id,
                counters: self.counters(),
                entities_by_kind: self.entities_by_kind(),
            },
        );
    }

    pub fn publish_state(&self, status: JobStatus) {
        *self.last_event_at.lock().unwrap() = Instant::now();
        self.bus.publish(
            self.job_id,
            ProgressEvent::State {
                job_id: self.job_id,
                status,
            },
        );
    }

    /// Emit a bus heartbeat if nothing else has been published for
    /// `idle_for`. Called from the orchestrator's heartbeat tick.
    pub fn heartbeat_if_idle(&self, idle_for: std::time::Duration) {
        let mut last = self.last_event_at.lock().unwrap();
        if last.elapsed() >= idle_for {
            *last = Instant::now();
            self.bus
                .publish(self.job_id, ProgressEvent::Heartbeat { job_id: self.job_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn counters_accumulate() {
        let bus = Arc::new(ProgressBus::new());
        let progress = SyncProgress::new(Uuid::from_u128(1), bus, 100);
        progress.record_inserted("doc", 2);
        progress.record_kept("doc", 1);
        progress.record_failed("doc", 1);

        let counters = progress.counters();
        assert_eq!(counters.inserted, 2);
        assert_eq!(counters.kept, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(progress.entities_by_kind()["doc"], 4);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Arc::new(ProgressBus::new());
        let job_id = Uuid::from_u128(1);
        let mut rx = bus.subscribe(job_id);

        bus.publish(
            job_id,
            ProgressEvent::State {
                job_id,
                status: JobStatus::Running,
            },
        );
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProgressEvent::State { status: JobStatus::Running, .. }));
    }

    #[tokio::test]
    async fn progress_publishes_only_at_interval() {
        let bus = Arc::new(ProgressBus::new());
        let job_id = Uuid::from_u128(1);
        let mut rx = bus.subscribe(job_id);
        let progress = SyncProgress::new(job_id, bus, 10);

        progress.record_inserted("doc", 9);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        progress.record_inserted("doc", 1);
        assert!(matches!(rx.try_recv(), Ok(ProgressEvent::Progress { .. })));
    }

    #[test]
    fn event_wire_shape_is_tagged() {
        let event = ProgressEvent::Heartbeat {
            job_id: Uuid::from_u128(7),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heartbeat");
    }

    #[tokio::test]
    async fn persist_terminal_writes_row_then_events() {
        let store = skein_db::Store::ephemeral().unwrap();
        let bus = Arc::new(ProgressBus::new());
        let job = SyncJob::new(Uuid::from_u128(1));
        store.jobs().create(&job).unwrap();
        let mut rx = bus.subscribe(job.id);

        let persisted = bus
            .persist_terminal(
                store.jobs(),
                job.id,
                JobStatus::Failed,
                Some(("source_fatal".to_string(), "boom".to_string())),
                SyncCounters::default(),
            )
            .unwrap();
        assert_eq!(persisted.status, JobStatus::Failed);
        assert_eq!(persisted.error.as_deref(), Some("boom"));

        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Error { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Done { .. }));
    }
}
