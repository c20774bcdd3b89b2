use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::Rng;
use skein_model::{
    Cursor, DestinationError, JobStatus, PointId, SourceError, SyncCounters, SyncJob,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dest::Destination;
use crate::engine::SyncContext;
use crate::error::SyncError;
use crate::router::{DagRouter, PendingDelete, PendingUpsert, UpsertKind, WriteOp};
use crate::source::{Emitted, EntityEmitter};

/// What the durable-workflow layer hands the orchestrator: a cancellation
/// token and an optional heartbeat hook. The hook is invoked on the
/// heartbeat cadence with a counters snapshot; returning true requests
/// cancellation (heartbeats double as cancellation probes).
#[derive(Clone)]
pub struct ActivityContext {
    pub cancel: CancellationToken,
    heartbeat: Option<Arc<dyn Fn(SyncCounters) -> bool + Send + Sync>>,
}

impl ActivityContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(
        mut self,
        heartbeat: Arc<dyn Fn(SyncCounters) -> bool + Send + Sync>,
    ) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    fn beat(&self, counters: SyncCounters) -> bool {
        self.heartbeat
            .as_ref()
            .map(|hook| hook(counters))
            .unwrap_or(false)
    }
}

impl Default for ActivityContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one sync job from pending to a terminal state: one producer, a
/// dispatcher keeping per-entity-id order, a worker pool, and a single
/// destination writer. Terminal state is persisted before `run` returns.
pub struct SyncOrchestrator {
    ctx: Arc<SyncContext>,
}

impl SyncOrchestrator {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, activity: ActivityContext) -> Result<SyncJob, SyncError> {
        let ctx = &self.ctx;
        let job_id = ctx.job.id;
        info!(
            "Starting sync job {job_id} for connection {} ({})",
            ctx.connection.name, ctx.connection.id
        );

        let outcome = self.run_inner(&activity).await;
        let (status, error) = match outcome {
            Ok(status) => (status, None),
            Err(err) => {
                error!("Sync job {job_id} failed: {err}");
                (
                    JobStatus::Failed,
                    Some((err.kind().to_string(), err.to_string())),
                )
            }
        };

        let counters = ctx.progress.counters();
        info!(
            "Sync job {job_id} finished as {status}: {} inserted, {} updated, {} kept, \
             {} skipped, {} deleted, {} failed",
            counters.inserted,
            counters.updated,
            counters.kept,
            counters.skipped,
            counters.deleted,
            counters.failed,
        );
        let job = ctx
            .bus
            .persist_terminal(&ctx.jobs, job_id, status, error, counters)?;
        Ok(job)
    }

    async fn run_inner(&self, activity: &ActivityContext) -> Result<JobStatus, SyncError> {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        let job_id = ctx.job.id;
        let connection_id = ctx.connection.id;

        ctx.dag.validate_registered(
            &ctx.transformers,
            &ctx.destinations.keys().map(|name| name.as_str()).collect_vec(),
        )?;

        for destination in ctx.destinations.values() {
            destination
                .ensure_collection(&ctx.connection.collection_id, config.vector_dim, true)
                .await?;
        }

        ctx.jobs
            .transition(job_id, JobStatus::Running, None, None)?;
        ctx.progress.publish_state(JobStatus::Running);

        // The job token is a child of the activity token so that internal
        // failures can unwedge the producer without cancelling the
        // workflow's own token.
        let job_cancel = activity.cancel.child_token();

        let (entity_tx, entity_rx) = mpsc::channel::<Emitted>(config.queue_capacity());
        let (op_tx, op_rx) = mpsc::channel::<WriteOp>(config.queue_capacity().max(2));

        let router = Arc::new(DagRouter::new(
            ctx.dag.clone(),
            ctx.transformers.clone(),
            ctx.kinds.clone(),
            ctx.ledger.clone(),
            ctx.progress.clone(),
            ctx.connection.tenant_id.clone(),
            ctx.connection.collection_id.clone(),
            connection_id,
            job_id,
            config.reentry_depth_limit,
        ));

        let producer = {
            let source = ctx.source.clone();
            let emitter = EntityEmitter::new(entity_tx, job_cancel.clone());
            let start_cursor = ctx.connections.cursor(connection_id)?;
            let retry_delay = config.source_retry_delay();
            let cancel = job_cancel.clone();
            tokio::spawn(async move {
                produce_with_retry(source, start_cursor, emitter, retry_delay, cancel).await
            })
        };

        let mut worker_txs = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<Emitted>(2);
            worker_txs.push(tx);
            let router = router.clone();
            let op_tx = op_tx.clone();
            let cancel = job_cancel.clone();
            workers.push(tokio::spawn(async move {
                let result = worker(router, rx, op_tx, cancel).await;
                if let Err(err) = &result {
                    error!("Sync worker {index} failed: {err}");
                }
                result
            }));
        }
        drop(op_tx);

        let dispatcher = {
            let cancel = job_cancel.clone();
            tokio::spawn(async move { dispatch(entity_rx, worker_txs, cancel).await })
        };

        let writer = {
            let writer = Writer::new(ctx.clone());
            tokio::spawn(async move { writer.run(op_rx).await })
        };

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let stop = heartbeat_stop.clone();
            let activity = activity.clone();
            let job_cancel = job_cancel.clone();
            let progress = ctx.progress.clone();
            let interval = config.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // the immediate first tick
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if activity.beat(progress.counters()) {
                                info!("Heartbeat hook requested cancellation");
                                job_cancel.cancel();
                            }
                            progress.heartbeat_if_idle(interval);
                        }
                    }
                }
            })
        };

        let abort_handles: Vec<_> = workers
            .iter()
            .map(|handle| handle.abort_handle())
            .chain([producer.abort_handle(), dispatcher.abort_handle(), writer.abort_handle()])
            .collect();

        let drain = async move {
            let producer_result = producer.await.map_err(SyncError::Join)?;
            let dispatcher_result = dispatcher.await.map_err(SyncError::Join)?;
            let worker_results = join_all(workers).await;
            let writer_result = writer.await.map_err(SyncError::Join)?;

            // Worker and writer failures outrank the producer's: an
            // internal failure cancels the producer, and reporting that
            // cancellation would bury the cause.
            for result in worker_results {
                result.map_err(SyncError::Join)??;
            }
            writer_result?;
            dispatcher_result?;
            let cursor = match producer_result {
                Ok(cursor) => cursor,
                Err(SourceError::Cancelled) => None,
                Err(err) => return Err(SyncError::Source(err)),
            };
            Ok::<Option<Cursor>, SyncError>(cursor)
        };
        tokio::pin!(drain);

        let outcome = tokio::select! {
            result = &mut drain => DrainOutcome::Finished(result),
            _ = activity.cancel.cancelled() => {
                info!("Sync job {job_id} cancelled; draining in-flight work");
                ctx.jobs.transition(job_id, JobStatus::Cancelling, None, None)?;
                ctx.progress.publish_state(JobStatus::Cancelling);

                match tokio::time::timeout(config.drain_deadline(), &mut drain).await {
                    Ok(result) => DrainOutcome::Cancelled(result),
                    Err(_) => {
                        warn!("Drain deadline elapsed; abandoning in-flight work");
                        for handle in &abort_handles {
                            handle.abort();
                        }
                        DrainOutcome::Abandoned
                    }
                }
            }
        };
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match outcome {
            DrainOutcome::Finished(result) => {
                let cursor = result?;
                self.finish_deletes(&ctx).await?;
                if let Some(cursor) = cursor {
                    ctx.connections.commit_cursor(connection_id, &cursor)?;
                    debug!("Committed cursor {cursor:?} for connection {connection_id}");
                }
                Ok(JobStatus::Completed)
            }
            DrainOutcome::Cancelled(result) => {
                // Disappearance deletes are skipped on cancellation; a
                // partial cursor is still worth committing when the source
                // handed one back.
                if let Ok(Some(cursor)) = result {
                    ctx.connections.commit_cursor(connection_id, &cursor)?;
                }
                Ok(JobStatus::Cancelled)
            }
            DrainOutcome::Abandoned => Ok(JobStatus::Cancelled),
        }
    }

    /// Completion protocol: everything the ledger attributes to an earlier
    /// job has disappeared from the source. Deletes run children before
    /// parents; parent entries without a point of their own do not count.
    async fn finish_deletes(&self, ctx: &SyncContext) -> Result<(), SyncError> {
        let disappeared = ctx
            .ledger
            .list_disappeared(ctx.connection.id, ctx.job.id)?;
        if disappeared.is_empty() {
            return Ok(());
        }
        info!(
            "{} entities disappeared from connection {}; deleting",
            disappeared.len(),
            ctx.connection.id
        );

        let ordered = disappeared
            .iter()
            .filter(|entry| entry.entry.child_entity_ids.is_empty())
            .chain(
                disappeared
                    .iter()
                    .filter(|entry| !entry.entry.child_entity_ids.is_empty()),
            )
            .map(|entry| PendingDelete {
                point_id: PointId::derive(ctx.connection.id, &entry.entity_id),
                entity_id: entry.entity_id.clone(),
                counts: entry.entry.child_entity_ids.is_empty(),
            })
            .collect_vec();

        let batch = ctx.config.write_batch_size.max(1);
        for chunk in ordered.chunks(batch) {
            apply_deletes(ctx, chunk).await?;
        }
        Ok(())
    }
}

enum DrainOutcome {
    Finished(Result<Option<Cursor>, SyncError>),
    Cancelled(Result<Option<Cursor>, SyncError>),
    Abandoned,
}

async fn produce_with_retry(
    source: Arc<dyn crate::source::Source>,
    start_cursor: Option<Cursor>,
    emitter: EntityEmitter,
    retry_delay: Duration,
    cancel: CancellationToken,
) -> Result<Option<Cursor>, SourceError> {
    match source.produce(start_cursor.clone(), &emitter).await {
        Ok(cursor) => Ok(cursor),
        Err(SourceError::Transient(message)) => {
            warn!("Transient source failure: {message}; retrying once in {retry_delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = tokio::time::sleep(retry_delay) => {}
            }
            // Re-emission of already-seen entities is harmless: upserts are
            // idempotent and the ledger is monotone.
            source.produce(start_cursor, &emitter).await
        }
        Err(err) => Err(err),
    }
}

async fn dispatch(
    mut entity_rx: mpsc::Receiver<Emitted>,
    worker_txs: Vec<mpsc::Sender<Emitted>>,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    while let Some(emitted) = entity_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        let mut hasher = std::hash::DefaultHasher::new();
        emitted.entity.entity_id.hash(&mut hasher);
        let index = (hasher.finish() % worker_txs.len() as u64) as usize;
        if worker_txs[index].send(emitted).await.is_err() {
            // A worker died. Cancel the job token so the producer's next
            // emit fails instead of blocking on a full queue forever; the
            // worker's own error is what the join surfaces.
            warn!("Worker {index} is gone; releasing the producer");
            cancel.cancel();
            break;
        }
    }
    Ok(())
}

async fn worker(
    router: Arc<DagRouter>,
    mut rx: mpsc::Receiver<Emitted>,
    op_tx: mpsc::Sender<WriteOp>,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    loop {
        let emitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(emitted) => emitted,
                None => break,
            },
        };
        let ops = router.route(emitted.entity, emitted.emit_seq).await?;
        for op in ops {
            if op_tx.send(op).await.is_err() {
                // Writer died; its join result carries the error.
                return Ok(());
            }
        }
    }
    Ok(())
}

/// The single destination-writer task. Batches upserts per destination,
/// retries with backoff and jitter, splits a failing batch once, and
/// applies ledger records only after the corresponding write landed.
struct Writer {
    ctx: Arc<SyncContext>,
    buffer: Vec<PendingUpsert>,
}

impl Writer {
    fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            buffer: Vec::new(),
        }
    }

    fn batch_size(&self, destination: &Arc<dyn Destination>) -> usize {
        self.ctx
            .config
            .write_batch_size
            .min(destination.max_batch_size())
            .max(1)
    }

    async fn run(mut self, mut op_rx: mpsc::Receiver<WriteOp>) -> Result<(), SyncError> {
        while let Some(op) = op_rx.recv().await {
            match op {
                WriteOp::Upsert(pending) => {
                    self.buffer.push(pending);
                    if self.buffer.len() >= self.ctx.config.write_batch_size {
                        self.flush().await?;
                    }
                }
                WriteOp::DeletePoints(deletes) => {
                    apply_deletes(&self.ctx, &deletes).await?;
                }
                WriteOp::Record(record) => {
                    // A record op is sequenced after the upserts it depends
                    // on; they must hit the destination first.
                    self.flush().await?;
                    self.ctx.ledger.record_seen(
                        self.ctx.connection.id,
                        self.ctx.job.id,
                        &record.entity_id,
                        record.hash,
                        record.parent_entity_id.as_deref(),
                        record.children.clone(),
                        record.emit_seq,
                    )?;
                }
            }
        }
        self.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SyncError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut self.buffer);

        // Dedupe by entity id, keeping the freshest emission, and drop
        // anything the ledger already recorded at an equal or higher
        // sequence for this job. A late duplicate must not overwrite a
        // fresh update at the destination.
        pending.sort_by(|a, b| {
            a.record
                .entity_id
                .cmp(&b.record.entity_id)
                .then(b.record.emit_seq.cmp(&a.record.emit_seq))
        });
        pending.dedup_by(|next, first| next.record.entity_id == first.record.entity_id);

        let mut fresh = Vec::with_capacity(pending.len());
        for upsert in pending {
            let stale = self
                .ctx
                .ledger
                .lookup(self.ctx.connection.id, &upsert.record.entity_id)?
                .map(|entry| {
                    entry.last_seen_job_id == self.ctx.job.id
                        && entry.emit_seq >= upsert.record.emit_seq
                })
                .unwrap_or(false);
            if stale {
                debug!(
                    "Discarding stale write for entity {} (seq {})",
                    upsert.record.entity_id, upsert.record.emit_seq
                );
            } else {
                fresh.push(upsert);
            }
        }

        let grouped: Vec<(String, Vec<PendingUpsert>)> = fresh
            .into_iter()
            .chunk_by(|upsert| upsert.destination.clone())
            .into_iter()
            .map(|(destination_name, group)| (destination_name, group.collect_vec()))
            .collect();

        for (destination_name, group) in grouped {
            let destination = self
                .ctx
                .destinations
                .get(&destination_name)
                .ok_or_else(|| {
                    crate::error::DagError::UnknownDestination(destination_name.clone())
                })?
                .clone();
            for chunk in group.chunks(self.batch_size(&destination)) {
                self.write_chunk(&destination, chunk).await?;
            }
        }
        Ok(())
    }

    async fn write_chunk(
        &self,
        destination: &Arc<dyn Destination>,
        chunk: &[PendingUpsert],
    ) -> Result<(), SyncError> {
        let collection = &self.ctx.connection.collection_id;
        let points = chunk.iter().map(|upsert| upsert.point.clone()).collect_vec();

        match retry_bulk(&self.ctx.config, "upsert", || {
            destination.bulk_upsert(collection, &points)
        })
        .await
        {
            Ok(()) => self.commit_chunk(chunk)?,
            Err(err) if err.is_transient() => {
                // Retry budget exhausted: split once, then give up on the
                // halves that still fail and keep the job moving.
                warn!(
                    "Upsert batch of {} exhausted its retries; splitting once",
                    chunk.len()
                );
                let mid = chunk.len().div_ceil(2);
                for half in [&chunk[..mid], &chunk[mid..]] {
                    if half.is_empty() {
                        continue;
                    }
                    let half_points =
                        half.iter().map(|upsert| upsert.point.clone()).collect_vec();
                    match retry_bulk(&self.ctx.config, "upsert", || {
                        destination.bulk_upsert(collection, &half_points)
                    })
                    .await
                    {
                        Ok(()) => self.commit_chunk(half)?,
                        Err(err) if err.is_transient() => {
                            for upsert in half {
                                warn!(
                                    "Entity {} failed to write: {err}",
                                    upsert.record.entity_id
                                );
                                self.ctx.progress.record_failed(&upsert.entity_kind, 1);
                            }
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn commit_chunk(&self, chunk: &[PendingUpsert]) -> Result<(), SyncError> {
        for upsert in chunk {
            let outcome = self.ctx.ledger.record_seen(
                self.ctx.connection.id,
                self.ctx.job.id,
                &upsert.record.entity_id,
                upsert.record.hash,
                upsert.record.parent_entity_id.as_deref(),
                upsert.record.children.clone(),
                upsert.record.emit_seq,
            )?;
            if outcome == skein_db::RecordOutcome::Recorded {
                match upsert.kind {
                    UpsertKind::Insert => self.ctx.progress.record_inserted(&upsert.entity_kind, 1),
                    UpsertKind::Update => self.ctx.progress.record_updated(&upsert.entity_kind, 1),
                }
            }
        }
        Ok(())
    }
}

async fn apply_deletes(ctx: &SyncContext, deletes: &[PendingDelete]) -> Result<(), SyncError> {
    if deletes.is_empty() {
        return Ok(());
    }
    let point_ids = deletes.iter().map(|delete| delete.point_id).collect_vec();

    // The ledger does not track which destination holds a point; deletes
    // go to every configured destination and missing ids are tolerated.
    for destination in ctx.destinations.values() {
        retry_bulk(&ctx.config, "delete", || {
            destination.bulk_delete(&ctx.connection.collection_id, &point_ids)
        })
        .await?;
    }

    let mut counted = 0;
    for delete in deletes {
        ctx.ledger.remove(ctx.connection.id, &delete.entity_id)?;
        if delete.counts {
            counted += 1;
        }
    }
    if counted > 0 {
        ctx.progress.record_deleted(counted);
    }
    Ok(())
}

async fn retry_bulk<F, Fut>(
    config: &crate::config::EngineConfig,
    what: &str,
    mut call: F,
) -> Result<(), DestinationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DestinationError>>,
{
    let attempts = config.dest_retry_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match call().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() => {
                last_err = Some(err);
                if attempt + 1 < attempts {
                    let base = config
                        .dest_retry_base_delay_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    let jitter = rand::thread_rng().gen_range(0.75..1.25);
                    let delay = Duration::from_millis((base as f64 * jitter) as u64);
                    warn!(
                        "Transient destination failure on {what} (attempt {}/{attempts}); \
                         backing off {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| DestinationError::transient("retries exhausted")))
}
