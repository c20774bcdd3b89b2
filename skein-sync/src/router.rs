use std::collections::BTreeSet;
use std::sync::Arc;

use log::warn;
use skein_db::Ledger;
use skein_model::{
    ConnectionId, ContentHash, Entity, JobId, KindRegistry, Point, PointId, content_hash,
};

use crate::dag::{DagNode, SyncDag};
use crate::error::{DagError, SyncError};
use crate::progress::SyncProgress;
use crate::transform::TransformerRegistry;

/// Ledger write to apply once the associated destination write (if any)
/// has succeeded.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub entity_id: String,
    pub hash: ContentHash,
    pub parent_entity_id: Option<String>,
    pub children: BTreeSet<String>,
    pub emit_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Insert,
    Update,
}

#[derive(Debug, Clone)]
pub struct PendingUpsert {
    pub destination: String,
    pub point: Point,
    pub kind: UpsertKind,
    pub entity_kind: String,
    pub record: LedgerRecord,
}

#[derive(Debug, Clone)]
pub struct PendingDelete {
    pub point_id: PointId,
    pub entity_id: String,
    /// Whether this delete counts toward the job's deleted counter.
    /// Parent entries without their own point are removed silently.
    pub counts: bool,
}

/// Ordered output of routing one entity. The writer consumes these FIFO;
/// a `Record` op is applied only after every upsert queued before it has
/// been flushed, which is what keeps a parent's ledger entry from claiming
/// children the destination never received.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert(PendingUpsert),
    DeletePoints(Vec<PendingDelete>),
    Record(LedgerRecord),
}

/// Routes one emitted entity through the per-connection DAG and decides,
/// against the ledger, whether the destination sees an insert, an update,
/// or nothing at all.
pub struct DagRouter {
    dag: SyncDag,
    transformers: TransformerRegistry,
    kinds: KindRegistry,
    ledger: Arc<dyn Ledger>,
    progress: Arc<SyncProgress>,
    tenant_id: String,
    collection_id: String,
    connection_id: ConnectionId,
    job_id: JobId,
    reentry_limit: usize,
}

impl DagRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dag: SyncDag,
        transformers: TransformerRegistry,
        kinds: KindRegistry,
        ledger: Arc<dyn Ledger>,
        progress: Arc<SyncProgress>,
        tenant_id: String,
        collection_id: String,
        connection_id: ConnectionId,
        job_id: JobId,
        reentry_limit: usize,
    ) -> Self {
        Self {
            dag,
            transformers,
            kinds,
            ledger,
            progress,
            tenant_id,
            collection_id,
            connection_id,
            job_id,
            reentry_limit,
        }
    }

    pub async fn route(&self, entity: Entity, emit_seq: u64) -> Result<Vec<WriteOp>, SyncError> {
        let Some(entry) = self.dag.entry(&entity.kind) else {
            self.progress.record_skipped(&entity.kind, "unrouted_kind");
            return Ok(Vec::new());
        };

        let spec = self.kinds.get_or_default(&entity.kind);
        let root_hash = content_hash(&entity, &spec)?;
        let existing = self
            .ledger
            .lookup(self.connection_id, &entity.entity_id)?;

        if let Some(existing_entry) = &existing {
            if existing_entry.content_hash == root_hash
                && self.keep(&entity, existing_entry, root_hash, emit_seq)?
            {
                return Ok(Vec::new());
            }
            // A hash hit with missing child entries falls through to the
            // update path, which regenerates the family.
        }

        let finals = self.transform_chain(entry, entity.clone()).await?;
        if finals.is_empty() {
            // Every output failed in a transformer; already counted. The
            // old family, if any, stays untouched until a later successful
            // pass replaces it.
            return Ok(Vec::new());
        }

        let mut ops = Vec::new();
        let new_child_ids: BTreeSet<String> = finals
            .iter()
            .filter(|(_, out)| out.entity_id != entity.entity_id)
            .map(|(_, out)| out.entity_id.clone())
            .collect();

        // Children present last run but not this run are orphans; they go
        // before the fresh upserts so the writer clears them first.
        if let Some(existing_entry) = &existing {
            let orphans: Vec<PendingDelete> = existing_entry
                .child_entity_ids
                .difference(&new_child_ids)
                .map(|id| PendingDelete {
                    point_id: PointId::derive(self.connection_id, id),
                    entity_id: id.clone(),
                    counts: true,
                })
                .collect();
            if !orphans.is_empty() {
                ops.push(WriteOp::DeletePoints(orphans));
            }
        }

        let is_fanout = !new_child_ids.is_empty();
        for (destination, out) in finals {
            let out_spec = self.kinds.get_or_default(&out.kind);
            let out_hash = content_hash(&out, &out_spec)?;

            if out.entity_id == entity.entity_id {
                let kind = if existing.is_some() {
                    UpsertKind::Update
                } else {
                    UpsertKind::Insert
                };
                let point = Point::from_entity(
                    &out,
                    &self.tenant_id,
                    &self.collection_id,
                    self.connection_id,
                    out_hash,
                )?;
                ops.push(WriteOp::Upsert(PendingUpsert {
                    destination,
                    point,
                    kind,
                    entity_kind: out.kind.clone(),
                    record: LedgerRecord {
                        entity_id: out.entity_id.clone(),
                        hash: root_hash,
                        parent_entity_id: entity.parent_entity_id.clone(),
                        children: BTreeSet::new(),
                        emit_seq,
                    },
                }));
                continue;
            }

            // Fan-out output: its own incremental decision against the
            // ledger, keyed by the child's content.
            match self.ledger.lookup(self.connection_id, &out.entity_id)? {
                Some(child_entry) if child_entry.content_hash == out_hash => {
                    self.ledger.record_seen(
                        self.connection_id,
                        self.job_id,
                        &out.entity_id,
                        out_hash,
                        Some(&entity.entity_id),
                        BTreeSet::new(),
                        emit_seq,
                    )?;
                    self.progress.record_kept(&out.kind, 1);
                }
                child_entry => {
                    let kind = if child_entry.is_some() {
                        UpsertKind::Update
                    } else {
                        UpsertKind::Insert
                    };
                    let point = Point::from_entity(
                        &out,
                        &self.tenant_id,
                        &self.collection_id,
                        self.connection_id,
                        out_hash,
                    )?;
                    ops.push(WriteOp::Upsert(PendingUpsert {
                        destination,
                        point,
                        kind,
                        entity_kind: out.kind.clone(),
                        record: LedgerRecord {
                            entity_id: out.entity_id.clone(),
                            hash: out_hash,
                            parent_entity_id: Some(entity.entity_id.clone()),
                            children: BTreeSet::new(),
                            emit_seq,
                        },
                    }));
                }
            }
        }

        if is_fanout {
            // The parent's own entry carries the child set and no point.
            // Queued last so it lands only after the children are flushed.
            ops.push(WriteOp::Record(LedgerRecord {
                entity_id: entity.entity_id.clone(),
                hash: root_hash,
                parent_entity_id: entity.parent_entity_id.clone(),
                children: new_child_ids,
                emit_seq,
            }));
        }

        Ok(ops)
    }

    /// Unchanged entity: refresh the job witness on the whole family and
    /// skip the destination entirely. Returns false when a tracked child
    /// has no ledger entry (a previous run was interrupted between child
    /// and parent bookkeeping) so the caller re-processes instead.
    fn keep(
        &self,
        entity: &Entity,
        existing: &skein_db::LedgerEntry,
        root_hash: ContentHash,
        emit_seq: u64,
    ) -> Result<bool, SyncError> {
        let mut child_records = Vec::with_capacity(existing.child_entity_ids.len());
        for child_id in &existing.child_entity_ids {
            match self.ledger.lookup(self.connection_id, child_id)? {
                Some(child_entry) => child_records.push((child_id.clone(), child_entry)),
                None => {
                    warn!(
                        "Entity {} tracks child {child_id} with no ledger entry; re-processing",
                        entity.entity_id
                    );
                    return Ok(false);
                }
            }
        }

        for (child_id, child_entry) in &child_records {
            self.ledger.record_seen(
                self.connection_id,
                self.job_id,
                child_id,
                child_entry.content_hash,
                child_entry.parent_entity_id.as_deref(),
                child_entry.child_entity_ids.clone(),
                emit_seq,
            )?;
        }
        self.ledger.record_seen(
            self.connection_id,
            self.job_id,
            &entity.entity_id,
            root_hash,
            entity.parent_entity_id.as_deref(),
            existing.child_entity_ids.clone(),
            emit_seq,
        )?;

        let kept = if child_records.is_empty() {
            1
        } else {
            child_records.len() as u64
        };
        self.progress.record_kept(&entity.kind, kept);
        Ok(true)
    }

    /// Walk the transformer chain from a kind node's successor, fanning
    /// out where transformers multiply entities and re-entering the graph
    /// where a transformer emits a kind the graph routes directly.
    async fn transform_chain(
        &self,
        entry: usize,
        entity: Entity,
    ) -> Result<Vec<(String, Entity)>, SyncError> {
        let mut finals = Vec::new();
        let mut stack = vec![(self.dag.next(entry), entity.kind.clone(), vec![entity], 0usize)];

        while let Some((node_idx, from_kind, batch, depth)) = stack.pop() {
            if batch.is_empty() {
                continue;
            }
            match self.dag.node(node_idx) {
                DagNode::Destination(name) => {
                    finals.extend(batch.into_iter().map(|out| (name.clone(), out)));
                }
                DagNode::Transformer(name) => {
                    let transformer = self
                        .transformers
                        .get(name)
                        .ok_or_else(|| DagError::UnknownTransformer(name.clone()))?;
                    let outputs = self.apply_isolating(&*transformer, name, batch).await;

                    let mut continuing = Vec::new();
                    for out in outputs {
                        if out.kind != from_kind {
                            if let Some(re_entry) = self.dag.entry(&out.kind) {
                                if depth + 1 > self.reentry_limit {
                                    self.progress.record_skipped(&out.kind, "reentry_depth");
                                } else {
                                    stack.push((
                                        self.dag.next(re_entry),
                                        out.kind.clone(),
                                        vec![out],
                                        depth + 1,
                                    ));
                                }
                                continue;
                            }
                        }
                        continuing.push(out);
                    }

                    let next_kind = continuing
                        .first()
                        .map(|out| out.kind.clone())
                        .unwrap_or(from_kind);
                    stack.push((self.dag.next(node_idx), next_kind, continuing, depth));
                }
                // Validation rules these out of any chain.
                DagNode::Kind(_) | DagNode::Source => {
                    stack.push((self.dag.next(node_idx), from_kind, batch, depth));
                }
            }
        }

        Ok(finals)
    }

    /// Apply a transformer, downgrading failures to per-entity skips. A
    /// failing batch is retried entity by entity so one poisoned entity
    /// doesn't take its neighbours down with it.
    async fn apply_isolating(
        &self,
        transformer: &dyn crate::transform::Transformer,
        name: &str,
        batch: Vec<Entity>,
    ) -> Vec<Entity> {
        if batch.len() == 1 {
            let entity_kind = batch[0].kind.clone();
            return match transformer.apply(batch).await {
                Ok(outputs) => outputs,
                Err(err) => {
                    warn!("Transformer {name} failed: {err}");
                    self.progress.record_failed(&entity_kind, 1);
                    Vec::new()
                }
            };
        }

        match transformer.apply(batch.clone()).await {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!("Transformer {name} failed on a batch of {}: {err}; retrying singly", batch.len());
                let mut outputs = Vec::new();
                for entity in batch {
                    let entity_kind = entity.kind.clone();
                    match transformer.apply(vec![entity]).await {
                        Ok(single) => outputs.extend(single),
                        Err(err) => {
                            warn!("Transformer {name} failed: {err}");
                            self.progress.record_failed(&entity_kind, 1);
                        }
                    }
                }
                outputs
            }
        }
    }
}
