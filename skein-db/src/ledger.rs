use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use skein_model::{ConnectionId, ContentHash, JobId};

use crate::StoreResult;

/// Durable record of one entity currently persisted in the destination.
/// Keyed by `(connection_id, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub content_hash: ContentHash,
    pub last_seen_job_id: JobId,
    /// Emit sequence of the version this entry reflects, scoped to
    /// `last_seen_job_id`. Monotone within a job; used to discard late
    /// duplicates that arrive after a fresher version was recorded.
    pub emit_seq: u64,
    pub parent_entity_id: Option<String>,
    pub child_entity_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisappearedEntry {
    pub entity_id: String,
    pub entry: LedgerEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// A fresher version (same job, higher emit_seq) was already recorded;
    /// the write was discarded.
    Stale,
}

/// The incremental-sync ledger. The only mutable state shared inside a job;
/// all access goes through this interface and writes serialise per key.
pub trait Ledger: Send + Sync {
    fn lookup(&self, connection_id: ConnectionId, entity_id: &str)
        -> StoreResult<Option<LedgerEntry>>;

    /// Record that `entity_id` was seen by `job_id` with the given hash.
    /// Idempotent, and monotone on `emit_seq` within a job: an entry already
    /// written by the same job with an equal-or-higher `emit_seq` wins.
    #[allow(clippy::too_many_arguments)]
    fn record_seen(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
        entity_id: &str,
        content_hash: ContentHash,
        parent_entity_id: Option<&str>,
        child_entity_ids: BTreeSet<String>,
        emit_seq: u64,
    ) -> StoreResult<RecordOutcome>;

    /// Entries of this connection whose `last_seen_job_id` is not
    /// `job_id`. After a full producer drain these are exactly the entities
    /// the source no longer emits.
    fn list_disappeared(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
    ) -> StoreResult<Vec<DisappearedEntry>>;

    fn remove(&self, connection_id: ConnectionId, entity_id: &str) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct SledLedger {
    tree: sled::Tree,
}

impl SledLedger {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    // Keys are `connection_id \0 entity_id`. The connection id is a
    // fixed-width UUID today, but the NUL separator is what keeps the
    // prefix scan unambiguous if that ever changes.
    fn prefix(connection_id: ConnectionId) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(17);
        prefix.extend_from_slice(connection_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn key(connection_id: ConnectionId, entity_id: &str) -> Vec<u8> {
        let mut key = Self::prefix(connection_id);
        key.extend_from_slice(entity_id.as_bytes());
        key
    }
}

impl Ledger for SledLedger {
    fn lookup(
        &self,
        connection_id: ConnectionId,
        entity_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let key = Self::key(connection_id, entity_id);
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record_seen(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
        entity_id: &str,
        content_hash: ContentHash,
        parent_entity_id: Option<&str>,
        child_entity_ids: BTreeSet<String>,
        emit_seq: u64,
    ) -> StoreResult<RecordOutcome> {
        let key = Self::key(connection_id, entity_id);
        let new_entry = LedgerEntry {
            content_hash,
            last_seen_job_id: job_id,
            emit_seq,
            parent_entity_id: parent_entity_id.map(str::to_string),
            child_entity_ids,
        };
        let new_bytes = rmp_serde::to_vec(&new_entry)?;

        // Compare-and-swap loop. Contention on a single entity id is rare
        // (one producer assigns emit_seqs) but workers may race a late
        // duplicate against a fresh version.
        loop {
            let current = self.tree.get(&key)?;
            if let Some(bytes) = &current {
                let existing: LedgerEntry = rmp_serde::from_slice(bytes)?;
                if existing.last_seen_job_id == job_id && existing.emit_seq >= emit_seq {
                    return Ok(RecordOutcome::Stale);
                }
            }
            let swap = self.tree.compare_and_swap(
                &key,
                current.as_deref(),
                Some(new_bytes.as_slice()),
            )?;
            if swap.is_ok() {
                return Ok(RecordOutcome::Recorded);
            }
            // Lost the race; re-read and re-apply the monotonicity check.
        }
    }

    fn list_disappeared(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
    ) -> StoreResult<Vec<DisappearedEntry>> {
        let prefix = Self::prefix(connection_id);
        let mut disappeared = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (key, bytes) = item?;
            let entry: LedgerEntry = rmp_serde::from_slice(&bytes)?;
            if entry.last_seen_job_id != job_id {
                let entity_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                disappeared.push(DisappearedEntry { entity_id, entry });
            }
        }
        Ok(disappeared)
    }

    fn remove(&self, connection_id: ConnectionId, entity_id: &str) -> StoreResult<()> {
        self.tree.remove(Self::key(connection_id, entity_id))?;
        Ok(())
    }
}
