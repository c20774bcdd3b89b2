mod connections;
mod jobs;
mod ledger;

pub use connections::ConnectionStore;
pub use jobs::JobStore;
pub use ledger::{DisappearedEntry, Ledger, LedgerEntry, RecordOutcome, SledLedger};

use std::path::Path;
use std::sync::Arc;

use miette::Diagnostic;
use skein_model::{ConnectionId, JobId, JobStatus};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("storage engine error")]
    Sled(#[from] sled::Error),

    #[error("could not encode stored value")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("could not decode stored value")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("job {job} already finished as {status}; terminal statuses are write-once")]
    TerminalStatus { job: JobId, status: JobStatus },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The process-wide durable store. One sled database with a tree per
/// concern; handles are cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct Store {
    ledger: SledLedger,
    jobs: JobStore,
    connections: ConnectionStore,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Backed by a temp directory that is deleted on drop. For tests and
    /// one-shot runs.
    pub fn ephemeral() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let store = Self {
            ledger: SledLedger::new(db.open_tree("ledger")?),
            jobs: JobStore::new(db.open_tree("jobs")?),
            connections: ConnectionStore::new(db.open_tree("connections")?, db.open_tree("cursors")?),
        };
        Ok(store)
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::new(self.ledger.clone())
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn connections(&self) -> &ConnectionStore {
        &self.connections
    }
}
