use chrono::Utc;
use log::warn;
use skein_model::{ConnectionId, JobId, JobStatus, SyncCounters, SyncJob};

use crate::{StoreError, StoreResult};

/// Durable record of sync jobs. Terminal rows are write-once: once a job is
/// completed, failed, or cancelled, further status writes are rejected.
#[derive(Clone)]
pub struct JobStore {
    tree: sled::Tree,
}

impl JobStore {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn create(&self, job: &SyncJob) -> StoreResult<()> {
        self.tree
            .insert(job.id.as_bytes(), rmp_serde::to_vec(job)?)?;
        Ok(())
    }

    pub fn get(&self, job_id: JobId) -> StoreResult<Option<SyncJob>> {
        match self.tree.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Transition a job to a new status, stamping started_at/finished_at as
    /// appropriate. Counters are replaced wholesale; the orchestrator owns
    /// them exclusively while the job is in flight.
    pub fn transition(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
        counters: Option<SyncCounters>,
    ) -> StoreResult<SyncJob> {
        let mut job = self.get(job_id)?.ok_or(StoreError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            if job.status == status {
                // Idempotent re-write of the same terminal state.
                return Ok(job);
            }
            return Err(StoreError::TerminalStatus {
                job: job_id,
                status: job.status,
            });
        }

        if status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        job.status = status;
        if error.is_some() {
            job.error = error;
        }
        if let Some(counters) = counters {
            job.counters = counters;
        }

        self.tree
            .insert(job_id.as_bytes(), rmp_serde::to_vec(&job)?)?;
        Ok(job)
    }

    pub fn list_for_connection(&self, connection_id: ConnectionId) -> StoreResult<Vec<SyncJob>> {
        let mut jobs = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let job: SyncJob = rmp_serde::from_slice(&bytes)?;
            if job.connection_id == connection_id {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    /// Mark jobs left in a non-terminal state by a crashed process as
    /// failed. Called at startup.
    pub fn fail_stranded(&self) -> StoreResult<usize> {
        let mut stranded = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let job: SyncJob = rmp_serde::from_slice(&bytes)?;
            if !job.status.is_terminal() {
                stranded.push(job.id);
            }
        }
        for job_id in &stranded {
            warn!("Job {job_id} was left in flight by a previous process; marking failed");
            self.transition(
                *job_id,
                JobStatus::Failed,
                Some("process exited before the job finished".to_string()),
                None,
            )?;
        }
        Ok(stranded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store() -> JobStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        JobStore::new(db.open_tree("jobs").unwrap())
    }

    #[test]
    fn transition_stamps_timestamps() {
        let store = store();
        let job = SyncJob::new(Uuid::from_u128(1));
        store.create(&job).unwrap();

        let running = store
            .transition(job.id, JobStatus::Running, None, None)
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        let done = store
            .transition(job.id, JobStatus::Completed, None, None)
            .unwrap();
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn terminal_status_is_write_once() {
        let store = store();
        let job = SyncJob::new(Uuid::from_u128(1));
        store.create(&job).unwrap();
        store
            .transition(job.id, JobStatus::Completed, None, None)
            .unwrap();

        let err = store
            .transition(job.id, JobStatus::Failed, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalStatus { .. }));

        // Re-writing the same terminal state is a no-op, not an error.
        store
            .transition(job.id, JobStatus::Completed, None, None)
            .unwrap();
    }

    #[test]
    fn fail_stranded_only_touches_open_jobs() {
        let store = store();
        let open = SyncJob::new(Uuid::from_u128(1));
        let done = SyncJob::new(Uuid::from_u128(1));
        store.create(&open).unwrap();
        store.create(&done).unwrap();
        store
            .transition(done.id, JobStatus::Completed, None, None)
            .unwrap();

        assert_eq!(store.fail_stranded().unwrap(), 1);
        assert_eq!(store.get(open.id).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(
            store.get(done.id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
