use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Worker tasks consuming the entity queue per job.
    pub workers: usize,
    /// Bounded queue between the producer and the workers. Defaults to
    /// 2x workers; this is the engine's only throttle.
    pub queue_capacity: Option<usize>,
    /// Upsert batch size toward the destination, further capped by the
    /// destination's own max_batch_size.
    pub write_batch_size: usize,
    /// How long a cancelled job may keep draining in-flight work before
    /// it is abandoned.
    pub drain_deadline_secs: u64,
    /// Pause before the single in-job retry of a transient source error.
    pub source_retry_delay_secs: u64,
    /// Destination write retry budget per batch.
    pub dest_retry_attempts: u32,
    pub dest_retry_base_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Timeout for each external call (embedding, destination).
    pub external_call_timeout_secs: u64,
    pub vector_dim: usize,
    pub chunk_max_chars: usize,
    /// How many times a routed entity may re-enter the DAG via a
    /// file-producing transformer before it is dead-lettered.
    pub reentry_depth_limit: usize,
    /// Publish a progress event at most every this many processed entities.
    pub progress_publish_every: u64,
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: None,
            write_batch_size: 128,
            drain_deadline_secs: 30,
            source_retry_delay_secs: 30,
            dest_retry_attempts: 3,
            dest_retry_base_delay_ms: 1000,
            heartbeat_interval_secs: 30,
            external_call_timeout_secs: 60,
            vector_dim: 384,
            chunk_max_chars: 2000,
            reentry_depth_limit: 4,
            progress_publish_every: 100,
            data_dir: "./skein-data".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("SKEIN.toml"))
            .merge(Env::prefixed("SKEIN_"))
    }

    pub fn load() -> figment::Result<Self> {
        Self::figment().extract()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.workers * 2).max(1)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    pub fn source_retry_delay(&self) -> Duration {
        Duration::from_secs(self.source_retry_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }
}
