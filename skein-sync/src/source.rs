use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use skein_model::{Cursor, Entity, KindSpec, SourceError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// An entity tagged with its position in the producer's emission order.
/// The sequence is what makes per-entity-id updates monotone once workers
/// reorder things.
#[derive(Debug)]
pub struct Emitted {
    pub entity: Entity,
    pub emit_seq: u64,
}

/// Cooperative callback handed to `Source::produce`. `emit` awaits queue
/// capacity, which is how the engine exerts backpressure on the source,
/// and fails fast once the job is cancelled.
#[derive(Clone)]
pub struct EntityEmitter {
    tx: mpsc::Sender<Emitted>,
    cancel: CancellationToken,
    seq: Arc<AtomicU64>,
}

impl EntityEmitter {
    pub fn new(tx: mpsc::Sender<Emitted>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn emit(&self, entity: Entity) -> Result<(), SourceError> {
        let emit_seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            sent = self.tx.send(Emitted { entity, emit_seq }) => {
                sent.map_err(|_| SourceError::Cancelled)
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emitted_so_far(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

/// A source connector. One instance is constructed per job from the
/// connection's config and resolved auth; `produce` runs once per job
/// (twice after a transient retry).
#[async_trait]
pub trait Source: Send + Sync {
    fn short_name(&self) -> &'static str;

    /// Kind specs for every entity kind this connector can emit.
    fn kind_specs(&self) -> Vec<KindSpec>;

    /// Whether the connector tolerates minute-level schedules.
    fn supports_continuous(&self) -> bool {
        false
    }

    /// Smoke-test the configured credentials without emitting anything.
    async fn validate(&self) -> Result<(), SourceError>;

    /// Emit a finite sequence of entities, parents before their children.
    /// Returns the cursor to resume from next job, or None for sources
    /// that re-enumerate everything. Must return promptly once `emit`
    /// reports cancellation, optionally with a partial cursor.
    async fn produce(
        &self,
        cursor: Option<Cursor>,
        emitter: &EntityEmitter,
    ) -> Result<Option<Cursor>, SourceError>;
}

/// Builds a source instance for one job from connection config and auth.
pub trait SourceFactory: Send + Sync {
    fn short_name(&self) -> &'static str;

    fn create(
        &self,
        config: &serde_json::Value,
        auth: Option<&str>,
    ) -> Result<Arc<dyn Source>, ConfigError>;
}

/// Source factories registered at process startup. Explicit registration;
/// there is no reflective discovery.
#[derive(Default)]
pub struct SourceRegistry {
    factories: HashMap<&'static str, Arc<dyn SourceFactory>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn SourceFactory>) {
        self.factories.insert(factory.short_name(), factory);
    }

    pub fn create(
        &self,
        source_kind: &str,
        config: &serde_json::Value,
        auth: Option<&str>,
    ) -> Result<Arc<dyn Source>, ConfigError> {
        let factory = self
            .factories
            .get(source_kind)
            .ok_or_else(|| ConfigError::UnknownSourceKind(source_kind.to_string()))?;
        factory.create(config, auth)
    }

    pub fn short_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
