use std::sync::Arc;

use hashbrown::HashMap;
use log::info;
use skein_db::{ConnectionStore, JobStore, Ledger, Store};
use skein_model::{ConnectionId, KindRegistry, KindSpec, SyncConnection, SyncJob};

use crate::config::EngineConfig;
use crate::dag::SyncDag;
use crate::dest::Destination;
use crate::error::{ConfigError, SyncError};
use crate::orchestrate::{ActivityContext, SyncOrchestrator};
use crate::progress::{ProgressBus, SyncProgress};
use crate::schedule::validate_schedule;
use crate::source::{Source, SourceFactory, SourceRegistry};
use crate::transform::{Transformer, TransformerRegistry};
use crate::transformers::{
    DenseEmbedTransformer, Embedder, HashEmbedder, SparseEmbedTransformer, TextChunker,
};

/// Everything one sync job needs, assembled up front: the source instance,
/// destination clients, transformer and kind registries, the routing
/// graph, the stores, and the progress plumbing.
pub struct SyncContext {
    pub config: EngineConfig,
    pub connection: SyncConnection,
    pub job: SyncJob,
    pub source: Arc<dyn Source>,
    pub destinations: HashMap<String, Arc<dyn Destination>>,
    pub transformers: TransformerRegistry,
    pub kinds: KindRegistry,
    pub dag: SyncDag,
    pub ledger: Arc<dyn Ledger>,
    pub jobs: JobStore,
    pub connections: ConnectionStore,
    pub progress: Arc<SyncProgress>,
    pub bus: Arc<ProgressBus>,
}

/// The per-process engine: explicit registries built at startup, one
/// durable store, one progress bus. Connectors and destinations are
/// registered here, never discovered.
pub struct Engine {
    config: EngineConfig,
    store: Store,
    sources: SourceRegistry,
    transformers: TransformerRegistry,
    destinations: HashMap<String, Arc<dyn Destination>>,
    primary_destination: String,
    bus: Arc<ProgressBus>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Store>,
    sources: SourceRegistry,
    transformers: TransformerRegistry,
    destinations: Vec<Arc<dyn Destination>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            sources: SourceRegistry::new(),
            transformers: TransformerRegistry::new(),
            destinations: Vec::new(),
            embedder: None,
        }
    }

    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, factory: Arc<dyn SourceFactory>) -> Self {
        self.sources.register(factory);
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.register(transformer);
        self
    }

    /// The first registered destination is where the default DAG routes.
    pub fn destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Override the dense embedding model. Defaults to the local
    /// deterministic embedder.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn build(self) -> Result<Engine, SyncError> {
        let Self {
            config,
            store,
            sources,
            mut transformers,
            destinations,
            embedder,
        } = self;

        if destinations.is_empty() {
            return Err(ConfigError::Invalid("no destination configured".to_string()).into());
        }
        let store = match store {
            Some(store) => store,
            None => Store::open(&config.data_dir)?,
        };

        // The canonical transformer set, unless the caller registered its
        // own versions.
        if !transformers.contains(TextChunker::NAME) {
            transformers.register(Arc::new(TextChunker::new(config.chunk_max_chars)));
        }
        if !transformers.contains(DenseEmbedTransformer::NAME) {
            let embedder =
                embedder.unwrap_or_else(|| Arc::new(HashEmbedder::new(config.vector_dim)));
            transformers.register(Arc::new(DenseEmbedTransformer::new(embedder)));
        }
        if !transformers.contains(SparseEmbedTransformer::NAME) {
            transformers.register(Arc::new(SparseEmbedTransformer::new()));
        }

        let primary_destination = destinations[0].name().to_string();
        let destinations: HashMap<String, Arc<dyn Destination>> = destinations
            .into_iter()
            .map(|destination| (destination.name().to_string(), destination))
            .collect();

        Ok(Engine {
            config,
            store,
            sources,
            transformers,
            destinations,
            primary_destination,
            bus: Arc::new(ProgressBus::new()),
        })
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> Arc<ProgressBus> {
        self.bus.clone()
    }

    pub fn destination(&self, name: &str) -> Option<Arc<dyn Destination>> {
        self.destinations.get(name).cloned()
    }

    pub fn primary_destination(&self) -> Arc<dyn Destination> {
        self.destinations[&self.primary_destination].clone()
    }

    fn build_source(&self, connection: &SyncConnection) -> Result<Arc<dyn Source>, ConfigError> {
        self.sources.create(
            &connection.source_kind,
            &connection.config,
            connection.auth_ref.as_deref(),
        )
    }

    /// Persist a connection after validating its schedule against the
    /// connector's declared capabilities.
    pub fn create_connection(&self, connection: &SyncConnection) -> Result<(), SyncError> {
        let source = self.build_source(connection)?;
        if let Some(schedule) = &connection.schedule {
            validate_schedule(
                schedule,
                &connection.source_kind,
                source.supports_continuous(),
            )
            .map_err(ConfigError::Schedule)?;
        }
        self.store.connections().upsert(connection)?;
        info!(
            "Registered connection {} ({} -> {})",
            connection.name, connection.source_kind, connection.collection_id
        );
        Ok(())
    }

    /// Smoke-test a connection's credentials without running a job.
    pub async fn validate_connection(&self, connection_id: ConnectionId) -> Result<(), SyncError> {
        let connection = self.store.connections().get(connection_id)?;
        let source = self.build_source(&connection)?;
        source.validate().await?;
        Ok(())
    }

    /// Create a job for the connection and drive it to a terminal state.
    /// Structural failures while assembling the context (unknown source,
    /// invalid graph) still land the job row in `failed`.
    pub async fn run_sync(
        &self,
        connection_id: ConnectionId,
        activity: ActivityContext,
    ) -> Result<SyncJob, SyncError> {
        let connection = self.store.connections().get(connection_id)?;
        let job = SyncJob::new(connection_id);
        self.store.jobs().create(&job)?;

        let ctx = match self.sync_context(connection, job.clone()) {
            Ok(ctx) => ctx,
            Err(err) => {
                let failed = self.bus.persist_terminal(
                    self.store.jobs(),
                    job.id,
                    skein_model::JobStatus::Failed,
                    Some((err.kind().to_string(), err.to_string())),
                    job.counters,
                )?;
                return Ok(failed);
            }
        };
        SyncOrchestrator::new(Arc::new(ctx)).run(activity).await
    }

    fn sync_context(
        &self,
        connection: SyncConnection,
        job: SyncJob,
    ) -> Result<SyncContext, SyncError> {
        let source = self.build_source(&connection)?;

        let specs = source.kind_specs();
        let mut kinds = KindRegistry::new();
        for spec in &specs {
            kinds.register(spec.clone());
            if spec.produces_children {
                // Chunks derived from a parent kind: whole payload is
                // content, text required.
                kinds.register(KindSpec::new(format!("{}.chunk", spec.kind)).requires_text());
            }
        }

        let dag = SyncDag::default_for(
            &specs,
            TextChunker::NAME,
            DenseEmbedTransformer::NAME,
            Some(SparseEmbedTransformer::NAME),
            &self.primary_destination,
        )?;

        let progress = Arc::new(SyncProgress::new(
            job.id,
            self.bus.clone(),
            self.config.progress_publish_every,
        ));

        Ok(SyncContext {
            config: self.config.clone(),
            connection,
            job,
            source,
            destinations: self.destinations.clone(),
            transformers: self.transformers.clone(),
            kinds,
            dag,
            ledger: self.store.ledger(),
            jobs: self.store.jobs().clone(),
            connections: self.store.connections().clone(),
            progress,
            bus: self.bus.clone(),
        })
    }
}
