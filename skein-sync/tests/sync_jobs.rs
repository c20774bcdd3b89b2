use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use skein_db::Store;
use skein_model::{
    DestinationError, Entity, JobStatus, KindSpec, Point, PointId, ScoredPoint, SearchRequest,
    SourceError, SyncConnection,
};
use skein_sync::destinations::MemoryDestination;
use skein_sync::orchestrate::ActivityContext;
use skein_sync::sources::StaticSourceFactory;
use skein_sync::{Destination, Engine, EngineConfig};

fn doc(id: &str, title: &str) -> Entity {
    Entity::new("doc", id)
        .with_payload_field("title", title)
        .with_text(title.to_string())
}

fn doc_spec() -> KindSpec {
    KindSpec::new("doc").content_fields(&["title"]).requires_text()
}

fn file_spec() -> KindSpec {
    KindSpec::new("report")
        .content_fields(&["name"])
        .requires_text()
        .parent()
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers = 4;
    config.write_batch_size = 8;
    config.dest_retry_base_delay_ms = 1;
    // Each fixture page is ~40 chars: one page, one chunk.
    config.chunk_max_chars = 64;
    config.progress_publish_every = 1;
    config
}

struct Harness {
    engine: Engine,
    destination: Arc<MemoryDestination>,
    connection: SyncConnection,
}

impl Harness {
    fn new(entities: Vec<Entity>, kind_specs: Vec<KindSpec>) -> Self {
        Self::with_destination(entities, kind_specs, Arc::new(MemoryDestination::new()))
    }

    fn with_destination(
        entities: Vec<Entity>,
        kind_specs: Vec<KindSpec>,
        destination: Arc<MemoryDestination>,
    ) -> Self {
        let engine = Engine::builder(test_config())
            .store(Store::ephemeral().unwrap())
            .source(Arc::new(StaticSourceFactory))
            .destination(destination.clone())
            .build()
            .unwrap();

        let mut connection = SyncConnection::new("acme", "fixtures", "static", "kb");
        connection.config = source_config(&entities, &kind_specs);
        engine.create_connection(&connection).unwrap();

        Self {
            engine,
            destination,
            connection,
        }
    }

    fn set_source_output(&mut self, entities: Vec<Entity>, kind_specs: Vec<KindSpec>) {
        self.connection.config = source_config(&entities, &kind_specs);
        self.engine
            .store()
            .connections()
            .upsert(&self.connection)
            .unwrap();
    }

    async fn sync(&self) -> skein_model::SyncJob {
        self.engine
            .run_sync(self.connection.id, ActivityContext::new())
            .await
            .unwrap()
    }

    fn point_for(&self, entity_id: &str) -> Option<Point> {
        self.destination
            .get_point("kb", PointId::derive(self.connection.id, entity_id))
    }

    fn ledger_entry(&self, entity_id: &str) -> Option<skein_db::LedgerEntry> {
        self.engine
            .store()
            .ledger()
            .lookup(self.connection.id, entity_id)
            .unwrap()
    }
}

fn source_config(entities: &[Entity], kind_specs: &[KindSpec]) -> serde_json::Value {
    serde_json::json!({
        "entities": entities,
        "kind_specs": kind_specs,
    })
}

#[tokio::test]
async fn fresh_sync_inserts_everything() {
    let harness = Harness::new(
        vec![doc("a", "Alpha"), doc("b", "Beta"), doc("c", "Gamma")],
        vec![doc_spec()],
    );

    let job = harness.sync().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.inserted, 3);
    assert_eq!(job.counters.updated, 0);
    assert_eq!(job.counters.kept, 0);
    assert_eq!(job.counters.deleted, 0);

    assert_eq!(harness.destination.point_count("kb"), 3);
    for id in ["a", "b", "c"] {
        let entry = harness.ledger_entry(id).expect("ledger entry");
        assert_eq!(entry.last_seen_job_id, job.id);
    }
}

#[tokio::test]
async fn unchanged_rerun_keeps_everything() {
    let harness = Harness::new(
        vec![doc("a", "Alpha"), doc("b", "Beta"), doc("c", "Gamma")],
        vec![doc_spec()],
    );

    harness.sync().await;
    let before = harness.destination.all_points("kb");

    let job = harness.sync().await;
    assert_eq!(job.counters.inserted, 0);
    assert_eq!(job.counters.updated, 0);
    assert_eq!(job.counters.kept, 3);
    assert_eq!(job.counters.deleted, 0);

    // The point set is untouched by the no-op rerun.
    assert_eq!(harness.destination.all_points("kb"), before);
}

#[tokio::test]
async fn content_change_updates_only_the_changed_entity() {
    let mut harness = Harness::new(
        vec![doc("a", "Alpha"), doc("b", "Beta"), doc("c", "Gamma")],
        vec![doc_spec()],
    );
    harness.sync().await;

    harness.set_source_output(
        vec![doc("a", "Alpha"), doc("b", "Beta (revised)"), doc("c", "Gamma")],
        vec![doc_spec()],
    );
    let job = harness.sync().await;
    assert_eq!(job.counters.inserted, 0);
    assert_eq!(job.counters.updated, 1);
    assert_eq!(job.counters.kept, 2);
    assert_eq!(job.counters.deleted, 0);

    let point = harness.point_for("b").expect("point for b");
    assert_eq!(point.payload.embeddable_text, "Beta (revised)");
}

#[tokio::test]
async fn volatile_field_change_is_kept_not_updated() {
    let mut harness = Harness::new(vec![doc("a", "Alpha")], vec![doc_spec()]);
    harness.sync().await;

    // fetched_at is not in the doc kind's content fields.
    harness.set_source_output(
        vec![doc("a", "Alpha").with_payload_field("fetched_at", "2026-08-01")],
        vec![doc_spec()],
    );
    let job = harness.sync().await;
    assert_eq!(job.counters.kept, 1);
    assert_eq!(job.counters.updated, 0);
}

#[tokio::test]
async fn disappeared_entity_is_deleted_from_destination_and_ledger() {
    let mut harness = Harness::new(
        vec![doc("a", "Alpha"), doc("b", "Beta"), doc("c", "Gamma")],
        vec![doc_spec()],
    );
    harness.sync().await;

    harness.set_source_output(vec![doc("a", "Alpha"), doc("b", "Beta")], vec![doc_spec()]);
    let job = harness.sync().await;
    assert_eq!(job.counters.kept, 2);
    assert_eq!(job.counters.deleted, 1);

    assert_eq!(harness.destination.point_count("kb"), 2);
    assert!(harness.point_for("c").is_none());
    assert!(harness.ledger_entry("c").is_none());
}

fn report(id: &str, pages: &[&str]) -> Entity {
    Entity::new("report", id)
        .with_payload_field("name", id)
        .with_text(pages.join("\n\n"))
}

#[tokio::test]
async fn chunked_file_stores_chunks_not_the_file() {
    // Two pages never fit one 64-char chunk, so each page is a chunk.
    let pages = [
        "page one has enough text to fill a chunk",
        "page two has enough text to fill a chunk",
        "page three also fills an entire chunk ok",
    ];
    let harness = Harness::new(vec![report("F", &pages)], vec![file_spec()]);

    let job = harness.sync().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.inserted, 3);

    assert_eq!(harness.destination.point_count("kb"), 3);
    assert!(harness.point_for("F").is_none(), "no point for the file itself");
    for index in 0..3 {
        let point = harness
            .point_for(&format!("F#chunk-{index}"))
            .expect("chunk point");
        assert_eq!(point.payload.parent_entity_id.as_deref(), Some("F"));
    }

    let parent = harness.ledger_entry("F").expect("parent ledger entry");
    assert_eq!(parent.child_entity_ids.len(), 3);
}

#[tokio::test]
async fn unchanged_file_keeps_all_chunks() {
    let pages = [
        "page one has enough text to fill a chunk",
        "page two has enough text to fill a chunk",
        "page three also fills an entire chunk ok",
    ];
    let harness = Harness::new(vec![report("F", &pages)], vec![file_spec()]);
    harness.sync().await;

    let job = harness.sync().await;
    assert_eq!(job.counters.kept, 3);
    assert_eq!(job.counters.inserted, 0);
    assert_eq!(job.counters.updated, 0);
}

#[tokio::test]
async fn removed_page_deletes_the_orphaned_chunk() {
    let pages = [
        "page one has enough text to fill a chunk",
        "page two has enough text to fill a chunk",
        "page three also fills an entire chunk ok",
    ];
    let mut harness = Harness::new(vec![report("F", &pages)], vec![file_spec()]);
    harness.sync().await;

    harness.set_source_output(vec![report("F", &pages[..2])], vec![file_spec()]);
    let job = harness.sync().await;
    assert_eq!(job.counters.kept, 2);
    assert_eq!(job.counters.deleted, 1);
    assert_eq!(job.counters.updated, 0);

    assert_eq!(harness.destination.point_count("kb"), 2);
    assert!(harness.point_for("F#chunk-2").is_none());
    assert!(harness.ledger_entry("F#chunk-2").is_none());

    let parent = harness.ledger_entry("F").expect("parent entry");
    assert_eq!(parent.child_entity_ids.len(), 2);
}

#[tokio::test]
async fn disappeared_file_takes_its_chunks_with_it() {
    let pages = [
        "page one has enough text to fill a chunk",
        "page two has enough text to fill a chunk",
    ];
    let mut harness = Harness::new(
        vec![report("F", &pages), doc("a", "Alpha")],
        vec![file_spec(), doc_spec()],
    );
    harness.sync().await;
    assert_eq!(harness.destination.point_count("kb"), 3);

    harness.set_source_output(vec![doc("a", "Alpha")], vec![file_spec(), doc_spec()]);
    let job = harness.sync().await;
    assert_eq!(job.counters.deleted, 2, "chunks count, the parent does not");

    assert_eq!(harness.destination.point_count("kb"), 1);
    assert!(harness.ledger_entry("F").is_none());
    assert!(harness.ledger_entry("F#chunk-0").is_none());
}

#[tokio::test]
async fn unrouted_kind_is_dead_lettered() {
    let harness = Harness::new(
        vec![doc("a", "Alpha"), Entity::new("mystery", "m1").with_text("??")],
        vec![doc_spec()],
    );

    let job = harness.sync().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.inserted, 1);
    assert_eq!(job.counters.skipped, 1);
    assert_eq!(harness.destination.point_count("kb"), 1);
}

#[tokio::test]
async fn entity_without_required_text_fails_the_job() {
    let harness = Harness::new(
        vec![Entity::new("doc", "a").with_payload_field("title", "untexted")],
        vec![doc_spec()],
    );

    let job = harness
        .engine
        .run_sync(harness.connection.id, ActivityContext::new())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("embeddable text"));
}

#[tokio::test]
async fn cancellation_drains_and_preserves_consistency() {
    let entities: Vec<Entity> = (0..1000)
        .map(|i| doc(&format!("d{i:04}"), &format!("Document number {i}")))
        .collect();

    let mut harness = Harness::new(entities, vec![doc_spec()]);
    // Slow the source to ~2ms per entity so the cancel lands mid-flight.
    let mut config = harness.connection.config.clone();
    config["emit_delay_ms"] = serde_json::json!(2);
    harness.connection.config = config;
    harness
        .engine
        .store()
        .connections()
        .upsert(&harness.connection)
        .unwrap();

    let activity = ActivityContext::new();
    let cancel = activity.cancel.clone();
    let engine = &harness.engine;
    let connection_id = harness.connection.id;

    let run = engine.run_sync(connection_id, activity);
    tokio::pin!(run);

    // Let roughly a tenth of the job happen, then cancel.
    let job = tokio::select! {
        job = &mut run => job.unwrap(),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {
            cancel.cancel();
            let started = std::time::Instant::now();
            let job = run.await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(30), "drain respected the deadline");
            job
        }
    };

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.deleted, 0, "no disappearance deletes on cancel");

    // Every ledger entry written by this job corresponds to a live point.
    let ledger = engine.store().ledger();
    let mut recorded = 0;
    for i in 0..1000 {
        let id = format!("d{i:04}");
        if let Some(entry) = ledger.lookup(connection_id, &id).unwrap() {
            assert_eq!(entry.last_seen_job_id, job.id);
            recorded += 1;
            assert!(
                harness.point_for(&id).is_some(),
                "ledger entry for {id} with no destination point"
            );
        }
    }
    assert_eq!(recorded, job.counters.inserted);

    // The destination may run ahead of the counters by at most the
    // in-flight batch.
    let in_destination = harness.destination.point_count("kb") as u64;
    assert!(in_destination >= job.counters.inserted);
    assert!(in_destination <= job.counters.inserted + test_config().write_batch_size as u64);
}

/// Delegates to a memory destination, failing the first N upsert calls
/// with a transient error.
struct FlakyDestination {
    inner: MemoryDestination,
    failures_left: AtomicU32,
    upsert_calls: AtomicU32,
}

impl FlakyDestination {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryDestination::new(),
            failures_left: AtomicU32::new(failures),
            upsert_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Destination for FlakyDestination {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_native_fusion(&self) -> bool {
        true
    }

    async fn ensure_collection(
        &self,
        collection_id: &str,
        vector_dim: usize,
        sparse: bool,
    ) -> Result<(), DestinationError> {
        self.inner
            .ensure_collection(collection_id, vector_dim, sparse)
            .await
    }

    async fn bulk_upsert(
        &self,
        collection_id: &str,
        points: &[Point],
    ) -> Result<(), DestinationError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(DestinationError::transient("injected failure"));
        }
        self.inner.bulk_upsert(collection_id, points).await
    }

    async fn bulk_delete(
        &self,
        collection_id: &str,
        point_ids: &[PointId],
    ) -> Result<(), DestinationError> {
        self.inner.bulk_delete(collection_id, point_ids).await
    }

    async fn search(
        &self,
        collection_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>, DestinationError> {
        self.inner.search(collection_id, request).await
    }
}

#[tokio::test]
async fn transient_destination_failures_are_retried() {
    let flaky = Arc::new(FlakyDestination::new(2));
    let engine = Engine::builder(test_config())
        .store(Store::ephemeral().unwrap())
        .source(Arc::new(StaticSourceFactory))
        .destination(flaky.clone())
        .build()
        .unwrap();

    let mut connection = SyncConnection::new("acme", "fixtures", "static", "kb");
    connection.config = source_config(
        &[doc("a", "Alpha"), doc("b", "Beta")],
        &[doc_spec()],
    );
    engine.create_connection(&connection).unwrap();

    let job = engine
        .run_sync(connection.id, ActivityContext::new())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.inserted, 2);
    assert_eq!(job.counters.failed, 0);
    assert!(flaky.upsert_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(flaky.inner.point_count("kb"), 2);
}

struct FailingSourceFactory;

impl skein_sync::SourceFactory for FailingSourceFactory {
    fn short_name(&self) -> &'static str {
        "failing"
    }

    fn create(
        &self,
        _config: &serde_json::Value,
        _auth: Option<&str>,
    ) -> Result<Arc<dyn skein_sync::Source>, skein_sync::ConfigError> {
        Ok(Arc::new(FailingSource))
    }
}

struct FailingSource;

#[async_trait]
impl skein_sync::Source for FailingSource {
    fn short_name(&self) -> &'static str {
        "failing"
    }

    fn kind_specs(&self) -> Vec<KindSpec> {
        vec![doc_spec()]
    }

    async fn validate(&self) -> Result<(), SourceError> {
        Err(SourceError::Auth("bad token".to_string()))
    }

    async fn produce(
        &self,
        _cursor: Option<skein_model::Cursor>,
        _emitter: &skein_sync::EntityEmitter,
    ) -> Result<Option<skein_model::Cursor>, SourceError> {
        Err(SourceError::Auth("bad token".to_string()))
    }
}

#[tokio::test]
async fn source_auth_error_fails_the_job() {
    let engine = Engine::builder(test_config())
        .store(Store::ephemeral().unwrap())
        .source(Arc::new(FailingSourceFactory))
        .destination(Arc::new(MemoryDestination::new()))
        .build()
        .unwrap();

    let connection = SyncConnection::new("acme", "broken", "failing", "kb");
    engine.create_connection(&connection).unwrap();

    let job = engine
        .run_sync(connection.id, ActivityContext::new())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("bad token"));

    // Terminal status is write-once.
    let err = engine
        .store()
        .jobs()
        .transition(job.id, JobStatus::Completed, None, None)
        .unwrap_err();
    assert!(matches!(err, skein_db::StoreError::TerminalStatus { .. }));
}

#[tokio::test]
async fn search_round_trip_finds_the_synced_text() {
    let harness = Harness::new(
        vec![
            doc("a", "quarterly payroll report for the finance team"),
            doc("b", "kitten adoption photos from the shelter"),
        ],
        vec![doc_spec()],
    );
    harness.sync().await;

    // Embed the query with the same deterministic model the engine used.
    use skein_sync::transformers::{Embedder, HashEmbedder};
    let embedder = HashEmbedder::new(test_config().vector_dim);
    let query = embedder
        .embed(&["quarterly payroll report for the finance team".to_string()])
        .await
        .unwrap()
        .remove(0);

    let results = harness
        .destination
        .search(
            "kb",
            &SearchRequest {
                dense: Some(query),
                limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results[0].payload.entity_id, "a");
    assert!(results[0].score > 0.8, "self-similarity above the floor");
}
