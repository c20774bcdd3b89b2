use std::sync::Arc;

use async_trait::async_trait;
use skein_db::Store;
use skein_model::{Entity, JobStatus, KindSpec, SyncConnection};
use skein_search::operations::{ChatClient, RerankClient, RerankedDoc};
use skein_search::{
    ExpansionStrategy, ResponseType, SearchError, SearchMethod, SearchOptions, SearchService,
};
use skein_sync::destinations::MemoryDestination;
use skein_sync::orchestrate::ActivityContext;
use skein_sync::sources::StaticSourceFactory;
use skein_sync::transformers::{Embedder, HashEmbedder};
use skein_sync::{Engine, EngineConfig};

fn doc(id: &str, title: &str) -> Entity {
    Entity::new("doc", id)
        .with_payload_field("title", title)
        .with_text(title.to_string())
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.vector_dim = 64;
    config
}

/// Sync the fixture docs into a fresh memory destination, returning the
/// destination and the embedder the engine used.
async fn indexed(
    entities: Vec<Entity>,
) -> (Arc<MemoryDestination>, Arc<HashEmbedder>) {
    let destination = Arc::new(MemoryDestination::new());
    let embedder = Arc::new(HashEmbedder::new(config().vector_dim));

    let engine = Engine::builder(config())
        .store(Store::ephemeral().unwrap())
        .source(Arc::new(StaticSourceFactory))
        .destination(destination.clone())
        .embedder(embedder.clone())
        .build()
        .unwrap();

    let mut connection = SyncConnection::new("acme", "fixtures", "static", "kb");
    connection.config = serde_json::json!({
        "entities": entities,
        "kind_specs": [KindSpec::new("doc").requires_text()],
    });
    engine.create_connection(&connection).unwrap();

    let job = engine
        .run_sync(connection.id, ActivityContext::new())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    (destination, embedder)
}

fn fixture_docs() -> Vec<Entity> {
    vec![
        doc("payroll", "quarterly payroll report for the finance team"),
        doc("oncall", "oncall handover notes for the platform team"),
        doc("kittens", "kitten adoption photos from the shelter"),
    ]
}

#[tokio::test]
async fn neural_search_round_trips_synced_text() {
    let (destination, embedder) = indexed(fixture_docs()).await;
    let service = SearchService::builder(destination, embedder).build();

    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Neural;
    options.expansion_strategy = ExpansionStrategy::None;
    options.enable_reranking = false;

    let response = service
        .search("kb", "quarterly payroll report for the finance team", options)
        .await
        .unwrap();

    assert_eq!(response.results[0].payload.entity_id, "payroll");
    assert!(
        response.results[0].score > 0.8,
        "exact text should sit above the self-similarity floor, got {}",
        response.results[0].score
    );
    assert!(response.errors.is_empty());
    assert!(response.timings.contains_key("embedding"));
    assert!(response.timings.contains_key("vector_search"));
}

#[tokio::test]
async fn hybrid_search_works_without_native_fusion() {
    struct NoFusion(Arc<MemoryDestination>);

    #[async_trait]
    impl skein_sync::Destination for NoFusion {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn supports_native_fusion(&self) -> bool {
            false
        }

        async fn ensure_collection(
            &self,
            collection_id: &str,
            vector_dim: usize,
            sparse: bool,
        ) -> Result<(), skein_model::DestinationError> {
            self.0.ensure_collection(collection_id, vector_dim, sparse).await
        }

        async fn bulk_upsert(
            &self,
            collection_id: &str,
            points: &[skein_model::Point],
        ) -> Result<(), skein_model::DestinationError> {
            self.0.bulk_upsert(collection_id, points).await
        }

        async fn bulk_delete(
            &self,
            collection_id: &str,
            point_ids: &[skein_model::PointId],
        ) -> Result<(), skein_model::DestinationError> {
            self.0.bulk_delete(collection_id, point_ids).await
        }

        async fn search(
            &self,
            collection_id: &str,
            request: &skein_model::SearchRequest,
        ) -> Result<Vec<skein_model::ScoredPoint>, skein_model::DestinationError> {
            // A destination without fusion would reject a dual-vector
            // request; the pipeline must never send one here.
            assert!(
                request.dense.is_none() || request.sparse.is_none(),
                "client-side fusion path must issue single-mode searches"
            );
            self.0.search(collection_id, request).await
        }
    }

    let (destination, embedder) = indexed(fixture_docs()).await;
    let service =
        SearchService::builder(Arc::new(NoFusion(destination)), embedder).build();

    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Hybrid;
    options.expansion_strategy = ExpansionStrategy::None;
    options.enable_reranking = false;

    let response = service
        .search("kb", "payroll report finance", options)
        .await
        .unwrap();
    assert_eq!(response.results[0].payload.entity_id, "payroll");
}

#[tokio::test]
async fn expansion_searches_every_phrasing() {
    struct CannedChat;

    #[async_trait]
    impl ChatClient for CannedChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, SearchError> {
            Ok("oncall handover notes for the platform team".to_string())
        }
    }

    let (destination, embedder) = indexed(fixture_docs()).await;
    let service = SearchService::builder(destination, embedder)
        .chat(Arc::new(CannedChat))
        .build();

    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Neural;
    options.expansion_strategy = ExpansionStrategy::Llm;
    options.enable_reranking = false;

    // The literal query matches nothing, but the canned expansion does.
    let response = service
        .search("kb", "who is holding the pager", options)
        .await
        .unwrap();
    assert!(
        response
            .results
            .iter()
            .any(|point| point.payload.entity_id == "oncall")
    );
}

#[tokio::test]
async fn reranker_outage_degrades_gracefully() {
    struct Down;

    #[async_trait]
    impl RerankClient for Down {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> Result<Vec<RerankedDoc>, SearchError> {
            Err(SearchError::Malformed {
                provider: "rerank",
                message: "provider outage".to_string(),
            })
        }
    }

    let (destination, embedder) = indexed(fixture_docs()).await;
    let service = SearchService::builder(destination, embedder)
        .rerank(Arc::new(Down))
        .build();

    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Neural;
    options.expansion_strategy = ExpansionStrategy::None;

    let response = service
        .search("kb", "quarterly payroll report for the finance team", options)
        .await
        .unwrap();
    assert_eq!(response.results[0].payload.entity_id, "payroll");
    assert!(
        response
            .errors
            .iter()
            .any(|(op, message)| op == "reranking" && message.contains("outage"))
    );
}

#[tokio::test]
async fn completion_answers_from_context() {
    struct GroundedChat;

    #[async_trait]
    impl ChatClient for GroundedChat {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, SearchError> {
            assert!(user.contains("payroll"), "context documents reach the model");
            Ok("The payroll report is quarterly.".to_string())
        }
    }

    let (destination, embedder) = indexed(fixture_docs()).await;
    let service = SearchService::builder(destination, embedder)
        .chat(Arc::new(GroundedChat))
        .build();

    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Neural;
    options.expansion_strategy = ExpansionStrategy::None;
    options.enable_reranking = false;
    options.response_type = ResponseType::Completion;

    let response = service
        .search("kb", "quarterly payroll report for the finance team", options)
        .await
        .unwrap();
    assert_eq!(
        response.completion.as_deref(),
        Some("The payroll report is quarterly.")
    );
}

#[tokio::test]
async fn interpretation_filters_by_kind() {
    let mut entities = fixture_docs();
    entities.push(
        Entity::new("memo", "memo-1")
            .with_payload_field("title", "payroll memo")
            .with_text("quarterly payroll report for the finance team"),
    );

    let destination = Arc::new(MemoryDestination::new());
    let embedder = Arc::new(HashEmbedder::new(config().vector_dim));
    let engine = Engine::builder(config())
        .store(Store::ephemeral().unwrap())
        .source(Arc::new(StaticSourceFactory))
        .destination(destination.clone())
        .embedder(embedder.clone())
        .build()
        .unwrap();
    let mut connection = SyncConnection::new("acme", "fixtures", "static", "kb");
    connection.config = serde_json::json!({
        "entities": entities,
        "kind_specs": [
            KindSpec::new("doc").requires_text(),
            KindSpec::new("memo").requires_text(),
        ],
    });
    engine.create_connection(&connection).unwrap();
    engine
        .run_sync(connection.id, ActivityContext::new())
        .await
        .unwrap();

    let service = SearchService::builder(destination, embedder).build();
    let mut options = SearchOptions::default();
    options.search_method = SearchMethod::Neural;
    options.expansion_strategy = ExpansionStrategy::None;
    options.enable_reranking = false;
    options.enable_query_interpretation = true;

    let response = service
        .search(
            "kb",
            "kind:memo quarterly payroll report for the finance team",
            options,
        )
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].payload.kind, "memo");
}

#[tokio::test]
async fn unknown_option_fields_are_rejected_at_the_surface() {
    let (destination, embedder) = indexed(vec![doc("a", "alpha")]).await;
    let service = SearchService::builder(destination, embedder).build();

    let err = service
        .search_json("kb", "alpha", serde_json::json!({ "shiny": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));
}

#[tokio::test]
async fn provider_flags_without_a_provider_are_rejected() {
    let (destination, embedder) = indexed(vec![doc("a", "alpha")]).await;
    // No rerank or chat model configured.
    let service = SearchService::builder(destination, embedder).build();

    // enable_reranking defaults to true; with no rerank model that is a
    // conflict, not a silent no-op.
    let err = service
        .search("kb", "alpha", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));

    let mut options = SearchOptions::default();
    options.enable_reranking = false;
    options.response_type = ResponseType::Completion;
    let err = service.search("kb", "alpha", options).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));

    let mut options = SearchOptions::default();
    options.enable_reranking = false;
    options.expansion_strategy = ExpansionStrategy::Llm;
    let err = service.search("kb", "alpha", options).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));

    // auto expansion is the documented degradation and stays allowed.
    let mut options = SearchOptions::default();
    options.enable_reranking = false;
    options.expansion_strategy = ExpansionStrategy::Auto;
    service.search("kb", "alpha", options).await.unwrap();
}
