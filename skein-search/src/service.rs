use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use skein_model::ScoredPoint;
use skein_sync::Destination;
use skein_sync::transformers::Embedder;

use crate::error::SearchError;
use crate::executor::SearchExecutor;
use crate::op::SearchOperation;
use crate::operations::{
    ChatClient, Completion, EmbedQueries, FilterBuild, QueryExpansion, QueryInterpretationOp,
    RerankClient, Reranking, VectorSearch,
};
use crate::options::{ExpansionStrategy, ResponseType, SearchOptions};
use crate::state::SearchState;

#[derive(Debug)]
pub struct SearchResponse {
    pub results: Vec<ScoredPoint>,
    pub completion: Option<String>,
    pub timings: BTreeMap<String, Duration>,
    /// Errors absorbed from optional stages; empty on a clean run.
    pub errors: Vec<(String, String)>,
}

/// The read side of the platform: assembles a per-request operation plan
/// from the options and runs it through the executor. Shares the
/// destination and the embedding model with the sync engine.
pub struct SearchService {
    destination: Arc<dyn Destination>,
    embedder: Arc<dyn Embedder>,
    chat: Option<Arc<dyn ChatClient>>,
    rerank: Option<Arc<dyn RerankClient>>,
    max_expansions: usize,
}

pub struct SearchServiceBuilder {
    destination: Arc<dyn Destination>,
    embedder: Arc<dyn Embedder>,
    chat: Option<Arc<dyn ChatClient>>,
    rerank: Option<Arc<dyn RerankClient>>,
    max_expansions: usize,
}

impl SearchServiceBuilder {
    pub fn chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn rerank(mut self, rerank: Arc<dyn RerankClient>) -> Self {
        self.rerank = Some(rerank);
        self
    }

    pub fn max_expansions(mut self, max_expansions: usize) -> Self {
        self.max_expansions = max_expansions.max(1);
        self
    }

    pub fn build(self) -> SearchService {
        SearchService {
            destination: self.destination,
            embedder: self.embedder,
            chat: self.chat,
            rerank: self.rerank,
            max_expansions: self.max_expansions,
        }
    }
}

impl SearchService {
    pub fn builder(
        destination: Arc<dyn Destination>,
        embedder: Arc<dyn Embedder>,
    ) -> SearchServiceBuilder {
        SearchServiceBuilder {
            destination,
            embedder,
            chat: None,
            rerank: None,
            max_expansions: 4,
        }
    }

    /// Options arriving over the wire; unknown fields are rejected.
    pub async fn search_json(
        &self,
        collection_id: &str,
        query: &str,
        options: serde_json::Value,
    ) -> Result<SearchResponse, SearchError> {
        self.search(collection_id, query, SearchOptions::from_json(options)?)
            .await
    }

    pub async fn search(
        &self,
        collection_id: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        options.validate()?;
        self.check_providers(&options)?;
        let plan = self.plan(collection_id, &options);
        debug!(
            "Searching {collection_id} with a {}-operation plan",
            plan.len()
        );

        let mut state = SearchState::new(query, options);
        let summary = SearchExecutor::new(plan).execute(&mut state).await?;

        Ok(SearchResponse {
            results: state.final_results,
            completion: state.completion,
            timings: summary.timings,
            errors: summary.errors,
        })
    }

    /// A flag that names a provider this service does not have is a
    /// conflict, not a silent no-op. `auto` expansion is the one
    /// documented degradation: without a chat model it means `none`.
    fn check_providers(&self, options: &SearchOptions) -> Result<(), SearchError> {
        if options.enable_reranking && self.rerank.is_none() {
            return Err(SearchError::InvalidConfig(
                "enable_reranking is set but no rerank model is configured".to_string(),
            ));
        }
        if options.response_type == ResponseType::Completion && self.chat.is_none() {
            return Err(SearchError::InvalidConfig(
                "response_type is completion but no chat model is configured".to_string(),
            ));
        }
        if options.expansion_strategy == ExpansionStrategy::Llm && self.chat.is_none() {
            return Err(SearchError::InvalidConfig(
                "expansion_strategy is llm but no chat model is configured".to_string(),
            ));
        }
        Ok(())
    }

    fn plan(&self, collection_id: &str, options: &SearchOptions) -> Vec<Arc<dyn SearchOperation>> {
        let mut plan: Vec<Arc<dyn SearchOperation>> = Vec::with_capacity(7);

        if options.enable_query_interpretation {
            plan.push(Arc::new(QueryInterpretationOp));
        }
        if options.enable_query_interpretation || options.filter.is_some() {
            plan.push(Arc::new(FilterBuild));
        }
        if options.expansion_strategy != ExpansionStrategy::None {
            plan.push(Arc::new(QueryExpansion::new(
                self.chat.clone(),
                self.max_expansions,
            )));
        }
        plan.push(Arc::new(EmbedQueries::new(self.embedder.clone())));
        plan.push(Arc::new(VectorSearch::new(
            self.destination.clone(),
            collection_id,
        )));
        if options.enable_reranking {
            if let Some(rerank) = &self.rerank {
                plan.push(Arc::new(Reranking::new(rerank.clone())));
            }
        }
        if options.response_type == ResponseType::Completion {
            if let Some(chat) = &self.chat {
                plan.push(Arc::new(Completion::new(chat.clone())));
            }
        }
        plan
    }
}
