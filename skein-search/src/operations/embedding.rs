use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use skein_sync::transformers::{Bm25SparseEmbedder, Embedder};

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::options::SearchMethod;
use crate::state::SearchState;

/// Embeds every phrasing: a dense vector per phrasing, plus a sparse
/// vector when the search method calls for keyword similarity.
pub struct EmbedQueries {
    embedder: Arc<dyn Embedder>,
}

impl EmbedQueries {
    pub const NAME: &'static str = "embedding";

    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl SearchOperation for EmbedQueries {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> Vec<&'static str> {
        vec![super::QueryExpansion::NAME]
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        let queries = state.queries_to_embed();
        let method = state.options.search_method;
        debug!(
            "Embedding {} phrasing(s) for {method:?} search",
            queries.len()
        );

        if matches!(method, SearchMethod::Neural | SearchMethod::Hybrid) {
            state.dense_queries = self.embedder.embed(&queries).await?;
        }
        if matches!(method, SearchMethod::Keyword | SearchMethod::Hybrid) {
            state.sparse_queries = queries
                .iter()
                .map(|query| Bm25SparseEmbedder::weigh_query(query))
                .collect();
        }
        Ok(())
    }
}
