use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, warn};
use skein_model::ScoredPoint;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::state::SearchState;

/// Reorders the top candidates with an external rerank model. On any
/// provider failure the unreranked results stand; operators who want
/// strict failure instead mark the operation non-optional in their plan.
pub struct Reranking {
    client: Arc<dyn super::RerankClient>,
    max_candidates: usize,
    max_chars_per_doc: usize,
}

impl Reranking {
    pub const NAME: &'static str = "reranking";

    pub fn new(client: Arc<dyn super::RerankClient>) -> Self {
        Self {
            client,
            max_candidates: 100,
            // Roughly a 4k-token budget per document.
            max_chars_per_doc: 16_000,
        }
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates.max(1);
        self
    }

    /// `(title, source, content)` rendering with a per-doc size budget.
    fn document_text(&self, point: &ScoredPoint) -> String {
        let title = point
            .payload
            .breadcrumbs
            .last()
            .map(|crumb| crumb.name.as_str())
            .unwrap_or(&point.payload.entity_id);
        let source = point.payload.source_name.as_deref().unwrap_or("unknown");
        let mut text = format!(
            "title: {title}\nsource: {source}\ncontent: {}",
            point.payload.embeddable_text
        );
        if text.len() > self.max_chars_per_doc {
            let mut cut = self.max_chars_per_doc;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

#[async_trait]
impl SearchOperation for Reranking {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> Vec<&'static str> {
        vec![super::VectorSearch::NAME]
    }

    fn optional(&self) -> bool {
        true
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        if state.final_results.is_empty() {
            return Ok(());
        }

        let candidates = state
            .final_results
            .iter()
            .take(self.max_candidates)
            .cloned()
            .collect_vec();
        let documents = candidates
            .iter()
            .map(|point| self.document_text(point))
            .collect_vec();

        let query = state.effective_query();
        let limit = state.options.limit;
        match self.client.rerank(&query, &documents, limit).await {
            Ok(ranked) => {
                let mut reranked = Vec::with_capacity(ranked.len());
                for doc in ranked {
                    let mut point = candidates[doc.index].clone();
                    point.score = doc.relevance;
                    reranked.push(point);
                }
                debug!("Reranked {} candidate(s)", reranked.len());
                state.final_results = reranked;
                Ok(())
            }
            Err(err) => {
                // Fallback-to-unreranked. The truncated original ranking
                // stays in final_results; record why.
                warn!("Reranking failed, returning unreranked results: {err}");
                state.final_results.truncate(limit);
                state.record_error(Self::NAME, &err);
                Ok(())
            }
        }
    }
}
