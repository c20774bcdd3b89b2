use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use log::debug;
use skein_model::{ScoredPoint, SearchRequest};
use skein_sync::Destination;
use skein_sync::destinations::rrf_fuse;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::state::SearchState;

/// Issues the destination searches and produces the raw ranking. Hybrid
/// requests use the destination's native fusion when it has one, otherwise
/// two single-mode searches fused client-side with RRF. Multiple phrasings
/// are searched independently and fused the same way.
pub struct VectorSearch {
    destination: Arc<dyn Destination>,
    collection_id: String,
}

impl VectorSearch {
    pub const NAME: &'static str = "vector_search";

    pub fn new(destination: Arc<dyn Destination>, collection_id: impl Into<String>) -> Self {
        Self {
            destination,
            collection_id: collection_id.into(),
        }
    }

    async fn search_one(
        &self,
        state: &SearchState,
        dense: Option<Vec<f32>>,
        sparse: Option<std::collections::BTreeMap<u32, f32>>,
        fetch: usize,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        let base = SearchRequest {
            dense: None,
            sparse: None,
            limit: fetch,
            offset: 0,
            score_threshold: state.options.score_threshold,
            filter: state.filter.clone(),
        };

        if dense.is_some() && sparse.is_some() && !self.destination.supports_native_fusion() {
            // Two single-mode searches, fused here.
            let dense_results = self
                .destination
                .search(
                    &self.collection_id,
                    &SearchRequest {
                        dense,
                        ..base.clone()
                    },
                )
                .await?;
            let sparse_results = self
                .destination
                .search(
                    &self.collection_id,
                    &SearchRequest {
                        sparse,
                        ..base
                    },
                )
                .await?;
            return Ok(rrf_fuse(&[dense_results, sparse_results], fetch));
        }

        Ok(self
            .destination
            .search(
                &self.collection_id,
                &SearchRequest {
                    dense,
                    sparse,
                    ..base
                },
            )
            .await?)
    }

    /// Interpolate similarity rank with freshness rank. Weight 0 leaves
    /// the ranking alone; weight 1 sorts purely by updated_at.
    fn apply_recency_bias(results: &mut [ScoredPoint], weight: f32) {
        if weight <= 0.0 || results.len() < 2 {
            return;
        }
        let count = results.len() as f32;

        let freshness_order = results
            .iter()
            .enumerate()
            .sorted_by_key(|(_, point)| point.payload.updated_at)
            .map(|(index, _)| index)
            .collect_vec();

        let mut adjusted: Vec<f32> = vec![0.0; results.len()];
        for (fresh_rank, original_index) in freshness_order.into_iter().enumerate() {
            // fresh_rank counts from the stalest; normalize to [0, 1].
            let freshness = fresh_rank as f32 / (count - 1.0);
            let similarity = 1.0 - original_index as f32 / (count - 1.0);
            adjusted[original_index] = (1.0 - weight) * similarity + weight * freshness;
        }
        let mut indexed = adjusted.into_iter().zip(results.iter().cloned()).collect_vec();
        indexed.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
        for (slot, (score, mut point)) in results.iter_mut().zip(indexed) {
            point.score = score;
            *slot = point;
        }
    }
}

#[async_trait]
impl SearchOperation for VectorSearch {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> Vec<&'static str> {
        vec![super::EmbedQueries::NAME, super::FilterBuild::NAME]
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        let phrasings = state.dense_queries.len().max(state.sparse_queries.len());
        let fetch = state.options.offset + state.options.limit;

        let mut per_phrasing = Vec::with_capacity(phrasings);
        for index in 0..phrasings {
            let dense = state.dense_queries.get(index).cloned();
            let sparse = state.sparse_queries.get(index).cloned();
            per_phrasing.push(self.search_one(state, dense, sparse, fetch).await?);
        }

        let mut results = match per_phrasing.len() {
            0 => Vec::new(),
            1 => per_phrasing.pop().unwrap_or_default(),
            _ => rrf_fuse(&per_phrasing, fetch),
        };

        Self::apply_recency_bias(&mut results, state.options.recency_bias);

        let end = results.len().min(fetch);
        let start = state.options.offset.min(end);
        results = results[start..end].to_vec();

        debug!(
            "Vector search returned {} result(s) across {} phrasing(s)",
            results.len(),
            phrasings
        );
        state.raw_results = results.clone();
        state.final_results = results;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::{ConnectionId, PointId, PointPayload};

    fn point(id: u128, score: f32, updated: Option<&str>) -> ScoredPoint {
        let connection_id: ConnectionId = uuid::Uuid::from_u128(1);
        ScoredPoint {
            id: PointId(uuid::Uuid::from_u128(id)),
            score,
            payload: PointPayload {
                tenant_id: "t".into(),
                collection_id: "kb".into(),
                connection_id,
                source_name: None,
                kind: "doc".into(),
                entity_id: format!("e{id}"),
                parent_entity_id: None,
                breadcrumbs: vec![],
                embeddable_text: "text".into(),
                content_hash: String::new(),
                job_id: None,
                updated_at: updated.map(|s| s.parse().unwrap()),
            },
        }
    }

    #[test]
    fn zero_bias_preserves_the_ranking() {
        let mut results = vec![
            point(1, 0.9, Some("2026-01-01T00:00:00Z")),
            point(2, 0.8, Some("2026-07-01T00:00:00Z")),
        ];
        let before = results.clone();
        VectorSearch::apply_recency_bias(&mut results, 0.0);
        assert_eq!(results, before);
    }

    #[test]
    fn full_bias_sorts_by_freshness() {
        let mut results = vec![
            point(1, 0.9, Some("2026-01-01T00:00:00Z")),
            point(2, 0.8, Some("2026-07-01T00:00:00Z")),
            point(3, 0.7, Some("2026-03-01T00:00:00Z")),
        ];
        VectorSearch::apply_recency_bias(&mut results, 1.0);
        let ids: Vec<String> = results
            .iter()
            .map(|p| p.payload.entity_id.clone())
            .collect();
        assert_eq!(ids, vec!["e2", "e3", "e1"]);
    }
}
