mod memory;
mod qdrant;

pub use memory::MemoryDestination;
pub use qdrant::QdrantDestination;

use hashbrown::HashMap;
use skein_model::{PointId, ScoredPoint};

pub const RRF_K: f32 = 60.0;

/// Reciprocal-rank fusion of two rankings. Scores become
/// sum(1 / (k + rank)) over the rankings a point appears in; the constant
/// k=60 is the usual choice and keeps single-list outliers from dominating.
pub fn rrf_fuse(rankings: &[Vec<ScoredPoint>], limit: usize) -> Vec<ScoredPoint> {
    let mut fused: HashMap<PointId, (f32, ScoredPoint)> = HashMap::new();
    for ranking in rankings {
        for (rank, point) in ranking.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
            fused
                .entry(point.id)
                .and_modify(|(score, _)| *score += contribution)
                .or_insert_with(|| (contribution, point.clone()));
        }
    }

    let mut results: Vec<ScoredPoint> = fused
        .into_iter()
        .map(|(_, (score, mut point))| {
            point.score = score;
            point
        })
        .collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::{ConnectionId, PointPayload};
    use uuid::Uuid;

    fn point(id: u128, score: f32) -> ScoredPoint {
        let connection_id: ConnectionId = Uuid::from_u128(1);
        ScoredPoint {
            id: skein_model::PointId(Uuid::from_u128(id)),
            score,
            payload: PointPayload {
                tenant_id: "t".into(),
                collection_id: "c".into(),
                connection_id,
                source_name: None,
                kind: "doc".into(),
                entity_id: format!("e{id}"),
                parent_entity_id: None,
                breadcrumbs: vec![],
                embeddable_text: "text".into(),
                content_hash: String::new(),
                job_id: None,
                updated_at: None,
            },
        }
    }

    #[test]
    fn points_in_both_rankings_outrank_single_list_hits() {
        let dense = vec![point(1, 0.9), point(2, 0.8), point(3, 0.7)];
        let sparse = vec![point(2, 12.0), point(4, 11.0)];

        let fused = rrf_fuse(&[dense, sparse], 10);
        assert_eq!(fused[0].payload.entity_id, "e2");
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn limit_truncates() {
        let dense = vec![point(1, 0.9), point(2, 0.8), point(3, 0.7)];
        let fused = rrf_fuse(&[dense], 2);
        assert_eq!(fused.len(), 2);
    }
}
