use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use log::debug;
use skein_model::{DestinationError, Point, PointId, ScoredPoint, SearchRequest};

use crate::dest::Destination;
use crate::destinations::rrf_fuse;

struct Collection {
    vector_dim: usize,
    sparse: bool,
    points: HashMap<PointId, Point>,
}

/// In-process destination with full search support. Backs tests, the demo
/// flow, and any deployment small enough to not want an external vector
/// store.
pub struct MemoryDestination {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryDestination {
    pub const NAME: &'static str = "memory";

    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn point_count(&self, collection_id: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection_id)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }

    pub fn get_point(&self, collection_id: &str, id: PointId) -> Option<Point> {
        self.collections
            .lock()
            .unwrap()
            .get(collection_id)
            .and_then(|c| c.points.get(&id).cloned())
    }

    pub fn all_points(&self, collection_id: &str) -> Vec<Point> {
        let mut points: Vec<Point> = self
            .collections
            .lock()
            .unwrap()
            .get(collection_id)
            .map(|c| c.points.values().cloned().collect())
            .unwrap_or_default();
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    fn sparse_dot(a: &BTreeMap<u32, f32>, b: &BTreeMap<u32, f32>) -> f32 {
        a.iter()
            .filter_map(|(idx, weight)| b.get(idx).map(|other| weight * other))
            .sum()
    }

    fn ranked<F>(collection: &Collection, request: &SearchRequest, score: F) -> Vec<ScoredPoint>
    where
        F: Fn(&Point) -> Option<f32>,
    {
        let mut results: Vec<ScoredPoint> = collection
            .points
            .values()
            .filter(|point| {
                request
                    .filter
                    .as_ref()
                    .map(|f| f.matches(&point.payload))
                    .unwrap_or(true)
            })
            .filter_map(|point| {
                score(point).map(|score| ScoredPoint {
                    id: point.id,
                    score,
                    payload: point.payload.clone(),
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        results
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &'static str {
        Self::NAME
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
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(collection_id.to_string())
            .or_insert_with(|| {
                debug!("Creating in-memory collection {collection_id} (dim {vector_dim})");
                Collection {
                    vector_dim,
                    sparse,
                    points: HashMap::new(),
                }
            });
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection_id: &str,
        points: &[Point],
    ) -> Result<(), DestinationError> {
        let mut collections = self.collections.lock().unwrap();
        let collection = collections
            .get_mut(collection_id)
            .ok_or_else(|| DestinationError::fatal(format!("no collection {collection_id}")))?;
        for point in points {
            if point.vector.len() != collection.vector_dim {
                return Err(DestinationError::fatal(format!(
                    "point {} has dimension {}, collection {} expects {}",
                    point.id,
                    point.vector.len(),
                    collection_id,
                    collection.vector_dim
                )));
            }
            collection.points.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn bulk_delete(
        &self,
        collection_id: &str,
        point_ids: &[PointId],
    ) -> Result<(), DestinationError> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(collection) = collections.get_mut(collection_id) {
            for id in point_ids {
                collection.points.remove(id);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>, DestinationError> {
        let collections = self.collections.lock().unwrap();
        let collection = collections
            .get(collection_id)
            .ok_or_else(|| DestinationError::fatal(format!("no collection {collection_id}")))?;

        if request.sparse.is_some() && !collection.sparse {
            return Err(DestinationError::fatal(format!(
                "collection {collection_id} was created without sparse vectors"
            )));
        }

        let dense_ranking = request.dense.as_ref().map(|query| {
            Self::ranked(collection, request, |point| {
                let score = Self::cosine(query, &point.vector);
                match request.score_threshold {
                    Some(threshold) if score < threshold => None,
                    _ => Some(score),
                }
            })
        });
        let sparse_ranking = request.sparse.as_ref().map(|query| {
            Self::ranked(collection, request, |point| {
                let sparse = point.sparse_vector.as_ref()?;
                let score = Self::sparse_dot(query, sparse);
                if score > 0.0 { Some(score) } else { None }
            })
        });

        let mut results = match (dense_ranking, sparse_ranking) {
            (Some(dense), Some(sparse)) => rrf_fuse(&[dense, sparse], usize::MAX),
            (Some(single), None) | (None, Some(single)) => single,
            (None, None) => {
                return Err(DestinationError::fatal(
                    "search request carries neither a dense nor a sparse vector",
                ));
            }
        };

        let end = (request.offset + request.limit).min(results.len());
        let start = request.offset.min(end);
        results = results[start..end].to_vec();
        Ok(results)
    }
}
