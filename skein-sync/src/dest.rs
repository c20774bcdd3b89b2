use async_trait::async_trait;
use skein_model::{DestinationError, Point, PointId, ScoredPoint, SearchRequest};

/// A vector-store destination. Implementations must be safe for concurrent
/// calls; the orchestrator shares one client across its tasks.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hard cap on points per bulk call. The writer batches up to
    /// min(this, configured write batch size).
    fn max_batch_size(&self) -> usize {
        256
    }

    /// Whether `search` can fuse dense and sparse rankings server-side.
    /// When false, the search pipeline issues two searches and fuses
    /// client-side.
    fn supports_native_fusion(&self) -> bool {
        false
    }

    /// Create the collection if it does not exist. Idempotent and safe to
    /// call concurrently from multiple jobs writing the same collection.
    async fn ensure_collection(
        &self,
        collection_id: &str,
        vector_dim: usize,
        sparse: bool,
    ) -> Result<(), DestinationError>;

    /// Idempotent on point id: re-upserting the same id overwrites.
    async fn bulk_upsert(
        &self,
        collection_id: &str,
        points: &[Point],
    ) -> Result<(), DestinationError>;

    /// Tolerates ids that are already absent.
    async fn bulk_delete(
        &self,
        collection_id: &str,
        point_ids: &[PointId],
    ) -> Result<(), DestinationError>;

    async fn search(
        &self,
        collection_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>, DestinationError>;
}
