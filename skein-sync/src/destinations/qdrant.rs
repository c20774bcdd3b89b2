use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use skein_model::{DestinationError, Point, PointId, PointPayload, ScoredPoint, SearchRequest};

use crate::dest::Destination;

const DENSE_VECTOR_NAME: &str = "text-dense";
const SPARSE_VECTOR_NAME: &str = "text-sparse";

/// Qdrant REST destination. One collection per logical namespace; dense
/// vectors under a named vector, sparse under a named sparse vector, and
/// server-side RRF fusion through the query API.
pub struct QdrantDestination {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_batch: usize,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    points: Vec<QueryPoint>,
}

#[derive(Deserialize)]
struct QueryPoint {
    id: uuid::Uuid,
    score: f32,
    payload: Option<PointPayload>,
}

impl QdrantDestination {
    pub const NAME: &'static str = "qdrant";

    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key,
            max_batch: 256,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// 5xx and transport errors are retryable; anything else the caller
    /// misconfigured.
    fn classify(err: reqwest::Error) -> DestinationError {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .map(|status| status.is_server_error())
                .unwrap_or(false);
        if retryable {
            DestinationError::transient(err)
        } else {
            DestinationError::fatal(err)
        }
    }

    async fn send_checked(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DestinationError> {
        self.request(builder)
            .send()
            .await
            .map_err(Self::classify)?
            .error_for_status()
            .map_err(Self::classify)
    }

    fn point_body(point: &Point) -> serde_json::Value {
        let mut vector = json!({ DENSE_VECTOR_NAME: point.vector });
        if let Some(sparse) = &point.sparse_vector {
            let indices: Vec<u32> = sparse.keys().copied().collect();
            let values: Vec<f32> = sparse.values().copied().collect();
            vector[SPARSE_VECTOR_NAME] = json!({ "indices": indices, "values": values });
        }
        json!({
            "id": point.id.0,
            "vector": vector,
            "payload": point.payload,
        })
    }

    fn filter_body(request: &SearchRequest) -> Option<serde_json::Value> {
        let filter = request.filter.as_ref()?;
        if filter.is_empty() {
            return None;
        }
        let mut must = Vec::new();
        if !filter.kinds.is_empty() {
            must.push(json!({ "key": "kind", "match": { "any": filter.kinds } }));
        }
        if !filter.sources.is_empty() {
            must.push(json!({ "key": "source_name", "match": { "any": filter.sources } }));
        }
        if !filter.connection_ids.is_empty() {
            must.push(json!({ "key": "connection_id", "match": { "any": filter.connection_ids } }));
        }
        if filter.updated_after.is_some() || filter.updated_before.is_some() {
            must.push(json!({
                "key": "updated_at",
                "range": {
                    "gte": filter.updated_after,
                    "lte": filter.updated_before,
                }
            }));
        }
        Some(json!({ "must": must }))
    }

    fn query_body(request: &SearchRequest) -> Result<serde_json::Value, DestinationError> {
        let sparse_query = request.sparse.as_ref().map(|sparse| {
            let indices: Vec<u32> = sparse.keys().copied().collect();
            let values: Vec<f32> = sparse.values().copied().collect();
            json!({ "indices": indices, "values": values })
        });

        let mut body = match (&request.dense, sparse_query) {
            (Some(dense), Some(sparse)) => json!({
                "prefetch": [
                    { "query": dense, "using": DENSE_VECTOR_NAME, "limit": request.limit + request.offset },
                    { "query": sparse, "using": SPARSE_VECTOR_NAME, "limit": request.limit + request.offset },
                ],
                "query": { "fusion": "rrf" },
            }),
            (Some(dense), None) => json!({
                "query": dense,
                "using": DENSE_VECTOR_NAME,
            }),
            (None, Some(sparse)) => json!({
                "query": sparse,
                "using": SPARSE_VECTOR_NAME,
            }),
            (None, None) => {
                return Err(DestinationError::fatal(
                    "search request carries neither a dense nor a sparse vector",
                ));
            }
        };

        body["limit"] = json!(request.limit);
        body["offset"] = json!(request.offset);
        body["with_payload"] = json!(true);
        if let Some(threshold) = request.score_threshold {
            body["score_threshold"] = json!(threshold);
        }
        if let Some(filter) = Self::filter_body(request) {
            body["filter"] = filter;
        }
        Ok(body)
    }
}

#[async_trait]
impl Destination for QdrantDestination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
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
        let exists = self
            .request(self.client.get(self.url(&format!("/collections/{collection_id}"))))
            .send()
            .await
            .map_err(Self::classify)?;
        if exists.status().is_success() {
            return Ok(());
        }

        let mut body = json!({
            "vectors": { DENSE_VECTOR_NAME: { "size": vector_dim, "distance": "Cosine" } },
        });
        if sparse {
            body["sparse_vectors"] = json!({ SPARSE_VECTOR_NAME: {} });
        }

        debug!("Creating qdrant collection {collection_id} (dim {vector_dim})");
        let response = self
            .request(
                self.client
                    .put(self.url(&format!("/collections/{collection_id}")))
                    .json(&body),
            )
            .send()
            .await
            .map_err(Self::classify)?;

        // Another job creating the same collection concurrently is fine.
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        response.error_for_status().map_err(Self::classify)?;
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection_id: &str,
        points: &[Point],
    ) -> Result<(), DestinationError> {
        let body = json!({
            "points": points.iter().map(Self::point_body).collect::<Vec<_>>(),
        });
        self.send_checked(
            self.client
                .put(self.url(&format!("/collections/{collection_id}/points?wait=true")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn bulk_delete(
        &self,
        collection_id: &str,
        point_ids: &[PointId],
    ) -> Result<(), DestinationError> {
        let body = json!({
            "points": point_ids.iter().map(|id| id.0).collect::<Vec<_>>(),
        });
        self.send_checked(
            self.client
                .post(self.url(&format!(
                    "/collections/{collection_id}/points/delete?wait=true"
                )))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>, DestinationError> {
        let body = Self::query_body(request)?;
        let response: QueryResponse = self
            .send_checked(
                self.client
                    .post(self.url(&format!("/collections/{collection_id}/points/query")))
                    .json(&body),
            )
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        response
            .result
            .points
            .into_iter()
            .map(|point| {
                let payload = point.payload.ok_or_else(|| {
                    DestinationError::fatal(format!("point {} returned without payload", point.id))
                })?;
                Ok(ScoredPoint {
                    id: PointId(point.id),
                    score: point.score,
                    payload,
                })
            })
            .collect()
    }
}
