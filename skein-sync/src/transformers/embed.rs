use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use miette::Diagnostic;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use skein_model::{Entity, TransformError};
use thiserror::Error;

use crate::transform::{Transformer, TransformerMeta};

#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    #[error("error executing embedding request")]
    Http(#[from] reqwest::Error),

    #[error("embedding response malformed: {0}")]
    Malformed(String),
}

/// A dense embedding model. Implementations batch internally up to
/// `batch_size` inputs per call.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dim(&self) -> usize;

    fn batch_size(&self) -> usize {
        64
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Deterministic local embedder: feature hashing of lowercased tokens into
/// a fixed-dimension space, L2-normalized. Identical text always produces
/// the identical unit vector, which is what the engine's change-detection
/// and self-similarity tests rely on. Not a semantic model.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-text2vec"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0f32; self.dim];
                for token in text.split_whitespace() {
                    let token = token.to_lowercase();
                    let digest = Sha256::digest(token.as_bytes());
                    let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
                        as usize
                        % self.dim;
                    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
                    vector[idx] += sign;
                }
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in &mut vector {
                        *v /= norm;
                    }
                }
                vector
            })
            .collect())
    }
}

/// Remote embedding model speaking the common `/v1/embeddings` shape.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
    batch_size: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dim: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            dim,
            batch_size: 64,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: EmbeddingsResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.data.len() != texts.len() {
            return Err(EmbedError::Malformed(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        for row in &response.data {
            if row.embedding.len() != self.dim {
                return Err(EmbedError::Malformed(format!(
                    "expected dimension {}, got {}",
                    self.dim,
                    row.embedding.len()
                )));
            }
        }

        Ok(response.data.into_iter().map(|row| row.embedding).collect())
    }
}

/// The neural embedding transformer: sets `vector` on each entity from its
/// embeddable text, batching calls to the underlying model.
pub struct DenseEmbedTransformer {
    meta: TransformerMeta,
    embedder: Arc<dyn Embedder>,
}

impl DenseEmbedTransformer {
    pub const NAME: &'static str = "embed-dense";

    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            meta: TransformerMeta {
                name: Self::NAME,
                input_kind: "*".to_string(),
                output_kind: "*".to_string(),
                supports_batch: true,
                preserves_metadata: true,
                external_io: true,
            },
            embedder,
        }
    }
}

#[async_trait]
impl Transformer for DenseEmbedTransformer {
    fn meta(&self) -> &TransformerMeta {
        &self.meta
    }

    async fn apply(&self, mut batch: Vec<Entity>) -> Result<Vec<Entity>, TransformError> {
        for entity in &batch {
            if entity
                .embeddable_text
                .as_deref()
                .unwrap_or("")
                .is_empty()
            {
                return Err(TransformError::new(
                    Self::NAME,
                    entity.entity_id.clone(),
                    "no embeddable text",
                ));
            }
        }

        let texts: Vec<String> = batch
            .iter()
            .map(|e| e.embeddable_text.clone().unwrap_or_default())
            .collect();

        let mut vectors = Vec::with_capacity(texts.len());
        for sub in texts.chunks(self.embedder.batch_size().max(1)) {
            debug!(
                "Embedding batch of {} texts with {}",
                sub.len(),
                self.embedder.model_name()
            );
            let first_id = batch[vectors.len()].entity_id.clone();
            let embedded = self
                .embedder
                .embed(sub)
                .await
                .map_err(|err| TransformError::new(Self::NAME, first_id, err))?;
            vectors.extend(embedded);
        }

        for (entity, vector) in batch.iter_mut().zip(vectors) {
            entity.vector = Some(vector);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["alpha beta gamma".to_string()];
        let a = embedder.embed(&texts).await.unwrap();
        let b = embedder.embed(&texts).await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn different_texts_embed_differently() {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder
            .embed(&["payroll report".to_string(), "kitten photos".to_string()])
            .await
            .unwrap();
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn transformer_sets_vectors() {
        let transformer = DenseEmbedTransformer::new(Arc::new(HashEmbedder::new(32)));
        let out = transformer
            .apply(vec![Entity::new("doc", "a").with_text("hello world")])
            .await
            .unwrap();
        assert_eq!(out[0].vector.as_ref().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn missing_text_fails_the_entity() {
        let transformer = DenseEmbedTransformer::new(Arc::new(HashEmbedder::new(32)));
        let err = transformer
            .apply(vec![Entity::new("doc", "a")])
            .await
            .unwrap_err();
        assert_eq!(err.entity_id, "a");
    }
}
