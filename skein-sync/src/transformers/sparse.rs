use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use skein_model::{Entity, TransformError};

use crate::transform::{Transformer, TransformerMeta};

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// BM25-style sparse embedder. Terms are hashed into a u32 index space;
/// weights are term frequencies saturated with the BM25 k1/b formula using
/// the in-batch average length as the document-length reference. Pure and
/// deterministic for a given batch.
pub struct Bm25SparseEmbedder;

impl Bm25SparseEmbedder {
    pub fn term_index(token: &str) -> u32 {
        let digest = Sha256::digest(token.as_bytes());
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    /// Weigh one document's terms against a reference average length.
    pub fn weigh(text: &str, avg_len: f32) -> BTreeMap<u32, f32> {
        let tokens = Self::tokens(text);
        let len = tokens.len() as f32;
        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for token in tokens {
            *counts.entry(Self::term_index(&token)).or_default() += 1.0;
        }

        let norm = K1 * (1.0 - B + B * len / avg_len.max(1.0));
        counts
            .into_iter()
            .map(|(idx, tf)| (idx, tf * (K1 + 1.0) / (tf + norm)))
            .collect()
    }

    /// Weigh a standalone piece of text (e.g. a search query) against its
    /// own length.
    pub fn weigh_query(text: &str) -> BTreeMap<u32, f32> {
        let len = Self::tokens(text).len() as f32;
        Self::weigh(text, len)
    }
}

pub struct SparseEmbedTransformer {
    meta: TransformerMeta,
}

impl SparseEmbedTransformer {
    pub const NAME: &'static str = "embed-sparse";

    pub fn new() -> Self {
        Self {
            meta: TransformerMeta {
                name: Self::NAME,
                input_kind: "*".to_string(),
                output_kind: "*".to_string(),
                supports_batch: true,
                preserves_metadata: true,
                external_io: false,
            },
        }
    }
}

impl Default for SparseEmbedTransformer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transformer for SparseEmbedTransformer {
    fn meta(&self) -> &TransformerMeta {
        &self.meta
    }

    async fn apply(&self, mut batch: Vec<Entity>) -> Result<Vec<Entity>, TransformError> {
        let lengths: Vec<usize> = batch
            .iter()
            .map(|e| Bm25SparseEmbedder::tokens(e.embeddable_text.as_deref().unwrap_or("")).len())
            .collect();
        let total: usize = lengths.iter().sum();
        let avg_len = if batch.is_empty() {
            1.0
        } else {
            total as f32 / batch.len() as f32
        };

        for entity in &mut batch {
            let text = entity.embeddable_text.as_deref().unwrap_or("");
            if text.is_empty() {
                return Err(TransformError::new(
                    Self::NAME,
                    entity.entity_id.clone(),
                    "no embeddable text",
                ));
            }
            entity.sparse_vector = Some(Bm25SparseEmbedder::weigh(text, avg_len));
        }
        Ok(batch)
    }
}
