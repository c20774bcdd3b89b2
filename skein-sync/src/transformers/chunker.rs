use async_trait::async_trait;
use skein_model::{Breadcrumb, Entity, TransformError};

use crate::transform::{Transformer, TransformerMeta};

/// Splits a parent entity's text into chunk entities. Chunk ids are
/// deterministic (`{parent}#chunk-{index}`) so that re-chunking unchanged
/// text maps onto the same destination points.
pub struct TextChunker {
    meta: TransformerMeta,
    max_chars: usize,
}

impl TextChunker {
    pub const NAME: &'static str = "chunk-text";

    pub fn new(max_chars: usize) -> Self {
        Self {
            meta: TransformerMeta {
                name: Self::NAME,
                input_kind: "*".to_string(),
                output_kind: "*.chunk".to_string(),
                supports_batch: false,
                preserves_metadata: true,
                external_io: false,
            },
            max_chars: max_chars.max(1),
        }
    }

    fn chunk_entity(&self, parent: &Entity, index: usize, text: &str) -> Entity {
        let mut chunk = Entity::new(
            format!("{}.chunk", parent.kind),
            format!("{}#chunk-{}", parent.entity_id, index),
        );
        chunk.parent_entity_id = Some(parent.entity_id.clone());
        chunk.embeddable_text = Some(text.to_string());
        chunk
            .payload
            .insert("chunk_index".to_string(), serde_json::json!(index));
        chunk
            .payload
            .insert("text".to_string(), serde_json::json!(text));
        chunk.breadcrumbs = parent.breadcrumbs.clone();
        chunk.breadcrumbs.push(Breadcrumb::new(
            parent.entity_id.clone(),
            parent
                .payload
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(&parent.entity_id)
                .to_string(),
            parent.kind.clone(),
        ));
        chunk.metadata = parent.metadata.clone();
        chunk
    }

    /// Greedy paragraph packing: split on blank lines, pack paragraphs up
    /// to max_chars, hard-split any single paragraph that exceeds it on a
    /// char boundary.
    fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            if paragraph.len() > self.max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                let mut rest = paragraph;
                while rest.len() > self.max_chars {
                    let mut cut = self.max_chars;
                    while !rest.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    chunks.push(rest[..cut].to_string());
                    rest = &rest[cut..];
                }
                if !rest.is_empty() {
                    current = rest.to_string();
                }
                continue;
            }

            if !current.is_empty() && current.len() + 2 + paragraph.len() > self.max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if current.is_empty() {
                current = paragraph.to_string();
            } else {
                current.push_str("\n\n");
                current.push_str(paragraph);
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

#[async_trait]
impl Transformer for TextChunker {
    fn meta(&self) -> &TransformerMeta {
        &self.meta
    }

    async fn apply(&self, batch: Vec<Entity>) -> Result<Vec<Entity>, TransformError> {
        let mut outputs = Vec::new();
        for parent in &batch {
            let text = parent.embeddable_text.as_deref().unwrap_or("");
            if text.is_empty() {
                return Err(TransformError::new(
                    Self::NAME,
                    parent.entity_id.clone(),
                    "no text to chunk",
                ));
            }
            for (index, chunk_text) in self.split(text).into_iter().enumerate() {
                outputs.push(self.chunk_entity(parent, index, &chunk_text));
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(text: &str) -> Entity {
        Entity::new("fs.file", "notes.md").with_text(text)
    }

    #[tokio::test]
    async fn chunk_ids_are_deterministic() {
        let chunker = TextChunker::new(20);
        let text = "first paragraph\n\nsecond paragraph\n\nthird paragraph";

        let a = chunker.apply(vec![file(text)]).await.unwrap();
        let b = chunker.apply(vec![file(text)]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].entity_id, "notes.md#chunk-0");
        assert_eq!(a[2].entity_id, "notes.md#chunk-2");
        for chunk in &a {
            assert_eq!(chunk.parent_entity_id.as_deref(), Some("notes.md"));
            assert_eq!(chunk.kind, "fs.file.chunk");
        }
    }

    #[tokio::test]
    async fn small_paragraphs_pack_together() {
        let chunker = TextChunker::new(200);
        let chunks = chunker
            .apply(vec![file("one\n\ntwo\n\nthree")])
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].embeddable_text.as_deref(),
            Some("one\n\ntwo\n\nthree")
        );
    }

    #[tokio::test]
    async fn oversized_paragraph_is_hard_split() {
        let chunker = TextChunker::new(10);
        let chunks = chunker.apply(vec![file(&"x".repeat(25))]).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].embeddable_text.as_deref(), Some(&"x".repeat(10)[..]));
        assert_eq!(chunks[2].embeddable_text.as_deref(), Some(&"x".repeat(5)[..]));
    }

    #[tokio::test]
    async fn empty_text_is_a_transform_error() {
        let chunker = TextChunker::new(10);
        let err = chunker
            .apply(vec![Entity::new("fs.file", "empty")])
            .await
            .unwrap_err();
        assert_eq!(err.entity_id, "empty");
    }
}
