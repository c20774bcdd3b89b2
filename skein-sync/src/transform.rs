use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use skein_model::{Entity, TransformError};

/// Static description of a transformer, declared at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformerMeta {
    pub name: &'static str,
    pub input_kind: String,
    pub output_kind: String,
    pub supports_batch: bool,
    pub preserves_metadata: bool,
    /// True when the transformer performs I/O beyond its inputs (an
    /// embedder calling a remote model). Pure otherwise.
    pub external_io: bool,
}

/// A named entity transformation. Pure apart from the external I/O its
/// metadata declares. Batch-capable transformers receive the whole batch in
/// one call; the router retries entity-by-entity when a batch call fails so
/// one bad entity cannot sink its neighbours.
#[async_trait]
pub trait Transformer: Send + Sync {
    fn meta(&self) -> &TransformerMeta;

    async fn apply(&self, batch: Vec<Entity>) -> Result<Vec<Entity>, TransformError>;
}

#[derive(Default, Clone)]
pub struct TransformerRegistry {
    transformers: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.transformers
            .insert(transformer.meta().name, transformer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transformers.contains_key(name)
    }
}
