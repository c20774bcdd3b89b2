mod chunker;
mod embed;
mod sparse;

pub use chunker::TextChunker;
pub use embed::{DenseEmbedTransformer, EmbedError, Embedder, HashEmbedder, HttpEmbedder};
pub use sparse::{Bm25SparseEmbedder, SparseEmbedTransformer};
