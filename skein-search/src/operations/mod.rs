mod clients;
mod completion;
mod embedding;
mod expansion;
mod filter_build;
mod interpretation;
mod rerank;
mod vector_search;

pub use clients::{ChatClient, HttpChatClient, HttpRerankClient, RerankClient, RerankedDoc};
pub use completion::Completion;
pub use embedding::EmbedQueries;
pub use expansion::QueryExpansion;
pub use filter_build::FilterBuild;
pub use interpretation::QueryInterpretationOp;
pub use rerank::Reranking;
pub use vector_search::VectorSearch;
