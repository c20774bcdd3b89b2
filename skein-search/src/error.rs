use miette::Diagnostic;
use skein_model::DestinationError;
use skein_sync::transformers::EmbedError;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SearchError {
    #[error("unrecognised or invalid search options: {0}")]
    InvalidConfig(String),

    #[error("query embedding failed")]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("{provider} request failed")]
    Provider {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} response malformed: {message}")]
    Malformed {
        provider: &'static str,
        message: String,
    },

    #[error("search plan stalled; unresolved dependencies for: {0}")]
    StalledPlan(String),
}
