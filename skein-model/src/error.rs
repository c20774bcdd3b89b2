use miette::Diagnostic;
use thiserror::Error;

/// Errors produced while building or hashing entities. These fail the job at
/// the point they surface; a connector emitting structurally invalid entities
/// is a programming error on the connector's side.
#[derive(Debug, Error, Diagnostic)]
pub enum EntityError {
    #[error("entity {entity_id} of kind {kind} requires embeddable text but has none")]
    MissingEmbeddableText { kind: String, entity_id: String },

    #[error("row for table {table} is missing its primary key column {column}")]
    MissingPrimaryKey { table: String, column: String },

    #[error("entity {entity_id} has a vector but no embeddable text")]
    VectorWithoutText { entity_id: String },
}

/// Source connector failures, split by how the engine reacts: auth errors
/// surface to the user, transient errors earn one in-job retry, fatal errors
/// fail the job until an operator intervenes.
#[derive(Debug, Error, Diagnostic)]
pub enum SourceError {
    #[error("source rejected the configured credentials: {0}")]
    Auth(String),

    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("fatal source failure: {0}")]
    Fatal(String),

    #[error("source cancelled mid-produce")]
    Cancelled,
}

impl SourceError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }
}

/// Destination failures. Transient errors are retried per batch with
/// backoff; fatal errors fail the job.
#[derive(Debug, Error, Diagnostic)]
pub enum DestinationError {
    #[error("transient destination failure: {0}")]
    Transient(String),

    #[error("fatal destination failure: {0}")]
    Fatal(String),
}

impl DestinationError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-entity transformer failure. Logged and counted; never fails the job.
#[derive(Debug, Error, Diagnostic)]
#[error("transformer {transformer} failed on entity {entity_id}: {message}")]
pub struct TransformError {
    pub transformer: String,
    pub entity_id: String,
    pub message: String,
}

impl TransformError {
    pub fn new(
        transformer: impl Into<String>,
        entity_id: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self {
            transformer: transformer.into(),
            entity_id: entity_id.into(),
            message: message.to_string(),
        }
    }
}
