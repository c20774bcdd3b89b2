use miette::Diagnostic;
use skein_db::StoreError;
use skein_model::{DestinationError, EntityError, SourceError};
use thiserror::Error;
use tokio::task::JoinError;

/// DAG validation failures. All of these fail the job before the first
/// entity is pulled.
#[derive(Debug, Error, Diagnostic)]
pub enum DagError {
    #[error("entity kind node {kind} has {count} outgoing edges; exactly one is required")]
    KindFanOut { kind: String, count: usize },

    #[error("transformer node {name} has {count} outgoing edges; exactly one is required")]
    TransformerFanOut { name: String, count: usize },

    #[error("chain starting at kind {kind} does not terminate in a destination")]
    NoTerminalDestination { kind: String },

    #[error("chain starting at kind {kind} revisits node {node}; the graph must be acyclic")]
    Cycle { kind: String, node: String },

    #[error("the graph has no destination node")]
    NoDestination,

    #[error("edge references unknown node index {0}")]
    UnknownNode(usize),

    #[error("transformer {0} is wired into the graph but not registered")]
    UnknownTransformer(String),

    #[error("destination {0} is wired into the graph but not configured")]
    UnknownDestination(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("no source registered under short name {0}")]
    UnknownSourceKind(String),

    #[error("invalid config for source {kind}: {message}")]
    InvalidSourceConfig { kind: String, message: String },

    #[error("invalid engine config: {0}")]
    Invalid(String),

    #[error("schedule rejected: {0}")]
    Schedule(#[from] crate::schedule::ScheduleError),
}

/// Errors that terminate a job. Per-entity failures are absorbed into
/// counters and never surface here.
#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    // Ledger failures are correctness-critical, so they fail the job the
    // same way a fatal destination error does.
    #[error("ledger failure")]
    Ledger(#[from] StoreError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("couldn't join sync task")]
    Join(#[source] JoinError),

    #[error("cancelled drain did not finish within the deadline")]
    DrainTimeout,
}

impl SyncError {
    /// Short machine-readable kind for the terminal job row and the final
    /// error event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source(SourceError::Auth(_)) => "source_auth",
            Self::Source(SourceError::Transient(_)) => "source_transient",
            Self::Source(SourceError::Fatal(_)) => "source_fatal",
            Self::Source(SourceError::Cancelled) => "cancelled",
            Self::Destination(DestinationError::Transient(_)) => "destination_transient",
            Self::Destination(DestinationError::Fatal(_)) => "destination_fatal",
            Self::Entity(_) => "invalid_entity",
            Self::Ledger(_) => "ledger",
            Self::Dag(_) => "invalid_dag",
            Self::Config(_) => "invalid_config",
            Self::Join(_) => "internal",
            Self::DrainTimeout => "drain_timeout",
        }
    }
}
