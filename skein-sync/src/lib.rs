pub mod config;
pub mod dag;
pub mod dest;
pub mod destinations;
pub mod engine;
pub mod error;
pub mod orchestrate;
pub mod progress;
pub mod router;
pub mod schedule;
pub mod source;
pub mod sources;
pub mod transform;
pub mod transformers;

pub use config::EngineConfig;
pub use dag::{DagNode, SyncDag};
pub use dest::Destination;
pub use engine::{Engine, EngineBuilder};
pub use error::{ConfigError, DagError, SyncError};
pub use orchestrate::{ActivityContext, SyncOrchestrator};
pub use progress::{ProgressBus, ProgressEvent, SyncProgress};
pub use source::{EntityEmitter, Source, SourceFactory, SourceRegistry};
pub use transform::{Transformer, TransformerMeta, TransformerRegistry};
