use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use skein_model::{Cursor, Entity, KindSpec, SourceError};

use crate::error::ConfigError;
use crate::source::{EntityEmitter, Source, SourceFactory};

/// In-memory source emitting a fixed list of entities. Backs hermetic
/// tests and the demo flow; also exercises backpressure and cancellation
/// when given a per-entity delay.
pub struct StaticSource {
    entities: Vec<Entity>,
    kind_specs: Vec<KindSpec>,
    emit_delay: Option<Duration>,
    fail_after: Option<(usize, fn() -> SourceError)>,
    cursor_out: Option<Cursor>,
}

impl StaticSource {
    pub fn new(entities: Vec<Entity>, kind_specs: Vec<KindSpec>) -> Self {
        Self {
            entities,
            kind_specs,
            emit_delay: None,
            fail_after: None,
            cursor_out: None,
        }
    }

    pub fn with_emit_delay(mut self, delay: Duration) -> Self {
        self.emit_delay = Some(delay);
        self
    }

    /// Fail with `error()` after emitting `count` entities.
    pub fn with_failure_after(mut self, count: usize, error: fn() -> SourceError) -> Self {
        self.fail_after = Some((count, error));
        self
    }

    pub fn with_cursor_out(mut self, cursor: Cursor) -> Self {
        self.cursor_out = Some(cursor);
        self
    }
}

#[async_trait]
impl Source for StaticSource {
    fn short_name(&self) -> &'static str {
        "static"
    }

    fn kind_specs(&self) -> Vec<KindSpec> {
        self.kind_specs.clone()
    }

    fn supports_continuous(&self) -> bool {
        true
    }

    async fn validate(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn produce(
        &self,
        _cursor: Option<Cursor>,
        emitter: &EntityEmitter,
    ) -> Result<Option<Cursor>, SourceError> {
        for (index, entity) in self.entities.iter().enumerate() {
            if let Some((count, error)) = self.fail_after {
                if index >= count {
                    return Err(error());
                }
            }
            if let Some(delay) = self.emit_delay {
                tokio::time::sleep(delay).await;
            }
            emitter.emit(entity.clone()).await?;
        }
        Ok(self.cursor_out.clone())
    }
}

#[derive(Debug, Deserialize)]
struct StaticConfig {
    entities: Vec<Entity>,
    #[serde(default)]
    kind_specs: Vec<KindSpec>,
    /// Pause between emits, for exercising backpressure and cancellation.
    #[serde(default)]
    emit_delay_ms: Option<u64>,
}

/// Factory for config-defined static sources (demo fixtures).
pub struct StaticSourceFactory;

impl SourceFactory for StaticSourceFactory {
    fn short_name(&self) -> &'static str {
        "static"
    }

    fn create(
        &self,
        config: &serde_json::Value,
        _auth: Option<&str>,
    ) -> Result<Arc<dyn Source>, ConfigError> {
        let config: StaticConfig =
            serde_json::from_value(config.clone()).map_err(|err| ConfigError::InvalidSourceConfig {
                kind: "static".to_string(),
                message: err.to_string(),
            })?;
        let mut kind_specs = config.kind_specs;
        if kind_specs.is_empty() {
            let mut kinds: Vec<String> = config.entities.iter().map(|e| e.kind.clone()).collect();
            kinds.sort();
            kinds.dedup();
            kind_specs = kinds.into_iter().map(KindSpec::new).collect();
        }
        let mut source = StaticSource::new(config.entities, kind_specs);
        if let Some(delay) = config.emit_delay_ms {
            source = source.with_emit_delay(Duration::from_millis(delay));
        }
        Ok(Arc::new(source))
    }
}
