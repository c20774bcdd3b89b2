use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use skein_model::{Breadcrumb, Cursor, Entity, KindSpec, SourceError};

use crate::error::ConfigError;
use crate::source::{EntityEmitter, Source, SourceFactory};

pub const FILE_KIND: &str = "fs.file";

/// Walks a directory tree and emits one file entity per readable text
/// file. Always re-enumerates everything: the content hash decides what is
/// actually re-written, and full enumeration is what makes disappearance
/// deletes possible.
pub struct FilesystemSource {
    root: PathBuf,
    include_extensions: Vec<String>,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>, include_extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            include_extensions,
        }
    }

    fn included(&self, path: &Path) -> bool {
        if self.include_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.include_extensions
                    .iter()
                    .any(|inc| inc.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Depth-first, name-sorted walk for a deterministic emission order.
    fn collect_files(&self, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.collect_files(&path, files)?;
            } else if self.included(&path) {
                files.push(path);
            }
        }
        Ok(())
    }

    fn file_entity(&self, path: &Path) -> std::io::Result<Option<Entity>> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            debug!("Skipping non-text file {}", path.display());
            return Ok(None);
        };
        let relative = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let meta = std::fs::metadata(path)?;
        let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative.clone());

        let mut entity = Entity::new(FILE_KIND, relative.clone())
            .with_payload_field("path", relative.clone())
            .with_payload_field("name", name)
            .with_text(contents)
            .with_breadcrumb(Breadcrumb::new(
                self.root.to_string_lossy().into_owned(),
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "/".to_string()),
                "fs.directory",
            ));
        entity.metadata.updated_at = modified;
        Ok(Some(entity))
    }
}

#[async_trait]
impl Source for FilesystemSource {
    fn short_name(&self) -> &'static str {
        "filesystem"
    }

    fn kind_specs(&self) -> Vec<KindSpec> {
        // mtime and size are volatile; path and contents are the content.
        vec![
            KindSpec::new(FILE_KIND)
                .content_fields(&["path", "name"])
                .requires_text()
                .parent(),
        ]
    }

    async fn validate(&self) -> Result<(), SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::Fatal(format!(
                "root {} is not a readable directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn produce(
        &self,
        _cursor: Option<Cursor>,
        emitter: &EntityEmitter,
    ) -> Result<Option<Cursor>, SourceError> {
        let mut files = Vec::new();
        self.collect_files(&self.root, &mut files)
            .map_err(SourceError::transient)?;
        debug!("Filesystem walk found {} candidate files", files.len());

        for path in files {
            match self.file_entity(&path) {
                Ok(Some(entity)) => emitter.emit(entity).await?,
                Ok(None) => {}
                Err(err) => {
                    // A file vanishing mid-walk is not fatal to the job.
                    warn!("Couldn't read {}: {err}", path.display());
                }
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct FilesystemConfig {
    root: String,
    #[serde(default)]
    include_extensions: Vec<String>,
}

pub struct FilesystemSourceFactory;

impl SourceFactory for FilesystemSourceFactory {
    fn short_name(&self) -> &'static str {
        "filesystem"
    }

    fn create(
        &self,
        config: &serde_json::Value,
        _auth: Option<&str>,
    ) -> Result<Arc<dyn Source>, ConfigError> {
        let config: FilesystemConfig =
            serde_json::from_value(config.clone()).map_err(|err| {
                ConfigError::InvalidSourceConfig {
                    kind: "filesystem".to_string(),
                    message: err.to_string(),
                }
            })?;
        Ok(Arc::new(FilesystemSource::new(
            config.root,
            config.include_extensions,
        )))
    }
}
