use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EntityError;

pub type ConnectionId = Uuid;
pub type JobId = Uuid;

/// One step of the ancestry path from the source's root container down to
/// the entity itself. Carried for provenance, indexed at the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub id: String,
    pub name: String,
    pub kind: String,
}

impl Breadcrumb {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// System-added fields. Everything in here is volatile: none of it
/// participates in the content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub source_name: Option<String>,
    pub connection_id: Option<ConnectionId>,
    pub job_id: Option<JobId>,
    pub emitted_at: Option<DateTime<Utc>>,
    /// Last content change as reported by the source, when it reports one.
    /// Used for recency weighting at search time.
    pub updated_at: Option<DateTime<Utc>>,
}

/// The unit of ingestion. One struct for every shape of record; `kind` is the
/// discriminator and `payload` carries the source-native fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub parent_entity_id: Option<String>,
    pub kind: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub embeddable_text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub sparse_vector: Option<BTreeMap<u32, f32>>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub metadata: EntityMetadata,
}

impl Entity {
    pub fn new(kind: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            parent_entity_id: None,
            kind: kind.into(),
            payload: serde_json::Map::new(),
            embeddable_text: None,
            vector: None,
            sparse_vector: None,
            breadcrumbs: Vec::new(),
            metadata: EntityMetadata::default(),
        }
    }

    pub fn with_payload_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.embeddable_text = Some(text.into());
        self
    }

    pub fn with_parent(mut self, parent_entity_id: impl Into<String>) -> Self {
        self.parent_entity_id = Some(parent_entity_id.into());
        self
    }

    pub fn with_breadcrumb(mut self, crumb: Breadcrumb) -> Self {
        self.breadcrumbs.push(crumb);
        self
    }
}

/// Static description of an entity kind, declared by the connector that
/// produces it. `content_fields` is the subset of payload fields that count
/// as content for change detection; fields not listed (fetch timestamps,
/// server revision tags) are excluded from the hash. An empty list means the
/// whole payload is content-relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSpec {
    pub kind: String,
    pub content_fields: Vec<String>,
    pub requires_embeddable_text: bool,
    /// Whether entities of this kind are expected to fan out into children
    /// (e.g. a file that a chunker splits). Drives child tracking.
    pub produces_children: bool,
}

impl KindSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content_fields: Vec::new(),
            requires_embeddable_text: false,
            produces_children: false,
        }
    }

    pub fn content_fields(mut self, fields: &[&str]) -> Self {
        self.content_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn requires_text(mut self) -> Self {
        self.requires_embeddable_text = true;
        self
    }

    pub fn parent(mut self) -> Self {
        self.produces_children = true;
        self
    }
}

/// Kind specs registered by the connectors active in this process. Built
/// once at startup; lookups during routing and hashing are read-only.
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    specs: BTreeMap<String, KindSpec>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: KindSpec) {
        self.specs.insert(spec.kind.clone(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.specs.get(kind)
    }

    /// The spec for `kind`, or a permissive default treating the entire
    /// payload as content. Connectors that care about volatile fields must
    /// register a spec.
    pub fn get_or_default(&self, kind: &str) -> KindSpec {
        self.specs
            .get(kind)
            .cloned()
            .unwrap_or_else(|| KindSpec::new(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }
}

/// Schema descriptor for row-shaped sources (SQL tables and the like).
/// Rows are represented as a generic entity carrying the descriptor rather
/// than as per-table types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
}

impl TableSchema {
    /// Kind discriminator for rows of this table.
    pub fn row_kind(&self) -> String {
        format!("table.{}", self.table)
    }

    /// Build a row entity. The entity id is the primary key value; the
    /// embeddable text is a rendering of the row's textual columns.
    pub fn row_entity(
        &self,
        row: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Entity, EntityError> {
        let pk = row
            .get(&self.primary_key)
            .ok_or_else(|| EntityError::MissingPrimaryKey {
                table: self.table.clone(),
                column: self.primary_key.clone(),
            })?;
        let entity_id = match pk {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let text = self
            .columns
            .iter()
            .filter_map(|col| {
                row.get(&col.name)
                    .and_then(|v| v.as_str())
                    .map(|s| format!("{}: {}", col.name, s))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut entity = Entity::new(self.row_kind(), entity_id);
        entity.payload = row;
        if !text.is_empty() {
            entity.embeddable_text = Some(text);
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_entity_uses_primary_key_as_id() {
        let schema = TableSchema {
            table: "customers".to_string(),
            primary_key: "id".to_string(),
            columns: vec![
                ColumnSpec {
                    name: "id".to_string(),
                    data_type: "integer".to_string(),
                },
                ColumnSpec {
                    name: "name".to_string(),
                    data_type: "text".to_string(),
                },
            ],
        };

        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!(42));
        row.insert("name".to_string(), serde_json::json!("Acme"));

        let entity = schema.row_entity(row).unwrap();
        assert_eq!(entity.entity_id, "42");
        assert_eq!(entity.kind, "table.customers");
        assert_eq!(entity.embeddable_text.as_deref(), Some("name: Acme"));
    }

    #[test]
    fn row_entity_without_primary_key_fails() {
        let schema = TableSchema {
            table: "customers".to_string(),
            primary_key: "id".to_string(),
            columns: vec![],
        };

        let err = schema.row_entity(serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, EntityError::MissingPrimaryKey { .. }));
    }
}
