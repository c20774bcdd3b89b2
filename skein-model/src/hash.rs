use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::entity::{Entity, KindRegistry, KindSpec};
use crate::error::EntityError;

/// Stable hash over an entity's content-relevant fields. Length-stable
/// (32 bytes, SHA-256) and collision-resistant enough that hash equality is
/// treated as content equality by the incremental-sync decision procedure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute the content hash of an entity under its kind spec.
///
/// Canonicalization rules, all load-bearing for "same content, same hash":
/// object keys are visited in sorted order, text is NFC-normalized, numbers
/// are rendered with serde_json's shortest-roundtrip formatting, and every
/// value is written with a type tag and length prefix so that adjacent
/// fields cannot alias each other.
pub fn content_hash(entity: &Entity, spec: &KindSpec) -> Result<ContentHash, EntityError> {
    let text = entity.embeddable_text.as_deref().unwrap_or("");
    if spec.requires_embeddable_text && text.is_empty() {
        return Err(EntityError::MissingEmbeddableText {
            kind: entity.kind.clone(),
            entity_id: entity.entity_id.clone(),
        });
    }
    if entity.vector.is_some() && text.is_empty() {
        return Err(EntityError::VectorWithoutText {
            entity_id: entity.entity_id.clone(),
        });
    }

    let mut hasher = Sha256::new();
    update_str(&mut hasher, &entity.kind);
    update_str(&mut hasher, text);

    if spec.content_fields.is_empty() {
        // Whole payload is content. serde_json's map iterates in key order.
        hasher.update((entity.payload.len() as u64).to_le_bytes());
        for (key, value) in &entity.payload {
            update_str(&mut hasher, key);
            update_value(&mut hasher, value);
        }
    } else {
        hasher.update((spec.content_fields.len() as u64).to_le_bytes());
        for field in &spec.content_fields {
            update_str(&mut hasher, field);
            match entity.payload.get(field) {
                Some(value) => {
                    hasher.update(b"+");
                    update_value(&mut hasher, value);
                }
                None => hasher.update(b"-"),
            }
        }
    }

    Ok(ContentHash(hasher.finalize().into()))
}

/// Content hash with the kind spec looked up (or defaulted) from the
/// registry.
pub fn content_hash_with(
    entity: &Entity,
    registry: &KindRegistry,
) -> Result<ContentHash, EntityError> {
    content_hash(entity, &registry.get_or_default(&entity.kind))
}

pub fn equal_content(a: &Entity, b: &Entity, registry: &KindRegistry) -> Result<bool, EntityError> {
    Ok(content_hash_with(a, registry)? == content_hash_with(b, registry)?)
}

fn update_str(hasher: &mut Sha256, s: &str) {
    let normalized: String = s.nfc().collect();
    hasher.update(b"s");
    hasher.update((normalized.len() as u64).to_le_bytes());
    hasher.update(normalized.as_bytes());
}

fn update_value(hasher: &mut Sha256, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => {
            hasher.update(b"z");
        }
        serde_json::Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([*b as u8]);
        }
        serde_json::Value::Number(n) => {
            // to_string is ryu's shortest roundtrip form for floats and plain
            // decimal for integers. Deterministic for a given value.
            let rendered = n.to_string();
            hasher.update(b"n");
            hasher.update((rendered.len() as u64).to_le_bytes());
            hasher.update(rendered.as_bytes());
        }
        serde_json::Value::String(s) => {
            update_str(hasher, s);
        }
        serde_json::Value::Array(items) => {
            hasher.update(b"a");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"o");
            hasher.update((keys.len() as u64).to_le_bytes());
            for key in keys {
                update_str(hasher, key);
                update_value(hasher, &map[key]);
            }
        }
    }
}
