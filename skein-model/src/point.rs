use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::entity::{Breadcrumb, ConnectionId, Entity, JobId};
use crate::error::EntityError;
use crate::hash::ContentHash;

/// Destination-side record id. Derived deterministically from the sync
/// connection and the source's entity id, so repeated writes of the same
/// entity land on the same point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointId(pub Uuid);

impl PointId {
    /// First 16 bytes of SHA-256 over `(connection_id, entity_id)`,
    /// truncated into the destination's UUID id space.
    pub fn derive(connection_id: ConnectionId, entity_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(connection_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(entity_id.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Indexable fields stored alongside the vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub tenant_id: String,
    pub collection_id: String,
    pub connection_id: ConnectionId,
    pub source_name: Option<String>,
    pub kind: String,
    pub entity_id: String,
    pub parent_entity_id: Option<String>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub embeddable_text: String,
    pub content_hash: String,
    pub job_id: Option<JobId>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub vector: Vec<f32>,
    pub sparse_vector: Option<BTreeMap<u32, f32>>,
    pub payload: PointPayload,
}

impl Point {
    /// Build the destination point for a fully transformed entity. The
    /// entity must carry a vector by this stage; the router only hands
    /// vectorized entities to destinations.
    pub fn from_entity(
        entity: &Entity,
        tenant_id: &str,
        collection_id: &str,
        connection_id: ConnectionId,
        hash: ContentHash,
    ) -> Result<Self, EntityError> {
        let vector = entity
            .vector
            .clone()
            .ok_or_else(|| EntityError::VectorWithoutText {
                entity_id: entity.entity_id.clone(),
            })?;
        let embeddable_text = entity
            .embeddable_text
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EntityError::VectorWithoutText {
                entity_id: entity.entity_id.clone(),
            })?;

        Ok(Self {
            id: PointId::derive(connection_id, &entity.entity_id),
            vector,
            sparse_vector: entity.sparse_vector.clone(),
            payload: PointPayload {
                tenant_id: tenant_id.to_string(),
                collection_id: collection_id.to_string(),
                connection_id,
                source_name: entity.metadata.source_name.clone(),
                kind: entity.kind.clone(),
                entity_id: entity.entity_id.clone(),
                parent_entity_id: entity.parent_entity_id.clone(),
                breadcrumbs: entity.breadcrumbs.clone(),
                embeddable_text,
                content_hash: hash.to_hex(),
                job_id: entity.metadata.job_id,
                updated_at: entity.metadata.updated_at,
            },
        })
    }
}

/// Destination-native filter expression. All listed constraints must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_ids: Vec<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
}

impl PointFilter {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
            && self.sources.is_empty()
            && self.connection_ids.is_empty()
            && self.updated_after.is_none()
            && self.updated_before.is_none()
    }

    pub fn matches(&self, payload: &PointPayload) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&payload.kind) {
            return false;
        }
        if !self.sources.is_empty() {
            let Some(source) = &payload.source_name else {
                return false;
            };
            if !self.sources.contains(source) {
                return false;
            }
        }
        if !self.connection_ids.is_empty() && !self.connection_ids.contains(&payload.connection_id)
        {
            return false;
        }
        if let Some(after) = self.updated_after {
            match payload.updated_at {
                Some(at) if at >= after => {}
                _ => return false,
            }
        }
        if let Some(before) = self.updated_before {
            match payload.updated_at {
                Some(at) if at <= before => {}
                _ => return false,
            }
        }
        true
    }
}

/// One search request against a destination collection. Dense, sparse, or
/// both; when both are present the destination fuses the two rankings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<BTreeMap<u32, f32>>,
    pub limit: usize,
    pub offset: usize,
    pub score_threshold: Option<f32>,
    pub filter: Option<PointFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    pub score: f32,
    pub payload: PointPayload,
}
