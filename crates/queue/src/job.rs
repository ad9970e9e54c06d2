use serde::{Deserialize, Serialize};

use beacon_core::{EntityKind, EntityRef};

use crate::error::QueueError;

/// Body of every job message: `{"kind": "schedule"|"monitor", "entityId": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub kind: EntityKind,
    pub entity_id: String,
}

impl JobPayload {
    pub fn schedule(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Schedule, entity_id: id.into() }
    }

    pub fn monitor(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Monitor, entity_id: id.into() }
    }

    pub fn parse(body: &str) -> Result<Self, QueueError> {
        serde_json::from_str(body).map_err(|e| QueueError::Parse(format!("invalid job payload: {e}")))
    }

    pub fn to_body(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Parse(e.to_string()))
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef { kind: self.kind, id: self.entity_id.clone() }
    }
}

impl From<&EntityRef> for JobPayload {
    fn from(entity: &EntityRef) -> Self {
        Self { kind: entity.kind, entity_id: entity.id.clone() }
    }
}
