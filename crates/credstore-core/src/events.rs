//! Secret lifecycle events
//!
//! Events are published only after the transaction that produced them
//! commits. Each carries the identity of the affected row, never its data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a secret touched by a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEventPayload {
    pub timestamp: DateTime<Utc>,
    pub id: i64,
    pub entity_uid: String,
    pub org_id: i64,
}

/// Lifecycle event emitted after a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SecretEvent {
    #[serde(rename = "secret_created")]
    Created(SecretEventPayload),
    #[serde(rename = "secret_updated")]
    Updated(SecretEventPayload),
    #[serde(rename = "secret_deleted")]
    Deleted(SecretEventPayload),
}

impl SecretEvent {
    pub fn created(id: i64, entity_uid: impl Into<String>, org_id: i64) -> Self {
        Self::Created(SecretEventPayload::now(id, entity_uid, org_id))
    }

    pub fn updated(id: i64, entity_uid: impl Into<String>, org_id: i64) -> Self {
        Self::Updated(SecretEventPayload::now(id, entity_uid, org_id))
    }

    pub fn deleted(id: i64, entity_uid: impl Into<String>, org_id: i64) -> Self {
        Self::Deleted(SecretEventPayload::now(id, entity_uid, org_id))
    }

    pub fn payload(&self) -> &SecretEventPayload {
        match self {
            Self::Created(p) | Self::Updated(p) | Self::Deleted(p) => p,
        }
    }

    /// Event name, identical to the serialised `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "secret_created",
            Self::Updated(_) => "secret_updated",
            Self::Deleted(_) => "secret_deleted",
        }
    }
}

impl SecretEventPayload {
    fn now(id: i64, entity_uid: impl Into<String>, org_id: i64) -> Self {
        Self {
            timestamp: Utc::now(),
            id,
            entity_uid: entity_uid.into(),
            org_id,
        }
    }
}
