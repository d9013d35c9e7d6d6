//! Secret models, commands and queries
//!
//! Requests are immutable inputs; operations return their results instead of
//! writing them back into the request.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field name → ciphertext blob produced by the cipher.
pub type SecureJsonData = BTreeMap<String, Vec<u8>>;

/// Entity uid stored when a command does not name one.
pub const DEFAULT_ENTITY_UID: &str = "0";

/// Maximum entity uid length accepted by the `secret` table.
pub const ENTITY_UID_MAX_LEN: usize = 40;

/// A tenant's encrypted credential bag for one logical entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub id: i64,
    pub org_id: i64,
    pub entity_uid: String,
    #[serde(with = "base64_map")]
    pub secure_json_data: SecureJsonData,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Key used to select a single secret within an org
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretIdentifier {
    EntityUid(String),
    Id(i64),
}

impl fmt::Display for SecretIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretIdentifier::EntityUid(uid) => write!(f, "entity_uid={}", uid),
            SecretIdentifier::Id(id) => write!(f, "id={}", id),
        }
    }
}

/// Apply the lookup identifier rule: an org id plus an entity uid
/// (preferred) or an id.
pub fn resolve_identifier(
    org_id: i64,
    id: Option<i64>,
    entity_uid: Option<&str>,
) -> Result<SecretIdentifier> {
    if org_id <= 0 {
        return Err(Error::IdentifierNotSet);
    }

    match (entity_uid.filter(|uid| !uid.is_empty()), id.filter(|id| *id != 0)) {
        (Some(uid), _) => Ok(SecretIdentifier::EntityUid(uid.to_string())),
        (None, Some(id)) => Ok(SecretIdentifier::Id(id)),
        (None, None) => Err(Error::IdentifierNotSet),
    }
}

// ----------------------
// Commands

/// Create a secret. Values are plaintext; the service encrypts them.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSecretCommand {
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub entity_uid: String,
    pub secure_json_data: BTreeMap<String, String>,
}

impl AddSecretCommand {
    pub fn new(
        org_id: i64,
        entity_uid: impl Into<String>,
        secure_json_data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            org_id,
            entity_uid: entity_uid.into(),
            secure_json_data,
        }
    }

    /// Entity uid to persist, falling back to the column default.
    pub fn entity_uid_or_default(&self) -> &str {
        if self.entity_uid.is_empty() {
            DEFAULT_ENTITY_UID
        } else {
            &self.entity_uid
        }
    }
}

/// Rewrite a secret's data. Selected by `id` when set, else by
/// `(org_id, entity_uid)`.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecretCommand {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub entity_uid: Option<String>,
    pub secure_json_data: BTreeMap<String, String>,
}

impl UpdateSecretCommand {
    pub fn by_id(org_id: i64, id: i64, secure_json_data: BTreeMap<String, String>) -> Self {
        Self {
            id: Some(id),
            org_id,
            entity_uid: None,
            secure_json_data,
        }
    }

    pub fn by_entity_uid(
        org_id: i64,
        entity_uid: impl Into<String>,
        secure_json_data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: None,
            org_id,
            entity_uid: Some(entity_uid.into()),
            secure_json_data,
        }
    }

    /// Row selector for updates. The id wins so a rename through
    /// `entity_uid` still targets the same row.
    pub fn target(&self) -> Result<SecretIdentifier> {
        if self.org_id <= 0 {
            return Err(Error::IdentifierNotSet);
        }
        match self.id.filter(|id| *id != 0) {
            Some(id) => Ok(SecretIdentifier::Id(id)),
            None => resolve_identifier(self.org_id, None, self.entity_uid.as_deref()),
        }
    }

    /// New entity uid to write, only meaningful when selecting by id.
    pub fn rename_to(&self) -> Option<&str> {
        self.entity_uid.as_deref().filter(|uid| !uid.is_empty())
    }
}

/// Delete a secret by org id plus entity uid (preferred) or id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSecretCommand {
    #[serde(default)]
    pub id: Option<i64>,
    pub org_id: i64,
    #[serde(default)]
    pub entity_uid: Option<String>,
}

impl DeleteSecretCommand {
    pub fn by_id(org_id: i64, id: i64) -> Self {
        Self {
            id: Some(id),
            org_id,
            entity_uid: None,
        }
    }

    pub fn by_entity_uid(org_id: i64, entity_uid: impl Into<String>) -> Self {
        Self {
            id: None,
            org_id,
            entity_uid: Some(entity_uid.into()),
        }
    }

    pub fn identifier(&self) -> Result<SecretIdentifier> {
        resolve_identifier(self.org_id, self.id, self.entity_uid.as_deref())
    }
}

// ---------------------
// Queries

/// Fetch one secret by org id plus entity uid (preferred) or id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSecretQuery {
    #[serde(default)]
    pub id: Option<i64>,
    pub org_id: i64,
    #[serde(default)]
    pub entity_uid: Option<String>,
}

impl GetSecretQuery {
    pub fn by_id(org_id: i64, id: i64) -> Self {
        Self {
            id: Some(id),
            org_id,
            entity_uid: None,
        }
    }

    pub fn by_entity_uid(org_id: i64, entity_uid: impl Into<String>) -> Self {
        Self {
            id: None,
            org_id,
            entity_uid: Some(entity_uid.into()),
        }
    }

    pub fn identifier(&self) -> Result<SecretIdentifier> {
        resolve_identifier(self.org_id, self.id, self.entity_uid.as_deref())
    }
}

/// List an org's secrets in ascending id order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSecretsQuery {
    pub org_id: i64,
    /// Zero or negative means no limit.
    #[serde(default)]
    pub secret_limit: i64,
}

impl GetSecretsQuery {
    pub fn new(org_id: i64) -> Self {
        Self {
            org_id,
            secret_limit: 0,
        }
    }

    pub fn with_limit(mut self, secret_limit: i64) -> Self {
        self.secret_limit = secret_limit;
        self
    }

    pub fn limit(&self) -> Option<i64> {
        (self.secret_limit > 0).then_some(self.secret_limit)
    }
}

// Plaintext never reaches Debug output.
struct RedactedValues<'a>(&'a BTreeMap<String, String>);

impl fmt::Debug for RedactedValues<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl fmt::Debug for AddSecretCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddSecretCommand")
            .field("org_id", &self.org_id)
            .field("entity_uid", &self.entity_uid)
            .field("secure_json_data", &RedactedValues(&self.secure_json_data))
            .finish()
    }
}

impl fmt::Debug for UpdateSecretCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSecretCommand")
            .field("id", &self.id)
            .field("org_id", &self.org_id)
            .field("entity_uid", &self.entity_uid)
            .field("secure_json_data", &RedactedValues(&self.secure_json_data))
            .finish()
    }
}

// ---------------------
// Column codec

#[derive(Serialize, Deserialize)]
struct SecureJsonColumn(#[serde(with = "base64_map")] SecureJsonData);

/// Encode ciphertext for the `secure_json_data` TEXT column: a JSON object
/// whose values are base64 strings.
pub fn encode_secure_json_data(data: &SecureJsonData) -> Result<String> {
    Ok(serde_json::to_string(&SecureJsonColumn(data.clone()))?)
}

/// Decode the `secure_json_data` column. NULL or empty decodes to an empty map.
pub fn decode_secure_json_data(column: Option<&str>) -> Result<SecureJsonData> {
    match column.map(str::trim) {
        None | Some("") => Ok(SecureJsonData::new()),
        Some(json) => {
            let SecureJsonColumn(data) = serde_json::from_str(json)?;
            Ok(data)
        }
    }
}

/// Serde adapter writing `Vec<u8>` map values as base64 strings
pub mod base64_map {
    use super::SecureJsonData;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        data: &SecureJsonData,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(data.len()))?;
        for (key, value) in data {
            map.serialize_entry(key, &BASE64.encode(value))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<SecureJsonData, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(key, value)| {
                BASE64
                    .decode(value.as_bytes())
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("field '{}': {}", key, e)))
            })
            .collect()
    }
}
