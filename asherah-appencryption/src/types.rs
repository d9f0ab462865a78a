//! Envelope records shared by the engine, the metastores, and the wire codec.

use serde::{Deserialize, Serialize};

/// Identifies one version of a parent key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMeta {
    #[serde(rename = "ID")]
    pub id: String,
    /// Unix seconds.
    #[serde(rename = "Created")]
    pub created: i64,
}

impl KeyMeta {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
        }
    }
}

/// A key encrypted under its parent, as persisted in a metastore or embedded
/// in a [`DataRowRecord`].
///
/// System keys have no `parent_key_meta` (their parent is the KMS master key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeKeyRecord {
    #[serde(rename = "Revoked", default, skip_serializing_if = "Option::is_none")]
    pub revoked: Option<bool>,

    /// Unix seconds.
    #[serde(rename = "Created")]
    pub created: i64,

    #[serde(rename = "EncryptedKey", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,

    #[serde(rename = "ParentKeyMeta", default, skip_serializing_if = "Option::is_none")]
    pub parent_key_meta: Option<KeyMeta>,
}

impl EnvelopeKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked.unwrap_or(false)
    }
}

/// The unit callers persist: ciphertext plus the IK-encrypted data row key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRowRecord {
    #[serde(rename = "Key")]
    pub key: EnvelopeKeyRecord,

    #[serde(rename = "Data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Serde adapter storing byte fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
