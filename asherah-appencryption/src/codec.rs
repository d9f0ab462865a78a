//! Wire codec for [`DataRowRecord`].
//!
//! Two representations carry identical fields:
//! - JSON: `{"Key":{"Created":..,"EncryptedKey":"<b64>","ParentKeyMeta":{"ID":..,"Created":..}},"Data":"<b64>"}`
//! - Compact: a versioned CBOR map with raw byte strings.
//!
//! Decoding never panics; every rejection is [`AsherahError::MalformedRecord`].

use crate::error::{AsherahError, AsherahResult};
use crate::types::{DataRowRecord, EnvelopeKeyRecord, KeyMeta};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Version tag of the compact encoding.
pub const COMPACT_VERSION: u8 = 1;

/// Encodes a record as a JSON string.
pub fn encode_json(record: &DataRowRecord) -> AsherahResult<String> {
    serde_json::to_string(record).map_err(|e| AsherahError::MalformedRecord(e.to_string()))
}

/// Encodes a record as JSON into a buffer pre-sized to `capacity` bytes.
pub fn encode_json_with_capacity(record: &DataRowRecord, capacity: usize) -> AsherahResult<String> {
    let mut buf = Vec::with_capacity(capacity);
    serde_json::to_writer(&mut buf, record)
        .map_err(|e| AsherahError::MalformedRecord(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| AsherahError::MalformedRecord(e.to_string()))
}

/// Decodes a record from JSON text.
pub fn decode_json(json: &str) -> AsherahResult<DataRowRecord> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| AsherahError::MalformedRecord(format!("not valid JSON: {e}")))?;
    decode_json_value(value)
}

/// Decodes a record from an already-parsed JSON value.
pub fn decode_json_value(value: serde_json::Value) -> AsherahResult<DataRowRecord> {
    if !value.is_object() {
        return Err(AsherahError::MalformedRecord(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    let record: DataRowRecord = serde_json::from_value(value)
        .map_err(|e| AsherahError::MalformedRecord(e.to_string()))?;
    validate(&record)?;
    Ok(record)
}

/// Converts a record to a JSON value.
pub fn to_json_value(record: &DataRowRecord) -> AsherahResult<serde_json::Value> {
    serde_json::to_value(record).map_err(|e| AsherahError::MalformedRecord(e.to_string()))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Rejects records that parse but cannot possibly decrypt.
pub fn validate(record: &DataRowRecord) -> AsherahResult<()> {
    let parent = record
        .key
        .parent_key_meta
        .as_ref()
        .ok_or_else(|| AsherahError::MalformedRecord("missing Key.ParentKeyMeta".into()))?;
    if parent.id.is_empty() {
        return Err(AsherahError::MalformedRecord(
            "empty Key.ParentKeyMeta.ID".into(),
        ));
    }
    if record.key.encrypted_key.is_empty() {
        return Err(AsherahError::MalformedRecord("empty Key.EncryptedKey".into()));
    }
    if record.data.is_empty() {
        return Err(AsherahError::MalformedRecord("empty Data".into()));
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct CompactRecord {
    v: u8,
    data: ByteBuf,
    key: ByteBuf,
    created: i64,
    parent_id: String,
    parent_created: i64,
}

/// Encodes a record in the compact binary form.
pub fn encode_compact(record: &DataRowRecord) -> AsherahResult<Vec<u8>> {
    validate(record)?;
    let parent = record
        .key
        .parent_key_meta
        .as_ref()
        .ok_or_else(|| AsherahError::MalformedRecord("missing Key.ParentKeyMeta".into()))?;

    let compact = CompactRecord {
        v: COMPACT_VERSION,
        data: ByteBuf::from(record.data.clone()),
        key: ByteBuf::from(record.key.encrypted_key.clone()),
        created: record.key.created,
        parent_id: parent.id.clone(),
        parent_created: parent.created,
    };

    let mut buf = Vec::with_capacity(record.data.len() + record.key.encrypted_key.len() + 96);
    ciborium::into_writer(&compact, &mut buf)
        .map_err(|e| AsherahError::MalformedRecord(format!("CBOR encode failed: {e}")))?;
    Ok(buf)
}

/// Decodes a record from the compact binary form.
pub fn decode_compact(bytes: &[u8]) -> AsherahResult<DataRowRecord> {
    let compact: CompactRecord = ciborium::from_reader(bytes)
        .map_err(|e| AsherahError::MalformedRecord(format!("CBOR decode failed: {e}")))?;
    if compact.v != COMPACT_VERSION {
        return Err(AsherahError::MalformedRecord(format!(
            "unsupported compact record version {}",
            compact.v
        )));
    }

    let record = DataRowRecord {
        key: EnvelopeKeyRecord {
            revoked: None,
            created: compact.created,
            encrypted_key: compact.key.into_vec(),
            parent_key_meta: Some(KeyMeta::new(compact.parent_id, compact.parent_created)),
        },
        data: compact.data.into_vec(),
    };
    validate(&record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataRowRecord {
        DataRowRecord {
            key: EnvelopeKeyRecord {
                revoked: None,
                created: 1_700_000_123,
                encrypted_key: vec![1, 2, 3, 4],
                parent_key_meta: Some(KeyMeta::new("_IK_p_svc_prod", 1_700_000_000)),
            },
            data: vec![9, 8, 7],
        }
    }

    #[test]
    fn json_field_names() {
        let json = encode_json(&sample()).unwrap();
        assert!(json.contains("\"Data\":\"CQgH\""));
        assert!(json.contains("\"EncryptedKey\":\"AQIDBA==\""));
        assert!(json.contains("\"ParentKeyMeta\":{\"ID\":\"_IK_p_svc_prod\",\"Created\":1700000000}"));
        assert!(!json.contains("Revoked"));
    }

    #[test]
    fn presized_encoding_matches() {
        let record = sample();
        assert_eq!(
            encode_json_with_capacity(&record, 4).unwrap(),
            encode_json(&record).unwrap()
        );
    }

    #[test]
    fn compact_version_is_checked() {
        let compact = CompactRecord {
            v: 9,
            data: ByteBuf::from(vec![1]),
            key: ByteBuf::from(vec![1]),
            created: 1,
            parent_id: "x".into(),
            parent_created: 1,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&compact, &mut buf).unwrap();
        let err = decode_compact(&buf).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }
}
