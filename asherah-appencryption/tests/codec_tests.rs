use asherah_appencryption::codec::{
    decode_compact, decode_json, decode_json_value, encode_compact, encode_json, to_json_value,
};
use asherah_appencryption::{AsherahError, DataRowRecord, EnvelopeKeyRecord, KeyMeta};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn record(data: Vec<u8>, encrypted_key: Vec<u8>, created: i64, parent: &str) -> DataRowRecord {
    DataRowRecord {
        key: EnvelopeKeyRecord {
            revoked: None,
            created,
            encrypted_key,
            parent_key_meta: Some(KeyMeta::new(parent, created - 30)),
        },
        data,
    }
}

fn sample() -> DataRowRecord {
    record(vec![0, 1, 2, 255], vec![7; 60], 1_700_000_123, "_IK_user1_svc_prod")
}

fn assert_malformed(result: Result<DataRowRecord, AsherahError>) {
    match result {
        Err(AsherahError::MalformedRecord(_)) => {}
        other => panic!("expected MalformedRecord, got {other:?}"),
    }
}

#[test]
fn json_roundtrip() {
    let original = sample();
    let json = encode_json(&original).unwrap();
    assert_eq!(decode_json(&json).unwrap(), original);
}

#[test]
fn json_value_roundtrip() {
    let original = sample();
    let value = to_json_value(&original).unwrap();
    assert_eq!(value["Key"]["ParentKeyMeta"]["ID"], "_IK_user1_svc_prod");
    assert_eq!(decode_json_value(value).unwrap(), original);
}

#[test]
fn compact_roundtrip() {
    let original = sample();
    let bytes = encode_compact(&original).unwrap();
    assert_eq!(decode_compact(&bytes).unwrap(), original);
}

#[test]
fn compact_is_smaller_than_json() {
    let original = record(vec![3; 1024], vec![9; 60], 1_700_000_000, "_IK_p_s_p");
    assert!(encode_compact(&original).unwrap().len() < encode_json(&original).unwrap().len());
}

#[test]
fn revoked_flag_survives_json() {
    let mut original = sample();
    original.key.revoked = Some(true);
    let json = encode_json(&original).unwrap();
    assert!(json.contains("\"Revoked\":true"));
    assert_eq!(decode_json(&json).unwrap(), original);
}

#[test]
fn rejects_non_json() {
    assert_malformed(decode_json("definitely not json"));
    assert_malformed(decode_json(""));
    assert_malformed(decode_json("{\"Key\":"));
}

#[test]
fn rejects_non_objects() {
    for input in ["[]", "[1,2]", "null", "42", "true", "\"a string\""] {
        let err = decode_json(input).unwrap_err();
        match err {
            AsherahError::MalformedRecord(msg) => assert!(msg.contains("expected a JSON object")),
            other => panic!("{input}: expected MalformedRecord, got {other:?}"),
        }
    }
}

#[test]
fn rejects_missing_fields() {
    assert_malformed(decode_json("{}"));
    assert_malformed(decode_json(r#"{"Data":"AQID"}"#));
    assert_malformed(decode_json(
        r#"{"Data":"AQID","Key":{"Created":1,"EncryptedKey":"AQID"}}"#,
    ));
    assert_malformed(decode_json(
        r#"{"Data":"","Key":{"Created":1,"EncryptedKey":"AQID","ParentKeyMeta":{"ID":"_IK_a","Created":1}}}"#,
    ));
    assert_malformed(decode_json(
        r#"{"Data":"AQID","Key":{"Created":1,"EncryptedKey":"AQID","ParentKeyMeta":{"ID":"","Created":1}}}"#,
    ));
}

#[test]
fn rejects_invalid_base64() {
    assert_malformed(decode_json(
        r#"{"Data":"!!!","Key":{"Created":1,"EncryptedKey":"AQID","ParentKeyMeta":{"ID":"_IK_a","Created":1}}}"#,
    ));
}

#[test]
fn rejects_garbage_compact() {
    assert_malformed(decode_compact(&[]));
    assert_malformed(decode_compact(&[0xff, 0x00, 0x13]));
}

#[test]
fn json_never_contains_nul() {
    let original = record(vec![0; 256], vec![0; 60], 1, "_IK_p_s_p");
    assert!(!encode_json(&original).unwrap().contains('\u{0}'));
}

proptest! {
    #[test]
    fn both_encodings_roundtrip(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        key in proptest::collection::vec(any::<u8>(), 1..96),
        created in 1i64..4_000_000_000,
        partition in "[a-zA-Z0-9_-]{1,24}",
    ) {
        let original = record(data, key, created, &format!("_IK_{partition}_svc_prod"));

        let json = encode_json(&original).unwrap();
        prop_assert_eq!(decode_json(&json).unwrap(), original.clone());

        let compact = encode_compact(&original).unwrap();
        prop_assert_eq!(decode_compact(&compact).unwrap(), original);
    }

    #[test]
    fn decoding_arbitrary_text_never_panics(input in ".{0,256}") {
        let _ = decode_json(&input);
    }
}
