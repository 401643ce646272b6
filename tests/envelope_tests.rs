//! Envelope codec tests across codecs, sizes, and spill placement.

use serde_json::json;

use taskmesh::envelope::{Envelope, SpillPolicy};
use taskmesh::meta::Meta;

fn meta(value: serde_json::Value) -> Meta {
    Meta::from_value(value).unwrap()
}

#[test]
fn back_to_back_frames_on_one_stream() {
    let first = Envelope::new(meta(json!({"n": 1})), b"one".to_vec());
    let second = Envelope::new(meta(json!({"n": 2})), b"two".to_vec());

    let mut stream = Vec::new();
    first.write_to(&mut stream).unwrap();
    second.write_to(&mut stream).unwrap();

    let mut reader = stream.as_slice();
    let a = Envelope::read_from(&mut reader).unwrap();
    let b = Envelope::read_from(&mut reader).unwrap();
    assert_eq!(a.meta().get("n"), Some(&json!(1)));
    assert_eq!(a.payload_bytes().unwrap(), b"one");
    assert_eq!(b.meta().get("n"), Some(&json!(2)));
    assert_eq!(b.payload_bytes().unwrap(), b"two");
    assert!(reader.is_empty());
}

#[test]
fn megabyte_payload_round_trips_inline() {
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let env = Envelope::new(meta(json!({"kind": "blob"})), payload.clone());
    assert!(!env.is_spilled());

    let bytes = env.to_bytes().unwrap();
    let decoded = Envelope::read_from(&mut bytes.as_slice()).unwrap();
    assert_eq!(decoded.payload_len(), payload.len());
    assert_eq!(decoded.payload_bytes().unwrap(), payload);
}

#[test]
fn spill_directory_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let policy = SpillPolicy {
        threshold: 8,
        dir: Some(dir.path().to_path_buf()),
    };

    let payload = vec![7u8; 64];
    let env = Envelope::with_policy(meta(json!({})), payload.clone(), &policy).unwrap();
    assert!(env.is_spilled());
    let spilled: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(spilled.len(), 1);
    assert_eq!(env.payload_bytes().unwrap(), payload);

    // Decoding an oversized frame spills into the same directory.
    let bytes = env.to_bytes().unwrap();
    let decoded = Envelope::read_from_with(&mut bytes.as_slice(), &policy).unwrap();
    assert!(decoded.is_spilled());
    assert_eq!(decoded.payload_bytes().unwrap(), payload);
    let spilled: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(spilled.len(), 2);
}

#[test]
fn unicode_meta_survives_both_codecs() {
    let m = meta(json!({"note": "π ≈ 3.14159", "emoji": "🦀"}));
    let env = Envelope::from_meta(m.clone());
    let bytes = env.to_bytes().unwrap();

    let sync_decoded = Envelope::read_from(&mut bytes.as_slice()).unwrap();
    assert_eq!(sync_decoded.meta(), &m);

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let async_decoded = rt
        .block_on(Envelope::async_read_from(&mut bytes.as_slice()))
        .unwrap();
    assert_eq!(async_decoded.meta(), &m);
}

#[test]
fn async_spilled_write_matches_sync_bytes() {
    let policy = SpillPolicy {
        threshold: 4,
        dir: None,
    };
    let env =
        Envelope::with_policy(meta(json!({"big": true})), vec![1u8; 256], &policy).unwrap();
    assert!(env.is_spilled());
    let sync_bytes = env.to_bytes().unwrap();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .unwrap();
    let async_bytes = rt.block_on(async {
        let mut buffer = Vec::new();
        env.async_write_to(&mut buffer).await.unwrap();
        buffer
    });
    assert_eq!(async_bytes, sync_bytes);
}
