use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p2p_direct::pairing::{CompressionMode, PairingPayload, PairingRole, SignalingCodec};
use p2p_direct::SignalingError;
use std::time::Duration;

const MINUTE_MS: u64 = 60 * 1000;

fn sdp(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("a=candidate:{} 1 udp 2122260223 192.168.1.{} 5{:04} typ host\r\n", i, i % 250, i))
        .collect()
}

fn raw_token(json: &str) -> String {
    let mut packed = b"RAW".to_vec();
    packed.extend_from_slice(json.as_bytes());
    URL_SAFE_NO_PAD.encode(packed)
}

#[test]
fn test_round_trip_in_every_compression_mode() {
    let codec = SignalingCodec::new();
    for description in [sdp(1), sdp(40)] {
        let payload = PairingPayload::new(PairingRole::Answer, description).with_key_hint("fp:ab12");
        for mode in [
            CompressionMode::Auto,
            CompressionMode::Always,
            CompressionMode::Never,
        ] {
            let token = codec.encode_with(&payload, mode).unwrap();
            assert_eq!(codec.decode(&token).unwrap(), payload);
        }
    }
}

#[test]
fn test_large_payload_is_compressed_and_shorter() {
    let codec = SignalingCodec::new();
    let payload = PairingPayload::new(PairingRole::Offer, sdp(40));

    let auto = codec.encode(&payload).unwrap();
    let raw = codec.encode_with(&payload, CompressionMode::Never).unwrap();
    let packed = URL_SAFE_NO_PAD.decode(&auto).unwrap();
    if cfg!(feature = "gzip") {
        assert!(packed.starts_with(b"GZIP"));
        assert!(auto.len() < raw.len());
    } else {
        assert!(packed.starts_with(b"RAW"));
    }
}

#[test]
fn test_missing_compressor_falls_back_to_raw() {
    let codec = SignalingCodec::new().without_compression();
    let payload = PairingPayload::new(PairingRole::Offer, sdp(40));
    let token = codec.encode_with(&payload, CompressionMode::Always).unwrap();
    assert!(URL_SAFE_NO_PAD.decode(&token).unwrap().starts_with(b"RAW"));
    assert_eq!(codec.decode(&token).unwrap(), payload);
}

#[test]
fn test_decoding_twice_gives_same_result() {
    let codec = SignalingCodec::new();
    let token = codec
        .encode(&PairingPayload::new(PairingRole::Offer, sdp(3)))
        .unwrap();
    assert_eq!(codec.decode(&token), codec.decode(&token));

    let bad = "!!not a token!!";
    assert_eq!(codec.decode(bad), codec.decode(bad));
}

#[test]
fn test_expiry_window() {
    let codec = SignalingCodec::new();
    let payload = PairingPayload::new(PairingRole::Offer, sdp(1));
    let token = codec.encode(&payload).unwrap();
    let created = payload.created_at;

    assert!(codec.decode_at(&token, created + 10 * MINUTE_MS).is_ok());
    match codec.decode_at(&token, created + 11 * MINUTE_MS) {
        Err(SignalingError::Expired {
            age_secs,
            validity_secs,
        }) => {
            assert_eq!(age_secs, 660);
            assert_eq!(validity_secs, 600);
        }
        other => panic!("expected Expired, got {:?}", other),
    }
    // Clock skew in the peer's favour is tolerated
    assert!(codec.decode_at(&token, created - MINUTE_MS).is_ok());
}

#[test]
fn test_token_created_eleven_minutes_ago_is_expired() {
    let codec = SignalingCodec::new();
    let mut payload = PairingPayload::new(PairingRole::Answer, sdp(1));
    payload.created_at -= 11 * MINUTE_MS;
    let token = codec.encode(&payload).unwrap();
    assert!(matches!(
        codec.decode(&token),
        Err(SignalingError::Expired { .. })
    ));
}

#[test]
fn test_custom_validity() {
    let codec = SignalingCodec::new().with_validity(Duration::from_secs(30));
    let payload = PairingPayload::new(PairingRole::Offer, sdp(1));
    let token = codec.encode(&payload).unwrap();
    assert!(codec.decode_at(&token, payload.created_at + 31_000).is_err());
}

#[test]
fn test_malformed_tokens() {
    let codec = SignalingCodec::new();
    let now = 1_700_000_000_000u64;
    let cases = [
        "%%%".to_string(),
        URL_SAFE_NO_PAD.encode(b"RA"),
        raw_token("not json"),
        raw_token(r#"{"role":"offer","connectionDescription":"x","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"2","role":"offer","connectionDescription":"x","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"1","role":"host","connectionDescription":"x","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"1","connectionDescription":"x","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"1","role":"offer","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"1","role":"offer","connectionDescription":"","createdAt":1700000000000}"#),
        raw_token(r#"{"version":"1","role":"offer","connectionDescription":"x"}"#),
    ];
    for token in &cases {
        assert!(
            matches!(codec.decode_at(token, now), Err(SignalingError::Malformed(_))),
            "token {:?} should be malformed",
            token
        );
    }

    let ok = raw_token(
        r#"{"version":"1","role":"answer","connectionDescription":"x","createdAt":1700000000000}"#,
    );
    let payload = codec.decode_at(&ok, now).unwrap();
    assert_eq!(payload.role, PairingRole::Answer);
    assert_eq!(payload.encryption_key_hint, None);
}
