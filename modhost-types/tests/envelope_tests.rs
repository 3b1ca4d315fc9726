use modhost_types::{Envelope, Response, ResponseStatus, UNSPECIFIED_ID};
use pretty_assertions::assert_eq;
use serde_json::json;

// ── Envelope ──────────────────────────────────────────────────────

#[test]
fn envelope_reads_module_address_and_id() {
    let env = Envelope::parse(r#"{"moduleAddress":"alpha","id":"42","op":"ping"}"#).unwrap();
    assert_eq!(env.module_address(), Some("alpha"));
    assert_eq!(env.correlation_id(), "42");
}

#[test]
fn envelope_without_id_uses_placeholder() {
    let env = Envelope::parse(r#"{"moduleAddress":"alpha"}"#).unwrap();
    assert_eq!(env.correlation_id(), UNSPECIFIED_ID);
}

#[test]
fn envelope_numeric_id_is_stringified() {
    let env = Envelope::from_value(json!({"moduleAddress": "alpha", "id": 7}));
    assert_eq!(env.correlation_id(), "7");
}

#[test]
fn envelope_without_address() {
    let env = Envelope::parse(r#"{"id":"1"}"#).unwrap();
    assert_eq!(env.module_address(), None);
}

#[test]
fn envelope_rejects_malformed_json() {
    assert!(Envelope::parse("{not json").is_err());
}

// ── Response ──────────────────────────────────────────────────────

#[test]
fn error_response_carries_reason() {
    let resp = Response::error("Unknown module: ghost").with_id("9");
    assert_eq!(resp.status, ResponseStatus::Failed);
    assert_eq!(resp.reason(), Some("Unknown module: ghost"));

    let value: serde_json::Value = serde_json::from_str(&resp.to_json().unwrap()).unwrap();
    assert_eq!(
        value,
        json!({"status": "FAILED", "payload": {"reason": "Unknown module: ghost"}, "id": "9"})
    );
}

#[test]
fn guest_response_without_id_parses() {
    let resp = Response::from_json(r#"{"status":"OK","payload":{"pong":true}}"#).unwrap();
    assert_eq!(resp.status, ResponseStatus::Ok);
    assert_eq!(resp.id, None);
    assert_eq!(resp.payload, json!({"pong": true}));
}

#[test]
fn pending_status_serializes_uppercase() {
    let json = Response::pending(json!(null)).to_json().unwrap();
    assert!(json.contains(r#""status":"PENDING""#));
}
