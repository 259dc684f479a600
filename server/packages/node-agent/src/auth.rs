//! Envelope authentication: canonical JSON, key derivation and HMAC checks.

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use node_agent_error::AgentError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_FIELD: &str = "_sig";
pub const TIMESTAMP_FIELD: &str = "_ts";
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

/// Why an envelope was rejected. Only ever logged locally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthFailure {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("missing or non-numeric timestamp")]
    MissingTimestamp,
    #[error("timestamp outside freshness window (skew {skew}s)")]
    Stale { skew: f64 },
    #[error("missing signature")]
    MissingSignature,
    #[error("signature is not valid hex")]
    MalformedSignature,
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl From<AuthFailure> for AgentError {
    fn from(failure: AuthFailure) -> Self {
        AgentError::AuthenticationFailed {
            reason: Some(failure.to_string()),
        }
    }
}

/// Verifies signed envelopes with a key derived once from the shared secret
/// and the node's bearer token.
#[derive(Clone)]
pub struct Authenticator {
    key: [u8; 32],
    window: Duration,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("key", &"<redacted>")
            .field("window", &self.window)
            .finish()
    }
}

impl Authenticator {
    pub fn new(secret: &str, token: &str) -> Self {
        Self {
            key: derive_key(secret, token),
            window: FRESHNESS_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn verify(&self, envelope: &Value) -> Result<(), AuthFailure> {
        self.verify_at(envelope, unix_now())
    }

    pub fn verify_at(&self, envelope: &Value, now: f64) -> Result<(), AuthFailure> {
        let object = envelope.as_object().ok_or(AuthFailure::NotAnObject)?;

        let ts = object
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_f64)
            .ok_or(AuthFailure::MissingTimestamp)?;
        let skew = now - ts;
        if skew.abs() > self.window.as_secs_f64() {
            return Err(AuthFailure::Stale { skew });
        }

        let signature = object
            .get(SIGNATURE_FIELD)
            .and_then(Value::as_str)
            .ok_or(AuthFailure::MissingSignature)?;
        let signature = hex::decode(signature).map_err(|_| AuthFailure::MalformedSignature)?;

        let canonical = canonical_json(&unsigned(object));
        let mut mac = self.mac();
        mac.update(canonical.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthFailure::SignatureMismatch)
    }

    /// Returns a copy of `envelope` with `_ts` set to `ts` and `_sig` filled in.
    pub fn sign_at(&self, envelope: &Value, ts: i64) -> Result<Value, AuthFailure> {
        let mut object = envelope.as_object().ok_or(AuthFailure::NotAnObject)?.clone();
        object.remove(SIGNATURE_FIELD);
        object.insert(TIMESTAMP_FIELD.to_string(), Value::from(ts));

        let canonical = canonical_json(&Value::Object(object.clone()));
        let mut mac = self.mac();
        mac.update(canonical.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        object.insert(SIGNATURE_FIELD.to_string(), Value::String(signature));
        Ok(Value::Object(object))
    }

    pub fn sign(&self, envelope: &Value) -> Result<Value, AuthFailure> {
        self.sign_at(envelope, unix_now() as i64)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }
}

/// `SHA256("{secret}:{token}")`.
pub fn derive_key(secret: &str, token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

pub fn unix_now() -> f64 {
    let now = time::OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9
}

fn unsigned(object: &Map<String, Value>) -> Value {
    let mut object = object.clone();
    object.remove(SIGNATURE_FIELD);
    Value::Object(object)
}

/// Sorted keys, `,`/`:` separators, everything outside printable ASCII
/// escaped as `\uXXXX`. Byte-compatible with the controller's
/// `json.dumps(sort_keys=True, separators=(",", ":"))`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => write_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&object[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(ch),
            _ => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn authenticator() -> Authenticator {
        Authenticator::new("shared-secret", "node-token")
    }

    #[test]
    fn canonical_form_matches_controller_encoding() {
        let value = json!({
            "type": "exec_script",
            "command_id": "c-1",
            "script_content": "echo \"héllo\" 😀\n",
            "_ts": 1700000000,
            "nested": {"b": [1, 2.5, null], "a": true}
        });
        insta::assert_snapshot!(canonical_json(&value), @r#"{"_ts":1700000000,"command_id":"c-1","nested":{"a":true,"b":[1,2.5,null]},"script_content":"echo \"h\u00e9llo\" \ud83d\ude00\n","type":"exec_script"}"#);
    }

    #[test]
    fn key_is_sha256_of_secret_and_token() {
        let expected: [u8; 32] = Sha256::digest(b"shared-secret:node-token").into();
        assert_eq!(derive_key("shared-secret", "node-token"), expected);
    }

    #[test]
    fn signed_envelope_verifies() {
        let auth = authenticator();
        let signed = auth
            .sign_at(&json!({"type": "exec_script", "command_id": "c1", "script_content": "echo hi"}), NOW)
            .expect("sign");
        assert_eq!(auth.verify_at(&signed, NOW as f64), Ok(()));
        assert_eq!(auth.verify_at(&signed, NOW as f64 + 59.0), Ok(()));
    }

    #[test]
    fn stale_timestamps_fail_in_both_directions() {
        let auth = authenticator();
        let signed = auth.sign_at(&json!({"type": "service_status"}), NOW).expect("sign");
        assert!(matches!(
            auth.verify_at(&signed, NOW as f64 + 61.0),
            Err(AuthFailure::Stale { .. })
        ));
        assert!(matches!(
            auth.verify_at(&signed, NOW as f64 - 61.0),
            Err(AuthFailure::Stale { .. })
        ));
        assert_eq!(auth.verify_at(&signed, NOW as f64 + 60.0), Ok(()));

        let strict = authenticator().with_window(Duration::from_secs(5));
        assert!(matches!(
            strict.verify_at(&signed, NOW as f64 + 6.0),
            Err(AuthFailure::Stale { .. })
        ));
    }

    #[test]
    fn tampering_invalidates_signature() {
        let auth = authenticator();
        let signed = auth
            .sign_at(&json!({"type": "exec_script", "command_id": "c1", "script_content": "echo hi"}), NOW)
            .expect("sign");

        let mut tampered = signed.clone();
        tampered["script_content"] = json!("echo hj");
        assert_eq!(
            auth.verify_at(&tampered, NOW as f64),
            Err(AuthFailure::SignatureMismatch)
        );

        let mut extra = signed.clone();
        extra["timeout"] = json!(1);
        assert_eq!(auth.verify_at(&extra, NOW as f64), Err(AuthFailure::SignatureMismatch));

        let other_key = Authenticator::new("shared-secret", "other-token");
        assert_eq!(
            other_key.verify_at(&signed, NOW as f64),
            Err(AuthFailure::SignatureMismatch)
        );
    }

    #[test]
    fn missing_fields_are_rejected() {
        let auth = authenticator();
        assert_eq!(
            auth.verify_at(&json!({"type": "service_status", "_sig": "00"}), NOW as f64),
            Err(AuthFailure::MissingTimestamp)
        );
        assert_eq!(
            auth.verify_at(&json!({"type": "service_status", "_ts": NOW}), NOW as f64),
            Err(AuthFailure::MissingSignature)
        );
        assert_eq!(
            auth.verify_at(&json!({"type": "service_status", "_ts": NOW, "_sig": "zz"}), NOW as f64),
            Err(AuthFailure::MalformedSignature)
        );
        assert_eq!(auth.verify_at(&json!([1, 2]), NOW as f64), Err(AuthFailure::NotAnObject));
    }

    #[test]
    fn debug_output_redacts_key() {
        let rendered = format!("{:?}", authenticator());
        assert!(rendered.contains("<redacted>"));
    }
}
