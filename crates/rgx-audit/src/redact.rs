//! Payload redaction. Audit records must never carry credentials.

use rgx_config::looks_like_secret;
use serde_json::Value;

/// Replacement for any redacted value.
pub const REDACTED: &str = "<REDACTED>";

/// Key fragments that mark a field as a credential (matched case-insensitively).
const CREDENTIAL_KEY_FRAGMENTS: &[&str] = &[
    "api_key",
    "apikey",
    "secret",
    "password",
    "passphrase",
    "token",
    "authorization",
    "private_key",
];

fn is_credential_key(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    CREDENTIAL_KEY_FRAGMENTS.iter().any(|f| k.contains(f))
}

/// Return a copy of `v` with credential-named fields and secret-looking
/// string values replaced by [`REDACTED`].
pub fn redact_payload(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, vv) in map {
                if is_credential_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact_payload(vv));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(redact_payload).collect()),
        Value::String(s) if looks_like_secret(s) => Value::String(REDACTED.to_string()),
        _ => v.clone(),
    }
}
