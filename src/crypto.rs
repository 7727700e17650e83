use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Canonical JSON byte sequence: no whitespace, object keys sorted bytewise,
/// array order preserved. `plan_hash` and `event_hash` are computed over this
/// form, so it must stay stable across releases.
pub fn canonical_json(value: &Value) -> Result<String, CryptoError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CryptoError> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hash_json<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    let json_value = serde_json::to_value(value)?;
    Ok(sha256_hex(&canonical_json(&json_value)?))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Generates a fresh agent API key. Returns `(plaintext, sha256_hex(plaintext))`;
/// the plaintext is shown to the caller exactly once and never stored.
pub fn generate_api_key() -> (String, String) {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    let plaintext = format!("sk_agent_{}", hex::encode(raw));
    let hash = sha256_hex(&plaintext);
    (plaintext, hash)
}

pub fn hash_api_key(plaintext: &str) -> String {
    sha256_hex(plaintext)
}

/// Keys carry >= 128 bits of entropy, so a fast hash is enough; the comparison
/// over hex digests is still constant-time.
pub fn verify_api_key(plaintext: &str, stored_hash: &str) -> bool {
    constant_time_eq(hash_api_key(plaintext).as_bytes(), stored_hash.as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn random_token() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}
