//! Canonical encoding and digests.
//!
//! Block hashes must be reproducible across processes, so everything that is
//! hashed goes through [`canonical_json`]: object keys sorted, no whitespace.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize `value` to compact JSON with every object's keys in sorted order.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| LedgerError::InvalidTransaction(format!("Failed to encode value: {}", e)))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings serialize infallibly.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Serialize)]
struct BlockContent<'a, T: Serialize> {
    index: u64,
    timestamp: u64,
    transactions: &'a [T],
    previous_hash: &'a str,
    nonce: u64,
}

/// Digest of a block's content fields. The block's own `hash` is never an input.
pub fn block_digest<T: Serialize>(
    index: u64,
    timestamp: u64,
    transactions: &[T],
    previous_hash: &str,
    nonce: u64,
) -> Result<String> {
    let encoded = canonical_json(&BlockContent {
        index,
        timestamp,
        transactions,
        previous_hash,
        nonce,
    })?;
    Ok(sha256_hex(encoded.as_bytes()))
}
