//! Pipeline identity: content hashing and pplid allocation.
//!
//! A content hash is the SHA-256 of the canonical JSON form of
//! `{"args": <resolved args>, "workflow": <workflow loc>}`. Canonical form
//! sorts object keys, renders integral floats as integers and emits no
//! whitespace, so equivalent argument trees hash identically no matter how
//! they were built.

use regex::Regex;
use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Maximum nesting accepted in an argument tree.
pub const MAX_ARG_DEPTH: usize = 128;

/// Prefix carried by every content hash.
pub const HASH_PREFIX: &str = "sha256:";

/// Prefix carried by every pipeline identifier.
pub const PPLID_PREFIX: &str = "ppl-";

static PPLID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ppl-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("pplid pattern is a valid regex")
});

/// Converts any serializable argument structure into an argument tree.
pub fn to_args_tree<T: Serialize + ?Sized>(args: &T) -> EngineResult<Value> {
    serde_json::to_value(args).map_err(|e| {
        EngineError::configuration(format!("argument tree is not representable: {e}"))
    })
}

/// Renders a value in canonical JSON form.
pub fn canonical_json(value: &Value) -> EngineResult<String> {
    let mut out = String::new();
    write_canonical(value, 0, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) -> EngineResult<()> {
    if depth > MAX_ARG_DEPTH {
        return Err(EngineError::configuration(format!(
            "argument tree nests deeper than {MAX_ARG_DEPTH} levels"
        )));
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

// 2^53: beyond this an f64 no longer represents every integer.
const EXACT_FLOAT_LIMIT: f64 = 9_007_199_254_740_992.0;

#[allow(clippy::cast_possible_truncation)]
fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f == 0.0 => "0".to_string(),
        Some(f) if f.fract() == 0.0 && f.abs() < EXACT_FLOAT_LIMIT => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Computes the content hash for a workflow location and resolved arguments.
pub fn compute_key(workflow_loc: &str, resolved_args: &Value) -> EngineResult<String> {
    if workflow_loc.trim().is_empty() {
        return Err(EngineError::configuration("workflow location is empty"));
    }

    let payload = serde_json::json!({
        "args": resolved_args,
        "workflow": workflow_loc,
    });
    let canonical = canonical_json(&payload)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// Recomputes a content hash and compares it with the expected one.
///
/// Returns the recomputed hash on mismatch.
pub fn verify_key(
    expected: &str,
    workflow_loc: &str,
    resolved_args: &Value,
) -> EngineResult<Result<(), String>> {
    let actual = compute_key(workflow_loc, resolved_args)?;
    if actual == expected {
        Ok(Ok(()))
    } else {
        Ok(Err(actual))
    }
}

/// Allocates a new pipeline identifier.
///
/// Identifiers embed a UUIDv7 so they sort by creation time.
#[must_use]
pub fn generate_pplid() -> String {
    format!("{PPLID_PREFIX}{}", Uuid::now_v7())
}

/// Returns true if the string has the shape of a pipeline identifier.
#[must_use]
pub fn is_valid_pplid(candidate: &str) -> bool {
    PPLID_PATTERN.is_match(candidate)
}
