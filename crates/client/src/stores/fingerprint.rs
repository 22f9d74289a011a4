//! Identity of a result set.

use std::collections::BTreeMap;
use std::fmt;

use crmsync_shared::FetchParams;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Hash of the `(filter, sort, projection)` triple behind a cached result.
///
/// `limit` and `skip` page through a result set without changing which
/// documents belong to it, so they are not part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(params: &FetchParams) -> Self {
        let sort: Vec<Value> = params
            .sort
            .iter()
            .map(|field| json!([field.field, field.direction]))
            .collect();
        let canonical = json!({
            "filter": params.filter,
            "sort": sort,
            "projection": params.projection,
        });

        let mut hasher = Sha256::new();
        hasher.update(sorted_keys(&canonical).to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Re-serialize objects with keys in lexical order, whatever map type
/// serde_json was built with.
fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted_keys(v))).collect();
            json!(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
