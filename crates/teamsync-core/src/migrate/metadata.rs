//! Image metadata normalization to the assets-instance schema.
//!
//! The normalized map always has exactly three keys: `URL`, `Author` and
//! `License`. Each is taken from the first truthy source field; `URL` and
//! `Author` fall back to null, `License` to a fixed license name.

use crate::config::SyncConfig;
use serde_json::{Map, Value};

const URL_FIELDS: &[&str] = &["Flickr image URL", "Pexels image URL", "Source URL"];
const AUTHOR_FIELDS: &[&str] = &["Flickr owner id", "Photographer name"];
const LICENSE_FIELDS: &[&str] = &["License", "license"];

/// Map arbitrary source metadata onto `{URL, Author, License}`.
pub fn normalize_image_meta(meta: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::with_capacity(3);
    normalized.insert(
        "URL".to_string(),
        first_truthy(meta, URL_FIELDS).unwrap_or(Value::Null),
    );
    normalized.insert(
        "Author".to_string(),
        first_truthy(meta, AUTHOR_FIELDS).unwrap_or(Value::Null),
    );
    normalized.insert(
        "License".to_string(),
        first_truthy(meta, LICENSE_FIELDS)
            .unwrap_or_else(|| Value::String(SyncConfig::FALLBACK_LICENSE.to_string())),
    );
    normalized
}

fn first_truthy(meta: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .filter_map(|key| meta.get(*key))
        .find(|value| is_truthy(value))
        .cloned()
}

/// Empty strings, zero, false, null and empty containers are skipped.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
