//! Structural patch utilities.
//!
//! Typed objects are only converted into generic JSON trees at the boundaries where K8s
//! expects partial documents: when applying worker StatefulSets, and when recording or
//! restoring revisions.

use serde_json::{Map, Value};

/// The key of a strategic merge patch directive.
pub const PATCH_DIRECTIVE: &str = "$patch";
/// The directive which replaces the target subtree rather than merging into it.
pub const PATCH_REPLACE: &str = "replace";
/// The directive which deletes the target subtree.
pub const PATCH_DELETE: &str = "delete";

/// Merge the given patch into the target document.
///
/// Objects are merged key by key following JSON merge patch semantics (RFC 7386), except that
/// an object carrying `"$patch": "replace"` replaces its target entirely and an object carrying
/// `"$patch": "delete"` removes it. This is the subset of strategic merge patch needed to
/// restore a recorded spec verbatim.
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    let patch_map = match patch {
        Value::Object(map) => map,
        _ => {
            *target = patch.clone();
            return;
        }
    };
    match directive(patch_map) {
        Some(PATCH_REPLACE) => {
            *target = strip_directives(patch);
            return;
        }
        Some(PATCH_DELETE) => {
            *target = Value::Null;
            return;
        }
        _ => (),
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let target_map = match target {
        Value::Object(map) => map,
        _ => return,
    };
    for (key, val) in patch_map {
        if key == PATCH_DIRECTIVE {
            continue;
        }
        if val.is_null() || matches!(val, Value::Object(map) if directive(map) == Some(PATCH_DELETE)) {
            target_map.remove(key);
            continue;
        }
        let entry = target_map.entry(key.clone()).or_insert(Value::Null);
        if contains_directive(val) {
            strategic_merge(entry, val);
        } else {
            json_patch::merge(entry, val);
        }
    }
}

/// Check whether every field set in `desired` carries the same value in `actual`.
///
/// Objects may carry additional keys in `actual`, such as fields defaulted by the API server or
/// owned by other field managers. Arrays must have the same length, with each element compared
/// the same way.
pub fn contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
        (Value::Object(actual), Value::Object(desired)) => desired
            .iter()
            .all(|(key, val)| actual.get(key).map(|found| contains(found, val)).unwrap_or(false)),
        (Value::Array(actual), Value::Array(desired)) => {
            actual.len() == desired.len() && actual.iter().zip(desired.iter()).all(|(found, val)| contains(found, val))
        }
        (actual, desired) => actual == desired,
    }
}

/// Remove all patch directives from the given document.
pub fn strip_directives(val: &Value) -> Value {
    match val {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != PATCH_DIRECTIVE)
                .map(|(key, val)| (key.clone(), strip_directives(val)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        _ => val.clone(),
    }
}

/// Get the patch directive of the given object, if any.
fn directive(map: &Map<String, Value>) -> Option<&str> {
    map.get(PATCH_DIRECTIVE).and_then(Value::as_str)
}

/// Check whether the given document carries a patch directive at any depth.
fn contains_directive(val: &Value) -> bool {
    match val {
        Value::Object(map) => map.contains_key(PATCH_DIRECTIVE) || map.values().any(contains_directive),
        Value::Array(items) => items.iter().any(contains_directive),
        _ => false,
    }
}
