//! Change sets and path utilities over serialized trees.
//!
//! A change is either an update `(path, value)` or a delete `(path,)`. A
//! batch of changes produced by one mutation is delivered to a subscriber as
//! a single delta, relative to the path it subscribed to. An update of the
//! empty path is a root update and carries the whole subscribed value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    /// Set or replace the value at `path`.
    Update {
        /// Path relative to the subscription.
        path: Vec<String>,
        /// New value.
        value: Value,
    },
    /// Something at `path` was removed or retyped.
    Delete {
        /// Path relative to the subscription.
        path: Vec<String>,
    },
}

impl Change {
    /// Update change.
    pub fn update<S: Into<String>>(path: impl IntoIterator<Item = S>, value: Value) -> Self {
        Change::Update {
            path: path.into_iter().map(Into::into).collect(),
            value,
        }
    }

    /// Delete change.
    pub fn delete<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        Change::Delete {
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Path this change touches.
    pub fn path(&self) -> &[String] {
        match self {
            Change::Update { path, .. } | Change::Delete { path } => path,
        }
    }

    /// True for an update of the empty path.
    pub fn is_root_update(&self) -> bool {
        matches!(self, Change::Update { path, .. } if path.is_empty())
    }
}

/// Why a change could not be applied to a mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Deletes are never applied incrementally.
    Delete,
    /// A root update arrived after the mirror was built.
    RootUpdate,
    /// A path segment is missing from the mirror.
    MissingSegment(String),
    /// The new value's shape differs from what the mirror holds there.
    ShapeMismatch(String),
}

/// Join path segments with dots.
pub fn dotted(path: &[String]) -> String {
    path.join(".")
}

/// Split a dotted path into segments.
pub fn split_dotted(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Value at `path` under `root`.
pub fn value_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, seg| node.get(seg.as_str()))
}

/// True if `prefix` is a prefix of `path` (or equal to it).
pub fn starts_with(path: &[String], prefix: &[String]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

/// Whether `new` can replace `old` without changing the tree's shape.
///
/// Records with different typeids or different key sets are incompatible,
/// as are values of different JSON kinds. Arrays and scalars compare by kind
/// only, so a growing array is still a value change.
pub fn shapes_compatible(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            if a.get("typeid") != b.get("typeid") || a.len() != b.len() {
                return false;
            }
            a.iter()
                .all(|(k, va)| b.get(k).is_some_and(|vb| shapes_compatible(va, vb)))
        }
        _ => kinds_match(old, new),
    }
}

fn kinds_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // A null is a value that has not been set yet.
        (Value::Null, _) | (_, Value::Null) => true,
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_)) => true,
        _ => false,
    }
}

/// Apply one change to a mirrored tree in place.
///
/// Fails without touching `root` when the change cannot be applied
/// incrementally; the caller then rebuilds from an authoritative snapshot.
pub fn apply_change(root: &mut Value, change: &Change) -> Result<(), ApplyError> {
    let (path, value) = match change {
        Change::Delete { .. } => return Err(ApplyError::Delete),
        Change::Update { path, .. } if path.is_empty() => return Err(ApplyError::RootUpdate),
        Change::Update { path, value } => (path, value),
    };
    let (last, parents) = path.split_last().ok_or(ApplyError::RootUpdate)?;
    let mut node = root;
    for seg in parents {
        node = node
            .get_mut(seg.as_str())
            .ok_or_else(|| ApplyError::MissingSegment(seg.clone()))?;
    }
    let slot = node
        .get_mut(last.as_str())
        .ok_or_else(|| ApplyError::MissingSegment(last.clone()))?;
    if !shapes_compatible(slot, value) {
        return Err(ApplyError::ShapeMismatch(dotted(path)));
    }
    *slot = value.clone();
    Ok(())
}

/// Every dotted path touched by `paths`, including each ancestor.
pub fn with_parents<'a>(paths: impl IntoIterator<Item = &'a str>) -> std::collections::BTreeSet<String> {
    let mut out = std::collections::BTreeSet::new();
    for path in paths {
        let mut acc = String::new();
        for seg in path.split('.') {
            if !acc.is_empty() {
                acc.push('.');
            }
            acc.push_str(seg);
            out.insert(acc.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mirror() -> Value {
        json!({
            "typeid": "daq:block/Block:1.0",
            "value": {"typeid": "daq:nt/NTScalar:1.0", "value": 5, "meta": {"typeid": "daq:meta/NumberMeta:1.0", "dtype": "int32"}},
        })
    }

    #[test]
    fn applies_value_change() {
        let mut root = mirror();
        apply_change(&mut root, &Change::update(["value", "value"], json!(7))).unwrap();
        assert_eq!(root["value"]["value"], json!(7));
    }

    #[test]
    fn missing_segment_is_reported_and_mirror_untouched() {
        let mut root = mirror();
        let before = root.clone();
        let err = apply_change(&mut root, &Change::update(["y", "value"], json!(1))).unwrap_err();
        assert_eq!(err, ApplyError::MissingSegment("y".into()));
        assert_eq!(root, before);
    }

    #[test]
    fn retyped_record_is_a_shape_mismatch() {
        let mut root = mirror();
        let retyped = json!({"typeid": "daq:nt/NTEnum:1.0", "value": "a", "meta": {"typeid": "daq:meta/ChoiceMeta:1.0", "choices": ["a"]}});
        assert!(matches!(
            apply_change(&mut root, &Change::update(["value"], retyped)),
            Err(ApplyError::ShapeMismatch(_))
        ));
        let scalar_to_string = Change::update(["value", "value"], json!("five"));
        assert!(matches!(apply_change(&mut root, &scalar_to_string), Err(ApplyError::ShapeMismatch(_))));
    }

    #[test]
    fn deletes_and_root_updates_are_not_applied() {
        let mut root = mirror();
        assert_eq!(apply_change(&mut root, &Change::delete(["value"])), Err(ApplyError::Delete));
        assert_eq!(
            apply_change(&mut root, &Change::update(Vec::<String>::new(), json!({}))),
            Err(ApplyError::RootUpdate)
        );
    }

    #[test]
    fn with_parents_includes_ancestors() {
        let got = with_parents(["a.b.c", "x"]);
        let want: Vec<_> = ["a", "a.b", "a.b.c", "x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), want);
    }
}
