//! Value-tree expansion and reconstruction.
//!
//! A JSON object written at a path is stored as one leaf per field at the
//! expanded child path; reading an internal node merges the descendant
//! leaves back into an object. Anything that is not an object (including
//! arrays and null) is a leaf.

use crate::error::Result;
use crate::path::Path;
use serde_json::{Map, Value};

/// Expand `value` rooted at `base` into `(path, leaf)` pairs.
///
/// An empty object expands to no leaves at all, so writing `{}` is a no-op,
/// matching the merge invariant: there is no descendant leaf to merge back.
pub fn flatten(base: &Path, value: &Value) -> Result<Vec<(Path, Value)>> {
    let mut leaves = Vec::new();
    collect(base, value, &mut leaves)?;
    Ok(leaves)
}

fn collect(at: &Path, value: &Value, out: &mut Vec<(Path, Value)>) -> Result<()> {
    match value {
        Value::Object(fields) => {
            for (key, field) in fields {
                let child = at.child(key)?;
                collect(&child, field, out)?;
            }
            Ok(())
        }
        leaf => {
            out.push((at.clone(), leaf.clone()));
            Ok(())
        }
    }
}

/// Place `leaf` into `tree` at the relative segment path, creating
/// intermediate objects as needed.
///
/// A scalar already sitting on the way is replaced by an object, so
/// `a.b = 2` followed by `a.b.c = 3` yields `{"a": {"b": {"c": 3}}}`
/// rather than an error.
pub(crate) fn merge_into(tree: &mut Map<String, Value>, relative: &[String], leaf: Value) {
    debug_assert!(!relative.is_empty());
    let (last, intermediate) = match relative.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut current = tree;
    for segment in intermediate {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot
            .as_object_mut()
            .unwrap_or_else(|| unreachable!("slot was just made an object"));
    }
    current.insert(last.clone(), leaf);
}
