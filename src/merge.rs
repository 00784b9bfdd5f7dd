// src/merge.rs
//
// §6 "JSON metadata merge rules": the scraper concatenates single-line JSON
// fragments from task stdout in arrival order. A fragment is either a plain
// object (deep merge, later wins at the leaf) or an RFC 6902 JSON Patch
// array (applied in order). No direct teacher analogue — this is pure
// data-transformation logic over `serde_json::Value`, the same type
// `model.rs`'s `Request`/`Config`/`Experiment` use for their own
// opaque-field handling. Wired into `ExternalProcessor::process` in
// `processor.rs`, which scrapes the task runtime's stdout through it.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// One parsed stdout fragment.
pub enum Fragment {
    Merge(Value),
    Patch(Vec<PatchOp>),
}

/// Parses one line of scraped stdout into a `Fragment`. A JSON array is a
/// patch document; any other JSON value is a merge document.
pub fn parse_fragment(line: &str) -> Result<Fragment> {
    let value: Value = serde_json::from_str(line)?;
    match value {
        Value::Array(ops) => {
            let parsed: Result<Vec<PatchOp>> = ops.into_iter().map(PatchOp::from_value).collect();
            Ok(Fragment::Patch(parsed?))
        }
        other => Ok(Fragment::Merge(other)),
    }
}

/// Applies `fragment` to `doc` in place, honoring the `studioml.status ==
/// "completed"` gate: once that field is set, only *new* top-level keys may
/// be added by subsequent merges, and patches are rejected outright (a
/// patch can touch arbitrary paths, including existing ones, which the
/// gate forbids categorically).
pub fn apply_fragment(doc: &mut Value, fragment: Fragment, post_completion: bool) -> Result<()> {
    match fragment {
        Fragment::Merge(incoming) => {
            if post_completion {
                deep_merge_additions_only(doc, &incoming)
            } else {
                deep_merge(doc, &incoming);
                Ok(())
            }
        }
        Fragment::Patch(ops) => {
            if post_completion {
                return Err(anyhow!("JSON-Patch fragments are not permitted after studioml.status==completed"));
            }
            for op in ops {
                op.apply(doc)?;
            }
            Ok(())
        }
    }
}

/// True once `doc.studioml.status == "completed"`.
pub fn is_completed(doc: &Value) -> bool {
    doc.get("studioml").and_then(|s| s.get("status")).and_then(Value::as_str) == Some("completed")
}

/// Deep merge: objects merge key-wise (recursively); any other type pair
/// has the incoming value win outright, matching "later wins at the leaf".
fn deep_merge(base: &mut Value, incoming: &Value) {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, incoming_value) => {
            *base_slot = incoming_value.clone();
        }
    }
}

/// Post-completion merge: only top-level keys absent from `doc` may be
/// added; anything already present is left untouched, even if `incoming`
/// disagrees.
fn deep_merge_additions_only(doc: &mut Value, incoming: &Value) -> Result<()> {
    let (Value::Object(doc_map), Value::Object(incoming_map)) = (doc, incoming) else {
        return Err(anyhow!("post-completion merge fragment must be a JSON object"));
    };
    for (key, value) in incoming_map {
        doc_map.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Ok(())
}

/// A single RFC 6902 operation, restricted to what `/`-pointer paths into a
/// metadata document plausibly need.
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    fn from_value(value: Value) -> Result<Self> {
        let op = value.get("op").and_then(Value::as_str).ok_or_else(|| anyhow!("patch op missing `op`"))?;
        let path = value.get("path").and_then(Value::as_str).ok_or_else(|| anyhow!("patch op missing `path`"))?;
        match op {
            "add" => Ok(PatchOp::Add {
                path: path.to_string(),
                value: value.get("value").cloned().unwrap_or(Value::Null),
            }),
            "remove" => Ok(PatchOp::Remove { path: path.to_string() }),
            "replace" => Ok(PatchOp::Replace {
                path: path.to_string(),
                value: value.get("value").cloned().unwrap_or(Value::Null),
            }),
            other => Err(anyhow!("unsupported JSON-Patch op: {:?}", other)),
        }
    }

    fn apply(&self, doc: &mut Value) -> Result<()> {
        match self {
            PatchOp::Add { path, value } => set_pointer(doc, path, value.clone()),
            PatchOp::Replace { path, value } => set_pointer(doc, path, value.clone()),
            PatchOp::Remove { path } => remove_pointer(doc, path),
        }
    }
}

fn set_pointer(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let (parent, key) = split_pointer(doc, path)?;
    parent.insert(key, value);
    Ok(())
}

fn remove_pointer(doc: &mut Value, path: &str) -> Result<()> {
    let (parent, key) = split_pointer(doc, path)?;
    parent.remove(&key).ok_or_else(|| anyhow!("JSON-Patch remove target does not exist: {:?}", path))?;
    Ok(())
}

/// Walks all but the last pointer segment, creating intermediate objects
/// as needed, and returns the final map plus the last segment as a key.
fn split_pointer<'a>(doc: &'a mut Value, path: &str) -> Result<(&'a mut serde_json::Map<String, Value>, String)> {
    let trimmed = path.strip_prefix('/').ok_or_else(|| anyhow!("JSON-Patch path must start with '/': {:?}", path))?;
    let mut segments: Vec<&str> = trimmed.split('/').collect();
    let last = segments.pop().ok_or_else(|| anyhow!("empty JSON-Patch path"))?.to_string();

    let mut current = doc;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert(Value::Object(serde_json::Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    Ok((current.as_object_mut().unwrap(), last))
}
