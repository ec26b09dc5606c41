//! Whole-field JSON patches derived from a merged label set.

use crate::labels::Labels;
use json_patch::{jsonptr::PointerBuf, AddOperation, ReplaceOperation};
use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// The field was absent on the original object.
    Add,
    /// The field was present on the original object, possibly empty.
    Replace,
}

/// A single RFC 6902 operation that sets a string map field as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PatchOperation {
    pub op: Op,
    pub path: PointerBuf,
    pub value: Labels,
}

/// `/spec/nodeSelector`
pub fn node_selector_path() -> PointerBuf {
    PointerBuf::from_tokens(["spec", "nodeSelector"])
}

/// `/metadata/annotations`
pub fn annotations_path() -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "annotations"])
}

/// Builds the operation that sets the field at `path` to `merged`.
///
/// Nothing is emitted for an empty merged set.
pub fn build(path: PointerBuf, merged: Labels, existed: bool) -> Option<PatchOperation> {
    if merged.is_empty() {
        return None;
    }

    let op = if existed { Op::Replace } else { Op::Add };
    Some(PatchOperation {
        op,
        path,
        value: merged,
    })
}

/// Converts operations into a JSON patch document.
pub fn into_patch(ops: impl IntoIterator<Item = PatchOperation>) -> json_patch::Patch {
    json_patch::Patch(ops.into_iter().map(Into::into).collect())
}

impl From<PatchOperation> for json_patch::PatchOperation {
    fn from(PatchOperation { op, path, value }: PatchOperation) -> Self {
        let value = serde_json::Value::Object(
            value
                .into_inner()
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
        );
        match op {
            Op::Add => Self::Add(AddOperation { path, value }),
            Op::Replace => Self::Replace(ReplaceOperation { path, value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    fn team_app() -> Labels {
        Labels::from(btreemap! { "team".to_string() => "app".to_string() })
    }

    #[test]
    fn absent_field_is_added() {
        let op = build(node_selector_path(), team_app(), false).expect("must patch");
        assert_eq!(op.op, Op::Add);
        assert_eq!(op.path.as_str(), "/spec/nodeSelector");
        assert_eq!(op.value, team_app());
    }

    #[test]
    fn present_field_is_replaced() {
        let op = build(annotations_path(), team_app(), true).expect("must patch");
        assert_eq!(op.op, Op::Replace);
        assert_eq!(op.path.as_str(), "/metadata/annotations");
    }

    #[test]
    fn empty_merge_is_a_noop() {
        assert_eq!(build(node_selector_path(), Labels::default(), false), None);
        assert_eq!(build(node_selector_path(), Labels::default(), true), None);
    }

    #[test]
    fn serializes_as_rfc6902() {
        let patch = into_patch(build(node_selector_path(), team_app(), true));
        assert_eq!(
            serde_json::to_value(&patch).expect("patch must serialize"),
            json!([{
                "op": "replace",
                "path": "/spec/nodeSelector",
                "value": { "team": "app" },
            }])
        );

        let patch = into_patch(build(annotations_path(), team_app(), false));
        assert_eq!(
            serde_json::to_value(&patch).expect("patch must serialize"),
            json!([{
                "op": "add",
                "path": "/metadata/annotations",
                "value": { "team": "app" },
            }])
        );
    }
}
