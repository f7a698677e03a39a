//! Field hierarchy extracted from a document.
//!
//! Paths are `/`-separated field names relative to the root node
//! (`header/title`). Array elements are addressed by index (`items/0`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldNode>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl FieldNode {
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    pub fn branch(name: impl Into<String>, children: Vec<FieldNode>) -> Self {
        Self {
            name: name.into(),
            value: None,
            children,
        }
    }

    /// Build the hierarchy of a JSON document.
    pub fn from_json(name: impl Into<String>, value: &serde_json::Value) -> Self {
        use serde_json::Value;
        let name = name.into();
        match value {
            Value::Object(map) => Self::branch(
                name,
                map.iter().map(|(k, v)| Self::from_json(k.clone(), v)).collect(),
            ),
            Value::Array(items) => Self::branch(
                name,
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Self::from_json(i.to_string(), v))
                    .collect(),
            ),
            Value::Null => Self::branch(name, Vec::new()),
            Value::String(s) => Self::leaf(name, s.clone()),
            other => Self::leaf(name, other.to_string()),
        }
    }

    pub fn find(&self, path: &str) -> Option<&FieldNode> {
        let mut node = self;
        for seg in segments(path) {
            node = node.children.iter().find(|c| c.name == seg)?;
        }
        Some(node)
    }

    /// True when `path` names a node below the root.
    pub fn contains_path(&self, path: &str) -> bool {
        !segments(path).is_empty() && self.find(path).is_some()
    }

    /// Total node count, root included.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(FieldNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }
}

/// Keep only the selected paths of a JSON document.
///
/// Ancestors of a selected field are kept as containers; a selected field
/// keeps its whole subtree. Paths that do not exist are ignored.
pub fn reduce_document<S: AsRef<str>>(
    document: &serde_json::Value,
    selections: &[S],
) -> serde_json::Value {
    let paths: Vec<Vec<&str>> = selections.iter().map(|s| segments(s.as_ref())).collect();
    let refs: Vec<&[&str]> = paths.iter().map(Vec::as_slice).collect();
    reduce_value(document, &refs).unwrap_or(serde_json::Value::Null)
}

/// Paths continuing below `key`, with `key` stripped.
fn narrow<'a, 'b>(paths: &[&'a [&'b str]], key: &str) -> Vec<&'a [&'b str]> {
    paths
        .iter()
        .copied()
        .filter(|p| p[0] == key)
        .map(|p| &p[1..])
        .collect()
}

fn reduce_value(value: &serde_json::Value, paths: &[&[&str]]) -> Option<serde_json::Value> {
    use serde_json::Value;
    if paths.iter().any(|p| p.is_empty()) {
        return Some(value.clone());
    }
    match value {
        Value::Object(map) => {
            let kept: serde_json::Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| {
                    let sub = narrow(paths, k);
                    if sub.is_empty() {
                        return None;
                    }
                    reduce_value(v, &sub).map(|v| (k.clone(), v))
                })
                .collect();
            (!kept.is_empty()).then_some(Value::Object(kept))
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items
                .iter()
                .enumerate()
                .filter_map(|(i, v)| {
                    let sub = narrow(paths, &i.to_string());
                    if sub.is_empty() {
                        return None;
                    }
                    reduce_value(v, &sub)
                })
                .collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        _ => None,
    }
}
