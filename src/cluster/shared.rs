//! Replicated shared-object tables and tree operations.
//!
//! Every node owns one subtree keyed by its node index; the leader
//! propagates each owner's writes to all peers. A subtree is a JSON object
//! whose values are scalars or nested objects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Node subtree type.
pub type Tree = Map<String, Value>;

/// Delta carried by `merge-shared-object-to-leader` and
/// `overwrite-shared-object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeInfo {
    pub seq: u64,
    pub obj: Tree,
}

/// Paths carried by `delete-shared-object-to-leader`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInfo {
    pub seq: u64,
    pub paths: Vec<Vec<String>>,
}

/// Either kind of leader-bound write.
#[derive(Debug, Clone)]
pub enum SharedWrite {
    Merge(MergeInfo),
    Delete(DeleteInfo),
}

impl SharedWrite {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Merge(m) => m.seq,
            Self::Delete(d) => d.seq,
        }
    }
}

/// Full snapshot exchanged on split-brain resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSnapshot {
    pub shared_object: HashMap<u32, Tree>,
    pub shared_object_seq: HashMap<u32, u64>,
}

/// Deep-merge `delta` into `target`: object-into-object recurses, anything
/// else overwrites.
pub fn deep_merge(target: &mut Tree, delta: &Tree) {
    for (key, value) in delta {
        match value {
            Value::Object(child) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(slot) = entry {
                    deep_merge(slot, child);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Delete `path` from `tree`, pruning ancestors that became empty.
/// Returns false when the path does not resolve.
pub fn delete_path(tree: &mut Tree, path: &[String]) -> bool {
    match path {
        [] => false,
        [leaf] => tree.remove(leaf).is_some(),
        [head, rest @ ..] => {
            let Some(Value::Object(child)) = tree.get_mut(head) else {
                return false;
            };
            if !delete_path(child, rest) {
                return false;
            }
            if child.is_empty() {
                tree.remove(head);
            }
            true
        }
    }
}

/// Resolve `path` inside `tree`. An empty path yields the tree itself.
pub fn get_path<'a>(tree: &'a Tree, path: &[String]) -> Option<&'a Value> {
    let mut current: Option<&Value> = None;
    let mut map = tree;
    for (i, key) in path.iter().enumerate() {
        let value = map.get(key)?;
        if i + 1 == path.len() {
            current = Some(value);
        } else {
            map = value.as_object()?;
        }
    }
    current
}

/// Build a single-leaf tree `path[0] -> path[1] -> ... -> value`.
pub fn tree_from_path(path: &[String], value: Value) -> Tree {
    let mut tree = Map::new();
    match path {
        [] => tree,
        [leaf] => {
            tree.insert(leaf.clone(), value);
            tree
        }
        [head, rest @ ..] => {
            tree.insert(head.clone(), Value::Object(tree_from_path(rest, value)));
            tree
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(v: Value) -> Tree {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_deep_merge_recurses_and_overwrites() {
        let mut target = tree(json!({"a": {"x": 1}, "b": 2}));
        let delta = tree(json!({"a": {"y": 3}, "b": {"nested": true}}));
        deep_merge(&mut target, &delta);
        assert_eq!(target["a"], json!({"x": 1, "y": 3}));
        assert_eq!(target["b"], json!({"nested": true}));
    }

    #[test]
    fn test_deep_merge_is_idempotent() {
        let a = tree(json!({"k": {"x": 1}}));
        let b = tree(json!({"k": {"y": 2}, "z": 3}));

        let mut once = a.clone();
        deep_merge(&mut once, &b);
        let mut twice = a.clone();
        deep_merge(&mut twice, &b);
        deep_merge(&mut twice, &b);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_delete_path_prunes_empty_ancestors() {
        let mut t = tree(json!({"a": {"b": {"c": 1}}, "keep": 0}));
        assert!(delete_path(&mut t, &["a".into(), "b".into(), "c".into()]));
        assert!(!t.contains_key("a"));
        assert!(t.contains_key("keep"));
    }

    #[test]
    fn test_delete_path_keeps_nonempty_ancestors() {
        let mut t = tree(json!({"a": {"b": 1, "c": 2}}));
        assert!(delete_path(&mut t, &["a".into(), "b".into()]));
        assert_eq!(t["a"], json!({"c": 2}));
    }

    #[test]
    fn test_delete_path_missing() {
        let mut t = tree(json!({"a": 1}));
        assert!(!delete_path(&mut t, &["missing".into()]));
        assert!(!delete_path(&mut t, &["a".into(), "deeper".into()]));
        assert!(!delete_path(&mut t, &[]));
    }

    #[test]
    fn test_merge_then_get_round_trip() {
        let mut t = Tree::new();
        let path = vec!["dev1".to_string(), "data".to_string(), "temp".to_string()];
        deep_merge(&mut t, &tree_from_path(&path, json!(42)));
        assert_eq!(get_path(&t, &path), Some(&json!(42)));

        assert!(delete_path(&mut t, &path));
        assert_eq!(get_path(&t, &path), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_get_path_type_mismatch() {
        let t = tree(json!({"a": 1}));
        assert_eq!(get_path(&t, &["a".into(), "b".into()]), None);
    }
}
