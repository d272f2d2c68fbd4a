//! Translation between a subtree of store nodes and a JSON document.
//!
//! Materialization is total and deterministic:
//! * a leaf becomes its scalar;
//! * a non-empty directory whose children are named "0".."n-1" (canonical integers, no leading
//!   zeros) becomes an array in index order;
//! * any other directory, including an empty one, becomes an object.
//!
//! Dematerialization goes the other way: objects become directories keyed by member name, arrays
//! become directories keyed by index, and scalars become leaves holding their JSON rendering.
//! For any document whose object keys don't look like array indexes,
//! `materialize(dematerialize(doc)) == doc`, except that an empty array comes back as `{}`.

use log::trace;
use serde_json::Map;
use std::collections::BTreeMap;

use super::{error, Document, Result, StoreNode, StorePath};

/// Turns a subtree of nodes into a document.
pub fn materialize(node: StoreNode) -> Document {
    match node {
        StoreNode::Leaf(raw) => decode_scalar(&raw),
        StoreNode::Directory(children) => match array_len(&children) {
            Some(len) => {
                let mut slots = vec![Document::Null; len];
                for (name, child) in children {
                    if let Some(index) = parse_index(&name) {
                        slots[index] = materialize(child);
                    }
                }
                Document::Array(slots)
            }
            None => Document::Object(
                children
                    .into_iter()
                    .map(|(name, child)| (name, materialize(child)))
                    .collect::<Map<_, _>>(),
            ),
        },
    }
}

/// Turns a document into a subtree of nodes, ready to be written.  Fails if an object key
/// can't be used as a node name.
pub fn dematerialize(doc: &Document) -> Result<StoreNode> {
    dematerialize_at(doc, &mut String::new())
}

/// `pointer` is the JSON pointer of `doc` within the whole document, for errors.
fn dematerialize_at(doc: &Document, pointer: &mut String) -> Result<StoreNode> {
    let depth = pointer.len();
    let node = match doc {
        Document::Object(map) => {
            let mut children = BTreeMap::new();
            for (key, value) in map {
                pointer.truncate(depth);
                pointer.push('/');
                pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
                StorePath::check_segment(key, key).map_err(|e| {
                    error::UnstorableKeySnafu {
                        pointer: pointer.clone(),
                        msg: e.to_string(),
                    }
                    .build()
                })?;
                children.insert(key.clone(), dematerialize_at(value, pointer)?);
            }
            StoreNode::Directory(children)
        }
        Document::Array(items) => {
            let mut children = BTreeMap::new();
            for (index, item) in items.iter().enumerate() {
                pointer.truncate(depth);
                pointer.push('/');
                pointer.push_str(&index.to_string());
                children.insert(index.to_string(), dematerialize_at(item, pointer)?);
            }
            StoreNode::Directory(children)
        }
        scalar => StoreNode::Leaf(encode_scalar(scalar)),
    };
    pointer.truncate(depth);
    Ok(node)
}

/// Serialize a scalar to the text kept in a leaf.
pub fn encode_scalar(scalar: &Document) -> String {
    scalar.to_string()
}

/// Deserialize the text kept in a leaf.  Leaves that weren't written by us, and so don't hold a
/// JSON scalar, are returned as plain strings.
pub fn decode_scalar(raw: &str) -> Document {
    match serde_json::from_str::<Document>(raw) {
        Ok(value) if !value.is_object() && !value.is_array() => value,
        _ => {
            trace!("Leaf text is not a JSON scalar, using it as a string: {:?}", raw);
            Document::String(raw.to_string())
        }
    }
}

/// Returns the array length if the given children look like array elements.
fn array_len(children: &BTreeMap<String, StoreNode>) -> Option<usize> {
    if children.is_empty() {
        return None;
    }
    let len = children.len();
    // Names are unique and canonical, so n distinct indexes below n must be exactly 0..n.
    children
        .keys()
        .all(|name| parse_index(name).map_or(false, |i| i < len))
        .then_some(len)
}

/// Parses a canonical non-negative integer name: digits only, no leading zeros except "0".
fn parse_index(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.len() > 1 && name.starts_with('0') {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    fn leaf(s: &str) -> StoreNode {
        StoreNode::Leaf(s.to_string())
    }

    #[test]
    fn leaves_are_scalars() {
        assert_eq!(materialize(leaf("\"a\"")), json!("a"));
        assert_eq!(materialize(leaf("42")), json!(42));
        assert_eq!(materialize(leaf("1.5")), json!(1.5));
        assert_eq!(materialize(leaf("true")), json!(true));
        assert_eq!(materialize(leaf("null")), json!(null));
    }

    #[test]
    fn foreign_leaves_are_strings() {
        assert_eq!(materialize(leaf("plain text")), json!("plain text"));
        assert_eq!(materialize(leaf("{\"a\": 1}")), json!("{\"a\": 1}"));
        assert_eq!(materialize(leaf("")), json!(""));
    }

    #[test]
    fn contiguous_indexes_are_arrays() {
        let node = StoreNode::Directory(btreemap!(
            "0".to_string() => leaf("\"a\""),
            "1".to_string() => leaf("\"b\""),
            "2".to_string() => leaf("\"c\""),
        ));
        assert_eq!(materialize(node), json!(["a", "b", "c"]));
    }

    #[test]
    fn arrays_sort_numerically() {
        let children = (0..12)
            .map(|i| (i.to_string(), leaf(&i.to_string())))
            .collect::<BTreeMap<_, _>>();
        let expected = (0..12).map(|i| json!(i)).collect::<Vec<_>>();
        assert_eq!(
            materialize(StoreNode::Directory(children)),
            Document::Array(expected)
        );
    }

    #[test]
    fn gaps_and_leading_zeros_are_objects() {
        let gap = StoreNode::Directory(btreemap!(
            "0".to_string() => leaf("1"),
            "2".to_string() => leaf("2"),
        ));
        assert_eq!(materialize(gap), json!({"0": 1, "2": 2}));

        let padded = StoreNode::Directory(btreemap!(
            "0".to_string() => leaf("1"),
            "01".to_string() => leaf("2"),
        ));
        assert_eq!(materialize(padded), json!({"0": 1, "01": 2}));
    }

    #[test]
    fn empty_directory_is_object() {
        assert_eq!(materialize(StoreNode::empty_directory()), json!({}));
    }

    #[test]
    fn dematerialize_document() {
        let doc = json!({"name": "a", "tags": ["x", "y"], "n": 1, "nested": {"ok": true}});
        let node = dematerialize(&doc).unwrap();
        assert_eq!(
            node,
            StoreNode::Directory(btreemap!(
                "n".to_string() => leaf("1"),
                "name".to_string() => leaf("\"a\""),
                "nested".to_string() => StoreNode::Directory(btreemap!(
                    "ok".to_string() => leaf("true"),
                )),
                "tags".to_string() => StoreNode::Directory(btreemap!(
                    "0".to_string() => leaf("\"x\""),
                    "1".to_string() => leaf("\"y\""),
                )),
            ))
        );
    }

    #[test]
    fn document_round_trip() {
        let docs = vec![
            json!({"name": "a", "tags": ["x", {"deep": [1, 2, null]}], "empty": {}}),
            json!("scalar"),
            json!([[1], [2, 3]]),
            json!({"a b": {"c.d": "%"}}),
        ];
        for doc in docs {
            let node = dematerialize(&doc).unwrap();
            assert_eq!(materialize(node), doc);
        }
    }

    #[test]
    fn tree_round_trip() {
        let tree = StoreNode::Directory(btreemap!(
            "a".to_string() => StoreNode::Directory(btreemap!(
                "0".to_string() => leaf("\"x\""),
                "1".to_string() => leaf("false"),
            )),
            "b".to_string() => StoreNode::empty_directory(),
            "c".to_string() => leaf("3"),
        ));
        let doc = materialize(tree.clone());
        assert_eq!(dematerialize(&doc).unwrap(), tree);
    }

    #[test]
    fn empty_array_reads_back_as_object() {
        let node = dematerialize(&json!([])).unwrap();
        assert_eq!(materialize(node), json!({}));
    }

    #[test]
    fn unstorable_keys_rejected() {
        for (doc, expected) in [
            (json!({"": 1}), "/"),
            (json!({"a/b": 1}), "/a~1b"),
            (json!({"x": {"..": 1}}), "/x/.."),
            (json!({"ok": 1, "list": [0, {"~/": 1}]}), "/list/1/~0~1"),
        ] {
            match dematerialize(&doc) {
                Err(error::Error::UnstorableKey { pointer, .. }) => assert_eq!(pointer, expected),
                other => panic!("{}: unexpected {:?}", doc, other),
            }
        }
    }
}
