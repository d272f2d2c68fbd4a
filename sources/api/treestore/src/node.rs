//! StoreNode is the in-memory form of a subtree read from, or about to be written to, a store.

use std::collections::BTreeMap;

/// A node in the store; either a leaf holding a scalar, or a directory of uniquely-named
/// children.  Children are kept in name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNode {
    Leaf(String),
    Directory(BTreeMap<String, StoreNode>),
}

impl StoreNode {
    pub fn empty_directory() -> Self {
        StoreNode::Directory(BTreeMap::new())
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, StoreNode::Directory(_))
    }

    /// Walks down through the given segments, returning the node found there, if any.
    pub fn descend<S: AsRef<str>>(&self, segments: &[S]) -> Option<&StoreNode> {
        let mut node = self;
        for segment in segments {
            node = match node {
                StoreNode::Directory(children) => children.get(segment.as_ref())?,
                StoreNode::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    /// Mutable version of `descend`.
    pub fn descend_mut<S: AsRef<str>>(&mut self, segments: &[S]) -> Option<&mut StoreNode> {
        let mut node = self;
        for segment in segments {
            node = match node {
                StoreNode::Directory(children) => children.get_mut(segment.as_ref())?,
                StoreNode::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    /// Returns a copy with every child directory emptied, which is what a non-recursive read
    /// returns.
    pub fn shallow(&self) -> StoreNode {
        match self {
            StoreNode::Leaf(value) => StoreNode::Leaf(value.clone()),
            StoreNode::Directory(children) => StoreNode::Directory(
                children
                    .iter()
                    .map(|(name, child)| {
                        let child = match child {
                            StoreNode::Leaf(value) => StoreNode::Leaf(value.clone()),
                            StoreNode::Directory(_) => StoreNode::empty_directory(),
                        };
                        (name.clone(), child)
                    })
                    .collect(),
            ),
        }
    }

    /// Inserts a node at the given position below this one, where every segment but the last
    /// must already name a directory.  Returns false if that's not the case.
    pub fn insert<S: AsRef<str>>(&mut self, segments: &[S], node: StoreNode) -> bool {
        let (name, parents) = match segments.split_last() {
            Some(split) => split,
            None => return false,
        };
        match self.descend_mut(parents) {
            Some(StoreNode::Directory(children)) => {
                children.insert(name.as_ref().to_string(), node);
                true
            }
            _ => false,
        }
    }
}
