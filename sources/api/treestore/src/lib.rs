/*!
# Background

A 'tree store' is a hierarchical key/value store shaped like a filesystem: every node has a
slash-delimited path, and is either a *leaf* holding a scalar, or a *directory* holding
uniquely-named children.

For more detail about its usage, see [treerest](../treerest).

# Library

This library provides a trait defining the exact requirements of a backend, along with basic
implementations for filesystem and memory stores.

The `materialize` module translates between a subtree of nodes and a JSON document, and the
`adapter` module wraps a backend in the document-level operations the REST server uses: read,
write, remove, and list.

We represent scalars -- the actual values stored in leaves -- using JSON, just to have a
convenient human-readable form that keeps numbers, booleans, and null distinct from strings.

# Current limitations

* Both provided backends replace a subtree in one step, so concurrent replaces of the same path
  leave exactly one of them in place.  A recursive read isn't a snapshot, though, and on the
  filesystem a reader can briefly find nothing where a replace is in progress.
* The user (e.g. treerest) is responsible for any locking across a read-modify-write sequence.
*/

pub mod adapter;
pub mod error;
pub mod filesystem;
pub mod materialize;
pub mod memory;
pub mod node;
pub mod path;

pub use adapter::StoreAdapter;
pub use error::{Error, Result};
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use node::StoreNode;
pub use path::{StorePath, PATH_SEPARATOR};

use log::trace;
use snafu::ensure;

/// Serde generic "Value" type representing a materialized tree of nodes.
pub type Document = serde_json::Value;

/// The narrow interface every backend provides.  Each method is a single round trip to the
/// backend and is linearizable on its own; nothing is promised across calls.
pub trait Store: Send + Sync {
    /// Returns the node at the given path, or None if there's nothing there.  If `recursive`
    /// is false, child directories are returned empty.
    fn get_node(&self, path: &StorePath, recursive: bool) -> Result<Option<StoreNode>>;

    /// Returns the names of the children of the directory at the given path, in name order, or
    /// None if there's nothing there.  Fails for leaves.
    fn list_children(&self, path: &StorePath) -> Result<Option<Vec<String>>>;

    /// Sets the value of a leaf, creating parent directories as needed.  Fails if a directory
    /// is already at the path.
    fn set_leaf(&self, path: &StorePath, value: &str) -> Result<()>;

    /// Creates an empty directory, creating parent directories as needed.  Succeeds if a
    /// directory is already at the path.
    fn create_directory(&self, path: &StorePath) -> Result<()>;

    /// Removes the node at the given path.  Returns Ok(false) if there was nothing there.
    /// Removing a non-empty directory requires `recursive`.
    fn remove_node(&self, path: &StorePath, recursive: bool) -> Result<bool>;

    /// Replaces whatever is at the given path with the given node.
    ///
    /// The default removes the old subtree and sets each node individually, so it isn't atomic;
    /// the provided backends replace it with one that is.
    fn put_node(&self, path: &StorePath, node: &StoreNode) -> Result<()> {
        ensure!(
            !path.is_root(),
            error::RootOperationSnafu { op: "replace" }
        );
        self.remove_node(path, true)?;
        self.write_subtree(path, node)
    }

    /// Writes the given node and everything under it, without removing anything first.
    fn write_subtree(&self, path: &StorePath, node: &StoreNode) -> Result<()> {
        match node {
            StoreNode::Leaf(value) => {
                trace!("Setting leaf {}", path);
                self.set_leaf(path, value)
            }
            StoreNode::Directory(children) => {
                trace!("Creating directory {}", path);
                self.create_directory(path)?;
                for (name, child) in children {
                    let child_path = path.child(name)?;
                    self.write_subtree(&child_path, child)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryStore;
    use super::{Store, StoreNode, StorePath};
    use maplit::btreemap;

    fn dir(children: std::collections::BTreeMap<String, StoreNode>) -> StoreNode {
        StoreNode::Directory(children)
    }

    #[test]
    fn put_node_replaces_subtree() {
        let m = MemoryStore::new();
        let path = StorePath::new("/items/foo").unwrap();

        m.set_leaf(&path.child("old").unwrap(), "1").unwrap();
        let node = dir(btreemap!(
            "new".to_string() => StoreNode::Leaf("2".to_string()),
        ));
        m.put_node(&path, &node).unwrap();

        assert_eq!(m.get_node(&path, true).unwrap(), Some(node));
    }

    #[test]
    fn put_node_writes_nested_directories() {
        let m = MemoryStore::new();
        let path = StorePath::new("/a").unwrap();
        let node = dir(btreemap!(
            "b".to_string() => dir(btreemap!(
                "c".to_string() => StoreNode::Leaf("\"x\"".to_string()),
            )),
            "empty".to_string() => StoreNode::empty_directory(),
        ));
        m.put_node(&path, &node).unwrap();

        assert_eq!(m.get_node(&path, true).unwrap(), Some(node));
        assert_eq!(
            m.list_children(&path).unwrap(),
            Some(vec!["b".to_string(), "empty".to_string()])
        );
    }

    #[test]
    fn put_node_refuses_root() {
        let m = MemoryStore::new();
        m.put_node(&StorePath::root(), &StoreNode::empty_directory())
            .unwrap_err();
    }
}
