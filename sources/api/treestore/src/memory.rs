//! In-memory tree store for use in testing other modules, and for running the server without
//! touching disk.
//!
//! Mimics the decisions made for FilesystemStore, e.g. parents being created implicitly by a
//! write.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{error, Result, Store, StoreNode, StorePath};
use snafu::ensure;

#[derive(Debug)]
pub struct MemoryStore {
    // The root is always a directory.  Every method holds the lock for its whole call, so each
    // call is linearizable, but nothing is held across calls.  put_node is one call, so a
    // replace is never seen half done.
    root: Mutex<StoreNode>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            root: Mutex::new(StoreNode::empty_directory()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreNode>> {
        self.root.lock().map_err(|_| error::StoreLockSnafu.build())
    }
}

/// Walks down to the directory at the given segments, creating missing directories on the way.
fn directory_mut<'a>(
    mut node: &'a mut StoreNode,
    segments: &[String],
) -> Result<&'a mut BTreeMap<String, StoreNode>> {
    for (depth, segment) in segments.iter().enumerate() {
        node = match node {
            StoreNode::Directory(children) => children
                .entry(segment.clone())
                .or_insert_with(StoreNode::empty_directory),
            StoreNode::Leaf(_) => {
                return error::NotADirectorySnafu {
                    path: display_segments(&segments[..depth]),
                }
                .fail()
            }
        };
    }
    match node {
        StoreNode::Directory(children) => Ok(children),
        StoreNode::Leaf(_) => error::NotADirectorySnafu {
            path: display_segments(segments),
        }
        .fail(),
    }
}

fn display_segments(segments: &[String]) -> String {
    format!("/{}", segments.join("/"))
}

impl Store for MemoryStore {
    fn get_node(&self, path: &StorePath, recursive: bool) -> Result<Option<StoreNode>> {
        let root = self.lock()?;
        Ok(root.descend(path.segments()).map(|node| {
            if recursive {
                node.clone()
            } else {
                node.shallow()
            }
        }))
    }

    fn list_children(&self, path: &StorePath) -> Result<Option<Vec<String>>> {
        let root = self.lock()?;
        match root.descend(path.segments()) {
            None => Ok(None),
            Some(StoreNode::Leaf(_)) => error::NotADirectorySnafu {
                path: path.to_string(),
            }
            .fail(),
            // BTreeMap keys are already in name order.
            Some(StoreNode::Directory(children)) => Ok(Some(children.keys().cloned().collect())),
        }
    }

    fn set_leaf(&self, path: &StorePath, value: &str) -> Result<()> {
        let (name, parents) = match path.segments().split_last() {
            Some(split) => split,
            None => return error::RootOperationSnafu { op: "set" }.fail(),
        };
        let mut root = self.lock()?;
        let parent = directory_mut(&mut root, parents)?;
        ensure!(
            !parent.get(name).map_or(false, StoreNode::is_directory),
            error::NotALeafSnafu {
                path: path.to_string()
            }
        );
        parent.insert(name.clone(), StoreNode::Leaf(value.to_string()));
        Ok(())
    }

    fn create_directory(&self, path: &StorePath) -> Result<()> {
        let mut root = self.lock()?;
        directory_mut(&mut root, path.segments())?;
        Ok(())
    }

    fn remove_node(&self, path: &StorePath, recursive: bool) -> Result<bool> {
        let (name, parents) = match path.segments().split_last() {
            Some(split) => split,
            None => return error::RootOperationSnafu { op: "remove" }.fail(),
        };
        let mut root = self.lock()?;
        let children = match root.descend_mut(parents) {
            Some(StoreNode::Directory(children)) => children,
            _ => return Ok(false),
        };
        match children.get(name) {
            None => return Ok(false),
            Some(StoreNode::Directory(grandchildren)) => {
                ensure!(
                    recursive || grandchildren.is_empty(),
                    error::DirectoryNotEmptySnafu {
                        path: path.to_string()
                    }
                );
            }
            Some(StoreNode::Leaf(_)) => {}
        }
        children.remove(name);
        Ok(true)
    }

    fn put_node(&self, path: &StorePath, node: &StoreNode) -> Result<()> {
        let (name, parents) = match path.segments().split_last() {
            Some(split) => split,
            None => return error::RootOperationSnafu { op: "replace" }.fail(),
        };
        let mut root = self.lock()?;
        let parent = directory_mut(&mut root, parents)?;
        parent.insert(name.clone(), node.clone());
        Ok(())
    }
}
