//! The document-level view of a store.  A write is one `put_node` call on the backend; reads of
//! a collection take one call per child.

use log::{debug, trace};
use snafu::OptionExt;

use super::materialize::{dematerialize, materialize};
use super::{error, Document, Result, Store, StorePath};

/// Wraps a backend in the read, write, remove, and list operations used by the REST server.
#[derive(Debug)]
pub struct StoreAdapter<S> {
    store: S,
}

impl<S: Store> StoreAdapter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Gives access to the underlying backend.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Materializes the subtree at the given path.  Fails with NotFound if there's nothing
    /// there.
    pub fn read(&self, path: &StorePath, recursive: bool) -> Result<Document> {
        debug!("Reading {} (recursive: {})", path, recursive);
        let node = self
            .store
            .get_node(path, recursive)?
            .context(error::NotFoundSnafu {
                path: path.to_string(),
            })?;
        Ok(materialize(node))
    }

    /// Replaces whatever is at the given path with the given document.  The document is
    /// checked in full before anything is written, so a document with an unstorable key
    /// leaves the store untouched.
    pub fn write(&self, path: &StorePath, doc: &Document) -> Result<()> {
        let node = dematerialize(doc)?;
        debug!("Writing {}", path);
        self.store.put_node(path, &node)
    }

    /// Removes the node at the given path.  Fails with NotFound if there's nothing there.
    pub fn remove(&self, path: &StorePath, recursive: bool) -> Result<()> {
        debug!("Removing {} (recursive: {})", path, recursive);
        if self.store.remove_node(path, recursive)? {
            Ok(())
        } else {
            error::NotFoundSnafu {
                path: path.to_string(),
            }
            .fail()
        }
    }

    /// Returns the names of the children of the directory at the given path, in name order.
    pub fn list(&self, path: &StorePath) -> Result<Vec<String>> {
        self.store
            .list_children(path)?
            .context(error::NotFoundSnafu {
                path: path.to_string(),
            })
    }

    /// Reads every child of the directory at the given path, in name order.  A child removed
    /// between listing and reading is skipped.
    pub fn read_collection(&self, path: &StorePath) -> Result<Vec<(String, Document)>> {
        let names = self.list(path)?;
        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            let child = path.child(&name)?;
            match self.read(&child, true) {
                Ok(doc) => documents.push((name, doc)),
                Err(e) if e.is_not_found() => {
                    trace!("Child {} disappeared while reading collection", child);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(documents)
    }
}
