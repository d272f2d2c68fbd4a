use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Possible errors from store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Path '{}' has invalid format: {}", path, msg))]
    InvalidPath { path: String, msg: String },

    #[snafu(display("Path segment beyond maximum length {}: {}", max, segment))]
    SegmentTooLong { segment: String, max: usize },

    #[snafu(display("Path would traverse outside store: {}", path))]
    PathTraversal { path: String },

    /// `pointer` is the JSON pointer of the offending key within the document.
    #[snafu(display("Document key at '{}' can't be stored: {}", pointer, msg))]
    UnstorableKey { pointer: String, msg: String },

    #[snafu(display("No node at '{}'", path))]
    NotFound { path: String },

    #[snafu(display("Node at '{}' is a leaf, not a directory", path))]
    NotADirectory { path: String },

    #[snafu(display("Node at '{}' is a directory, not a leaf", path))]
    NotALeaf { path: String },

    #[snafu(display("Directory at '{}' is not empty", path))]
    DirectoryNotEmpty { path: String },

    #[snafu(display("Refusing to {} the store root", op))]
    RootOperation { op: String },

    #[snafu(display("Reading node '{}' failed: {}", path, source))]
    NodeRead { path: String, source: io::Error },

    #[snafu(display("Removing node at '{}' failed: {}", path.display(), source))]
    DeleteNode { path: PathBuf, source: io::Error },

    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("Error walking store tree: {}", source))]
    Walk { source: walkdir::Error },

    #[snafu(display("Error building store path: {}", source))]
    StripPrefix { source: std::path::StripPrefixError },

    #[snafu(display("Store integrity violation at {}: {}", path.display(), msg))]
    Corruption { msg: String, path: PathBuf },

    #[snafu(display("Another thread poisoned the store lock by panicking"))]
    StoreLock,
}

impl Error {
    /// Whether the error means the requested path simply has no node, as opposed to the
    /// backend failing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
