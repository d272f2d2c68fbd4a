//! This implementation of the Store trait relies on the filesystem for storage.
//!
//! Directory nodes are directories and leaves are files, at paths resembling the store paths,
//! e.g. base/a/b/c for /a/b/c.  Each segment is percent-encoded so that any name the store
//! accepts is also a safe filename.
//!
//! A replace is staged under a scratch name beside the target and renamed into place.  Scratch
//! names start with a dot, which no encoded segment does, and reads skip them.

use log::{debug, trace, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::{ensure, OptionExt, ResultExt};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use walkdir::WalkDir;

use super::{error, Result, Store, StoreNode, StorePath};

// Everything but ASCII alphanumerics, '_' and '-' is percent-encoded in filenames.  Encoding
// dots means no encoded segment can be "." or "..".
const ENCODE_CHARACTERS: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

const SCRATCH_PREFIX: &str = ".tmp";
static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    // Held by every call that changes the tree.  Reads don't take it.
    write_lock: Mutex<()>,
}

impl FilesystemStore {
    /// Uses the given directory as the store root.  The directory isn't created; see `create`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> FilesystemStore {
        FilesystemStore {
            base_path: base_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Like `new`, but creates the root directory if it doesn't exist.
    pub fn create<P: AsRef<Path>>(base_path: P) -> Result<FilesystemStore> {
        let base_path = base_path.as_ref();
        fs::create_dir_all(base_path).context(error::IoSnafu { path: base_path })?;
        debug!("Using filesystem store at {}", base_path.display());
        Ok(Self::new(base_path))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| error::StoreLockSnafu.build())
    }

    /// Returns the appropriate path on the filesystem for the given store path.
    fn node_path(&self, path: &StorePath) -> Result<PathBuf> {
        if path.is_root() {
            return Ok(self.base_path.clone());
        }

        // Encode segments so they're filesystem-safe, then join them with the filesystem
        // separator to get the path underneath the store.
        let encoded: Vec<_> = path.segments().iter().map(encode_segment).collect();
        let fs_path = self
            .base_path
            .join(encoded.join(path::MAIN_SEPARATOR_STR));

        // Must stay strictly inside the base.
        ensure!(
            fs_path != self.base_path && fs_path.starts_with(&self.base_path),
            error::PathTraversalSnafu {
                path: path.to_string()
            }
        );

        Ok(fs_path)
    }

    /// Reads the directory at the given filesystem path into a node.  If `recursive` is false,
    /// child directories are returned empty.
    fn read_directory(&self, fs_path: &Path, recursive: bool) -> Result<StoreNode> {
        let mut walker = WalkDir::new(fs_path)
            .min_depth(1)
            .follow_links(false)
            .same_file_system(true)
            .sort_by_file_name();
        if !recursive {
            walker = walker.max_depth(1);
        }

        trace!("Starting walk of filesystem under {}", fs_path.display());
        let mut directory = StoreNode::empty_directory();
        let entries = walker
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_scratch(e.file_name()));
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Something removed concurrently is simply not part of what we read.
                    if let Some(io_error) = e.io_error() {
                        if io_error.kind() == io::ErrorKind::NotFound {
                            continue;
                        }
                    }
                    return Err(e).context(error::WalkSnafu);
                }
            };

            let relative = entry
                .path()
                .strip_prefix(fs_path)
                .context(error::StripPrefixSnafu)?;
            let segments = relative
                .components()
                .map(|c| {
                    let raw = c.as_os_str().to_str().context(error::CorruptionSnafu {
                        msg: "Non-UTF8 path",
                        path: entry.path(),
                    })?;
                    decode_segment(raw, entry.path())
                })
                .collect::<Result<Vec<_>>>()?;

            let file_type = entry.file_type();
            let node = if file_type.is_dir() {
                StoreNode::empty_directory()
            } else if file_type.is_file() {
                match read_leaf(entry.path())? {
                    Some(value) => StoreNode::Leaf(value),
                    None => continue,
                }
            } else {
                trace!("Skipping non-file entry: {}", entry.path().display());
                continue;
            };

            // Parents are yielded before their children, so a failed insert means the parent
            // was skipped or removed while we walked.
            if !directory.insert(&segments, node) {
                trace!("Skipping orphaned entry: {}", entry.path().display());
            }
        }
        Ok(directory)
    }

    /// Moves whatever is at `target` to `displaced`, then `staged` to `target`.  Returns whether
    /// anything was displaced.
    fn swap_in(&self, target: &Path, staged: &Path, displaced: &Path) -> Result<bool> {
        let _guard = self.lock()?;
        let displaced_any = match fs::rename(target, displaced) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).context(error::IoSnafu { path: target }),
        };
        if let Err(e) = fs::rename(staged, target) {
            if displaced_any {
                if let Err(restore) = fs::rename(displaced, target) {
                    warn!(
                        "Unable to restore {} from {}: {}",
                        target.display(),
                        displaced.display(),
                        restore
                    );
                }
            }
            return Err(e).context(error::IoSnafu { path: target });
        }
        Ok(displaced_any)
    }
}

// Filesystem helpers

/// The filename for a store path segment.
fn encode_segment<S: AsRef<str>>(segment: S) -> String {
    utf8_percent_encode(segment.as_ref(), ENCODE_CHARACTERS).to_string()
}

/// The store path segment for a filename; `path` is only used for errors.
fn decode_segment<S, P>(segment: S, path: P) -> Result<String>
where
    S: AsRef<str>,
    P: AsRef<Path>,
{
    let raw = segment.as_ref();
    // We only ever write encoded UTF-8, so bad bytes mean the directory was edited by hand.
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => Ok(decoded.into_owned()),
        Err(_) => error::CorruptionSnafu {
            path: path.as_ref(),
            msg: format!("filename '{}' doesn't decode to UTF-8", raw),
        }
        .fail(),
    }
}

/// Reads a leaf file; Ok(None) if it's gone.
fn read_leaf(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(error::NodeReadSnafu {
            path: path.display().to_string(),
        }),
    }
}

/// Writes a leaf file, creating any missing parent directories.
fn write_leaf_file(path: &Path, value: &str) -> Result<()> {
    let parent = path.parent().with_context(|| error::CorruptionSnafu {
        msg: "Leaf path has no parent",
        path,
    })?;
    fs::create_dir_all(parent).context(error::IoSnafu { path: parent })?;
    fs::write(path, value).context(error::IoSnafu { path })
}

/// Writes a node and everything under it at the given filesystem path, which mustn't exist yet.
fn write_node(fs_path: &Path, node: &StoreNode) -> Result<()> {
    match node {
        StoreNode::Leaf(value) => {
            fs::write(fs_path, value).context(error::IoSnafu { path: fs_path })
        }
        StoreNode::Directory(children) => {
            fs::create_dir(fs_path).context(error::IoSnafu { path: fs_path })?;
            for (name, child) in children {
                write_node(&fs_path.join(encode_segment(name)), child)?;
            }
            Ok(())
        }
    }
}

/// A fresh name beside `target` for staging or displacing a node.
fn scratch_path(target: &Path) -> PathBuf {
    let unique = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!("{}.{}.{}", SCRATCH_PREFIX, process::id(), unique))
}

fn is_scratch(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with(SCRATCH_PREFIX)
}

/// Removes a scratch entry.  Failure is only logged, since reads never see scratch entries.
fn discard(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Unable to remove scratch entry {}: {}", path.display(), e),
    }
}

/// Returns the metadata of the given path, or None if nothing is there.
fn metadata(path: &Path) -> Result<Option<fs::Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(error::IoSnafu { path }),
    }
}

impl Store for FilesystemStore {
    fn get_node(&self, path: &StorePath, recursive: bool) -> Result<Option<StoreNode>> {
        let fs_path = self.node_path(path)?;
        let metadata = match metadata(&fs_path)? {
            Some(metadata) => metadata,
            // We create the root at startup, so something must be wrong.
            None if path.is_root() => {
                return error::CorruptionSnafu {
                    msg: "Store root missing",
                    path: fs_path,
                }
                .fail()
            }
            None => return Ok(None),
        };

        if metadata.is_dir() {
            self.read_directory(&fs_path, recursive).map(Some)
        } else if metadata.is_file() {
            Ok(read_leaf(&fs_path)?.map(StoreNode::Leaf))
        } else {
            error::CorruptionSnafu {
                msg: "Node is neither a file nor a directory",
                path: fs_path,
            }
            .fail()
        }
    }

    fn list_children(&self, path: &StorePath) -> Result<Option<Vec<String>>> {
        let fs_path = self.node_path(path)?;
        match metadata(&fs_path)? {
            None => return Ok(None),
            Some(metadata) => {
                ensure!(
                    metadata.is_dir(),
                    error::NotADirectorySnafu {
                        path: path.to_string()
                    }
                );
            }
        }

        let walker = WalkDir::new(&fs_path)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false);

        let mut names = Vec::new();
        for entry in walker {
            let entry = entry.context(error::WalkSnafu)?;
            if is_scratch(entry.file_name()) {
                continue;
            }
            let raw = entry
                .file_name()
                .to_str()
                .context(error::CorruptionSnafu {
                    msg: "Non-UTF8 path",
                    path: entry.path(),
                })?;
            names.push(decode_segment(raw, entry.path())?);
        }
        // Encoded names don't sort the same as decoded ones.
        names.sort();
        Ok(Some(names))
    }

    fn set_leaf(&self, path: &StorePath, value: &str) -> Result<()> {
        ensure!(!path.is_root(), error::RootOperationSnafu { op: "set" });
        let fs_path = self.node_path(path)?;
        ensure!(
            !fs_path.is_dir(),
            error::NotALeafSnafu {
                path: path.to_string()
            }
        );
        let _guard = self.lock()?;
        write_leaf_file(&fs_path, value)
    }

    fn create_directory(&self, path: &StorePath) -> Result<()> {
        let fs_path = self.node_path(path)?;
        ensure!(
            !fs_path.is_file(),
            error::NotADirectorySnafu {
                path: path.to_string()
            }
        );
        let _guard = self.lock()?;
        fs::create_dir_all(&fs_path).context(error::IoSnafu { path: &fs_path })
    }

    fn remove_node(&self, path: &StorePath, recursive: bool) -> Result<bool> {
        ensure!(!path.is_root(), error::RootOperationSnafu { op: "remove" });
        let fs_path = self.node_path(path)?;
        let _guard = self.lock()?;
        let metadata = match metadata(&fs_path)? {
            Some(metadata) => metadata,
            None => return Ok(false),
        };

        let result = if metadata.is_dir() {
            if recursive {
                fs::remove_dir_all(&fs_path)
            } else {
                let mut entries =
                    fs::read_dir(&fs_path).context(error::IoSnafu { path: &fs_path })?;
                ensure!(
                    entries.next().is_none(),
                    error::DirectoryNotEmptySnafu {
                        path: path.to_string()
                    }
                );
                fs::remove_dir(&fs_path)
            }
        } else {
            fs::remove_file(&fs_path)
        };

        // If it was removed out from under us, it's still gone.
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(error::DeleteNodeSnafu { path: fs_path }),
        }
    }

    // The new subtree is written under a scratch name first, so the swap itself is two renames
    // under the write lock.  A reader sees the old node, the new one, or briefly nothing.
    fn put_node(&self, path: &StorePath, node: &StoreNode) -> Result<()> {
        ensure!(!path.is_root(), error::RootOperationSnafu { op: "replace" });
        let fs_path = self.node_path(path)?;
        let parent = fs_path.parent().with_context(|| error::CorruptionSnafu {
            msg: "Node path has no parent",
            path: &fs_path,
        })?;
        fs::create_dir_all(parent).context(error::IoSnafu { path: parent })?;

        let staged = scratch_path(&fs_path);
        trace!("Staging {} at {}", path, staged.display());
        if let Err(e) = write_node(&staged, node) {
            discard(&staged);
            return Err(e);
        }

        let displaced = scratch_path(&fs_path);
        match self.swap_in(&fs_path, &staged, &displaced) {
            Ok(true) => {
                discard(&displaced);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                discard(&staged);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn p(name: &str) -> StorePath {
        StorePath::new(name).unwrap()
    }

    fn store() -> (TempDir, FilesystemStore) {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::create(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn node_path() {
        let f = FilesystemStore::new("/base");
        let path = p("/a/b c/d.e");
        assert_eq!(
            f.node_path(&path).unwrap().into_os_string(),
            "/base/a/b%20c/d%2Ee"
        );
        assert_eq!(
            f.node_path(&StorePath::root()).unwrap().into_os_string(),
            "/base"
        );
    }

    #[test]
    fn segments_encode() {
        assert_eq!(encode_segment("item_1-x"), "item_1-x");
        assert_eq!(encode_segment("v1.2"), "v1%2E2");
        assert_eq!(encode_segment(".."), "%2E%2E");
        assert_eq!(encode_segment("50% off"), "50%25%20off");
        assert_eq!(encode_segment("é"), "%C3%A9");
    }

    #[test]
    fn segments_decode() {
        for name in ["item_1-x", "v1.2", "..", "50% off", "é"] {
            assert_eq!(decode_segment(encode_segment(name), "").unwrap(), name);
        }
        assert!(matches!(
            decode_segment("%C3%28", ""),
            Err(error::Error::Corruption { .. })
        ));
    }

    #[test]
    fn get_set_remove() {
        let (_dir, f) = store();
        let path = p("/items/foo/name");

        f.set_leaf(&path, "\"a\"").unwrap();
        assert_eq!(
            f.get_node(&path, true).unwrap(),
            Some(StoreNode::Leaf("\"a\"".to_string()))
        );

        assert!(f.remove_node(&path, false).unwrap());
        assert_eq!(f.get_node(&path, true).unwrap(), None);
        assert!(!f.remove_node(&path, false).unwrap());
        // The parent directory stays, empty.
        assert_eq!(
            f.get_node(&p("/items/foo"), true).unwrap(),
            Some(StoreNode::empty_directory())
        );
    }

    #[test]
    fn read_tree() {
        let (_dir, f) = store();
        f.set_leaf(&p("/a/x.y/1"), "1").unwrap();
        f.set_leaf(&p("/a/z"), "true").unwrap();
        f.create_directory(&p("/a/empty")).unwrap();

        let full = StoreNode::Directory(btreemap!(
            "empty".to_string() => StoreNode::empty_directory(),
            "x.y".to_string() => StoreNode::Directory(btreemap!(
                "1".to_string() => StoreNode::Leaf("1".to_string()),
            )),
            "z".to_string() => StoreNode::Leaf("true".to_string()),
        ));
        assert_eq!(f.get_node(&p("/a"), true).unwrap(), Some(full.clone()));
        assert_eq!(f.get_node(&p("/a"), false).unwrap(), Some(full.shallow()));
    }

    #[test]
    fn list_children_decoded_and_sorted() {
        let (_dir, f) = store();
        for name in ["/c/b", "/c/a b", "/c/a.c", "/c/sub/x"] {
            f.set_leaf(&p(name), "1").unwrap();
        }
        assert_eq!(
            f.list_children(&p("/c")).unwrap(),
            Some(vec![
                "a b".to_string(),
                "a.c".to_string(),
                "b".to_string(),
                "sub".to_string(),
            ])
        );
        assert_eq!(f.list_children(&p("/missing")).unwrap(), None);
        f.list_children(&p("/c/b")).unwrap_err();
    }

    #[test]
    fn leaf_and_directory_conflicts() {
        let (_dir, f) = store();
        f.set_leaf(&p("/a/b"), "1").unwrap();
        f.set_leaf(&p("/a"), "1").unwrap_err();
        f.create_directory(&p("/a/b")).unwrap_err();
    }

    #[test]
    fn remove_directory_needs_recursive() {
        let (_dir, f) = store();
        f.set_leaf(&p("/a/b/c"), "1").unwrap();
        f.remove_node(&p("/a"), false).unwrap_err();
        assert!(f.remove_node(&p("/a"), true).unwrap());
        assert_eq!(f.get_node(&p("/a"), true).unwrap(), None);
        f.remove_node(&StorePath::root(), true).unwrap_err();
    }

    #[test]
    fn put_node_replaces() {
        let (_dir, f) = store();
        let path = p("/items/foo");
        f.set_leaf(&path.child("old").unwrap(), "1").unwrap();

        let node = StoreNode::Directory(btreemap!(
            "new".to_string() => StoreNode::Leaf("2".to_string()),
        ));
        f.put_node(&path, &node).unwrap();
        assert_eq!(f.get_node(&path, true).unwrap(), Some(node));
    }

    #[test]
    fn missing_root_is_corruption() {
        let dir = TempDir::new().unwrap();
        let f = FilesystemStore::new(dir.path().join("nope"));
        f.get_node(&StorePath::root(), true).unwrap_err();
        assert_eq!(f.get_node(&p("/a"), true).unwrap(), None);
    }

    #[test]
    fn put_node_replaces_leaf_with_directory() {
        let (_dir, f) = store();
        let path = p("/items/foo");
        f.set_leaf(&path, "1").unwrap();

        let node = StoreNode::Directory(btreemap!(
            "a".to_string() => StoreNode::Leaf("2".to_string()),
        ));
        f.put_node(&path, &node).unwrap();
        assert_eq!(f.get_node(&path, true).unwrap(), Some(node));

        f.put_node(&path, &StoreNode::Leaf("3".to_string())).unwrap();
        assert_eq!(
            f.get_node(&path, true).unwrap(),
            Some(StoreNode::Leaf("3".to_string()))
        );
        // Nothing left over beside it.
        assert_eq!(
            f.list_children(&p("/items")).unwrap(),
            Some(vec!["foo".to_string()])
        );
        let items = f.node_path(&p("/items")).unwrap();
        assert_eq!(fs::read_dir(items).unwrap().count(), 1);
    }

    #[test]
    fn scratch_entries_hidden() {
        let (_dir, f) = store();
        f.set_leaf(&p("/items/foo"), "1").unwrap();
        let items = f.node_path(&p("/items")).unwrap();
        fs::write(items.join(".tmp.1.1"), "2").unwrap();
        fs::create_dir(items.join(".tmp.1.2")).unwrap();
        fs::write(items.join(".tmp.1.2").join("x"), "3").unwrap();

        assert_eq!(
            f.list_children(&p("/items")).unwrap(),
            Some(vec!["foo".to_string()])
        );
        assert_eq!(
            f.get_node(&p("/items"), true).unwrap(),
            Some(StoreNode::Directory(btreemap!(
                "foo".to_string() => StoreNode::Leaf("1".to_string()),
            )))
        );
    }

    #[test]
    fn concurrent_replaces_never_mix() {
        let (_dir, f) = store();
        let path = p("/items/race");
        let small = StoreNode::Directory(btreemap!(
            "v".to_string() => StoreNode::Leaf("1".to_string()),
        ));
        let large = StoreNode::Directory(btreemap!(
            "v".to_string() => StoreNode::Leaf("2".to_string()),
            "w".to_string() => StoreNode::Leaf("3".to_string()),
            "x".to_string() => StoreNode::Leaf("4".to_string()),
            "y".to_string() => StoreNode::Leaf("5".to_string()),
        ));

        for _ in 0..100 {
            let barrier = Barrier::new(2);
            thread::scope(|s| {
                for node in [&small, &large] {
                    let (f, path, barrier) = (&f, &path, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        f.put_node(path, node).unwrap();
                    });
                }
            });
            let stored = f.get_node(&path, true).unwrap().unwrap();
            assert!(stored == small || stored == large, "{:?}", stored);
        }
        assert_eq!(
            f.list_children(&p("/items")).unwrap(),
            Some(vec!["race".to_string()])
        );
    }
}
