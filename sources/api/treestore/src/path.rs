// Note: this only allows UTF-8 path segments; the filesystem store encodes anything unusual.

use log::trace;
use snafu::ensure;
use std::fmt;
use std::str::FromStr;

use super::{error, Error, Result};

pub const PATH_SEPARATOR: char = '/';

/// Maximum segment length matches the maximum filename length of 255; the filesystem store's
/// encoding can still push a long segment over, in which case the write fails there.
const MAX_SEGMENT_LENGTH: usize = 255;

/// A StorePath is a pointer to a node in the store.  Paths are slash-delimited strings
/// ("/a/b/c") with the slashes implying hierarchy, so "/a/b/c" is a child of "/a/b".  The root
/// is "/", and has no segments.
///
/// The segments are the source of truth; a leading slash is optional when parsing, and a single
/// trailing slash is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// Returns the path of the store root.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Creates a StorePath from the given slash-delimited name.
    ///
    /// Examples:
    /// * /a/b/c -> ["a", "b", "c"]
    /// * a/b/ -> ["a", "b"]
    /// * / -> []
    pub fn new<S: AsRef<str>>(name: S) -> Result<Self> {
        let segments = Self::parse_name_segments(&name)?;
        Ok(Self { segments })
    }

    /// Returns a list of the segments that make up the path.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the last segment, which is the node's name within its parent.  The root has no
    /// name.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// Adds a single segment to the path, returning a new StorePath.
    ///
    /// Fails if the segment is invalid, e.g. it contains the separator.
    pub fn child<S: AsRef<str>>(&self, segment: S) -> Result<Self> {
        let segment = segment.as_ref();
        Self::check_segment(&format!("{}/{}", self, segment), segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Checks that a single segment is acceptable as a node name.
    ///
    /// `path` is only used to give an understandable error.
    pub fn check_segment(path: &str, segment: &str) -> Result<()> {
        ensure!(
            !segment.is_empty(),
            error::InvalidPathSnafu {
                path,
                msg: "empty path segment",
            }
        );
        ensure!(
            segment != "." && segment != "..",
            error::PathTraversalSnafu { path }
        );
        ensure!(
            !segment.contains(PATH_SEPARATOR),
            error::InvalidPathSnafu {
                path,
                msg: format!("segment '{}' contains '{}'", segment, PATH_SEPARATOR),
            }
        );
        ensure!(
            !segment.chars().any(char::is_control),
            error::InvalidPathSnafu {
                path,
                msg: format!("segment '{}' contains a control character", segment.escape_debug()),
            }
        );
        ensure!(
            segment.len() <= MAX_SEGMENT_LENGTH,
            error::SegmentTooLongSnafu {
                segment,
                max: MAX_SEGMENT_LENGTH,
            }
        );
        Ok(())
    }

    /// Given a path name, returns a list of its segments, separated by PATH_SEPARATOR.
    fn parse_name_segments<S: AsRef<str>>(name: S) -> Result<Vec<String>> {
        let name = name.as_ref();

        ensure!(
            !name.is_empty(),
            error::InvalidPathSnafu {
                path: name,
                msg: "cannot be empty",
            }
        );

        let trimmed = name.strip_prefix(PATH_SEPARATOR).unwrap_or(name);
        let trimmed = trimmed.strip_suffix(PATH_SEPARATOR).unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split(PATH_SEPARATOR) {
            Self::check_segment(name, segment)?;
            segments.push(segment.to_string());
        }

        trace!("Parsed path '{}' to segments {:?}", name, segments);
        Ok(segments)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "{}", PATH_SEPARATOR);
        }
        for segment in &self.segments {
            write!(f, "{}{}", PATH_SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for StorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
