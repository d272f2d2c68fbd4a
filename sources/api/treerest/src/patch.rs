//! Applies partial updates to a document, producing a candidate for validation.
//!
//! Two formats are supported: JSON Patch (RFC 6902), an ordered list of operations that is
//! applied all-or-nothing, and JSON Merge Patch (RFC 7396), a recursive merge where `null`
//! removes a member.  Neither touches the document it's given; the result is a new document.

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fmt;
use treestore::Document;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Content type that selects JSON Patch.
pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";
/// Content type that selects JSON Merge Patch.
pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMode {
    #[default]
    Merge,
    JsonPatch,
}

impl PatchMode {
    /// Picks the mode named by the request's content type, falling back to the configured mode
    /// for anything else, including plain JSON.
    pub fn from_content_type(content_type: Option<&str>, default: PatchMode) -> PatchMode {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());
        match essence.as_deref() {
            Some(JSON_PATCH_CONTENT_TYPE) => PatchMode::JsonPatch,
            Some(MERGE_PATCH_CONTENT_TYPE) => PatchMode::Merge,
            _ => default,
        }
    }
}

impl fmt::Display for PatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchMode::Merge => write!(f, "merge"),
            PatchMode::JsonPatch => write!(f, "json-patch"),
        }
    }
}

/// Applies the patch to a copy of the target and returns the result.  On any failure the
/// target is left as it was.
pub fn apply(mode: PatchMode, target: &Document, patch: &Document) -> Result<Document> {
    debug!("Applying {} patch", mode);
    match mode {
        PatchMode::Merge => Ok(apply_merge(target, patch)),
        PatchMode::JsonPatch => apply_json_patch(target, patch),
    }
}

fn apply_merge(target: &Document, patch: &Document) -> Document {
    let mut patched = target.clone();
    json_patch::merge(&mut patched, patch);
    patched
}

fn apply_json_patch(target: &Document, patch: &Document) -> Result<Document> {
    ensure!(patch.is_array(), error::NotAnArraySnafu);
    let operations: json_patch::Patch =
        serde_json::from_value(patch.clone()).context(error::MalformedSnafu)?;

    let mut patched = target.clone();
    if let Err(e) = json_patch::patch(&mut patched, &operations) {
        return match e.kind {
            json_patch::PatchErrorKind::TestFailed => error::TestFailedSnafu {
                msg: e.to_string(),
            }
            .fail(),
            _ => error::PathSnafu {
                msg: e.to_string(),
            }
            .fail(),
        };
    }
    Ok(patched)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("JSON Patch must be an array of operations"))]
        NotAnArray,

        #[snafu(display("Malformed JSON Patch: {}", source))]
        Malformed { source: serde_json::Error },

        #[snafu(display("JSON Patch test failed: {}", msg))]
        TestFailed { msg: String },

        #[snafu(display("JSON Patch path error: {}", msg))]
        Path { msg: String },
    }
}
