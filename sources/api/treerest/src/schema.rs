//! Validates documents against JSON Schemas before they're written.
//!
//! Schema references are resolved against a base URI.  Only local schemas are supported: the
//! base is a `file://` URI or a bare path, and a reference is either relative to the base or an
//! absolute `file://` URI of its own.  Each schema is compiled the first time it's used and kept
//! for the life of the validator.

use jsonschema::Validator;
use log::{debug, trace};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use treestore::{Document, StorePath};

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

const FILE_SCHEME: &str = "file://";

/// One failed schema constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Where the failing value lives: the store path of the document followed by the JSON
    /// pointer of the value inside it.
    pub location: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// The outcome of validating a document; never partially valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<Violation>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

pub struct SchemaValidator {
    base: PathBuf,
    cache: RwLock<HashMap<String, Arc<Validator>>>,
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    /// Creates a validator that resolves schema references against the given base URI.
    pub fn new<S: AsRef<str>>(schema_uri: S) -> Result<Self> {
        let base = uri_to_path(schema_uri.as_ref())?;
        debug!("Loading schemas from {}", base.display());
        Ok(Self {
            base,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Checks the document against the referenced schema.  `root` is the store path the
    /// document lives at, used to give each violation a full location.
    ///
    /// Fails only if the schema itself can't be loaded; a document that doesn't satisfy the
    /// schema gives Ok(Invalid).
    pub fn validate(
        &self,
        doc: &Document,
        schema: &str,
        root: &StorePath,
    ) -> Result<ValidationResult> {
        let validator = self.compiled(schema)?;
        let violations: Vec<_> = validator
            .iter_errors(doc)
            .map(|e| Violation {
                location: location(root, &e.instance_path.to_string()),
                message: e.to_string(),
            })
            .collect();

        if violations.is_empty() {
            trace!("Document at {} satisfies {}", root, schema);
            Ok(ValidationResult::Valid)
        } else {
            debug!(
                "Document at {} fails {} with {} violation(s)",
                root,
                schema,
                violations.len()
            );
            Ok(ValidationResult::Invalid(violations))
        }
    }

    /// Returns the compiled schema for the reference, loading it if it isn't cached yet.
    fn compiled(&self, schema: &str) -> Result<Arc<Validator>> {
        {
            let cache = self.cache.read().ok().context(error::CacheLockSnafu)?;
            if let Some(validator) = cache.get(schema) {
                return Ok(Arc::clone(validator));
            }
        }

        // Concurrent misses may both load the schema; the result is the same either way.
        let path = self.schema_path(schema)?;
        debug!("Compiling schema '{}' from {}", schema, path.display());
        let raw = fs::read_to_string(&path).context(error::ReadSchemaSnafu { path: &path })?;
        let parsed: Document =
            serde_json::from_str(&raw).context(error::ParseSchemaSnafu { path: &path })?;
        let validator = jsonschema::validator_for(&parsed).map_err(|e| {
            error::CompileSchemaSnafu {
                path: &path,
                msg: e.to_string(),
            }
            .build()
        })?;

        let validator = Arc::new(validator);
        let mut cache = self.cache.write().ok().context(error::CacheLockSnafu)?;
        cache.insert(schema.to_string(), Arc::clone(&validator));
        Ok(validator)
    }

    /// Resolves a schema reference to a file.
    fn schema_path(&self, schema: &str) -> Result<PathBuf> {
        let path = uri_to_path(schema)?;
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.base.join(path))
        }
    }
}

/// Turns a `file://` URI or bare path into a path.  Other schemes aren't supported.
fn uri_to_path(uri: &str) -> Result<PathBuf> {
    if let Some(rest) = uri.strip_prefix(FILE_SCHEME) {
        return Ok(Path::new(rest).to_path_buf());
    }
    ensure!(!uri.contains("://"), error::UnsupportedUriSnafu { uri });
    Ok(Path::new(uri).to_path_buf())
}

/// Joins the document's store path and a JSON pointer inside it.
pub(crate) fn location(root: &StorePath, pointer: &str) -> String {
    match (root.is_root(), pointer.is_empty()) {
        (true, true) => root.to_string(),
        (true, false) => pointer.to_string(),
        (false, _) => format!("{}{}", root, pointer),
    }
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unsupported schema URI '{}', only file:// and plain paths work", uri))]
        UnsupportedUri { uri: String },

        #[snafu(display("Failed to read schema '{}': {}", path.display(), source))]
        ReadSchema { path: PathBuf, source: io::Error },

        #[snafu(display("Schema '{}' is not valid JSON: {}", path.display(), source))]
        ParseSchema {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Schema '{}' is not a valid JSON Schema: {}", path.display(), msg))]
        CompileSchema { path: PathBuf, msg: String },

        #[snafu(display("Schema cache lock poisoned"))]
        CacheLock,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn schema_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let item = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "size": {"type": "integer", "minimum": 0}
            },
            "required": ["name"]
        });
        fs::write(dir.path().join("item.json"), item.to_string()).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        dir
    }

    fn validator(dir: &TempDir) -> SchemaValidator {
        SchemaValidator::new(format!("file://{}", dir.path().display())).unwrap()
    }

    fn root() -> StorePath {
        StorePath::new("/items/foo").unwrap()
    }

    #[test]
    fn valid_document() {
        let dir = schema_dir();
        let v = validator(&dir);
        let result = v
            .validate(&json!({"name": "a", "size": 1}), "item.json", &root())
            .unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn violations_are_located() {
        let dir = schema_dir();
        let v = validator(&dir);
        let result = v
            .validate(&json!({"size": -1}), "item.json", &root())
            .unwrap();
        let violations = match result {
            ValidationResult::Invalid(violations) => violations,
            ValidationResult::Valid => panic!("expected violations"),
        };
        assert_eq!(violations.len(), 2);
        let locations: Vec<_> = violations.iter().map(|v| v.location.as_str()).collect();
        assert!(locations.contains(&"/items/foo"), "{:?}", locations);
        assert!(locations.contains(&"/items/foo/size"), "{:?}", locations);
        for violation in &violations {
            assert!(violation.to_string().starts_with(&violation.location));
        }
    }

    #[test]
    fn root_documents_use_bare_pointer() {
        assert_eq!(location(&StorePath::root(), ""), "/");
        assert_eq!(location(&StorePath::root(), "/a/0"), "/a/0");
        assert_eq!(location(&root(), ""), "/items/foo");
        assert_eq!(location(&root(), "/a/0"), "/items/foo/a/0");
    }

    #[test]
    fn schemas_are_cached() {
        let dir = schema_dir();
        let v = validator(&dir);
        v.validate(&json!({"name": "a"}), "item.json", &root())
            .unwrap();
        fs::remove_file(dir.path().join("item.json")).unwrap();
        assert!(v
            .validate(&json!({"name": "a"}), "item.json", &root())
            .unwrap()
            .is_valid());
    }

    #[test]
    fn bare_path_base_and_absolute_reference() {
        let dir = schema_dir();
        let v = SchemaValidator::new(dir.path().display().to_string()).unwrap();
        v.validate(&json!({"name": "a"}), "item.json", &root())
            .unwrap();

        let elsewhere = SchemaValidator::new("file:///nonexistent").unwrap();
        let absolute = format!("file://{}", dir.path().join("item.json").display());
        elsewhere
            .validate(&json!({"name": "a"}), &absolute, &root())
            .unwrap();
    }

    #[test]
    fn bad_schemas_fail() {
        let dir = schema_dir();
        let v = validator(&dir);
        let doc = json!({"name": "a"});
        assert!(matches!(
            v.validate(&doc, "missing.json", &root()),
            Err(Error::ReadSchema { .. })
        ));
        assert!(matches!(
            v.validate(&doc, "broken.json", &root()),
            Err(Error::ParseSchema { .. })
        ));
        assert!(matches!(
            SchemaValidator::new("http://example.com/schemas"),
            Err(Error::UnsupportedUri { .. })
        ));
    }
}
