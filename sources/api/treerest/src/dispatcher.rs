//! The dispatcher drives one request through the pipeline and turns the outcome into a
//! response.
//!
//! Each request moves through a fixed set of stages, starting at Idle and always ending at
//! Responded:
//!
//! * GET: Routed, Reading
//! * PUT/POST: Routed, Validating, Writing
//! * PATCH: Routed, Reading, Patching, Validating, Writing
//! * DELETE: Routed, Deleting
//!
//! Any failure skips straight to Responded.  Validation always happens before the write, so an
//! invalid document never reaches the store.
//!
//! Nothing is locked across stages.  Two concurrent writes to the same path race, and the last
//! write wins; a PATCH can lose an update made between its read and its write.  The write itself
//! is a single replace in the store, so the winner is always stored whole.

use log::{debug, error, trace};
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt;
use treestore::{Document, Store, StoreAdapter, StorePath};

use crate::patch::{self, PatchMode};
use crate::routes::{Method, Resolved, RouteTable};
use crate::schema::{self, SchemaValidator, ValidationResult};
use crate::writer::{self, Payload, Response, ResponseDefaults, ResponseOptions};

pub use error::Error;
type Result<T> = std::result::Result<T, Error>;

/// The message sent for every failure that isn't the client's doing; the details are logged.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// A request, independent of the HTTP library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Routed,
    Reading,
    Patching,
    Validating,
    Writing,
    Deleting,
    Responded,
}

/// Tracks and logs the stage of one request.
struct Progress<'a> {
    request: &'a Request,
    stage: Stage,
}

impl<'a> Progress<'a> {
    fn new(request: &'a Request) -> Self {
        Self {
            request,
            stage: Stage::Idle,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(
            "{} {}: {:?} -> {:?}",
            self.request.method, self.request.path, self.stage, stage
        );
        self.stage = stage;
    }
}

pub struct Dispatcher<S> {
    adapter: StoreAdapter<S>,
    routes: RouteTable,
    validator: SchemaValidator,
    defaults: ResponseDefaults,
    patch_mode: PatchMode,
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .field("validator", &self.validator)
            .field("defaults", &self.defaults)
            .field("patch_mode", &self.patch_mode)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Dispatcher<S> {
    /// Every collaborator is handed in here and kept for the life of the dispatcher.
    pub fn new(
        adapter: StoreAdapter<S>,
        routes: RouteTable,
        validator: SchemaValidator,
        defaults: ResponseDefaults,
        patch_mode: PatchMode,
    ) -> Self {
        Self {
            adapter,
            routes,
            validator,
            defaults,
            patch_mode,
        }
    }

    pub fn adapter(&self) -> &StoreAdapter<S> {
        &self.adapter
    }

    /// Handles one request.  Never fails; every outcome becomes a response.
    pub fn dispatch(&self, request: &Request) -> Response {
        let options = ResponseOptions::from_query(&request.query, self.defaults);
        let mut progress = Progress::new(request);

        let (status, payload, allow) = match self.handle(request, &mut progress) {
            Ok((status, payload)) => (status, payload, None),
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    error!(
                        "{} {} failed at {:?}: {}",
                        request.method, request.path, progress.stage, e
                    );
                } else {
                    debug!("{} {} rejected: {}", request.method, request.path, e);
                }
                (status, Payload::Errors(e.messages()), e.allow())
            }
        };

        progress.enter(Stage::Responded);
        let mut response = writer::write(&payload, status, options);
        response.allow = allow;
        response
    }

    /// The response for a request that couldn't be handled at all, e.g. because it timed out.
    pub fn internal_error(&self, query: &HashMap<String, String>) -> Response {
        let options = ResponseOptions::from_query(query, self.defaults);
        writer::write(
            &Payload::Errors(vec![INTERNAL_ERROR_MESSAGE.to_string()]),
            500,
            options,
        )
    }

    fn handle(&self, request: &Request, progress: &mut Progress<'_>) -> Result<(u16, Payload)> {
        let method: Method = request.method.parse().context(error::RouteSnafu)?;
        let resolved = self
            .routes
            .resolve(method, &request.path)
            .context(error::RouteSnafu)?;
        progress.enter(Stage::Routed);

        match method {
            Method::Get => self.get(request, &resolved, progress),
            Method::Put => self.replace(request, &resolved, progress, 200),
            Method::Post => self.replace(request, &resolved, progress, 201),
            Method::Patch => self.patch(request, &resolved, progress),
            Method::Delete => self.delete(&resolved, progress),
        }
    }

    fn get(
        &self,
        request: &Request,
        resolved: &Resolved<'_>,
        progress: &mut Progress<'_>,
    ) -> Result<(u16, Payload)> {
        progress.enter(Stage::Reading);
        let path = &resolved.store_path;

        if !resolved.is_collection {
            let doc = self
                .adapter
                .read(path, true)
                .map_err(|e| store_error(e, path))?;
            return Ok((200, Payload::Data(doc)));
        }

        let children = self
            .adapter
            .read_collection(path)
            .map_err(|e| store_error(e, path))?;
        let table = writer::resolve_flag(request.query.get("table").map(String::as_str), false);
        let doc = if table {
            Document::Array(
                children
                    .into_iter()
                    .map(|(name, doc)| with_dir_name(doc, resolved.dir_name, name))
                    .collect(),
            )
        } else {
            Document::Object(children.into_iter().collect())
        };
        Ok((200, Payload::Data(doc)))
    }

    /// PUT and POST: create or replace the whole document.
    fn replace(
        &self,
        request: &Request,
        resolved: &Resolved<'_>,
        progress: &mut Progress<'_>,
        status: u16,
    ) -> Result<(u16, Payload)> {
        let doc = parse_body(&request.body)?;

        progress.enter(Stage::Validating);
        self.check(&doc, resolved)?;

        progress.enter(Stage::Writing);
        self.adapter
            .write(&resolved.store_path, &doc)
            .map_err(|e| store_error(e, &resolved.store_path))?;
        Ok((status, Payload::Data(doc)))
    }

    fn patch(
        &self,
        request: &Request,
        resolved: &Resolved<'_>,
        progress: &mut Progress<'_>,
    ) -> Result<(u16, Payload)> {
        progress.enter(Stage::Reading);
        let current = self
            .adapter
            .read(&resolved.store_path, true)
            .map_err(|e| store_error(e, &resolved.store_path))?;

        progress.enter(Stage::Patching);
        let mode = PatchMode::from_content_type(request.content_type.as_deref(), self.patch_mode);
        let patch_doc = parse_body(&request.body)?;
        let patched = patch::apply(mode, &current, &patch_doc).context(error::PatchSnafu)?;

        progress.enter(Stage::Validating);
        self.check(&patched, resolved)?;

        progress.enter(Stage::Writing);
        self.adapter
            .write(&resolved.store_path, &patched)
            .map_err(|e| store_error(e, &resolved.store_path))?;
        Ok((200, Payload::Data(patched)))
    }

    fn delete(&self, resolved: &Resolved<'_>, progress: &mut Progress<'_>) -> Result<(u16, Payload)> {
        progress.enter(Stage::Deleting);
        self.adapter
            .remove(&resolved.store_path, true)
            .map_err(|e| store_error(e, &resolved.store_path))?;
        Ok((204, Payload::Empty))
    }

    /// Validates a document that's about to be written.
    fn check(&self, doc: &Document, resolved: &Resolved<'_>) -> Result<()> {
        // Routes that allow writes always have a schema; see RouteTable::register.
        let schema = match resolved.schema {
            Some(schema) => schema,
            None => {
                trace!("No schema for {}, skipping validation", resolved.store_path);
                return Ok(());
            }
        };
        match self
            .validator
            .validate(doc, schema, &resolved.store_path)
            .context(error::SchemaSnafu)?
        {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(violations) => error::InvalidSnafu {
                violations: violations
                    .into_iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>(),
            }
            .fail(),
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Document> {
    serde_json::from_slice(body).context(error::BodySnafu)
}

/// Separates "there's nothing there" and documents the store can't hold from real store
/// failures.
fn store_error(e: treestore::Error, path: &StorePath) -> Error {
    match e {
        treestore::Error::NotFound { path } => Error::NotFound { path },
        treestore::Error::UnstorableKey { pointer, .. } => Error::Unstorable {
            location: schema::location(path, &pointer),
        },
        source => Error::Store {
            source: Box::new(source),
        },
    }
}

/// For table reads, records each child's name inside its document.
fn with_dir_name(doc: Document, dir_name: Option<&str>, name: String) -> Document {
    match (doc, dir_name) {
        (Document::Object(mut map), Some(field)) => {
            map.insert(field.to_string(), Document::String(name));
            Document::Object(map)
        }
        (doc, _) => doc,
    }
}

pub mod error {
    use super::INTERNAL_ERROR_MESSAGE;
    use crate::{patch, routes, schema};
    use snafu::Snafu;

    /// Everything that can end a request early.  Each maps to a status code and the messages
    /// the client sees.
    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", source))]
        Route { source: routes::Error },

        #[snafu(display("No document at '{}'", path))]
        NotFound { path: String },

        #[snafu(display("Request body is not valid JSON: {}", source))]
        Body { source: serde_json::Error },

        #[snafu(display("{}", source))]
        Patch { source: patch::Error },

        #[snafu(display("Document failed validation: {}", violations.join("; ")))]
        Invalid { violations: Vec<String> },

        #[snafu(display("{}: key can't be stored", location))]
        Unstorable { location: String },

        #[snafu(display("Schema error: {}", source))]
        Schema { source: schema::Error },

        #[snafu(display("Store error: {}", source))]
        Store {
            #[snafu(source(from(treestore::Error, Box::new)))]
            source: Box<treestore::Error>,
        },
    }

    impl Error {
        pub fn status(&self) -> u16 {
            match self {
                Error::Route { source } => match source {
                    routes::Error::NoRoute { .. } => 404,
                    routes::Error::MethodNotAllowed { .. } => 405,
                    routes::Error::UnknownMethod { .. } => 405,
                    routes::Error::StorePath { .. } => 400,
                    _ => 500,
                },
                Error::NotFound { .. } => 404,
                Error::Body { .. } => 400,
                Error::Patch { .. } => 400,
                Error::Invalid { .. } => 400,
                Error::Unstorable { .. } => 400,
                Error::Schema { .. } => 500,
                Error::Store { .. } => 500,
            }
        }

        /// The methods the path does allow, when the method was the problem.
        pub fn allow(&self) -> Option<String> {
            match self {
                Error::Route {
                    source: routes::Error::MethodNotAllowed { allowed, .. },
                } => Some(
                    allowed
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                _ => None,
            }
        }

        /// The error list sent to the client.
        pub fn messages(&self) -> Vec<String> {
            match self {
                Error::Invalid { violations } => violations.clone(),
                _ if self.status() >= 500 => vec![INTERNAL_ERROR_MESSAGE.to_string()],
                _ => vec![self.to_string()],
            }
        }
    }
}
