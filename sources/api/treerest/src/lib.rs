/*!
# Background

treerest serves JSON documents over HTTP, keeping them in a hierarchical store where every
scalar is a leaf and every object or array is a directory.  See the treestore crate for the
storage side.

Requests are matched against a table of routes.  Each route maps a URL pattern with `{name}`
placeholders to a store path template and names the methods it allows.  Routes that allow
writes also name a JSON Schema, and no document is written unless it satisfies that schema.

# Requests

* GET reads the document under the resolved store path.  A collection route reads every child
  and returns them keyed by name, or as an array with `?table=true`.
* PUT replaces the document and answers 200; POST does the same and answers 201.
* PATCH reads the current document, applies a JSON Merge Patch or JSON Patch depending on the
  content type, validates the result, and writes it.
* DELETE removes the subtree and answers 204.

Responses are plain JSON, or wrapped as `{"code": ..., "data": ...}` with `?envelope=true`.
Errors are a list of messages in the same shape.

# Configuration

The [config] module describes the configuration file.  The `treerest` binary loads it, applies
command-line overrides, and starts the [server].
*/

pub mod config;
pub mod dispatcher;
pub mod patch;
pub mod routes;
pub mod schema;
pub mod server;
pub mod writer;

pub use config::ServerConfig;
pub use dispatcher::{Dispatcher, Request};
pub use server::serve;
