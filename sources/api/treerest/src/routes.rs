//! The route table binds request paths to store paths.
//!
//! A route pattern is a slash-delimited path whose segments are either literal text or a whole
//! segment placeholder like `{name}`, which captures the (percent-decoded) request segment.  The
//! store path template is plain text with the same `{name}` placeholders substituted in order;
//! placeholders captured by the pattern but not used by the template are dropped.
//!
//! Routes are registered once at startup.  Any problem with a route is found at registration,
//! so resolving a request never fails because of the configuration.

use log::{debug, info, trace};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use treestore::StorePath;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The request methods a route can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Patch,
    Delete,
}

impl Method {
    /// Whether the method changes the store, and so needs validation.
    pub fn is_write(self) -> bool {
        matches!(self, Method::Put | Method::Post | Method::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "GET" => Method::Get,
            "PUT" => Method::Put,
            "POST" => Method::Post,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            _ => return error::UnknownMethodSnafu { method: s }.fail(),
        })
    }
}

/// A declared binding of an endpoint pattern to a store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: String,
    pub store_template: String,
    /// Reference to the schema that documents written through this route must satisfy.
    pub schema: Option<String>,
    pub methods: BTreeSet<Method>,
    /// Collection routes read every child of the store path rather than a single document.
    pub is_collection: bool,
    /// For table reads of a collection, the field that receives each child's name.
    pub dir_name: Option<String>,
}

/// The outcome of resolving a request against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub store_path: StorePath,
    pub schema: Option<&'a str>,
    pub is_collection: bool,
    pub dir_name: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Text(String),
    Var(String),
}

#[derive(Debug)]
struct CompiledRoute {
    route: Route,
    segments: Vec<Segment>,
    template: Vec<TemplatePart>,
}

impl CompiledRoute {
    /// Returns the captured values, by name, if the request segments match this route.
    fn captures<'r>(&self, request: &'r [String]) -> Option<Vec<(&str, &'r str)>> {
        if request.len() != self.segments.len() {
            return None;
        }
        let mut captures = Vec::new();
        for (segment, given) in self.segments.iter().zip(request) {
            match segment {
                Segment::Literal(literal) if literal == given => {}
                Segment::Literal(_) => return None,
                Segment::Capture(name) => captures.push((name.as_str(), given.as_str())),
            }
        }
        Some(captures)
    }

    /// The shape of the pattern, ignoring placeholder names; two routes with the same shape
    /// match exactly the same requests.
    fn shape(&self) -> Vec<Option<&str>> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(literal) => Some(literal.as_str()),
                Segment::Capture(_) => None,
            })
            .collect()
    }
}

/// The set of registered routes, in registration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    prefix: String,
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Creates an empty table whose patterns all live under the given path prefix, e.g. "/api".
    pub fn new<S: AsRef<str>>(prefix: S) -> Self {
        let prefix = prefix.as_ref().trim_end_matches('/');
        let prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };
        Self {
            prefix,
            routes: Vec::new(),
        }
    }

    /// Adds a route to the table.  The table's prefix is prepended to the route's pattern.
    pub fn register(&mut self, mut route: Route) -> Result<()> {
        route.pattern = format!("{}{}", self.prefix, route.pattern);
        let segments = parse_pattern(&route.pattern)?;
        let template = parse_template(&route.store_template)?;

        let captured: HashSet<&str> = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Capture(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect();
        for part in &template {
            if let TemplatePart::Var(name) = part {
                ensure!(
                    captured.contains(name.as_str()),
                    error::TemplatePlaceholderSnafu {
                        template: &route.store_template,
                        name,
                        pattern: &route.pattern,
                    }
                );
            }
        }

        ensure!(
            !route.methods.is_empty(),
            error::NoMethodsSnafu {
                pattern: &route.pattern
            }
        );
        ensure!(
            route.schema.is_some() || !route.methods.iter().any(|m| m.is_write()),
            error::MissingSchemaSnafu {
                pattern: &route.pattern
            }
        );

        let compiled = CompiledRoute {
            route,
            segments,
            template,
        };
        let shape = compiled.shape();
        for existing in self.routes.iter().filter(|r| r.shape() == shape) {
            if let Some(method) = existing
                .route
                .methods
                .intersection(&compiled.route.methods)
                .next()
            {
                return error::DuplicateRouteSnafu {
                    method: *method,
                    pattern: &compiled.route.pattern,
                }
                .fail();
            }
        }

        info!(
            "Registered route {} -> {} for {}",
            compiled.route.pattern,
            compiled.route.store_template,
            compiled
                .route
                .methods
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.routes.push(compiled);
        Ok(())
    }

    /// Finds the route for the given request and builds its store path.
    ///
    /// Fails with NoRoute if no pattern matches, or MethodNotAllowed if a pattern matches but
    /// none that match allow the method.
    pub fn resolve(&self, method: Method, path: &str) -> Result<Resolved<'_>> {
        let request = match split_request_path(path) {
            Some(segments) => segments,
            None => return error::NoRouteSnafu { path }.fail(),
        };

        let mut allowed = BTreeSet::new();
        for compiled in &self.routes {
            let captures = match compiled.captures(&request) {
                Some(captures) => captures,
                None => continue,
            };
            if !compiled.route.methods.contains(&method) {
                allowed.extend(compiled.route.methods.iter().copied());
                continue;
            }

            trace!(
                "Request '{}' matched '{}' with {:?}",
                path,
                compiled.route.pattern,
                captures
            );
            let store_path = substitute(&compiled.template, &captures, path)?;
            debug!("Resolved {} {} to store path {}", method, path, store_path);
            return Ok(Resolved {
                store_path,
                schema: compiled.route.schema.as_deref(),
                is_collection: compiled.route.is_collection,
                dir_name: compiled.route.dir_name.as_deref(),
            });
        }

        ensure!(!allowed.is_empty(), error::NoRouteSnafu { path });
        error::MethodNotAllowedSnafu {
            method,
            path,
            allowed: allowed.into_iter().collect::<Vec<_>>(),
        }
        .fail()
    }
}

/// Parses a route pattern into segments.  "/" is the empty pattern.
fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    let rest = match pattern.strip_prefix('/') {
        Some(rest) => rest,
        None => {
            return error::InvalidPatternSnafu {
                pattern,
                msg: "must start with '/'",
            }
            .fail()
        }
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let mut names = HashSet::new();
    let mut segments = Vec::new();
    for segment in rest.split('/') {
        ensure!(
            !segment.is_empty(),
            error::InvalidPatternSnafu {
                pattern,
                msg: "empty segment",
            }
        );
        let parsed = match segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
        {
            Some(name) => {
                ensure!(
                    is_placeholder_name(name),
                    error::InvalidPatternSnafu {
                        pattern,
                        msg: format!("bad placeholder '{}'", segment),
                    }
                );
                ensure!(
                    names.insert(name),
                    error::InvalidPatternSnafu {
                        pattern,
                        msg: format!("placeholder '{}' used twice", name),
                    }
                );
                Segment::Capture(name.to_string())
            }
            None => {
                ensure!(
                    !segment.contains(['{', '}']),
                    error::InvalidPatternSnafu {
                        pattern,
                        msg: format!("placeholders must be whole segments, found '{}'", segment),
                    }
                );
                Segment::Literal(segment.to_string())
            }
        };
        segments.push(parsed);
    }
    Ok(segments)
}

/// Parses a store path template into text and placeholders.
fn parse_template(template: &str) -> Result<Vec<TemplatePart>> {
    let mut parts = Vec::new();
    let mut rest = template;
    while !rest.is_empty() {
        match rest.find(['{', '}']) {
            None => {
                parts.push(TemplatePart::Text(rest.to_string()));
                break;
            }
            Some(start) => {
                ensure!(
                    rest[start..].starts_with('{'),
                    error::InvalidTemplateSnafu {
                        template,
                        msg: "unmatched '}'",
                    }
                );
                if start > 0 {
                    parts.push(TemplatePart::Text(rest[..start].to_string()));
                }
                let after = &rest[start + 1..];
                let end = match after.find('}') {
                    Some(end) => end,
                    None => {
                        return error::InvalidTemplateSnafu {
                            template,
                            msg: "unclosed '{'",
                        }
                        .fail()
                    }
                };
                let name = &after[..end];
                ensure!(
                    is_placeholder_name(name),
                    error::InvalidTemplateSnafu {
                        template,
                        msg: format!("bad placeholder '{{{}}}'", name),
                    }
                );
                parts.push(TemplatePart::Var(name.to_string()));
                rest = &after[end + 1..];
            }
        }
    }
    Ok(parts)
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Splits a request path into percent-decoded segments.  Returns None if the path can't match
/// any route, e.g. because it has an empty segment.
fn split_request_path(path: &str) -> Option<Vec<String>> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Some(Vec::new());
    }
    rest.split('/')
        .map(|segment| {
            if segment.is_empty() {
                return None;
            }
            percent_decode_str(segment)
                .decode_utf8()
                .ok()
                .map(|cow| cow.into_owned())
        })
        .collect()
}

/// Builds the store path for a matched request.  Captured values must each be usable as a
/// single store path segment, so a request can't reach outside the route's subtree.
fn substitute(
    template: &[TemplatePart],
    captures: &[(&str, &str)],
    path: &str,
) -> Result<StorePath> {
    let mut rendered = String::new();
    for part in template {
        match part {
            TemplatePart::Text(text) => rendered.push_str(text),
            TemplatePart::Var(name) => {
                // Registration checked that every placeholder is captured.
                let value = captures
                    .iter()
                    .find(|(captured, _)| *captured == name.as_str())
                    .map(|(_, value)| *value)
                    .unwrap_or_default();
                StorePath::check_segment(path, value).context(error::StorePathSnafu { path })?;
                rendered.push_str(value);
            }
        }
    }
    StorePath::new(&rendered).context(error::StorePathSnafu { path })
}

pub mod error {
    use super::Method;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unknown method '{}'", method))]
        UnknownMethod { method: String },

        #[snafu(display("Invalid route pattern '{}': {}", pattern, msg))]
        InvalidPattern { pattern: String, msg: String },

        #[snafu(display("Invalid store path template '{}': {}", template, msg))]
        InvalidTemplate { template: String, msg: String },

        #[snafu(display(
            "Store path template '{}' uses '{{{}}}', which route '{}' doesn't capture",
            template,
            name,
            pattern
        ))]
        TemplatePlaceholder {
            template: String,
            name: String,
            pattern: String,
        },

        #[snafu(display("Route '{}' allows no methods", pattern))]
        NoMethods { pattern: String },

        #[snafu(display("Route '{}' allows writes but has no schema", pattern))]
        MissingSchema { pattern: String },

        #[snafu(display("Duplicate route for {} {}", method, pattern))]
        DuplicateRoute { method: Method, pattern: String },

        #[snafu(display("No route for '{}'", path))]
        NoRoute { path: String },

        #[snafu(display("Method {} not allowed for '{}'", method, path))]
        MethodNotAllowed {
            method: Method,
            path: String,
            allowed: Vec<Method>,
        },

        #[snafu(display("Request path '{}' doesn't give a valid store path: {}", path, source))]
        StorePath {
            path: String,
            source: treestore::Error,
        },
    }
}
