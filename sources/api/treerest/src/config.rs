//! Server configuration, loaded once at startup.
//!
//! The file is TOML unless its extension is `.json`.  Every field has a default, except that at
//! least one `[[routes]]` entry is needed to build a working server.  Each entry declares a
//! collection and a resource inside it, for example:
//!
//! ```toml
//! [[routes]]
//! collection = "/items"
//! collection-path = "/items"
//! resource = "/items/{name}"
//! resource-path = "/items/{name}"
//! schema = "item.json"
//! dir-name = "id"
//! ```

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use treestore::{Store, StoreAdapter};

use crate::dispatcher::Dispatcher;
use crate::patch::PatchMode;
use crate::routes::{Method, Route, RouteTable};
use crate::schema::SchemaValidator;
use crate::writer::ResponseDefaults;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_SCHEMA_URI: &str = "file://schemas";
pub const DEFAULT_STORE_PATH: &str = "/var/lib/treerest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    /// Prepended to every route pattern.
    pub prefix: String,
    pub envelope: bool,
    pub indent: bool,
    /// Used for PATCH requests whose content type doesn't name a format.
    pub patch_mode: PatchMode,
    pub schema_uri: String,
    /// Deadline for the store work of one request.
    pub store_timeout_secs: u64,
    pub threads: usize,
    pub max_body_bytes: usize,
    pub store: StoreConfig,
    pub routes: Vec<RouteConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            prefix: String::new(),
            envelope: false,
            indent: true,
            patch_mode: PatchMode::Merge,
            schema_uri: DEFAULT_SCHEMA_URI.to_string(),
            store_timeout_secs: 5,
            threads: 4,
            max_body_bytes: 1024 * 1024,
            store: StoreConfig::default(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_STORE_PATH.to_string(),
        }
    }
}

/// A collection and the resources inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RouteConfig {
    pub collection: String,
    pub collection_path: String,
    pub resource: String,
    pub resource_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_name: Option<String>,
    /// Methods allowed on the resource; the collection only answers GET.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<Method>>,
}

impl RouteConfig {
    /// Expands the entry into its collection route and resource route.
    pub fn routes(&self) -> [Route; 2] {
        let methods = match &self.methods {
            Some(methods) => methods.iter().copied().collect(),
            None => [
                Method::Get,
                Method::Put,
                Method::Post,
                Method::Patch,
                Method::Delete,
            ]
            .into_iter()
            .collect(),
        };
        [
            Route {
                pattern: self.collection.clone(),
                store_template: self.collection_path.clone(),
                schema: self.schema.clone(),
                methods: BTreeSet::from([Method::Get]),
                is_collection: true,
                dir_name: self.dir_name.clone(),
            },
            Route {
                pattern: self.resource.clone(),
                store_template: self.resource_path.clone(),
                schema: self.schema.clone(),
                methods,
                is_collection: false,
                dir_name: None,
            },
        ]
    }
}

impl ServerConfig {
    /// Reads the configuration file, as JSON if it ends in `.json` and TOML otherwise.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(error::ReadConfigSnafu { path })?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: Self = if is_json {
            serde_json::from_str(&raw).context(error::ParseJsonSnafu { path })?
        } else {
            toml::from_str(&raw).context(error::ParseTomlSnafu { path })?
        };
        config.check()?;
        Ok(config)
    }

    /// Catches values that parse but can't run a server.
    pub fn check(&self) -> Result<()> {
        ensure!(self.threads > 0, error::NoThreadsSnafu);
        Ok(())
    }

    pub fn response_defaults(&self) -> ResponseDefaults {
        ResponseDefaults {
            envelope: self.envelope,
            indent: self.indent,
        }
    }

    /// Builds the route table from the `[[routes]]` entries.
    pub fn route_table(&self) -> Result<RouteTable> {
        ensure!(!self.routes.is_empty(), error::NoRoutesSnafu);

        let mut table = RouteTable::new(&self.prefix);
        for entry in &self.routes {
            for route in entry.routes() {
                table.register(route).context(error::RouteSnafu)?;
            }
        }
        Ok(table)
    }

    /// Wires a dispatcher for the given store.
    pub fn dispatcher<S: Store>(&self, store: S) -> Result<Dispatcher<S>> {
        let routes = self.route_table()?;
        let validator = SchemaValidator::new(&self.schema_uri).context(error::SchemaSnafu)?;
        Ok(Dispatcher::new(
            StoreAdapter::new(store),
            routes,
            validator,
            self.response_defaults(),
            self.patch_mode,
        ))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context(error::SerializeTomlSnafu)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(error::SerializeJsonSnafu)
    }
}

pub mod error {
    use crate::{routes, schema};
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
        ReadConfig { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to parse TOML config file {}: {}", path.display(), source))]
        ParseToml {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Failed to parse JSON config file {}: {}", path.display(), source))]
        ParseJson {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("No routes specified"))]
        NoRoutes,

        #[snafu(display("threads must be at least 1"))]
        NoThreads,

        #[snafu(display("Bad route: {}", source))]
        Route { source: routes::Error },

        #[snafu(display("Bad schema configuration: {}", source))]
        Schema { source: schema::Error },

        #[snafu(display("Failed to render config as TOML: {}", source))]
        SerializeToml { source: toml::ser::Error },

        #[snafu(display("Failed to render config as JSON: {}", source))]
        SerializeJson { source: serde_json::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    const EXAMPLE: &str = r#"
bind = "127.0.0.1:9000"
prefix = "/api"
envelope = true
patch-mode = "json-patch"

[store]
path = "/tmp/store"

[[routes]]
collection = "/items"
collection-path = "/items"
resource = "/items/{name}"
resource-path = "/items/{name}"
schema = "item.json"
dir-name = "id"

[[routes]]
collection = "/users/{user}/notes"
collection-path = "/notes/{user}"
resource = "/users/{user}/notes/{note}"
resource-path = "/notes/{user}/{note}"
schema = "note.json"
methods = ["GET", "PUT"]
"#;

    #[test]
    fn defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.prefix, "");
        assert!(!config.envelope);
        assert!(config.indent);
        assert_eq!(config.patch_mode, PatchMode::Merge);
        assert_eq!(config.schema_uri, "file://schemas");
        assert_eq!(config.store_timeout_secs, 5);
        assert_eq!(config.threads, 4);
        assert_eq!(config.max_body_bytes, 1_048_576);
        assert_eq!(config.store.path, "/var/lib/treerest");
    }

    #[test]
    fn parse_example() {
        let config: ServerConfig = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert!(config.envelope);
        assert!(config.indent);
        assert_eq!(config.patch_mode, PatchMode::JsonPatch);
        assert_eq!(config.store.path, "/tmp/store");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].dir_name.as_deref(), Some("id"));
        assert_eq!(
            config.routes[1].methods,
            Some(vec![Method::Get, Method::Put])
        );
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<ServerConfig>("bnd = \"x\"").is_err());
    }

    #[test]
    fn routes_expand_in_pairs() {
        let config: ServerConfig = toml::from_str(EXAMPLE).unwrap();
        let table = config.route_table().unwrap();

        let resolved = table.resolve(Method::Get, "/api/items").unwrap();
        assert!(resolved.is_collection);
        assert_eq!(resolved.dir_name, Some("id"));
        assert!(table.resolve(Method::Put, "/api/items").is_err());

        let resolved = table.resolve(Method::Put, "/api/users/bob/notes/n1").unwrap();
        assert_eq!(resolved.store_path.to_string(), "/notes/bob/n1");
        assert_eq!(resolved.schema, Some("note.json"));
        assert!(table
            .resolve(Method::Delete, "/api/users/bob/notes/n1")
            .is_err());
    }

    #[test]
    fn zero_routes() {
        let err = ServerConfig::default().route_table().unwrap_err();
        assert!(matches!(err, Error::NoRoutes));
        assert_eq!(err.to_string(), "No routes specified");
    }

    #[test]
    fn writable_route_needs_schema() {
        let mut config: ServerConfig = toml::from_str(EXAMPLE).unwrap();
        config.routes[0].schema = None;
        assert!(matches!(
            config.route_table(),
            Err(Error::Route { .. })
        ));
    }

    #[test]
    fn load_by_extension() {
        let dir = TempDir::new().unwrap();
        let expected: ServerConfig = toml::from_str(EXAMPLE).unwrap();

        let toml_path = dir.path().join("treerest.toml");
        fs::write(&toml_path, EXAMPLE).unwrap();
        assert_eq!(ServerConfig::load(&toml_path).unwrap(), expected);

        let json_path = dir.path().join("treerest.json");
        fs::write(&json_path, expected.to_json().unwrap()).unwrap();
        assert_eq!(ServerConfig::load(&json_path).unwrap(), expected);

        assert!(matches!(
            ServerConfig::load(dir.path().join("missing.toml")),
            Err(Error::ReadConfig { .. })
        ));
        fs::write(&json_path, EXAMPLE).unwrap();
        assert!(matches!(
            ServerConfig::load(&json_path),
            Err(Error::ParseJson { .. })
        ));
    }

    #[test]
    fn zero_threads_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("treerest.toml");
        fs::write(&path, "threads = 0").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::NoThreads));
        assert_eq!(err.to_string(), "threads must be at least 1");

        fs::write(&path, "threads = 1").unwrap();
        assert_eq!(ServerConfig::load(&path).unwrap().threads, 1);
    }

    #[test]
    fn printed_toml_reloads() {
        let config: ServerConfig = toml::from_str(EXAMPLE).unwrap();
        let printed = config.to_toml().unwrap();
        assert_eq!(toml::from_str::<ServerConfig>(&printed).unwrap(), config);
    }
}
