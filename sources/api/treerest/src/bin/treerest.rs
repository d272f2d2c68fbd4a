//! The treerest server binary.

#[macro_use]
extern crate log;

use argh::FromArgs;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use treestore::{FilesystemStore, MemoryStore};

use treerest::{serve, ServerConfig};

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("{}", source))]
        Config { source: treerest::config::Error },

        #[snafu(display("Unable to open store: {}", source))]
        Store { source: treestore::Error },

        #[snafu(display("{}", source))]
        Server { source: treerest::server::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },
    }
}

/// Formats accepted by --print-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

impl FromStr for ConfigFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            other => Err(format!("unknown format '{}', expected json or toml", other)),
        }
    }
}

/// Serves JSON documents kept in a hierarchical store.
#[derive(FromArgs, Debug)]
struct Args {
    /// configuration file; TOML, or JSON if it ends in .json
    #[argh(option)]
    config: Option<PathBuf>,
    /// log-level trace|debug|info|warn|error
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
    /// address to listen on
    #[argh(option)]
    bind: Option<String>,
    /// directory holding the store
    #[argh(option)]
    store_path: Option<String>,
    /// keep documents in memory; nothing survives a restart
    #[argh(switch)]
    memory: bool,
    /// wrap responses in an envelope unless the request says otherwise
    #[argh(switch)]
    envelope: bool,
    /// send compact JSON unless the request says otherwise
    #[argh(switch)]
    no_indent: bool,
    /// base URI for schema references
    #[argh(option)]
    schema_uri: Option<String>,
    /// print the effective configuration as json or toml, then exit
    #[argh(option)]
    print_config: Option<ConfigFormat>,
}

/// Loads the config file, if any, and applies the command-line overrides on top.
fn effective_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path).context(error::ConfigSnafu)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(path) = &args.store_path {
        config.store.path = path.clone();
    }
    if let Some(uri) = &args.schema_uri {
        config.schema_uri = uri.clone();
    }
    if args.envelope {
        config.envelope = true;
    }
    if args.no_indent {
        config.indent = false;
    }
    Ok(config)
}

async fn run() -> Result<()> {
    let args: Args = argh::from_env();

    // Errors go to stderr, everything else to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    let config = effective_config(&args)?;

    if let Some(format) = args.print_config {
        let rendered = match format {
            ConfigFormat::Json => config.to_json(),
            ConfigFormat::Toml => config.to_toml(),
        }
        .context(error::ConfigSnafu)?;
        println!("{}", rendered);
        return Ok(());
    }

    let threads_suffix = match config.threads {
        n if n > 1 => "s",
        _ => "",
    };
    if args.memory {
        info!(
            "Starting server at {} with {} thread{} and an in-memory store",
            config.bind, config.threads, threads_suffix
        );
        let dispatcher = config
            .dispatcher(MemoryStore::new())
            .context(error::ConfigSnafu)?;
        serve(&config, dispatcher).await.context(error::ServerSnafu)
    } else {
        info!(
            "Starting server at {} with {} thread{} and store at {}",
            config.bind, config.threads, threads_suffix, config.store.path
        );
        let store = FilesystemStore::create(&config.store.path).context(error::StoreSnafu)?;
        let dispatcher = config.dispatcher(store).context(error::ConfigSnafu)?;
        serve(&config, dispatcher).await.context(error::ServerSnafu)
    }
}

// Errors are printed with Display rather than the Debug form a Result-returning main would use.
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
