//! TimerSync - synchronized countdown timers
//!
//! Usage:
//!   timersync [OPTIONS] node [NODE OPTIONS]     Run a node with a console
//!   timersync [OPTIONS] directory [--bind ADDR] Run the directory server
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use timersync::config::Config;
use timersync::console;
use timersync::directory::DirectoryServer;
use timersync::node::Node;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// TimerSync - synchronized countdown timers
#[derive(Parser, Debug)]
#[command(name = "timersync")]
#[command(author = "TimerSync Contributors")]
#[command(version)]
#[command(about = "Countdown timers shared between a parent node and its children")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run a cluster node with an interactive console
    Node {
        /// Peer listener bind address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Directory server address
        #[arg(short, long)]
        directory: Option<String>,

        /// Preferred node identifier
        #[arg(long)]
        id: Option<String>,

        /// Maximum number of children this node accepts as parent
        #[arg(long)]
        max_children: Option<usize>,
    },
    /// Run the directory (rendezvous) server
    Directory {
        /// TCP bind address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File config if given, else defaults plus TIMERSYNC__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    match args.command {
        Mode::Node {
            listen,
            directory,
            id,
            max_children,
        } => {
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            if let Some(directory) = directory {
                config.directory.address = directory;
            }
            if id.is_some() {
                config.node.id = id;
            }
            if let Some(max_children) = max_children {
                config.cluster.max_children = max_children;
            }
            if let Err(e) = config.validate() {
                eprintln!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
            run_node(&config).await
        }
        Mode::Directory { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            run_directory(&config).await
        }
    }
}

async fn run_node(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::start(config).await?;

    tokio::select! {
        result = console::run(node.handle()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    node.shutdown().await;
    Ok(())
}

async fn run_directory(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = DirectoryServer::bind(&config.server).await?;
    info!("Starting TimerSync directory server");
    info!("  Bind address: {}", server.local_addr()?);
    info!("  Identifier digits: {}", config.server.id_digits);

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    Ok(())
}
