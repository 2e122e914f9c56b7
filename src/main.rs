//! toolhub-mcp: MCP tool server with progressive tool loading and async jobs
//!
//! Serves one client over stdio. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use toolhub_mcp::config::{self, Config};
use toolhub_mcp::mcp::{McpServer, ProtocolServer, ServerServices};
use toolhub_mcp::registry_client::{HealthSource, RegistryClient};

/// MCP tool server with progressive tool loading and async jobs.
///
/// Discovers tools from JSON manifests, negotiates protocol versions with
/// clients, and runs long tool calls as pollable jobs.
#[derive(Parser, Debug)]
#[command(name = "toolhub-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Directory of tool manifests (overrides the configuration file)
    #[arg(long, value_name = "DIR")]
    tools_dir: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the server, registers it if configured, and serves stdio until
/// EOF or a signal.
async fn serve(cfg: Config) -> std::io::Result<()> {
    let server = Arc::new(ProtocolServer::new(&cfg, ServerServices::default()));
    let mut sweeper = server.jobs().start_sweeper();

    let registry = if cfg.registry.enabled {
        match RegistryClient::new(&cfg.registry, &cfg.server) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!(error = %e, "Registry client unavailable; continuing without discovery");
                None
            }
        }
    } else {
        None
    };

    let mut reporter = None;
    if let Some(client) = &registry {
        if client.register().await {
            let source: Arc<dyn HealthSource> = server.clone();
            reporter = Some(client.start_health_reporting(
                source,
                Duration::from_secs(cfg.registry.health_interval_secs),
            ));
        }
    }

    info!("MCP server ready, waiting for client connection...");
    let mut mcp = McpServer::stdio(Arc::clone(&server));
    let result = mcp.run().await;

    if let Some(mut reporter) = reporter {
        reporter.stop().await;
    }
    if let Some(client) = &registry {
        client.unregister().await;
    }
    sweeper.stop().await;

    result
}

/// Entry point for the toolhub-mcp server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config_or_default(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = args.tools_dir {
        cfg.tools.directory = Some(dir);
    }

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_id = %cfg.server.server_id,
        tools_dir = ?cfg.tools.directory,
        "Starting toolhub-mcp server"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg)) {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
