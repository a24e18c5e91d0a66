//! mt5-bridge CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use mt5_bridge::config::BridgeConfig;
use mt5_bridge::server;

#[derive(Parser)]
#[command(name = "mt5-bridge")]
#[command(about = "Multi-tenant HTTP/WebSocket bridge over isolated MetaTrader 5 terminals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server
    Run {
        /// Configuration file (default: the platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Write logs to this directory instead of stdout
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (default: the platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            host,
            port,
            log_dir,
            debug,
        } => {
            let path = config.unwrap_or_else(BridgeConfig::default_path);
            let mut config = BridgeConfig::load_with_env(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.validate()?;

            let _guard = init_logging(&config.log_level, debug, log_dir.as_deref())?;
            server::run_server(config).await
        }

        Commands::Config { config } => {
            let path = config.unwrap_or_else(BridgeConfig::default_path);
            let config = BridgeConfig::load_with_env(&path)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }

        Commands::Version => {
            println!("mt5-bridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Console logging by default; file logging with a non-blocking writer when
/// a log directory is given. The returned guard must outlive the server.
fn init_logging(
    level: &str,
    debug: bool,
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = if debug { "debug" } else { level };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "bridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            Ok(None)
        }
    }
}
