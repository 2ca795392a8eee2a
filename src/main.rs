use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

#[derive(Parser)]
#[command(name = "buildbox")]
#[command(version, about = "Isolated template builds and live preview for a low-code editor")]
pub struct Cli {
    /// Debug-level logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the build HTTP server
    Serve {
        /// Port to serve on (overrides buildbox.toml and BUILDBOX_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,

        /// Open the server in a browser once it is listening
        #[arg(long)]
        open: bool,
    },
    /// Run a single build in-process and wait for the archive
    Build {
        /// Project name used for the archive filename
        #[arg(short, long)]
        name: String,

        /// Path to the JSON schema document
        #[arg(short, long)]
        schema: PathBuf,

        /// Copy the finished archive here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Boot a local container over the template and run its dev server
    Preview {
        /// Skip dependency installation
        #[arg(long)]
        no_install: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and print warnings
    Validate,
    /// Write a default buildbox.toml
    Init,
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Install the global subscriber. With `log_dir`, logs are also written to a
/// daily rolling file there; the returned guard must live until exit.
fn init_tracing(
    verbose: bool,
    log_json: bool,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = log_json || env_bool("BUILDBOX_LOG_JSON");

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "buildbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    // A missing .env is normal.
    let _ = dotenvy::from_path(project_dir.join(".env"));

    let _log_guard = match &cli.command {
        Commands::Serve { .. } => {
            let log_dir = cmd::serve::server_log_dir(&project_dir);
            init_tracing(cli.verbose, cli.log_json, log_dir.as_deref())
        }
        _ => init_tracing(cli.verbose, cli.log_json, None),
    };

    match &cli.command {
        Commands::Serve { port, dev, open } => {
            cmd::cmd_serve(&project_dir, *port, *dev, *open).await?;
        }
        Commands::Build { name, schema, out } => {
            cmd::cmd_build(&project_dir, name, schema, out.as_deref()).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Preview { no_install } => {
            cmd::cmd_preview(&project_dir, *no_install).await?;
        }
    }

    Ok(())
}
