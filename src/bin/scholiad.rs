//! scholiad - annotation server daemon
//!
//! Runs controller instances back to back: a `restart` command rebuilds the
//! instance from a freshly loaded configuration, `shutdown` exits.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use scholia::config::{InterfaceConfig, ServerConfig};
use scholia::controller::Outcome;
use scholia::host;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "scholiad")]
#[command(about = "Collaborative text-annotation server", long_about = None)]
struct Cli {
    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve(ServeArgs),

    /// Write a default configuration file
    Init {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Listen address, repeatable; replaces the configured interfaces
    #[arg(short, long)]
    listen: Vec<String>,

    /// Load the bundled sample paper on start
    #[arg(long)]
    toy_data: bool,

    /// Enable diagnostic commands and debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Serve(ServeArgs::default()));

    let level = match &command {
        Commands::Serve(args) if args.debug => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match command {
        Commands::Init { path, force } => {
            if path.exists() && !force {
                bail!("{:?} already exists (use --force to overwrite)", path);
            }
            ServerConfig::default()
                .write(&path)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote default configuration to {:?}", path);
            Ok(())
        }
        Commands::Serve(args) => serve(cli.config.as_deref(), &args).await,
    }
}

fn load_config(path: Option<&Path>, args: &ServeArgs) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    if !args.listen.is_empty() {
        config.interfaces = args
            .listen
            .iter()
            .enumerate()
            .map(|(index, listen)| InterfaceConfig {
                name: format!("listen-{}", index),
                listen: listen.clone(),
            })
            .collect();
    }
    if args.toy_data {
        config.provider.seed_toy_data = true;
    }
    if args.debug {
        config.debug = true;
    }

    config.validate()?;
    Ok(config)
}

async fn serve(path: Option<&Path>, args: &ServeArgs) -> anyhow::Result<()> {
    let mut generation: u64 = 0;
    loop {
        generation += 1;
        let config = load_config(path, args).context("Failed to load configuration")?;
        info!(generation, interfaces = config.interfaces.len(), "starting controller instance");

        let outcome = host::start_instance(&config)
            .await
            .context("Controller instance failed")?;
        match outcome {
            Outcome::Restart => info!(generation, "restarting"),
            Outcome::Shutdown => {
                info!(generation, "shutting down");
                return Ok(());
            }
        }
    }
}
