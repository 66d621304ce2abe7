//! podterm server
//!
//! Serves browser terminals into workload containers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use server::config::Config;
use server::{AppState, JwtValidator};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// podterm - browser terminals into workload containers.
#[derive(Parser, Debug)]
#[command(name = "podterm-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the terminal server
    Serve {
        /// Address to listen on, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Mint a signed access token for development
    Token {
        /// Subject claim
        #[arg(long, default_value = "dev")]
        subject: String,

        /// Lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    if let Commands::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        config.server.listen = listen.clone();
    }

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Serve { .. } => {
            config.validate()?;
            serve(&config).await
        }
        Commands::Config => {
            let mut shown = config.clone();
            if !shown.auth.jwt_secret.is_empty() {
                shown.auth.jwt_secret = "<redacted>".to_string();
            }
            print!("{}", shown.to_toml()?);
            Ok(())
        }
        Commands::Token { subject, ttl } => {
            if config.auth.jwt_secret.is_empty() {
                anyhow::bail!("No jwt_secret configured; set [auth] jwt_secret or PODTERM_JWT_SECRET");
            }
            let validator = JwtValidator::new(
                config.auth.jwt_secret.as_bytes(),
                Duration::from_secs(config.auth.leeway_secs),
            );
            let token = validator
                .issue(&subject, Duration::from_secs(ttl))
                .context("Failed to sign token")?;
            println!("{token}");
            Ok(())
        }
    }
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(
        exec = ?config.exec.mode,
        discovery = ?config.discovery.mode,
        shells = ?config.session.shells,
        max_sessions = config.session.max_sessions,
        "podterm server starting"
    );

    let shutdown = CancellationToken::new();
    let sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    tokio::spawn(wait_for_shutdown_signal(sigterm, sigint, shutdown.clone()));

    server::http::serve(listener, AppState::from_config(config), shutdown)
        .await
        .context("Server error")?;

    tracing::info!("podterm server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal(
    mut sigterm: Signal,
    mut sigint: Signal,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    shutdown.cancel();
}
