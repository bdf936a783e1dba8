//! Aegis connectivity client - Entry Point

use aegis_client::{AppConfig, ConnectivityService};
use aegis_core::SystemClock;
use aegis_session::{Credentials, LoginOutcome, SessionStatus};
use aegis_ws::WsMessage;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Aegis security platform connectivity client
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via AEGIS_CONFIG env var)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as TOML
    Config,
    /// Log in and print frames from the named channels as JSON lines
    Watch {
        /// Channel names from the configuration
        #[arg(required = true)]
        channels: Vec<String>,
        /// Two-factor code, if the account requires one
        #[arg(long)]
        otp: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any WS connections)
    aegis_ws::init_crypto();

    let args = Args::parse();

    aegis_telemetry::init_logging()?;

    info!("Starting aegis v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > AEGIS_CONFIG env var > environment only
    let config_path = args
        .config
        .or_else(|| std::env::var_os("AEGIS_CONFIG").map(PathBuf::from));
    if let Some(path) = &config_path {
        info!(config_path = %path.display(), "Loading configuration");
    }

    let config = AppConfig::load(config_path.as_deref())?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Watch { channels, otp } => watch(config, channels, otp).await,
    }
}

async fn watch(config: AppConfig, channels: Vec<String>, otp: Option<String>) -> Result<()> {
    let username = std::env::var("AEGIS_USERNAME").context("AEGIS_USERNAME is not set")?;
    let password = std::env::var("AEGIS_PASSWORD").context("AEGIS_PASSWORD is not set")?;

    let service = ConnectivityService::init(config, Arc::new(SystemClock))?;

    let outcome = service.login(Credentials::new(username, password)).await?;
    if outcome == LoginOutcome::TwoFactorRequired {
        let Some(code) = otp else {
            service.dispose();
            bail!("Two-factor verification required; pass --otp");
        };
        service.verify_two_factor(&code).await?;
    }

    let mut subscriptions = Vec::with_capacity(channels.len());
    for name in &channels {
        let channel = name.clone();
        subscriptions.push(service.subscribe(
            name,
            Arc::new(move |message: &WsMessage| {
                println!("{}", json!({ "channel": channel, "message": message.to_value() }));
            }),
        ));
        service.open_channel(name)?;
    }
    info!(channels = ?channels, "Watching channels, press Ctrl-C to stop");

    let mut status_rx = service.session().subscribe_status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
        _ = status_rx.wait_for(|status| *status == SessionStatus::Expired) => {
            warn!("Session expired, stopping");
        }
    }

    drop(subscriptions);
    service.logout().await;
    service.dispose();
    Ok(())
}
