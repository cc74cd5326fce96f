//! Hublink CLI: keep a server-push channel open and print what arrives.
//!
//! # Commands
//! ```text
//! hublink listen  --url <endpoint> --token <identity> [--transport hub|socket]
//! hublink backoff [--base-ms N] [--cap-ms N] [--attempts N] [--json]
//! hublink config
//! ```

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use hublink_core::{BackoffConfig, BackoffPolicy, ConnectionEvent, ConnectionManager};

mod config;
mod logging;

use config::{AppConfig, TransportKind};

#[derive(Parser)]
#[command(
    name = "hublink",
    about = "Resilient real-time connection client",
    long_about = "
Hublink keeps a notification channel to a hub or plain WebSocket endpoint
alive across drops and restarts, re-announces the identity token after
every reconnect, and prints each received message as one JSON line.

ENVIRONMENT VARIABLES:
  HUBLINK_CONFIG   Path to a YAML config file
  HUBLINK_URL      Endpoint URL
  HUBLINK_TOKEN    Identity token
  RUST_LOG         Log filter (overrides the configured levels)
",
    version
)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true, env = "HUBLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, register the token and print every message until Ctrl-C
    Listen {
        /// Endpoint URL
        #[arg(long, env = "HUBLINK_URL")]
        url: Option<String>,
        /// Identity token announced after each (re)connect
        #[arg(long, env = "HUBLINK_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Transport to use
        #[arg(long, value_enum)]
        transport: Option<TransportKind>,
        /// Connect to the hub WebSocket directly, without negotiating
        #[arg(long)]
        skip_negotiation: bool,
    },

    /// Print the retry delay schedule
    Backoff {
        #[arg(long)]
        base_ms: Option<u64>,
        #[arg(long)]
        cap_ms: Option<u64>,
        /// Number of delays to print (default: manager.max_connect_attempts - 1)
        #[arg(long)]
        attempts: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.log.json |= cli.log_json;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Listen { url, token, transport, skip_negotiation } => {
            if url.is_some() {
                config.url = url;
            }
            if token.is_some() {
                config.token = token;
            }
            if let Some(kind) = transport {
                config.transport = kind;
            }
            config.hub.skip_negotiation |= skip_negotiation;
            cmd_listen(config).await
        }

        Commands::Backoff { base_ms, cap_ms, attempts, json } => {
            let mut backoff = config.manager.backoff;
            if let Some(base_ms) = base_ms {
                backoff.base_ms = base_ms;
            }
            if let Some(cap_ms) = cap_ms {
                backoff.cap_ms = cap_ms;
            }
            let attempts = attempts.unwrap_or(config.manager.max_connect_attempts.saturating_sub(1));
            cmd_backoff(backoff, attempts, json)
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn cmd_listen(config: AppConfig) -> Result<()> {
    let Some(token) = config.token.clone().filter(|t| !t.is_empty()) else {
        bail!("no token: pass --token, set HUBLINK_TOKEN or `token:` in the config file");
    };

    let manager = match config.transport {
        TransportKind::Hub => {
            ConnectionManager::new(config.manager.clone(), hublink_hub::factory(config.hub_config()?))?
        }
        TransportKind::Socket => ConnectionManager::new(
            config.manager.clone(),
            hublink_socket::factory(config.socket_config()?),
        )?,
    };

    let _printer = manager.subscribe(|msg| {
        println!("{}", serde_json::to_string(msg)?);
        Ok(())
    });
    let mut events = manager.events();

    manager.connect(token).await;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, disconnecting");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    report(&event);
                    if event.is_terminal() {
                        break Err(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event observer lagged");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    manager.shutdown().await;
    match outcome {
        Ok(()) => Ok(()),
        Err(event) => bail!("connection gave up: {}", serde_json::to_string(&event)?),
    }
}

fn report(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged { from, to } => {
            tracing::debug!(from = %from, to = %to, "state changed");
        }
        ConnectionEvent::Registered { identity } => {
            tracing::info!(identity = %identity, "listening");
        }
        other => tracing::info!(event = ?other, "connection event"),
    }
}

fn cmd_backoff(config: BackoffConfig, attempts: u32, as_json: bool) -> Result<()> {
    config.validate()?;
    let policy = BackoffPolicy::new(config);
    // Waits between initial-connect opens: the failure count is 1 at the first retry.
    let schedule: Vec<u64> = (1..=attempts).map(|a| policy.delay_ms(a)).collect();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&schedule)?);
    } else {
        println!("{:>7}  {:>9}", "attempt", "delay_ms");
        for (i, ms) in schedule.iter().enumerate() {
            println!("{:>7}  {:>9}", i + 1, ms);
        }
        println!("total: {}ms", schedule.iter().sum::<u64>());
    }
    Ok(())
}
