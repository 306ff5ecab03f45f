// flurry: volunteer relay proxy CLI
//
// Inspect and toggle the persisted proxy state, manage configuration and
// check that the broker is reachable.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use flurry_core::broker::BrokerSink;
use flurry_core::{BrokerDialer, PersistedState, SledStorage, StateStore, WsDialer};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "flurry")]
#[command(about = "Flurry: volunteer relay proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show persisted proxy state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn the proxy on; it resumes serving on next launch
    Enable,
    /// Turn the proxy off
    Disable,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Check that the broker accepts a signaling connection
    BrokerCheck {
        /// Broker URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Status { json } => cmd_status(json),
        Commands::Enable => cmd_toggle(true),
        Commands::Disable => cmd_toggle(false),
        Commands::Config { action } => cmd_config(action),
        Commands::BrokerCheck { url } => cmd_broker_check(url).await,
    }
}

fn open_state(config: &config::Config) -> Result<StateStore> {
    let path = config.state_path()?;
    let backend = SledStorage::open(&path)
        .with_context(|| format!("Failed to open state store at {}", path.display()))?;
    Ok(StateStore::new(Arc::new(backend)))
}

fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn cmd_status(json: bool) -> Result<()> {
    let config = config::Config::load()?;
    let state: PersistedState = open_state(&config)?.load();

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("{}", "Flurry Status".bold());
    println!();

    let enabled = if state.enabled {
        "enabled".green()
    } else {
        "disabled".dimmed()
    };
    println!("  {:<16} {}", "Proxy:", enabled);
    println!("  {:<16} {}", "Clients helped:", state.total_helped);
    println!(
        "  {:<16} {}",
        "Total uptime:",
        format_uptime(state.alltime_uptime_secs)
    );
    println!("  {:<16} {}", "NAT type:", state.nat_type);
    println!("  {:<16} {}", "Broker:", config.broker_url.bright_cyan());

    Ok(())
}

fn cmd_toggle(enabled: bool) -> Result<()> {
    let config = config::Config::load()?;
    let store = open_state(&config)?;
    store
        .set_enabled(enabled)
        .context("Failed to persist proxy toggle")?;

    if enabled {
        println!("{} Proxy enabled", "✓".green());
    } else {
        println!("{} Proxy disabled", "✓".green());
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

async fn cmd_broker_check(url: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let proxy_config = config.to_proxy_config()?;
    let url = url.unwrap_or(proxy_config.broker_url);

    println!("Connecting to {} ...", url.bright_cyan());
    let began = Instant::now();
    let dialed = tokio::time::timeout(proxy_config.connect_timeout, WsDialer::new().dial(&url))
        .await
        .with_context(|| {
            format!(
                "Broker did not answer within {:?}",
                proxy_config.connect_timeout
            )
        })?;

    let (mut sink, _stream) = dialed.context("Broker connection failed")?;
    sink.close().await;

    println!(
        "{} Broker reachable ({} ms)",
        "✓".green(),
        began.elapsed().as_millis()
    );
    Ok(())
}
