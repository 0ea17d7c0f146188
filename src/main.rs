mod config;
mod core;
mod error_taxonomy;
mod models;
mod reasoner;
mod server;
mod session;
mod store;
mod tools;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(
    name = "parleylock",
    version,
    about = "Streaming chat backend for the Professor Lock betting assistant"
)]
struct Cli {
    /// Path to a config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate configuration and environment, then exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.validate()?;
            server::run_http_server(config).await
        }
        Commands::Check => run_check(&config),
    }
}

/// Startup check: configuration sanity plus a data-dir write probe.
fn run_check(config: &Config) -> Result<()> {
    config.validate()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let probe = config.data_dir.join(".write-probe");
    std::fs::write(&probe, b"ok")
        .with_context(|| format!("data dir {} is not writable", config.data_dir.display()))?;
    let _ = std::fs::remove_file(&probe);

    println!("config: ok");
    println!("data dir: {} (writable)", config.data_dir.display());
    println!("reasoner: {} @ {}", config.model, config.base_url);
    if config.api_key.is_none() {
        println!("warning: no API key set (PARLEYLOCK_API_KEY); turns will fail upstream");
    }
    if config.service_key.is_none() {
        println!("note: no service key set; service-privileged access is disabled");
    }
    for (name, endpoint) in [
        ("web_search", &config.tools.web_search_url),
        ("stat_lookup", &config.tools.stats_url),
        ("get_odds", &config.tools.odds_url),
    ] {
        match endpoint {
            Some(url) => println!("tool {name}: {url}"),
            None => println!("tool {name}: no upstream, deterministic fallback"),
        }
    }
    Ok(())
}
