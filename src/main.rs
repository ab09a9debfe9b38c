//! hubwire CLI - talk to a hub endpoint from the terminal.
//!
//! This is the main binary entry point. See the `hubwire` library for the
//! client itself.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hubwire::negotiate::{self, Negotiator};
use hubwire::{Config, HubClient, HubClientBuilder, RealtimeSession};
use mimalloc::MiMalloc;
use serde_json::Value;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "hubwire")]
#[command(version)]
#[command(about = "Client for RPC-over-WebSocket hub endpoints")]
struct Cli {
    /// Full hub URL (overrides server_url and hub_path from config)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Backend node, sent as X-Server-Select
    #[arg(long, global = true)]
    node: Option<String>,

    /// Auth token (also read from HUBWIRE_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Extra header as NAME:VALUE (repeatable)
    #[arg(long = "header", global = true, value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the negotiate step and print the socket URL
    Negotiate,
    /// Connect and print every inbound invocation as a JSON line
    Listen,
    /// Invoke a hub method and print its completion
    Invoke {
        /// Target method name
        target: String,
        /// Arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,
    },
    /// Perform one liveness round-trip
    Ping,
    /// Print the resolved configuration (token excluded)
    Config,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_argument(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn init_logging(verbose: u8) -> Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("HUBWIRE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    builder.init();
    Ok(())
}

/// Config file + env, then command-line flags on top.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(url) = &cli.url {
        config.server_url.clone_from(url);
        config.hub_path.clear();
    }
    if let Some(node) = &cli.node {
        config.node = Some(node.clone());
    }
    if let Some(token) = &cli.token {
        config.token.clone_from(token);
    }
    Ok(config)
}

fn client_builder(config: &Config, cli: &Cli) -> HubClientBuilder {
    config.client_builder().headers(cli.headers.iter().cloned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let config = resolve_config(&cli)?;

    match &cli.command {
        Commands::Negotiate => negotiate_command(&config, &cli).await,
        Commands::Listen => listen_command(&config, &cli).await,
        Commands::Invoke { target, args } => invoke_command(&config, &cli, target, args).await,
        Commands::Ping => ping_command(&config, &cli).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("hub url: {}", config.hub_url());
            println!("token: {}", if config.has_token() { "set" } else { "not set" });
            Ok(())
        }
    }
}

async fn negotiate_command(config: &Config, cli: &Cli) -> Result<()> {
    let base_url = reqwest::Url::parse(&config.hub_url())
        .with_context(|| format!("Invalid hub URL {}", config.hub_url()))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(node) = &config.node {
        headers.push((hubwire::config::NODE_HEADER.to_string(), node.clone()));
    }
    if config.has_token() {
        headers.push(("Authorization".to_string(), config.token.clone()));
    }
    headers.extend(cli.headers.iter().cloned());

    let negotiator = Negotiator::new(negotiate::default_http_client()?, base_url, headers);
    let negotiation = negotiator.negotiate().await?;
    println!("{}", negotiation.websocket_url);
    Ok(())
}

async fn listen_command(config: &Config, cli: &Cli) -> Result<()> {
    let client = client_builder(config, cli)
        .default_handler(|target: &str, args: &[Value]| {
            let line = serde_json::json!({ "target": target, "arguments": args });
            println!("{line}");
        })
        .build()?;

    let mut states = client.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            log::info!("[Hub] {state:?}");
        }
    });

    // Keep the session alive until Ctrl-C; dropping it closes the client.
    let session = if config.has_token() {
        Some(RealtimeSession::open(client.clone(), config.token.clone()).await?)
    } else {
        client.connect().await?;
        None
    };
    log::info!("Listening on {} (Ctrl-C to stop)", config.hub_url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    drop(session);
    client.close();
    Ok(())
}

async fn connected_client(config: &Config, cli: &Cli) -> Result<HubClient> {
    let client = client_builder(config, cli).ping_interval(None).build()?;
    if let Err(e) = client.connect().await {
        client.close();
        bail!("Failed to connect to {}: {e}", config.hub_url());
    }
    Ok(client)
}

async fn invoke_command(config: &Config, cli: &Cli, target: &str, args: &[String]) -> Result<()> {
    let client = connected_client(config, cli).await?;
    let arguments: Vec<Value> = args.iter().map(|raw| parse_argument(raw)).collect();

    let outcome = match client.invoke(target, &arguments) {
        Ok(pending) => pending.await,
        Err(e) => Err(e),
    };
    client.close();

    let result = outcome.with_context(|| format!("Invocation of {target} failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn ping_command(config: &Config, cli: &Cli) -> Result<()> {
    let client = connected_client(config, cli).await?;
    let outcome = client.ping().await;
    client.close();
    outcome.context("Ping failed")?;
    println!("pong");
    Ok(())
}
