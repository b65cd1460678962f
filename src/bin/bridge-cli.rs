//! Bridge CLI - talk to Redis through a webdis gateway
//!
//! One-shot `get`/`set`/`publish`, plus `listen` and `watch` which bind a
//! throwaway host object and print what arrives until interrupted.

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use webdis_bridge::{Bridge, BridgeConfig, CapabilityRegistry, Field};

#[derive(Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Redis pub/sub and key access over a webdis gateway", long_about = None)]
struct Cli {
    /// Gateway URL (overrides the config file)
    #[arg(short, long)]
    server: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get {
        /// Key name
        key: String,
    },

    /// Write a key and announce the change on `<key>_changed`
    Set {
        /// Key name
        key: String,

        /// Value (parsed as JSON when possible)
        value: String,
    },

    /// Publish a message
    Publish {
        /// Channel name
        channel: String,

        /// Payload (parsed as JSON when possible)
        value: String,
    },

    /// Print a line for every message on the given channels or patterns
    Listen {
        /// Channels; names containing `*` are patterns
        #[arg(required = true)]
        channels: Vec<String>,
    },

    /// Print every change announced for the given keys
    Watch {
        /// Keys to follow through `<key>_changed`
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

fn parse_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn load_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    Ok(config)
}

fn listener_host(channels: &[String]) -> CapabilityRegistry {
    channels
        .iter()
        .fold(CapabilityRegistry::new("bridge-cli"), |registry, channel| {
            let label = channel.clone();
            registry.with_handler(&format!("on:{channel}"), move |_: &[Value]| {
                println!("{label}: message");
            })
        })
}

fn watcher_host(keys: &[String]) -> CapabilityRegistry {
    let values: Arc<Mutex<HashMap<String, Value>>> = Arc::default();
    keys.iter()
        .fold(CapabilityRegistry::new("bridge-cli"), |registry, key| {
            let (read, write) = (values.clone(), values.clone());
            let (read_key, write_key) = (key.clone(), key.clone());
            registry.with_field(
                key,
                Field::read_write(
                    move || read.lock().get(&read_key).cloned().unwrap_or(Value::Null),
                    move |value: Value| {
                        println!("{write_key} = {value}");
                        write.lock().insert(write_key.clone(), value);
                    },
                ),
            )
        })
}

/// Dispatch `count` replies, bounded by the request timeout.
async fn drain_replies(bridge: &mut Bridge, count: usize) -> anyhow::Result<()> {
    let bound = bridge
        .config()
        .request_timeout()
        .unwrap_or(Duration::from_secs(10));
    tokio::time::timeout(bound, async {
        for _ in 0..count {
            if !bridge.next_event().await {
                break;
            }
        }
    })
    .await
    .context("gateway did not answer in time")
}

async fn run_until_interrupted(bridge: &mut Bridge) -> anyhow::Result<()> {
    tokio::select! {
        _ = bridge.run() => Ok(()),
        signal = tokio::signal::ctrl_c() => signal.context("waiting for ctrl-c"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Get { key } => {
            let mut bridge = Bridge::builder(config)
                .host(Arc::new(CapabilityRegistry::new("bridge-cli")))
                .build()?;
            let value = bridge.get(&key).await?;
            println!("{value}");
        }

        Commands::Set { key, value } => {
            let mut bridge = Bridge::builder(config)
                .host(Arc::new(CapabilityRegistry::new("bridge-cli")))
                .build()?;
            bridge.set(&key, parse_value(value));
            drain_replies(&mut bridge, 2).await?;
        }

        Commands::Publish { channel, value } => {
            let mut bridge = Bridge::builder(config)
                .host(Arc::new(CapabilityRegistry::new("bridge-cli")))
                .build()?;
            bridge.publish(&channel, parse_value(value));
            drain_replies(&mut bridge, 1).await?;
        }

        Commands::Listen { channels } => {
            let mut bridge = Bridge::builder(config)
                .host(Arc::new(listener_host(&channels)))
                .build()?;
            for channel in &channels {
                bridge.subscribe_to_event(channel, &format!("on:{channel}"))?;
            }
            println!("Listening on {} channel(s), ctrl-c to stop", channels.len());
            run_until_interrupted(&mut bridge).await?;
        }

        Commands::Watch { keys } => {
            let mut bridge = Bridge::builder(config)
                .host(Arc::new(watcher_host(&keys)))
                .build()?;
            for key in &keys {
                bridge.subscribe_to_property(key, key)?;
            }
            println!("Watching {} key(s), ctrl-c to stop", keys.len());
            run_until_interrupted(&mut bridge).await?;
        }
    }

    Ok(())
}
