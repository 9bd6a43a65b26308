// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mF2C channel CLI
//!
//! # Usage
//!
//! ```bash
//! # Listen-only channel, print everything received
//! mf2c-channel listen --name agent-b
//!
//! # Send one private message (waits for agent-b's key first)
//! mf2c-channel send --name agent-a --to agent-b --security private --qos exactly-once "secret"
//!
//! # Using a configuration file
//! mf2c-channel --config agent.toml listen
//! ```

use clap::{Parser, Subcommand};
use mf2c_channel::{
    Channel, ChannelConfig, ConfigError, Envelope, Flag, HandlerStatsSnapshot, Privacy, Protocol,
    QoS, Security,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// mF2C secure messaging channel
#[derive(Parser, Debug)]
#[command(name = "mf2c-channel")]
#[command(about = "mF2C secure messaging channel - signed/encrypted pub/sub over MQTT")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker URL (tcp://host:port, host:port, memory://name)
    #[arg(short, long, global = true)]
    broker: Option<String>,

    /// Transport protocol
    #[arg(long, global = true)]
    protocol: Option<String>,

    /// Connect / handshake / publish timeout (seconds)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a channel and print received messages until Ctrl+C
    Listen {
        /// Own friendly name
        #[arg(short, long)]
        name: Option<String>,

        /// Peer to ping (listen-only if omitted)
        #[arg(long)]
        to: Option<String>,

        /// Statistics reporting interval (seconds, 0 to disable)
        #[arg(long, default_value = "10")]
        stats_interval: u64,
    },

    /// Send one message
    Send {
        /// Own friendly name
        #[arg(short, long)]
        name: Option<String>,

        /// Destination friendly name
        #[arg(long)]
        to: Option<String>,

        /// Security level (public, protected, private)
        #[arg(long, default_value = "protected")]
        security: Security,

        /// Delivery QoS (at-most-once, at-least-once, exactly-once)
        #[arg(long, default_value = "at-least-once")]
        qos: QoS,

        /// Privacy category (gdpr, not-gdpr, notpii)
        #[arg(long, default_value = "notpii")]
        privacy: Privacy,

        /// Message payload
        payload: String,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "channel.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match &args.command {
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { config } => cmd_validate(config),
        Commands::Listen {
            name,
            to,
            stats_interval,
        } => {
            let config = build_config(&args, name.as_deref(), to.as_deref())?;
            cmd_listen(config, *stats_interval).await
        }
        Commands::Send {
            name,
            to,
            security,
            qos,
            privacy,
            payload,
        } => {
            let config = build_config(&args, name.as_deref(), to.as_deref())?;
            if config.destination.is_none() {
                return Err(ConfigError::Missing("destination (--to)").into());
            }
            let (security, qos) = (*security, *qos);
            let flags: [Flag; 3] = [security.into(), qos.into(), (*privacy).into()];
            let payload = payload.clone();
            tokio::task::spawn_blocking(move || {
                let channel = Channel::with_config(config)?;
                channel.send(Envelope::with_payload(payload), &flags)?;
                println!(
                    "Sent to {} ({}, {})",
                    channel.destination().unwrap_or("?"),
                    security,
                    qos
                );
                channel.destruct();
                Ok::<_, mf2c_channel::ChannelError>(())
            })
            .await??;
            Ok(())
        }
    }
}

fn build_config(
    args: &Args,
    name: Option<&str>,
    to: Option<&str>,
) -> Result<ChannelConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => ChannelConfig::from_file(path)?,
        None => {
            let name = name.ok_or(ConfigError::Missing("friendly name (--name or --config)"))?;
            ChannelConfig::new(name, None)
        }
    };

    if let Some(name) = name {
        config.friendly_name = name.to_string();
    }
    if let Some(to) = to {
        config.destination = Some(to.to_string());
    }
    if let Some(broker) = &args.broker {
        config.broker = broker.clone();
    }
    if let Some(protocol) = &args.protocol {
        config.protocol = Protocol::from_name(protocol)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown protocol '{}'", protocol)))?;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_listen(config: ChannelConfig, stats_interval: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("mF2C Channel v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Agent:       {}", config.friendly_name);
    println!("Broker:      {}", config.broker);
    println!(
        "Destination: {}",
        config.destination.as_deref().unwrap_or("(listen-only)")
    );
    println!();

    let channel = Arc::new(tokio::task::spawn_blocking(move || Channel::with_config(config)).await??);

    println!("Press Ctrl+C to stop...");
    println!();

    let reader = Arc::clone(&channel);
    let reader_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut since_stats = Duration::ZERO;
        loop {
            tick.tick().await;
            if reader.is_shut_down() {
                break;
            }
            while let Some(msg) = reader.pop() {
                print_message(&msg);
            }
            if stats_interval > 0 {
                since_stats += Duration::from_millis(100);
                if since_stats >= Duration::from_secs(stats_interval) {
                    since_stats = Duration::ZERO;
                    print_stats(&reader.stats());
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let closing = Arc::clone(&channel);
    tokio::task::spawn_blocking(move || closing.destruct()).await?;
    let _ = reader_task.await;

    println!("\nFinal Statistics:");
    print_stats(&channel.stats());
    Ok(())
}

fn print_message(msg: &Envelope) {
    let security = msg
        .security()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "?".into());
    let text = msg.decrypted_payload().or(msg.payload()).unwrap_or("");
    println!(
        "[{}] from {}: {}",
        security,
        msg.source().unwrap_or("?"),
        text
    );
}

fn print_stats(stats: &HandlerStatsSnapshot) {
    println!("--- Channel Statistics ---");
    println!(
        "  published {} ({:.1} msg/s), buffered {}, dropped {}",
        stats.published,
        stats.messages_per_second(),
        stats.buffered,
        stats.dropped_oldest
    );
    println!(
        "  received {} (app {}, ping req {}, ping ack {}, handshake {})",
        stats.received_total(),
        stats.received_app,
        stats.received_ping_req,
        stats.received_ping_ack,
        stats.received_handshake
    );
    println!(
        "  pings sent {}, acks sent {}, errors {}",
        stats.pings_sent, stats.acks_sent, stats.errors
    );
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = ChannelConfig::new("agent-a", Some("agent-b".into()))
        .broker("tcp://localhost:1883")
        .keep_alive_secs(60)
        .timeout_secs(60)
        .ping_interval_secs(30);

    let content = format!(
        r#"# mF2C Channel Configuration
# Generated by mf2c-channel gen-config
#
# Omit `destination` for a listen-only channel.
# `broker` also accepts host:port or memory://<name>.

{}
"#,
        config.to_toml()?
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match ChannelConfig::from_file(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Agent:       {}", config.friendly_name);
            println!(
                "Destination: {}",
                config.destination.as_deref().unwrap_or("(listen-only)")
            );
            println!("Protocol:    {}", config.protocol);
            println!("Broker:      {}", config.broker);
            println!(
                "Timeouts:    keep-alive {}s, timeout {}s, ping every {}s",
                config.keep_alive_secs,
                config.timeout_secs,
                config.ping_interval()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
