//! Courier node - run an echo consumer or route a single command
//!
//! Usage:
//!   courier-node serve --bind 127.0.0.1:9400
//!   courier-node send --config routing.toml --service billing --command invoice.total --arg id=42

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_core::{codes, CommandMessage, CommandResponse, ResponseType};
use courier_fabric::PlainCipher;
use courier_messaging::{
    ConsumerConfig, ConsumerEvent, MessagingConsumer, RoutingConfig, RoutingManager,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(about = "Courier command/response messaging node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept providers and echo every command back as JSON
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9400")]
        bind: SocketAddr,

        /// Tag attached to every log record
        #[arg(long)]
        log_key: Option<String>,
    },

    /// Route one command through the consumers of a routing config
    Send {
        /// Path to the routing configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Service the command is routed by
        #[arg(short, long)]
        service: String,

        #[arg(long)]
        command: String,

        #[arg(long, default_value = "default")]
        route: String,

        /// Command argument as key=value, repeatable
        #[arg(long = "arg", value_parser = parse_argument)]
        args: Vec<(String, String)>,

        #[arg(long, default_value_t = 0)]
        company_id: i32,

        /// How long to wait for the response; 0 sends without waiting
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,

        /// How long to wait for a consumer connection before sending
        #[arg(long, default_value_t = 2000)]
        connect_wait_ms: u64,
    },
}

fn parse_argument(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Command::Serve { bind, log_key } => serve(bind, log_key).await,
        Command::Send {
            config,
            service,
            command,
            route,
            args,
            company_id,
            wait_ms,
            connect_wait_ms,
        } => {
            let mut message = CommandMessage::new(company_id, route, command);
            message.arguments.extend(args);
            send(
                config,
                &service,
                message,
                Duration::from_millis(wait_ms),
                Duration::from_millis(connect_wait_ms),
            )
            .await
        }
    }
}

async fn serve(bind: SocketAddr, log_key: Option<String>) -> Result<()> {
    let consumer = Arc::new(MessagingConsumer::new(Arc::new(PlainCipher)));
    let mut events = consumer.subscribe();

    let config = ConsumerConfig {
        log_key,
        ..ConsumerConfig::default()
    };
    let addr = consumer
        .start(&bind.ip().to_string(), bind.port(), config)
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;
    info!(%addr, "Echo consumer ready");

    let responder = consumer.clone();
    let echo = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConsumerEvent::Message { connection, message } => {
                    let reply = echo_response(&message);
                    responder.send_response(connection, &reply).await;
                }
                ConsumerEvent::Warning { connection, message } => {
                    warn!(%connection, "{}", message)
                }
                ConsumerEvent::Error { connection, message } => {
                    error!(%connection, "{}", message)
                }
                ConsumerEvent::Accepted { .. } | ConsumerEvent::Closed { .. } => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    echo.abort();
    consumer.stop().await;
    Ok(())
}

fn echo_response(message: &CommandMessage) -> CommandResponse {
    let body = serde_json::json!({
        "Route": message.route,
        "Command": message.command,
        "Arguments": message.arguments,
    });
    CommandResponse::for_message(message, codes::SUCCESS, ResponseType::Json, body.to_string())
}

fn load_config(path: &Path) -> Result<RoutingConfig> {
    RoutingConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn send(
    config: PathBuf,
    service: &str,
    message: CommandMessage,
    wait: Duration,
    connect_wait: Duration,
) -> Result<()> {
    let config = load_config(&config)?;
    let manager = RoutingManager::from_config(&config, Arc::new(PlainCipher))
        .context("Failed to start routing")?;

    // Give the persistent connections a moment to come up
    let connected = tokio::time::timeout(connect_wait, async {
        loop {
            let ready = manager
                .consumers()
                .iter()
                .any(|consumer| consumer.serves(service) && consumer.provider().is_connected());
            if ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    if connected.is_err() {
        warn!(service, "No consumer connected yet, sending anyway");
    }

    let result = manager.send_message(service, message, wait).await;
    manager.dispose().await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
