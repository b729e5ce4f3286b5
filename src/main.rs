//! CLI for tidemq
//!
//! Subcommands:
//! - `server`: run the broker until Ctrl-C or the `stop` command on stdin
//! - `publish`: publish one message to a topic at a fixed interval
//! - `subscribe`: log every message received on a topic

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use tidemq::config::{DEFAULT_CONFIG_FILE, Settings, load_config_from};
use tidemq::utils::logging;
use tidemq::{Broker, Error, Result, Session};

#[derive(Parser)]
#[command(name = "tidemq", version, about)]
struct Cli {
    /// Configuration file to read, without extension
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Endpoint {
    /// Host to bind (server) or connect to (clients)
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker
    Server {
        #[command(flatten)]
        endpoint: Endpoint,
    },
    /// Publish a message to a topic repeatedly
    Publish {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        /// Seconds between two publishes
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Subscribe to a topic and log what arrives
    Subscribe {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    logging::init(&settings.logging.level);

    let outcome = match cli.command {
        Command::Server { endpoint } => {
            apply(&endpoint, &mut settings.server.host, &mut settings.server.port);
            run_server(settings).await
        }
        Command::Publish {
            endpoint,
            topic,
            message,
            interval,
        } => {
            apply(&endpoint, &mut settings.client.host, &mut settings.client.port);
            run_publisher(settings, &topic, &message, interval).await
        }
        Command::Subscribe { endpoint, topic } => {
            apply(&endpoint, &mut settings.client.host, &mut settings.client.port);
            run_subscriber(settings, &topic).await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn apply(endpoint: &Endpoint, host: &mut String, port: &mut u16) {
    if let Some(h) = &endpoint.host {
        host.clone_from(h);
    }
    if let Some(p) = endpoint.port {
        *port = p;
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let broker = Broker::start(&settings).await?;
    info!(addr = %broker.local_addr(), "broker started");

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        _ = command_listener() => {}
    }

    broker.stop().await;
    Ok(())
}

/// Reads operator commands from stdin. Returns when `stop` is entered.
async fn command_listener() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("type 'help' for available commands");

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim().to_lowercase().as_str() {
                "stop" => {
                    info!("stopping broker via command");
                    return;
                }
                "help" => {
                    info!("available commands:");
                    info!("  stop  - stop the broker and exit");
                    info!("  help  - show this help message");
                }
                "" => {}
                other => warn!(command = other, "unknown command, type 'help' for available commands"),
            },
            // Detached from a terminal: only a signal stops the broker.
            Ok(None) => return std::future::pending().await,
            Err(e) => {
                warn!(error = %e, "stdin unavailable, command listener stopped");
                return std::future::pending().await;
            }
        }
    }
}

async fn run_publisher(settings: Settings, topic: &str, message: &str, interval: u64) -> Result<()> {
    let mut session = Session::connect(&settings.client).await?;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = time::interval(Duration::from_secs(interval.max(1)));

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            _ = ticker.tick() => match session.publish(topic, message.as_bytes().to_vec()).await {
                Ok(()) => info!(topic, "published message"),
                Err(e) if !session.is_connected() => break Err(e),
                Err(e) => warn!(topic, error = %e, "failed to publish message"),
            },
        }
    };

    session.disconnect().await;
    outcome
}

async fn run_subscriber(settings: Settings, topic: &str) -> Result<()> {
    let mut session = Session::connect(&settings.client).await?;

    let subscribed = session
        .subscribe(topic, |topic, payload| {
            info!(topic, payload = %String::from_utf8_lossy(payload), "message received");
        })
        .await;
    if let Err(e) = subscribed {
        session.disconnect().await;
        return Err(e);
    }
    info!(topic, "subscribed, press Ctrl-C to exit");

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => Ok(()),
        _ = session.closed() => Err(Error::ConnectionClosed),
    };

    session.disconnect().await;
    outcome
}
