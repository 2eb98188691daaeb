//! GW-Admin: Stream Gateway admin CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared_bus::{NatsBus, NatsBusConfig};
use stream_gateway::{Gateway, GatewayConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gw_admin::commands::{self, SubscribeOptions};

/// GW-Admin: Stream Gateway admin CLI
#[derive(Parser, Debug)]
#[command(name = "gw-admin")]
#[command(about = "Manage and inspect the durable streams behind the stream gateway")]
struct Args {
    /// NATS server URL (defaults to GW_NATS_URL, then nats://localhost:4222)
    #[arg(short, long)]
    url: Option<String>,

    /// Log filter, e.g. "debug" or "stream_gateway=trace"
    #[arg(long, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream management
    Streams {
        #[command(subcommand)]
        action: StreamsAction,
    },
    /// Publish one event; the payload body is JSON for the subject's event type
    Publish {
        subject: String,
        json: String,
        /// Producer id written into the envelope
        #[arg(long, default_value = "gw-admin")]
        producer: String,
        /// Dedup key; repeated publishes with the same key are stored once
        #[arg(long)]
        dedup_key: Option<String>,
    },
    /// Pull messages matching a subject pattern and print them
    Subscribe {
        pattern: String,
        /// Consumer group to pull as
        #[arg(short, long, default_value = "gw-admin")]
        group: String,
        /// Stop after this many messages
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Stop after this many seconds without a message
        #[arg(short, long, default_value = "5")]
        timeout: u64,
        /// Leave messages unacknowledged
        #[arg(long)]
        no_ack: bool,
    },
    /// Check connectivity and that every platform stream exists
    Check,
}

#[derive(Subcommand, Debug)]
enum StreamsAction {
    /// Declare every platform stream
    Setup,
    /// List streams with message counts
    List,
    /// Show one stream's configuration and state
    Info { name: String },
    /// Delete a stream and all its messages
    Delete {
        name: String,
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = GatewayConfig::from_env().context("invalid GW_* configuration")?;
    if let Some(url) = args.url {
        config.bus.url = url;
    }

    let bus = Arc::new(
        NatsBus::connect(&NatsBusConfig::from(&config.bus))
            .await
            .with_context(|| format!("failed to connect to {}", config.bus.url))?,
    );
    let dlq_prefix = config.dead_letter.subject_prefix.clone();
    let bus_config = config.bus.clone();
    let gateway = Gateway::new(bus.clone(), config)?;

    match args.command {
        Command::Streams { action } => {
            let out = match action {
                StreamsAction::Setup => commands::setup(&gateway).await?,
                StreamsAction::List => commands::list(bus.as_ref()).await?,
                StreamsAction::Info { name } => commands::info(bus.as_ref(), &name).await?,
                StreamsAction::Delete { name, yes } => {
                    commands::delete(bus.as_ref(), &name, yes).await?
                }
            };
            print!("{out}");
        }
        Command::Publish {
            subject,
            json,
            producer,
            dedup_key,
        } => {
            let event = commands::build_event(&subject, &json, &producer)?;
            print!(
                "{}",
                commands::publish(&gateway, &event, dedup_key.as_deref()).await?
            );
        }
        Command::Subscribe {
            pattern,
            group,
            count,
            timeout,
            no_ack,
        } => {
            let options = SubscribeOptions {
                group,
                max_messages: count,
                idle_timeout: Duration::from_secs(timeout),
                ack: !no_ack,
            };
            let shown = commands::subscribe(bus.as_ref(), &pattern, &options).await?;
            for line in &shown {
                println!("{line}");
            }
            eprintln!("{} message(s)", shown.len());
        }
        Command::Check => {
            print!(
                "{}",
                commands::check(bus.as_ref(), &bus_config, &dlq_prefix).await?
            );
        }
    }

    bus.flush().await?;
    Ok(())
}
