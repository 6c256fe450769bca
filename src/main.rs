//! CLI for hublink
//!
//! Subcommands:
//! - `emulator`: run an in-memory hub behind the WebSocket protocol
//! - `send`: publish one device-to-cloud message
//! - `listen`: run the downlink receive loop and print commands
//! - `command`: send one cloud-to-device command
//! - `feedback`: pull and commit one feedback batch
//! - `read`: read the next record of each stream partition

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hublink::config::{Settings, load_config};
use hublink::device::{DownlinkReceiver, TransportSession, UplinkPublisher, listener_fn};
use hublink::hub::{MemoryHub, start_emulator};
use hublink::message::{AckLevel, InboundMessage, OutboundMessage};
use hublink::service::{CommandSender, FeedbackCollector, PartitionedReader};
use hublink::transport::{ServiceTransport, WsConnector, WsServiceTransport};
use hublink::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hublink")]
enum Command {
    /// Start the hub emulator
    Emulator {
        /// Extra devices to register, as `id=key`
        #[arg(long = "device")]
        devices: Vec<String>,
    },
    /// Publish one message from the configured device
    Send {
        /// Payload text
        message: String,
        /// Feedback to request: none, positive, negative or full
        #[arg(long)]
        ack: Option<AckLevel>,
    },
    /// Receive commands for the configured device until interrupted
    Listen,
    /// Send a command to a device
    Command {
        device_id: String,
        message: String,
        #[arg(long)]
        ack: Option<AckLevel>,
    },
    /// Pull one batch of delivery feedback
    Feedback {
        /// Print the batch without marking it consumed
        #[arg(long)]
        no_commit: bool,
    },
    /// Read the next record of one or every partition
    Read {
        #[arg(long)]
        partition: Option<String>,
        /// Overrides the configured lookback window
        #[arg(long)]
        lookback_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let result = match cmd {
        Command::Emulator { devices } => run_emulator(&config, devices).await,
        Command::Send { message, ack } => run_send(&config, message, ack).await,
        Command::Listen => run_listen(&config).await,
        Command::Command {
            device_id,
            message,
            ack,
        } => run_command(&config, &device_id, message, ack).await,
        Command::Feedback { no_commit } => run_feedback(&config, no_commit).await,
        Command::Read {
            partition,
            lookback_secs,
        } => run_read(&config, partition, lookback_secs).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn run_emulator(config: &Settings, devices: Vec<String>) -> CliResult {
    let hub = MemoryHub::new(config.hub_config());
    hub.register_device(config.hub.device_id.clone(), config.hub.device_key.clone());
    for device in devices {
        let (id, key) = device
            .split_once('=')
            .ok_or_else(|| format!("device '{device}' is not of the form id=key"))?;
        hub.register_device(id, key);
    }

    let addr = config.emulator_addr();
    tokio::select! {
        result = start_emulator(&addr, hub) => {
            result?;
            error!("Emulator exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}

async fn open_session(config: &Settings) -> Result<Arc<TransportSession>, Box<dyn std::error::Error>> {
    let session = Arc::new(TransportSession::new(Arc::new(WsConnector)));
    session.open(config.identity(), &config.hub.endpoint).await?;
    Ok(session)
}

async fn connect_service(
    config: &Settings,
) -> Result<Arc<dyn ServiceTransport>, Box<dyn std::error::Error>> {
    let service = WsServiceTransport::connect(&config.hub.endpoint).await?;
    Ok(Arc::new(service))
}

async fn run_send(config: &Settings, message: String, ack: Option<AckLevel>) -> CliResult {
    let session = open_session(config).await?;
    let publisher = UplinkPublisher::new(session);
    let message = OutboundMessage::new(message).with_ack(ack.unwrap_or(config.hub.ack_level));
    let ack = publisher.publish(message).await?;
    println!("accepted {} at {}", ack.message_id, ack.accepted_at);
    Ok(())
}

async fn run_listen(config: &Settings) -> CliResult {
    let session = open_session(config).await?;
    let receiver = DownlinkReceiver::new(session, config.receiver_options());
    receiver.register(
        "stdout",
        listener_fn(|message: &InboundMessage| {
            println!("{}: {}", message.message_id, message.text()?);
            Ok(())
        }),
    );
    receiver.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping receive loop.");
    receiver.stop().await;

    let stats = receiver.stats();
    info!(
        received = stats.received,
        completed = stats.completed,
        "receive loop finished"
    );
    Ok(())
}

async fn run_command(
    config: &Settings,
    device_id: &str,
    message: String,
    ack: Option<AckLevel>,
) -> CliResult {
    let sender = CommandSender::new(connect_service(config).await?);
    let message = OutboundMessage::new(message).with_ack(ack.unwrap_or(config.hub.ack_level));
    let ack = sender.send(device_id, message).await?;
    println!("queued {} for {}", ack.message_id, device_id);
    Ok(())
}

async fn run_feedback(config: &Settings, no_commit: bool) -> CliResult {
    let collector = FeedbackCollector::new(connect_service(config).await?, config.feedback_wait());
    let batch = collector.pull_feedback().await?;
    if batch.is_empty() {
        println!("no feedback pending");
        return Ok(());
    }
    for record in &batch.records {
        println!(
            "{} {} {} ({})",
            record.enqueued_time, record.original_message_id, record.status, record.description
        );
    }
    if !no_commit {
        collector.commit(&batch).await?;
    }
    Ok(())
}

async fn run_read(
    config: &Settings,
    partition: Option<String>,
    lookback_secs: Option<u64>,
) -> CliResult {
    let lookback = lookback_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.lookback());
    let reader = PartitionedReader::new(connect_service(config).await?, lookback, config.stream_wait());

    let results = match partition {
        Some(partition) => {
            let record = reader.read_next(&partition, lookback).await?;
            vec![(partition, record)]
        }
        None => reader.read_next_per_partition().await?,
    };
    for (partition, record) in results {
        match record {
            Some(record) => println!(
                "[{partition}] #{} {} from {}: {}",
                record.offset,
                record.enqueued_at,
                record.device_id,
                record.text()
            ),
            None => println!("[{partition}] no data"),
        }
    }
    Ok(())
}
