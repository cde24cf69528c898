//! CLI binary for voicebridge.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voicebridge::adapters::{CommandRecognizer, HttpRewriter, HttpSynthesizer};
use voicebridge::link::{self, CommandWriter, LinkEvent};
use voicebridge::{BridgeConfig, Session, StageAdapters};

/// voicebridge: half-duplex speech mediation over a serial audio bridge.
#[derive(Parser)]
#[command(name = "voicebridge", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device path, overriding the configuration.
    #[arg(short, long)]
    device: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the mediation session.
    Run {
        /// Stop after this many completed cycles.
        #[arg(long)]
        max_cycles: Option<u32>,
    },

    /// Print inbound device traffic for a few seconds, then exit.
    Probe {
        /// How long to listen.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voicebridge=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        BridgeConfig::from_file(path)?
    } else {
        BridgeConfig::default()
    };
    if let Some(device) = cli.device {
        config.serial.device = device;
    }

    match cli.command.unwrap_or(Command::Run { max_cycles: None }) {
        Command::Run { max_cycles } => {
            if max_cycles.is_some() {
                config.session.max_cycles = max_cycles;
            }
            run_session(config).await
        }
        Command::Probe { seconds } => probe(config, seconds).await,
    }
}

async fn run_session(config: BridgeConfig) -> anyhow::Result<()> {
    println!("voicebridge v{}", env!("CARGO_PKG_VERSION"));

    let adapters = StageAdapters {
        recognizer: Arc::new(CommandRecognizer::new(config.recognizer.clone())),
        rewriter: Arc::new(HttpRewriter::new(config.rewriter.clone())),
        synthesizer: Arc::new(HttpSynthesizer::new(config.synthesizer.clone())),
    };

    let session = Session::open(config, adapters)?;
    let cancel = session.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    });

    println!("\nReady! Speak near the device. Press Ctrl+C to stop.\n");

    let summary = session.run().await?;
    println!(
        "session {} finished: {} cycle(s)",
        summary.session_id, summary.completed_cycles
    );
    Ok(())
}

/// Dump demultiplexed device traffic, the way the firmware bring-up
/// scripts do. Useful to verify framing and baud before a full session.
async fn probe(config: BridgeConfig, seconds: u64) -> anyhow::Result<()> {
    let (transport, sink) = link::open_serial(&config.serial)?;
    let (tx, mut rx) = mpsc::channel(256);
    let reader = link::spawn_reader(Box::new(transport), tx);
    CommandWriter::new(sink).state_query()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    let mut frames: u64 = 0;
    let mut samples: u64 = 0;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            maybe = rx.recv() => match maybe {
                Some(LinkEvent::Frame(frame)) => {
                    frames += 1;
                    samples += frame.samples.len() as u64;
                }
                Some(LinkEvent::Line(line)) => println!("<= {line}"),
                None => break,
            },
        }
    }

    reader.stop();
    println!("{frames} audio frame(s), {samples} samples total");
    Ok(())
}
