//! admbridge - Live sample and control bridge for multichannel audio export

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use admbridge::export::{
    ExportAggregator, ExportConfig, FrameWriter, SilentSource, WavWriter, DEFAULT_BITS_PER_SAMPLE,
};
use admbridge::network::{
    Communicator, CommunicatorRegistry, NetworkError, PortPair, ProducerEndpoint, ProducerKind,
    StaticProducer, TransportConfig,
};
use admbridge::protocol::ChannelTable;

#[derive(Parser)]
#[command(name = "admbridge")]
#[command(about = "Live sample and control bridge for multichannel audio export")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with `transport` and `export` settings
    #[arg(long, global = true, env = "ADMBRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test producer that streams a sine tone while rendering
    Produce {
        /// Channels per frame
        #[arg(long, default_value = "2")]
        channels: u8,

        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Act as a scene producer (64 slots, first `channels` mapped)
        #[arg(long)]
        scene: bool,

        /// Frames per sample block
        #[arg(long, default_value = "480")]
        block_frames: usize,

        /// Stop after this many seconds (runs until killed if omitted)
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Query a producer's config and channel mappings
    Probe {
        /// Producer ports as SAMPLES:COMMAND[:scene]
        source: SourceSpec,
    },

    /// Render connected producers into one WAV file
    Export {
        /// Producer ports as SAMPLES:COMMAND[:scene], repeatable
        #[arg(long = "source", required = true)]
        sources: Vec<SourceSpec>,

        /// Silent placeholder channels appended after the sources
        #[arg(long, default_value = "0")]
        silence: usize,

        /// Frames to render
        #[arg(long)]
        frames: u64,

        /// Output WAV path
        #[arg(short, long)]
        output: PathBuf,

        /// Output bit depth (16, 24 or 32)
        #[arg(long, default_value_t = DEFAULT_BITS_PER_SAMPLE)]
        bits: u16,
    },
}

/// Producer address given on the command line
#[derive(Debug, Clone, Copy)]
struct SourceSpec {
    ports: PortPair,
    kind: ProducerKind,
}

impl FromStr for SourceSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let port = |text: &str| {
            text.parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", text, e))
        };

        let kind = match parts.get(2) {
            None => ProducerKind::ExportSource,
            Some(&"scene") => ProducerKind::Scene,
            Some(&"source") => ProducerKind::ExportSource,
            Some(other) => return Err(format!("unknown producer kind '{}'", other)),
        };
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!("expected SAMPLES:COMMAND[:scene], got '{}'", s));
        }

        Ok(Self {
            ports: PortPair::new(port(parts[0])?, port(parts[1])?),
            kind,
        })
    }
}

/// Settings file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    transport: TransportConfig,
    export: ExportConfig,
}

impl AppConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        Ok(Self {
            transport: config.transport.validated(),
            export: config.export.validated(),
        })
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn run_produce(
    config: &AppConfig,
    channels: u8,
    sample_rate: u32,
    scene: bool,
    block_frames: usize,
    duration_secs: Option<u64>,
) -> Result<()> {
    let producer = if scene {
        let mut table = ChannelTable::new();
        for slot in 0..channels as usize {
            table.set(slot, 0x1001 + slot as u32);
        }
        StaticProducer::scene(sample_rate, table, "")
    } else {
        StaticProducer::export_source(channels, sample_rate)
    };
    let producer = Arc::new(producer);
    let endpoint = ProducerEndpoint::listen(producer.clone(), &config.transport)?;

    println!("\nProducer ready.");
    println!("  samples port: {}", endpoint.samples_port());
    println!("  command port: {}", endpoint.command_port());
    println!(
        "  export with: --source {}:{}{}\n",
        endpoint.samples_port(),
        endpoint.command_port(),
        if scene { ":scene" } else { "" }
    );

    let width = producer.frame_width();
    let block_frames = block_frames.max(1);
    let block_period = Duration::from_secs_f64(block_frames as f64 / sample_rate.max(1) as f64);
    let deadline = duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut phase = 0.0f32;
    let step = 440.0 * std::f32::consts::TAU / sample_rate.max(1) as f32;
    let mut block = vec![0.0f32; block_frames * width];

    while deadline.map_or(true, |d| Instant::now() < d) {
        if !producer.is_rendering() {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        for frame in block.chunks_exact_mut(width.max(1)) {
            frame.fill(phase.sin() * 0.25);
            phase = (phase + step) % std::f32::consts::TAU;
        }

        match endpoint.send_block(&block) {
            Ok(()) => {}
            Err(NetworkError::SendBufferFull) => warn!("Send queue full, block dropped"),
            Err(e) => warn!("Block not sent: {}", e),
        }
        std::thread::sleep(block_period);
    }

    info!("Producer sent {} blocks", endpoint.blocks_sent());
    endpoint.close();
    Ok(())
}

fn run_probe(config: &AppConfig, source: SourceSpec) -> Result<()> {
    let communicator = Communicator::connect(source.ports, source.kind, &config.transport)
        .with_context(|| format!("Failed to connect to {}", source.ports))?;
    let report = communicator.config();

    let summary = serde_json::json!({
        "ports": source.ports,
        "kind": source.kind,
        "config": report,
        "pack_format": report.pack_format_label(),
        "channel_format": report.channel_format_label(),
        "channel_count": communicator.channel_count(),
        "mappings": communicator.channel_mappings(),
        "document_bytes": communicator.metadata_document().len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_export(
    config: &AppConfig,
    sources: Vec<SourceSpec>,
    silence: usize,
    frames: u64,
    output: &Path,
    bits: u16,
) -> Result<()> {
    let registry = CommunicatorRegistry::new(config.transport.clone());
    let mut aggregator = ExportAggregator::new(config.export.clone());

    for source in &sources {
        let communicator = registry
            .get_or_create(source.ports, source.kind)
            .with_context(|| format!("Failed to connect to {}", source.ports))?;
        aggregator.attach(communicator)?;
    }

    let sample_rate = aggregator
        .sample_rate()
        .context("No source reported a sample rate")?;
    if silence > 0 {
        aggregator.attach(SilentSource::new("silence", silence, sample_rate))?;
    }

    let issues = aggregator.validate();
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("  - {}", issue);
        }
        bail!("Can not render due to {} issue(s)", issues.len());
    }

    let channels = u16::try_from(aggregator.total_channels()).context("Too many channels")?;
    let mut writer = WavWriter::create(output, sample_rate, channels, bits)?;

    aggregator.set_render_in_progress(true)?;
    info!(
        "Rendering {} frames from {} sources (session {})",
        frames,
        aggregator.source_count(),
        aggregator.id()
    );

    // Announce frames at real-time pace, the way a host render would
    let block_frames = config.export.block_frames as u64;
    let block_period = Duration::from_secs_f64(block_frames as f64 / sample_rate as f64);
    let mut announced = 0;
    while announced < frames {
        let block = block_frames.min(frames - announced);
        aggregator.add_expected_frames(block);
        announced += block;

        aggregator.process_available(&mut writer)?;
        std::thread::sleep(block_period);
    }

    let report = aggregator.close(&mut writer)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_complete() {
        warn!(
            "{} frames missing from {}",
            report.shortfall,
            writer.path().display()
        );
    }
    println!(
        "\nWrote {} frames to {}",
        writer.frames_written(),
        output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Produce {
            channels,
            sample_rate,
            scene,
            block_frames,
            duration_secs,
        } => {
            run_produce(
                &config,
                channels,
                sample_rate,
                scene,
                block_frames,
                duration_secs,
            )?;
        }
        Commands::Probe { source } => {
            run_probe(&config, source)?;
        }
        Commands::Export {
            sources,
            silence,
            frames,
            output,
            bits,
        } => {
            run_export(&config, sources, silence, frames, &output, bits)?;
        }
    }

    Ok(())
}
