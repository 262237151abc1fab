//! evpipe - Demo Entry Point
//!
//! Builds a composite device against the simulated transfer engine and
//! processing nodes, streams a number of buffers and prints the resulting
//! media graph.
//!
//! Usage: `evpipe [CONFIG] [FRAMES]`

use anyhow::{bail, Context};
use evpipe::{
    config::DeviceConfig,
    dma::{MemoryRegisterMap, MockTransferEngine},
    graph::SimulatedNode,
    Buffer, BufferHandle, BufferState, CompositeDevice,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FRAMES: u64 = 16;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const BIND_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let path = PathBuf::from(path);
            DeviceConfig::load(&path)
                .with_context(|| format!("failed to load device config {:?}", path))?
        }
        None => DeviceConfig::load_or_default(DeviceConfig::default_config_path()),
    };
    let frames = match args.next() {
        Some(n) => n
            .parse::<u64>()
            .with_context(|| format!("invalid frame count {:?}", n))?,
        None => DEFAULT_FRAMES,
    };

    tracing::info!("Starting {} ({})", config.name, config.model);
    run(&config, frames)
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evpipe=debug"));

    match std::env::var_os("EVPIPE_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "evpipe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

fn run(config: &DeviceConfig, frames: u64) -> anyhow::Result<()> {
    let sim = &config.simulation;
    let mut engine = MockTransferEngine::new(sim.latency()).with_residue(sim.residue);
    if let Some(capacity) = sim.capacity {
        engine = engine.with_capacity(capacity);
    }

    let device = CompositeDevice::probe(
        config,
        Arc::new(config.topology.clone()),
        Arc::new(engine),
        Arc::new(MemoryRegisterMap::new(config.register_bank_size)),
    )
    .context("device probe failed")?;

    let mut nodes = Vec::new();
    for node in &config.topology.nodes {
        let sim_node = Arc::new(SimulatedNode::new().with_format(node.format.unwrap_or_default()));
        device
            .bind(sim_node.subdevice(&node.id, node.pad_descriptors()))
            .with_context(|| format!("failed to bind {}", node.id))?;
        nodes.push((node.id.as_str(), sim_node));
    }
    if !device.wait_complete(BIND_TIMEOUT) {
        bail!("graph did not complete, {} node(s) unbound", device.pending());
    }

    let channels = device.channels().to_vec();
    for channel in &channels {
        let base = 0x1000_0000 * (channel.port() as u64 + 1);
        for i in 0..sim.buffers_per_channel {
            let handle = BufferHandle {
                index: i as u32,
                dma_addr: base + (i * config.transfer_size) as u64,
                len: config.transfer_size,
            };
            channel.enqueue(Buffer::new(handle))?;
        }
    }
    for channel in &channels {
        channel
            .start_streaming()
            .with_context(|| format!("failed to start {}", channel.name()))?;
        match channel.format() {
            Ok(format) => tracing::info!("{}: {:?}", channel.name(), format),
            Err(e) => tracing::warn!("{}: no format: {}", channel.name(), e),
        }
    }

    let mut done = 0;
    while done < frames {
        let mut progressed = false;
        for channel in &channels {
            let Some(buffer) = channel.dequeue_timeout(DEQUEUE_TIMEOUT) else {
                continue;
            };
            progressed = true;
            if buffer.state == BufferState::Done {
                done += 1;
                tracing::debug!(
                    "{}: buffer {} seq {} ({} bytes)",
                    channel.name(),
                    buffer.handle.index,
                    buffer.sequence,
                    buffer.bytes_used
                );
            } else {
                tracing::warn!(
                    "{}: buffer {} {:?}",
                    channel.name(),
                    buffer.handle.index,
                    buffer.state
                );
            }
            channel.enqueue(Buffer::new(buffer.handle))?;
        }
        if !progressed {
            bail!("no buffer completed within {:?}", DEQUEUE_TIMEOUT);
        }
    }

    for channel in channels.iter().rev() {
        channel.stop_streaming();
        let mut flushed = 0;
        while channel.try_dequeue().is_some() {
            flushed += 1;
        }
        let stats = channel.stats();
        tracing::info!(
            "{}: {} completed, {} errored, {} flushed, avg interval {:.1}us, jitter {}us",
            channel.name(),
            stats.completed,
            stats.errored,
            flushed,
            stats.avg_interval_us(),
            stats.jitter_us()
        );
    }
    for (id, node) in &nodes {
        tracing::debug!("{}: {} start(s), {} stop(s)", id, node.starts(), node.stops());
    }

    println!("{}", device.snapshot_json()?);
    drop(channels);
    device.remove();
    Ok(())
}
