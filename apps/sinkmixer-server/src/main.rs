//! Standalone demo host for the sink mixing engine.
//!
//! Loads a YAML description of one or more sinks, builds a `SinkMixer` and
//! the `NetworkSender` each sink's protocol variant calls for, feeds each
//! mixer a synthetic sine-wave source, and runs until interrupted.

mod config;
mod demo_source;
mod sinks;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sinkmixer_core::{SharedContext, SinkMixer};

use crate::config::ServerConfig;

/// Headless demo host for the sink mixing engine.
#[derive(Parser, Debug)]
#[command(name = "sinkmixer-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SINKMIXER_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("sinkmixer-server v{}", env!("CARGO_PKG_VERSION"));

    let server_config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if server_config.sinks.is_empty() {
        log::warn!("no sinks configured; pass --config pointing at a YAML file with a `sinks:` list");
    }

    let context = Arc::new(SharedContext::new(server_config.settings.clone()));
    let stop = Arc::new(AtomicBool::new(false));

    let mut mixers = Vec::new();
    let mut source_threads = Vec::new();

    for entry in &server_config.sinks {
        let sender = match sinks::build_sender(&entry.sink, &context) {
            Ok(sender) => sender,
            Err(err) => {
                log::error!("skipping sink '{}': {err:#}", entry.sink.sink_id);
                continue;
            }
        };

        let mixer = match SinkMixer::new(entry.sink.clone(), Arc::clone(&context), entry.frames_per_chunk, sender, None) {
            Ok(mixer) => mixer,
            Err(err) => {
                log::error!("failed to construct mixer for sink '{}': {err}", entry.sink.sink_id);
                continue;
            }
        };

        mixer.start();
        log::info!(
            "sink '{}' started ({}Hz/{}ch/{}bit via {:?})",
            entry.sink.sink_id,
            entry.sink.output_sample_rate,
            entry.sink.output_channels,
            entry.sink.output_bit_depth,
            entry.sink.protocol_variant
        );

        let ssrc = context.allocate_ssrc();
        let (rate_tx, _rate_rx) = crossbeam_channel::unbounded();
        let input_queue = mixer.attach_source(u64::from(ssrc), rate_tx);

        let source_thread = demo_source::spawn(
            input_queue,
            ssrc,
            entry.frames_per_chunk,
            entry.sink.output_channels,
            entry.sink.output_sample_rate,
            server_config.demo_tone_hz,
            server_config.demo_tone_amplitude,
            Arc::clone(&stop),
        );

        mixers.push((mixer, u64::from(ssrc), ssrc));
        source_threads.push(source_thread);
    }

    if mixers.is_empty() {
        log::error!("no sinks started successfully, exiting");
        return Ok(());
    }

    let shutdown_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        shutdown_flag.store(true, Ordering::Release);
    })
    .context("failed to install Ctrl+C handler")?;

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    log::info!("shutting down {} sink(s)...", mixers.len());
    for thread in source_threads {
        let _ = thread.join();
    }
    for (mixer, instance_id, ssrc) in mixers {
        mixer.detach_source(instance_id);
        mixer.stop();
        context.release_ssrc(ssrc);
    }

    log::info!("shutdown complete");
    Ok(())
}
