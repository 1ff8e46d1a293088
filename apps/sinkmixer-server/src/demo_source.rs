//! A synthetic single-tone source pipeline.
//!
//! The sink mixing engine expects chunks from an external source pipeline
//! (resampling, EQ, delay are all out of scope for the engine itself). This
//! demo host stands in for that pipeline with one sine-wave generator per
//! sink, so the mixer's full tick loop -- harvest, mix, downscale, dispatch,
//! side-chain -- runs against real data end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sinkmixer_core::queue::BoundedChunkQueue;
use sinkmixer_core::ProcessedChunk;

/// Pushes one sine-wave chunk per `chunk_duration_ms` into `queue` until
/// `stop` is set, then exits. The SSRC identifies this source to the
/// mixer's CSRC aggregation.
pub fn spawn(
    queue: Arc<BoundedChunkQueue>,
    ssrc: u32,
    frames_per_chunk: u32,
    channels: u16,
    sample_rate: u32,
    tone_hz: f64,
    amplitude: f64,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let chunk_duration_ms = f64::from(frames_per_chunk) * 1000.0 / f64::from(sample_rate.max(1));
    std::thread::Builder::new()
        .name(format!("demo-source-{ssrc}"))
        .spawn(move || {
            let mut phase = 0.0f64;
            let phase_step = 2.0 * std::f64::consts::PI * tone_hz / f64::from(sample_rate.max(1));
            let peak = amplitude.clamp(0.0, 1.0) * f64::from(i32::MAX);

            while !stop.load(Ordering::Acquire) {
                let mut samples = Vec::with_capacity(frames_per_chunk as usize * channels as usize);
                for _ in 0..frames_per_chunk {
                    let value = (phase.sin() * peak) as i32;
                    for _ in 0..channels {
                        samples.push(value);
                    }
                    phase += phase_step;
                }
                queue.push(ProcessedChunk::new(samples, channels, vec![ssrc], Instant::now()));
                std::thread::sleep(std::time::Duration::from_millis(chunk_duration_ms.max(1.0) as u64));
            }
        })
        .expect("failed to spawn demo source thread")
}
