//! Shared, read-mostly mixer tuning knobs.

use serde::{Deserialize, Serialize};

/// Engine-wide tuning knobs shared (read-only, after construction) by every
/// sink mixer. Owned by the host application, handed to each mixer via
/// [`crate::context::SharedContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioEngineSettings {
    /// Target amount of buffered audio per source, in milliseconds.
    pub target_buffer_level_ms: u32,
    /// Tolerance band around the target before the rate controller reacts.
    pub buffer_tolerance_ms: u32,
    /// Upper bound on the playback speed-up ratio the rate controller may command.
    pub max_speedup_factor: f32,
    /// Smoothing factor for the backlog EMA; `alpha = 1 - drain_smoothing_factor`.
    pub drain_smoothing_factor: f32,
    /// Cadence at which the rate controller re-measures backlog.
    pub buffer_measurement_interval_ms: u32,
    /// Whether the rate controller is active at all.
    pub enable_adaptive_buffer_drain: bool,
    /// How long the mixer emits silence after all sources go quiet before
    /// it stops mixing entirely. Zero disables the hold.
    pub underrun_hold_timeout_ms: u32,
    /// Capacity of the MP3 lane's encoded-output queue.
    pub mp3_output_queue_max_size: usize,
    /// Target MP3 bitrate in kbps.
    pub mp3_bitrate_kbps: u32,
    /// Whether the MP3 encoder runs in VBR mode.
    pub mp3_vbr_enabled: bool,
    /// Maximum duration, in milliseconds, a per-source ready deque may hold.
    pub max_ready_queue_duration_ms: u32,
    /// Fallback cap on ready-deque length when duration-based sizing would
    /// be degenerate (e.g. very short chunks).
    pub max_ready_chunks_per_source: usize,
}

impl Default for AudioEngineSettings {
    fn default() -> Self {
        Self {
            target_buffer_level_ms: 30,
            buffer_tolerance_ms: 10,
            max_speedup_factor: 1.10,
            drain_smoothing_factor: 0.9,
            buffer_measurement_interval_ms: 100,
            enable_adaptive_buffer_drain: true,
            underrun_hold_timeout_ms: 500,
            mp3_output_queue_max_size: 64,
            mp3_bitrate_kbps: 192,
            mp3_vbr_enabled: false,
            max_ready_queue_duration_ms: 200,
            max_ready_chunks_per_source: 32,
        }
    }
}

impl AudioEngineSettings {
    /// `alpha` used in the rate controller's EMA: `smoothed * (1 - alpha) + raw * alpha`.
    #[must_use]
    pub fn ema_alpha(&self) -> f32 {
        1.0 - self.drain_smoothing_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_example_values() {
        let s = AudioEngineSettings::default();
        assert_eq!(s.target_buffer_level_ms, 30);
        assert_eq!(s.buffer_tolerance_ms, 10);
    }

    #[test]
    fn ema_alpha_is_one_minus_smoothing_factor() {
        let mut s = AudioEngineSettings::default();
        s.drain_smoothing_factor = 0.9;
        assert!((s.ema_alpha() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let s = AudioEngineSettings {
            target_buffer_level_ms: 50,
            ..AudioEngineSettings::default()
        };
        assert_eq!(s.target_buffer_level_ms, 50);
        assert_eq!(s.buffer_tolerance_ms, 10);
    }
}
