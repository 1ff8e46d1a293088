//! Demo host configuration.
//!
//! Supports loading from a YAML file with environment variable overrides.
//! Describes the sinks this process should mix and dispatch, plus the
//! shared engine tuning knobs and the synthetic source the demo host
//! drives them with (no real source pipeline is part of this repository --
//! see the module docs on [`crate::demo_source`]).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sinkmixer_core::{AudioEngineSettings, SinkConfig};

/// One demo sink entry: a [`SinkConfig`] plus the frame count per mixer
/// chunk (the sink's own cadence; chunk duration derives from this and the
/// sink's sample rate).
#[derive(Debug, Clone, Deserialize)]
pub struct SinkEntry {
    #[serde(flatten)]
    pub sink: SinkConfig,
    pub frames_per_chunk: u32,
}

/// Demo host configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Sinks to mix and dispatch. Each entry becomes one `SinkMixer`.
    pub sinks: Vec<SinkEntry>,

    /// Shared mixer tuning knobs, applied to every sink in this process.
    /// Override: `SINKMIXER_TARGET_BUFFER_MS`
    pub settings: AudioEngineSettings,

    /// Frequency in Hz of the synthetic demo tone fed into each sink's
    /// first (and only) source.
    pub demo_tone_hz: f64,

    /// Amplitude of the synthetic demo tone, as a fraction of full scale.
    pub demo_tone_amplitude: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            settings: AudioEngineSettings::default(),
            demo_tone_hz: 440.0,
            demo_tone_amplitude: 0.2,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SINKMIXER_TARGET_BUFFER_MS") {
            if let Ok(ms) = val.parse() {
                self.settings.target_buffer_level_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("SINKMIXER_DEMO_TONE_HZ") {
            if let Ok(hz) = val.parse() {
                self.demo_tone_hz = hz;
            }
        }
    }
}
