//! Per-sink configuration.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol_constants::{VALID_BIT_DEPTHS, VALID_CHANNEL_RANGE};
use crate::utils::validate_sink_destination_ip;

/// Which sender variant a sink dispatches through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    ScreamLegacy,
    RtpL16,
    RtpOpus,
    MultiDeviceRtpL16,
    MultiDeviceRtpOpus,
    WebRtcDataChannel,
    SystemAudio,
}

/// How a `MultiDeviceRtp` sink maps the N-channel mix down to each
/// receiver's stereo pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MultiDeviceReceiver {
    pub receiver_id: String,
    pub output_ip: IpAddr,
    pub output_port: u16,
    pub left_channel_index: u16,
    pub right_channel_index: u16,
}

/// A 2x8 channel-mixing matrix override; when absent the stereo
/// preprocessor falls back to the standard downmix coefficients for the
/// sink's channel count.
pub type SpeakerMatrix = Vec<[f32; 8]>;

/// Immutable (after mixer construction, barring an explicit reconfiguration
/// path) description of one sink's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkConfig {
    pub sink_id: String,
    pub protocol_variant: ProtocolVariant,
    pub output_ip: IpAddr,
    pub output_port: u16,
    pub output_sample_rate: u32,
    pub output_bit_depth: u16,
    pub output_channels: u16,
    pub channel_layout_mask: u32,
    #[serde(default)]
    pub multi_device_mode: bool,
    #[serde(default)]
    pub rtp_receivers: Vec<MultiDeviceReceiver>,
    #[serde(default)]
    pub time_sync_delay_ms: i64,
    #[serde(default)]
    pub speaker_matrix: Option<SpeakerMatrix>,
}

impl SinkConfig {
    /// Validates the static invariants from the data model: bit depth and
    /// channel count ranges, Opus's fixed-format requirement, and
    /// multi-device receiver presence. Called at mixer construction time;
    /// any failure is fatal and the mixer does not start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink_id.trim().is_empty() {
            return Err(ConfigError::EmptySinkId);
        }
        if !VALID_BIT_DEPTHS.contains(&self.output_bit_depth) {
            return Err(ConfigError::InvalidBitDepth(self.output_bit_depth));
        }
        if !VALID_CHANNEL_RANGE.contains(&self.output_channels) {
            return Err(ConfigError::InvalidChannelCount(self.output_channels));
        }
        let is_opus = matches!(
            self.protocol_variant,
            ProtocolVariant::RtpOpus | ProtocolVariant::MultiDeviceRtpOpus
        );
        if is_opus && (self.output_sample_rate != 48_000 || self.output_bit_depth != 16) {
            return Err(ConfigError::OpusRequiresStandardFormat {
                sample_rate: self.output_sample_rate,
                bit_depth: self.output_bit_depth,
            });
        }
        let is_multi_device = matches!(
            self.protocol_variant,
            ProtocolVariant::MultiDeviceRtpL16 | ProtocolVariant::MultiDeviceRtpOpus
        );
        if is_multi_device && self.rtp_receivers.is_empty() {
            return Err(ConfigError::EmptyReceiverList);
        }
        // SystemAudio deliberately exempts output_ip from this check: a
        // loopback address there is the signal that selects the local FIFO
        // backend, not a network destination. See
        // `validate_sink_destination_ip`'s own doc comment.
        if !matches!(self.protocol_variant, ProtocolVariant::SystemAudio) {
            validate_sink_destination_ip(&self.output_ip)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn chunk_duration_ms(&self, frames_per_chunk: u32) -> f64 {
        f64::from(frames_per_chunk) * 1000.0 / f64::from(self.output_sample_rate.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SinkConfig {
        SinkConfig {
            sink_id: "living-room".into(),
            protocol_variant: ProtocolVariant::RtpL16,
            output_ip: "239.1.2.3".parse().unwrap(),
            output_port: 4010,
            output_sample_rate: 48_000,
            output_bit_depth: 16,
            output_channels: 2,
            channel_layout_mask: 0x3,
            multi_device_mode: false,
            rtp_receivers: vec![],
            time_sync_delay_ms: 0,
            speaker_matrix: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_bad_bit_depth() {
        let mut c = base_config();
        c.output_bit_depth = 12;
        assert_eq!(
            c.validate(),
            Err(ConfigError::InvalidBitDepth(12))
        );
    }

    #[test]
    fn rejects_out_of_range_channels() {
        let mut c = base_config();
        c.output_channels = 0;
        assert!(c.validate().is_err());
        c.output_channels = 9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn opus_requires_48k_16bit() {
        let mut c = base_config();
        c.protocol_variant = ProtocolVariant::RtpOpus;
        c.output_sample_rate = 44_100;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OpusRequiresStandardFormat { .. })
        ));
    }

    #[test]
    fn multi_device_requires_receivers() {
        let mut c = base_config();
        c.protocol_variant = ProtocolVariant::MultiDeviceRtpL16;
        assert_eq!(c.validate(), Err(ConfigError::EmptyReceiverList));
    }

    #[test]
    fn rejects_loopback_destination_for_network_variant() {
        let mut c = base_config();
        c.output_ip = "127.0.0.1".parse().unwrap();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidDestinationIp(_))
        ));
    }

    #[test]
    fn rejects_broadcast_destination_for_scream_legacy() {
        let mut c = base_config();
        c.protocol_variant = ProtocolVariant::ScreamLegacy;
        c.output_ip = "255.255.255.255".parse().unwrap();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidDestinationIp(_))
        ));
    }

    #[test]
    fn system_audio_exempts_loopback_destination() {
        let mut c = base_config();
        c.protocol_variant = ProtocolVariant::SystemAudio;
        c.output_ip = "127.0.0.1".parse().unwrap();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn chunk_duration_matches_sample_rate() {
        let c = base_config();
        assert!((c.chunk_duration_ms(576) - 12.0).abs() < 1e-9);
    }
}
