//! Centralized error types for the sink mixing engine.
//!
//! The engine distinguishes two error classes:
//! - Construction-time errors ([`ConfigError`], [`SenderError`]) are returned
//!   to the caller and prevent a mixer/sender from starting.
//! - Runtime errors ([`RuntimeIssue`]) are never propagated out of the main
//!   loop; they are recorded in counters and logs, exactly per the
//!   propagation policy in the component design -- the mixer does not abort
//!   the process over a bad chunk, a dropped packet or a codec hiccup.

use thiserror::Error;

/// A stable short code for an error, independent of its `Display` text.
///
/// Useful for log filtering and for tests that want to assert "which kind
/// of error" without string-matching the human message.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Errors that can prevent a [`crate::config::SinkConfig`] or
/// [`crate::settings::AudioEngineSettings`] from being accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("output bit depth {0} is not one of 8, 16, 24, 32")]
    InvalidBitDepth(u16),

    #[error("output channel count {0} is outside the supported range 1..=8")]
    InvalidChannelCount(u16),

    #[error("RTP Opus requires 48000 Hz / 16-bit PCM input, got {sample_rate} Hz / {bit_depth}-bit")]
    OpusRequiresStandardFormat { sample_rate: u32, bit_depth: u16 },

    #[error("sink id must not be empty")]
    EmptySinkId,

    #[error("multi-device receiver list is empty for a MultiDeviceRtp sink")]
    EmptyReceiverList,

    #[error("sink output_ip is not a valid network destination: {0}")]
    InvalidDestinationIp(#[from] crate::utils::IpValidationError),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidBitDepth(_) => "config_invalid_bit_depth",
            Self::InvalidChannelCount(_) => "config_invalid_channel_count",
            Self::OpusRequiresStandardFormat { .. } => "config_opus_format_mismatch",
            Self::EmptySinkId => "config_empty_sink_id",
            Self::EmptyReceiverList => "config_empty_receiver_list",
            Self::InvalidDestinationIp(_) => "config_invalid_destination_ip",
        }
    }
}

/// Errors raised while bringing up a sender (socket creation/bind, codec init).
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("failed to bind socket for sink {sink_id}: {source}")]
    SocketBind {
        sink_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to join multicast group {group} on sink {sink_id}: {source}")]
    MulticastJoin {
        sink_id: String,
        group: String,
        #[source]
        source: std::io::Error,
    },

    #[error("codec initialization failed for sink {sink_id}: {reason}")]
    CodecInit { sink_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ErrorCode for SenderError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind { .. } => "sender_socket_bind_failed",
            Self::MulticastJoin { .. } => "sender_multicast_join_failed",
            Self::CodecInit { .. } => "sender_codec_init_failed",
            Self::Config(_) => "sender_config_invalid",
        }
    }
}

/// Recoverable runtime conditions. These are never returned as a hard
/// `Result::Err` from the mixer's tick loop -- they are logged and counted.
/// The type exists so call sites have one vocabulary for "what kind of
/// hiccup just happened", rather than ad hoc log strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeIssue {
    #[error("chunk from source {instance_id} had {actual} samples, expected {expected}")]
    ChunkShapeMismatch {
        instance_id: u64,
        expected: usize,
        actual: usize,
    },

    #[error("{queue} overflowed, dropped oldest entry")]
    BufferOverflow { queue: &'static str },

    #[error("underrun: no active source for {elapsed_ms} ms")]
    Underrun { elapsed_ms: u64 },

    #[error("send failed on sink {sink_id}: {reason}")]
    SendFailed { sink_id: String, reason: String },

    #[error("codec failure in {lane}: {reason}")]
    CodecFailure { lane: &'static str, reason: String },

    #[error("listener {listener_id} closed")]
    ListenerClosed { listener_id: u64 },

    #[error("coordinator requested a cycle skip")]
    CoordinatorSkip,

    #[error("shutdown requested")]
    ShutdownRequested,
}

impl ErrorCode for RuntimeIssue {
    fn code(&self) -> &'static str {
        match self {
            Self::ChunkShapeMismatch { .. } => "chunk_shape_mismatch",
            Self::BufferOverflow { .. } => "buffer_overflow",
            Self::Underrun { .. } => "underrun",
            Self::SendFailed { .. } => "send_failed",
            Self::CodecFailure { .. } => "codec_failure",
            Self::ListenerClosed { .. } => "listener_closed",
            Self::CoordinatorSkip => "coordinator_skip",
            Self::ShutdownRequested => "shutdown_requested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_codes_are_stable() {
        assert_eq!(ConfigError::InvalidBitDepth(17).code(), "config_invalid_bit_depth");
        assert_eq!(
            ConfigError::InvalidChannelCount(0).code(),
            "config_invalid_channel_count"
        );
    }

    #[test]
    fn runtime_issue_display_is_human_readable() {
        let issue = RuntimeIssue::ChunkShapeMismatch {
            instance_id: 7,
            expected: 1152,
            actual: 1100,
        };
        assert!(issue.to_string().contains("expected 1152"));
        assert_eq!(issue.code(), "chunk_shape_mismatch");
    }

    #[test]
    fn sender_error_wraps_config_error() {
        let err: SenderError = ConfigError::EmptySinkId.into();
        assert_eq!(err.code(), "sender_config_invalid");
    }
}
