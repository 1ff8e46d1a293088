//! The polymorphic sender family: every sink dispatches its mixed, downscaled
//! PCM through exactly one of these variants. Shared RTP plumbing lives in
//! [`crate::rtp`] and is composed into the RTP-based variants rather than
//! inherited.

pub mod multi_device;
pub mod rtp_l16;
pub mod rtp_opus;
pub mod scream;
pub mod system_audio;
pub mod webrtc;

use crate::mixer::mixing::CsrcSet;

/// Narrow trait seam over the external Opus encoder, mirroring
/// [`crate::mp3_lane::Mp3EncoderPort`]. A real, codec-feature-gated
/// implementation lives in the host application.
pub trait OpusEncoderPort: Send {
    /// Encodes one 20 ms frame of interleaved 16-bit PCM (960 samples per
    /// channel) to an Opus packet.
    ///
    /// Conforming implementations must configure the underlying encoder
    /// with bitrate
    /// [`OPUS_BITRATE_BPS`](crate::protocol_constants::OPUS_BITRATE_BPS),
    /// complexity
    /// [`OPUS_COMPLEXITY`](crate::protocol_constants::OPUS_COMPLEXITY), FEC
    /// enabled per
    /// [`OPUS_FEC_ENABLED`](crate::protocol_constants::OPUS_FEC_ENABLED)
    /// with expected packet loss
    /// [`OPUS_EXPECTED_PACKET_LOSS_PERCENT`](crate::protocol_constants::OPUS_EXPECTED_PACKET_LOSS_PERCENT),
    /// and application mode AUDIO. These are fixed encoder-tuning values,
    /// not per-call parameters, so the trait does not carry them explicitly.
    fn encode(&mut self, pcm: &[i16], channels: u16) -> Result<Vec<u8>, String>;
}

/// All senders implement this three-operation contract. `setup` and `close`
/// must each be idempotent-safe: `close` is explicitly required to be a
/// no-op when called more than once.
pub trait NetworkSender: Send {
    /// Returns `true` on success. For network variants a `false` here is
    /// fatal at mixer construction; for system-audio variants the mixer
    /// continues in best-effort mode.
    fn setup(&mut self) -> bool;

    /// Sends one payload of already-formatted bytes, carrying the current
    /// CSRC snapshot for RTP-based variants (ignored by others).
    fn send_payload(&self, bytes: &[u8], csrcs: &CsrcSet);

    /// Idempotent.
    fn close(&mut self);

    /// Returns the `(sample_rate, channels, bit_depth)` the sender actually
    /// ended up using if it diverged from the sink's configured format
    /// during `setup` (e.g. a SystemAudio device that only accepts a
    /// different native format). `None`, the default, means the configured
    /// format was honored as-is. [`SinkMixer::update_playback_format_from_sender`](crate::mixer::SinkMixer::update_playback_format_from_sender)
    /// calls this after `setup` to keep the mixer's clock and downscale
    /// target in sync with what the sender accepted.
    fn renegotiated_format(&self) -> Option<(u32, u16, u16)> {
        None
    }
}
