//! Protocol and wire-format constants for the sink mixing engine.
//!
//! These values are fixed by the RTP/RTCP/SAP specifications and by the
//! legacy Scream wire format. Do not change them to "tune" behavior --
//! any change here is a wire-format break for every consumer.

use std::time::Duration;

/// RTP payload type used for the legacy uncompressed L16 stream.
pub const RTP_PAYLOAD_TYPE_L16: u8 = 127;

/// RTP payload type used for the Opus-encoded stream.
pub const RTP_PAYLOAD_TYPE_OPUS: u8 = 111;

/// RTP version field value (always 2).
pub const RTP_VERSION: u8 = 2;

/// Maximum number of CSRC identifiers an RTP header can carry.
pub const RTP_MAX_CSRC_COUNT: usize = 15;

/// Size in bytes of a fixed RTP header with zero CSRCs.
pub const RTP_FIXED_HEADER_LEN: usize = 12;

/// Default MTU payload cap for RTP packets, before frame-alignment rounding.
pub const DEFAULT_RTP_MTU_PAYLOAD_BYTES: usize = 1152;

/// Multicast TTL used for RTP/RTCP traffic.
pub const RTP_MULTICAST_TTL: u32 = 64;

/// DSCP Expedited Forwarding codepoint (46), shifted into the IP TOS byte
/// (DSCP occupies the top 6 bits).
pub const DSCP_EXPEDITED_FORWARDING: u8 = 46 << 2;

/// Opus frame size in samples per channel at 48 kHz / 20 ms.
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Opus clock rate used for RTP timestamps (fixed regardless of sink sample rate).
pub const OPUS_CLOCK_RATE_HZ: u32 = 48_000;

/// Opus target bitrate.
pub const OPUS_BITRATE_BPS: i32 = 192_000;

/// Opus encoder complexity.
pub const OPUS_COMPLEXITY: i32 = 3;

/// Opus expected packet loss percentage used to size in-band FEC.
pub const OPUS_EXPECTED_PACKET_LOSS_PERCENT: i32 = 10;

/// Whether Opus in-band FEC is enabled. See
/// [`crate::sender::OpusEncoderPort::encode`] for the full set of settings a
/// conforming encoder must apply.
pub const OPUS_FEC_ENABLED: bool = true;

/// Interval between RTCP Sender Reports.
pub const RTCP_SR_INTERVAL: Duration = Duration::from_secs(5);

/// RTCP receive-socket read timeout, bounding how long the RTCP thread can block.
pub const RTCP_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// RTCP packet type: Sender Report.
pub const RTCP_PT_SENDER_REPORT: u8 = 200;

/// RTCP packet type: Receiver Report.
pub const RTCP_PT_RECEIVER_REPORT: u8 = 201;

/// RTCP packet type: Source Description.
pub const RTCP_PT_SDES: u8 = 202;

/// RTCP packet type: Goodbye.
pub const RTCP_PT_BYE: u8 = 203;

/// RTCP packet type: Application-defined.
pub const RTCP_PT_APP: u8 = 204;

/// Seconds between the Unix epoch (1970-01-01) and the NTP epoch (1900-01-01).
pub const NTP_UNIX_EPOCH_OFFSET_SECS: u64 = 2_208_988_800;

/// Interval between SAP announcements for each RTP sender.
pub const SAP_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// First SAP multicast group (global scope).
pub const SAP_MULTICAST_ADDR_GLOBAL: &str = "224.2.127.254";

/// Second SAP multicast group (administratively scoped / local).
pub const SAP_MULTICAST_ADDR_LOCAL: &str = "224.0.0.56";

/// UDP port used by both SAP multicast groups.
pub const SAP_PORT: u16 = 9875;

/// Multicast TTL used for SAP announcements.
pub const SAP_MULTICAST_TTL: u32 = 16;

/// SAP header: version field (upper 3 bits of byte 0).
pub const SAP_VERSION: u8 = 1;

/// MIME payload type announced in the SAP packet, before the SDP body.
pub const SAP_PAYLOAD_TYPE: &str = "application/sdp";

/// Scream legacy wire header length in bytes.
pub const SCREAM_HEADER_LEN: usize = 5;

/// Sample-rate-flag base rate selector bit (bit 7): set selects the 44.1k family,
/// clear selects the 48k family; the low 7 bits carry the multiplier.
pub const SCREAM_SAMPLE_RATE_44K_FLAG: u8 = 0x80;

/// Valid output bit depths for a sink.
pub const VALID_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];

/// Valid output channel count range (inclusive).
pub const VALID_CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 1..=8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_ef_encodes_to_top_six_bits() {
        assert_eq!(DSCP_EXPEDITED_FORWARDING, 0b1011_1000);
    }

    #[test]
    fn valid_bit_depths_matches_spec() {
        assert_eq!(VALID_BIT_DEPTHS, [8, 16, 24, 32]);
    }

    #[test]
    fn channel_range_is_one_to_eight() {
        assert!(VALID_CHANNEL_RANGE.contains(&1));
        assert!(VALID_CHANNEL_RANGE.contains(&8));
        assert!(!VALID_CHANNEL_RANGE.contains(&9));
    }
}
