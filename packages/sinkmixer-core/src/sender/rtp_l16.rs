//! RTP L16 sender: standard RTP carrying raw PCM samples in network byte
//! order, with an SAP announcer and RTCP loop running alongside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::mixer::mixing::CsrcSet;
use crate::protocol_constants::{DEFAULT_RTP_MTU_PAYLOAD_BYTES, RTP_PAYLOAD_TYPE_L16};
use crate::rtp::session::slice_payload;
use crate::rtp::{RtcpController, RtpSessionCore, SapAnnouncer, SdpDescriptor};

use super::NetworkSender;

/// Swaps each sample in `pcm` from host byte order into network byte order,
/// sample-width groups at a time. `pcm` is mutated in place.
///
/// Only used when building a payload from freshly-produced native-endian
/// samples (e.g. `MultiDeviceRtp`'s per-receiver stereo extraction); the
/// mixer's own downscale staging is already big-endian, so `RtpL16Sender`
/// sends it as-is without calling this.
pub fn swap_to_network_order(pcm: &mut [u8], bytes_per_sample: usize) {
    if bytes_per_sample <= 1 {
        return;
    }
    for sample in pcm.chunks_exact_mut(bytes_per_sample) {
        sample.reverse();
    }
}

/// Derives the `channelmap` indices SAP advertises for non-Opus,
/// 3+-channel sinks from the sink's configured channel-layout bitmask: the
/// index of each set bit, in ascending order, truncated/padded to
/// `channels` entries.
#[must_use]
pub fn channel_indices_from_layout_mask(mask: u32, channels: u16) -> Vec<u16> {
    let mut indices: Vec<u16> = (0..32u16).filter(|bit| mask & (1 << bit) != 0).collect();
    indices.truncate(channels as usize);
    while indices.len() < channels as usize {
        indices.push(indices.len() as u16);
    }
    indices
}

pub struct RtpL16Sender {
    session: Option<Arc<RtpSessionCore>>,
    destination: SocketAddr,
    sink_id: String,
    source_ip: std::net::Ipv4Addr,
    ssrc: u32,
    bytes_per_sample: usize,
    channels: u16,
    sample_rate: u32,
    channel_layout_mask: u32,
    mtu_payload_cap: usize,
    rtcp: Option<RtcpController>,
    sap: Option<SapAnnouncer>,
    time_sync_delay_ms: i64,
    closed: AtomicBool,
}

impl RtpL16Sender {
    #[must_use]
    pub fn new(
        destination: SocketAddr,
        sink_id: String,
        source_ip: std::net::Ipv4Addr,
        ssrc: u32,
        bytes_per_sample: usize,
        channels: u16,
        sample_rate: u32,
        channel_layout_mask: u32,
        time_sync_delay_ms: i64,
    ) -> Self {
        Self {
            session: None,
            destination,
            sink_id,
            source_ip,
            ssrc,
            bytes_per_sample,
            channels,
            sample_rate,
            channel_layout_mask,
            mtu_payload_cap: DEFAULT_RTP_MTU_PAYLOAD_BYTES,
            rtcp: None,
            sap: None,
            time_sync_delay_ms,
            closed: AtomicBool::new(false),
        }
    }

    fn frame_bytes(&self) -> usize {
        self.bytes_per_sample * self.channels as usize
    }
}

impl NetworkSender for RtpL16Sender {
    fn setup(&mut self) -> bool {
        let session = match RtpSessionCore::new(self.destination, self.ssrc, RTP_PAYLOAD_TYPE_L16) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!("rtp l16 setup failed for {}: {err}", self.sink_id);
                return false;
            }
        };

        let rtcp_dest = SocketAddr::new(self.destination.ip(), self.destination.port() + 1);
        let rtcp_socket = match std::net::UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => socket,
            Err(err) => {
                warn!("rtcp socket bind failed for {}: {err}", self.sink_id);
                self.session = Some(session);
                return true;
            }
        };
        let _ = rtcp_socket.connect(rtcp_dest);
        let rtcp_session = Arc::clone(&session);
        let time_sync_delay_ms = self.time_sync_delay_ms;
        self.rtcp = RtcpController::spawn(rtcp_socket, self.ssrc, time_sync_delay_ms, move || {
            (
                rtcp_session.timestamp(),
                rtcp_session.packet_count() as u32,
                rtcp_session.octet_count() as u32,
            )
        })
        .ok();

        let channels = self.channels;
        let sample_rate = self.sample_rate;
        let channel_layout_mask = self.channel_layout_mask;
        let ssrc = self.ssrc;
        let source_ip = self.source_ip;
        let sink_id = self.sink_id.clone();
        let destination = self.destination;
        self.sap = SapAnnouncer::spawn(move || SdpDescriptor {
            ssrc,
            source_ip,
            sink_id: sink_id.clone(),
            destination_ip: destination.ip(),
            destination_port: destination.port(),
            payload_type: RTP_PAYLOAD_TYPE_L16,
            codec_name: "L16".into(),
            clock_rate: sample_rate,
            channels,
            fmtp: None,
            is_opus: false,
            channel_map_indices: (channels >= 3)
                .then(|| channel_indices_from_layout_mask(channel_layout_mask, channels)),
        })
        .ok();

        self.session = Some(session);
        true
    }

    fn send_payload(&self, bytes: &[u8], csrcs: &CsrcSet) {
        let Some(session) = &self.session else { return };
        let frame_bytes = self.frame_bytes();
        // `bytes` is the mixer's downscale staging output, already
        // big-endian (network byte order) -- no swap needed here.
        let slices: Vec<Vec<u8>> = slice_payload(bytes, self.mtu_payload_cap, frame_bytes.max(1))
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let slice_count = slices.len();
        for (i, slice) in slices.into_iter().enumerate() {
            let frames_in_slice = if frame_bytes == 0 {
                0
            } else {
                (slice.len() / frame_bytes) as u32
            };
            let marker = i + 1 == slice_count;
            session.send_rtp_packet(&slice, frames_in_slice, csrcs.as_slice(), marker);
        }
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sap) = self.sap.take() {
            sap.stop();
        }
        if let Some(mut rtcp) = self.rtcp.take() {
            rtcp.stop();
        }
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_to_network_order_reverses_each_sample_group() {
        let mut pcm = vec![0x12, 0x34, 0x56, 0x78]; // two 16-bit samples
        swap_to_network_order(&mut pcm, 2);
        assert_eq!(pcm, vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn eight_bit_swap_is_a_no_op() {
        let mut pcm = vec![1, 2, 3];
        swap_to_network_order(&mut pcm, 1);
        assert_eq!(pcm, vec![1, 2, 3]);
    }

    #[test]
    fn channel_indices_derive_from_set_bits() {
        // channels 0,1,3,4,5 set (5.1 minus LFE at bit 2... illustrative mask)
        let mask = 0b11011;
        assert_eq!(
            channel_indices_from_layout_mask(mask, 4),
            vec![0, 1, 3, 4]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut sender = RtpL16Sender::new(
            "127.0.0.1:4010".parse().unwrap(),
            "living-room".into(),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            0xAAAA,
            2,
            2,
            48_000,
            0x3,
            0,
        );
        sender.setup();
        sender.close();
        sender.close();
    }
}
