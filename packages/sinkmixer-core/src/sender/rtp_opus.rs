//! RTP Opus sender: accumulates incoming 16-bit PCM into 20 ms frames,
//! encodes via the external Opus codec, and emits each packet as RTP with
//! no marker bit. Timestamp advances by a fixed 960 samples per frame
//! regardless of whether the encode or send succeeded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use crate::mixer::mixing::CsrcSet;
use crate::protocol_constants::{OPUS_FRAME_SAMPLES, RTP_PAYLOAD_TYPE_OPUS};
use crate::rtp::{RtcpController, RtpSessionCore, SapAnnouncer, SdpDescriptor};

use super::{NetworkSender, OpusEncoderPort};

/// Remaps `interleaved` (in the sink's configured channel order) into Opus
/// mapping family 1's canonical channel order. For mono/stereo this is the
/// identity; for anything else the caller must supply the target order,
/// which at the data-model level is carried in `SinkConfig::speaker_matrix`
/// -- here we only expose the hook so the sender stays decoupled from that
/// policy.
pub fn remap_to_opus_family1_order(interleaved: &[i16], channel_order: &[usize]) -> Vec<i16> {
    let channels = channel_order.len();
    if channels == 0 {
        return interleaved.to_vec();
    }
    let frame_count = interleaved.len() / channels;
    let mut out = Vec::with_capacity(interleaved.len());
    for frame in interleaved.chunks_exact(channels) {
        for &src_index in channel_order {
            out.push(frame[src_index]);
        }
    }
    debug_assert_eq!(out.len(), frame_count * channels);
    out
}

pub struct RtpOpusSender {
    session: Option<Arc<RtpSessionCore>>,
    destination: SocketAddr,
    sink_id: String,
    source_ip: std::net::Ipv4Addr,
    ssrc: u32,
    channels: u16,
    encoder: Mutex<Option<Box<dyn OpusEncoderPort>>>,
    frame_buffer: Mutex<Vec<i16>>,
    rtcp: Option<RtcpController>,
    sap: Option<SapAnnouncer>,
    time_sync_delay_ms: i64,
    closed: AtomicBool,
}

impl RtpOpusSender {
    #[must_use]
    pub fn new(
        destination: SocketAddr,
        sink_id: String,
        source_ip: std::net::Ipv4Addr,
        ssrc: u32,
        channels: u16,
        encoder: Box<dyn OpusEncoderPort>,
        time_sync_delay_ms: i64,
    ) -> Self {
        Self {
            session: None,
            destination,
            sink_id,
            source_ip,
            ssrc,
            channels,
            encoder: Mutex::new(Some(encoder)),
            frame_buffer: Mutex::new(Vec::with_capacity(OPUS_FRAME_SAMPLES * channels as usize * 2)),
            rtcp: None,
            sap: None,
            time_sync_delay_ms,
            closed: AtomicBool::new(false),
        }
    }

    /// Accepts interleaved 16-bit PCM, appends it to the internal frame
    /// buffer, and encodes/emits every complete 960-sample-per-channel
    /// frame it now contains.
    fn ingest_and_drain(&self, pcm: &[i16], csrcs: &CsrcSet) {
        let needed = OPUS_FRAME_SAMPLES * self.channels as usize;
        let mut buffer = self.frame_buffer.lock();
        buffer.extend_from_slice(pcm);

        while buffer.len() >= needed {
            let frame: Vec<i16> = buffer.drain(0..needed).collect();
            self.encode_and_send(&frame, csrcs);
        }
    }

    fn encode_and_send(&self, frame: &[i16], csrcs: &CsrcSet) {
        let Some(session) = &self.session else { return };
        let encoded = {
            let mut encoder_guard = self.encoder.lock();
            match encoder_guard.as_mut() {
                Some(encoder) => encoder.encode(frame, self.channels),
                None => return,
            }
        };
        match encoded {
            Ok(packet) => {
                session.send_rtp_packet(
                    &packet,
                    OPUS_FRAME_SAMPLES as u32,
                    csrcs.as_slice(),
                    false,
                );
            }
            Err(reason) => {
                error!("opus encode failed for {}: {reason}", self.sink_id);
                // timestamp still advances: drop the frame, keep the clock honest
                session.send_rtp_packet(&[], OPUS_FRAME_SAMPLES as u32, csrcs.as_slice(), false);
            }
        }
    }
}

impl NetworkSender for RtpOpusSender {
    fn setup(&mut self) -> bool {
        let session = match RtpSessionCore::new(self.destination, self.ssrc, RTP_PAYLOAD_TYPE_OPUS) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!("rtp opus setup failed for {}: {err}", self.sink_id);
                return false;
            }
        };

        let rtcp_dest = SocketAddr::new(self.destination.ip(), self.destination.port() + 1);
        if let Ok(rtcp_socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            let _ = rtcp_socket.connect(rtcp_dest);
            let rtcp_session = Arc::clone(&session);
            self.rtcp = RtcpController::spawn(
                rtcp_socket,
                self.ssrc,
                self.time_sync_delay_ms,
                move || {
                    (
                        rtcp_session.timestamp(),
                        rtcp_session.packet_count() as u32,
                        rtcp_session.octet_count() as u32,
                    )
                },
            )
            .ok();
        }

        let ssrc = self.ssrc;
        let source_ip = self.source_ip;
        let sink_id = self.sink_id.clone();
        let destination = self.destination;
        let channels = self.channels;
        let codec_name = if channels > 2 { "multiopus" } else { "opus" }.to_string();
        self.sap = SapAnnouncer::spawn(move || SdpDescriptor {
            ssrc,
            source_ip,
            sink_id: sink_id.clone(),
            destination_ip: destination.ip(),
            destination_port: destination.port(),
            payload_type: RTP_PAYLOAD_TYPE_OPUS,
            codec_name: codec_name.clone(),
            clock_rate: 48_000,
            channels: 2.max(channels),
            fmtp: if channels > 2 {
                Some(format!(
                    "streams={channels};coupledstreams={};mappingfamily=1",
                    channels / 2
                ))
            } else {
                None
            },
            is_opus: true,
            channel_map_indices: None,
        })
        .ok();

        self.session = Some(session);
        true
    }

    fn send_payload(&self, bytes: &[u8], csrcs: &CsrcSet) {
        // bytes are interleaved 16-bit PCM, big-endian (the mixer's
        // downscale staging always writes big-endian samples)
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();
        self.ingest_and_drain(&samples, csrcs);
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
        *self.encoder.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder;
    impl OpusEncoderPort for FixedEncoder {
        fn encode(&mut self, pcm: &[i16], _channels: u16) -> Result<Vec<u8>, String> {
            Ok(vec![pcm.len() as u8])
        }
    }

    #[test]
    fn identity_remap_preserves_order() {
        let samples = vec![1, 2, 3, 4];
        let remapped = remap_to_opus_family1_order(&samples, &[0, 1]);
        assert_eq!(remapped, samples);
    }

    #[test]
    fn remap_reorders_channels() {
        let samples = vec![10, 20, 30, 100, 200, 300];
        // swap channel 0 and 2
        let remapped = remap_to_opus_family1_order(&samples, &[2, 1, 0]);
        assert_eq!(remapped, vec![30, 20, 10, 300, 200, 100]);
    }

    #[test]
    fn close_before_setup_is_safe() {
        let mut sender = RtpOpusSender::new(
            "127.0.0.1:4010".parse().unwrap(),
            "opus-sink".into(),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            0xBEEF,
            2,
            Box::new(FixedEncoder),
            0,
        );
        sender.close();
        sender.close();
    }
}
