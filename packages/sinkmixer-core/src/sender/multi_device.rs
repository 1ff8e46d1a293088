//! MultiDeviceRtp sender: fans one mixed N-channel signal out to several
//! independent RTP receivers, each getting its own stereo pair extracted
//! from two configured channel indices. All receivers share a single RTP
//! timestamp clock so their streams stay in phase with each other.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::warn;

use crate::config::MultiDeviceReceiver;
use crate::mixer::mixing::CsrcSet;
use crate::protocol_constants::{
    DEFAULT_RTP_MTU_PAYLOAD_BYTES, OPUS_FRAME_SAMPLES, RTP_PAYLOAD_TYPE_L16, RTP_PAYLOAD_TYPE_OPUS,
};
use crate::rtp::session::slice_payload;
use crate::rtp::{RtcpController, RtpSessionCore, SapAnnouncer, SdpDescriptor};

use super::rtp_l16::swap_to_network_order;
use super::{NetworkSender, OpusEncoderPort};

enum Codec {
    L16 { bytes_per_sample: usize },
    Opus {
        encoder: parking_lot::Mutex<Box<dyn OpusEncoderPort>>,
        frame_buffer: parking_lot::Mutex<Vec<i16>>,
    },
}

/// One receiver's RTP session plus the codec state it owns. Receivers share
/// the mix's source timestamp progression by construction (every tick feeds
/// every receiver the same frame count), so no shared clock object is
/// needed -- each `RtpSessionCore` simply advances in lockstep.
struct ReceiverLane {
    receiver: MultiDeviceReceiver,
    session: Option<Arc<RtpSessionCore>>,
    rtcp: Option<RtcpController>,
    sap: Option<SapAnnouncer>,
}

pub struct MultiDeviceRtpSender {
    sink_id: String,
    source_ip: std::net::Ipv4Addr,
    ssrc_base: u32,
    source_channels: u16,
    sample_rate: u32,
    time_sync_delay_ms: i64,
    codec: Codec,
    mtu_payload_cap: usize,
    lanes: Vec<parking_lot::Mutex<ReceiverLane>>,
    closed: AtomicBool,
    next_ssrc_offset: AtomicU32,
}

impl MultiDeviceRtpSender {
    #[must_use]
    pub fn new_l16(
        sink_id: String,
        source_ip: std::net::Ipv4Addr,
        ssrc_base: u32,
        source_channels: u16,
        sample_rate: u32,
        bytes_per_sample: usize,
        time_sync_delay_ms: i64,
        receivers: Vec<MultiDeviceReceiver>,
    ) -> Self {
        Self::new(
            sink_id,
            source_ip,
            ssrc_base,
            source_channels,
            sample_rate,
            time_sync_delay_ms,
            receivers,
            Codec::L16 { bytes_per_sample },
        )
    }

    #[must_use]
    pub fn new_opus(
        sink_id: String,
        source_ip: std::net::Ipv4Addr,
        ssrc_base: u32,
        source_channels: u16,
        time_sync_delay_ms: i64,
        receivers: Vec<MultiDeviceReceiver>,
        encoder_factory: impl Fn() -> Box<dyn OpusEncoderPort>,
    ) -> Self {
        Self::new(
            sink_id,
            source_ip,
            ssrc_base,
            source_channels,
            48_000,
            time_sync_delay_ms,
            receivers,
            Codec::Opus {
                encoder: parking_lot::Mutex::new(encoder_factory()),
                frame_buffer: parking_lot::Mutex::new(Vec::with_capacity(OPUS_FRAME_SAMPLES * 2)),
            },
        )
    }

    fn new(
        sink_id: String,
        source_ip: std::net::Ipv4Addr,
        ssrc_base: u32,
        source_channels: u16,
        sample_rate: u32,
        time_sync_delay_ms: i64,
        receivers: Vec<MultiDeviceReceiver>,
        codec: Codec,
    ) -> Self {
        let lanes = receivers
            .into_iter()
            .map(|receiver| {
                parking_lot::Mutex::new(ReceiverLane {
                    receiver,
                    session: None,
                    rtcp: None,
                    sap: None,
                })
            })
            .collect();
        Self {
            sink_id,
            source_ip,
            ssrc_base,
            source_channels,
            sample_rate,
            time_sync_delay_ms,
            codec,
            mtu_payload_cap: DEFAULT_RTP_MTU_PAYLOAD_BYTES,
            lanes,
            closed: AtomicBool::new(false),
            next_ssrc_offset: AtomicU32::new(0),
        }
    }

    /// Extracts a receiver's stereo pair from an interleaved N-channel
    /// 16-bit PCM buffer using its configured channel indices. Out-of-range
    /// indices read as silence rather than panicking.
    fn extract_stereo(&self, pcm: &[i16], receiver: &MultiDeviceReceiver) -> Vec<i16> {
        let channels = self.source_channels as usize;
        if channels == 0 {
            return Vec::new();
        }
        let left_index = receiver.left_channel_index as usize;
        let right_index = receiver.right_channel_index as usize;
        let frame_count = pcm.len() / channels;
        let mut out = Vec::with_capacity(frame_count * 2);
        for frame in pcm.chunks_exact(channels) {
            out.push(frame.get(left_index).copied().unwrap_or(0));
            out.push(frame.get(right_index).copied().unwrap_or(0));
        }
        out
    }

    fn payload_type(&self) -> u8 {
        match self.codec {
            Codec::L16 { .. } => RTP_PAYLOAD_TYPE_L16,
            Codec::Opus { .. } => RTP_PAYLOAD_TYPE_OPUS,
        }
    }

    fn send_l16(&self, lane: &ReceiverLane, stereo: &[i16], csrcs: &CsrcSet, bytes_per_sample: usize) {
        let Some(session) = &lane.session else { return };
        let mut bytes: Vec<u8> = Vec::with_capacity(stereo.len() * bytes_per_sample);
        for &sample in stereo {
            bytes.extend_from_slice(&sample.to_ne_bytes());
        }
        swap_to_network_order(&mut bytes, bytes_per_sample);
        let frame_bytes = bytes_per_sample * 2;
        let slices: Vec<Vec<u8>> = slice_payload(&bytes, self.mtu_payload_cap, frame_bytes.max(1))
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

    fn ingest_opus(
        &self,
        lane: &ReceiverLane,
        stereo: &[i16],
        csrcs: &CsrcSet,
        encoder: &parking_lot::Mutex<Box<dyn OpusEncoderPort>>,
        frame_buffer: &parking_lot::Mutex<Vec<i16>>,
    ) {
        let Some(session) = &lane.session else { return };
        let needed = OPUS_FRAME_SAMPLES * 2;
        let mut buffer = frame_buffer.lock();
        buffer.extend_from_slice(stereo);
        while buffer.len() >= needed {
            let frame: Vec<i16> = buffer.drain(0..needed).collect();
            let encoded = encoder.lock().encode(&frame, 2);
            match encoded {
                Ok(packet) => {
                    session.send_rtp_packet(&packet, OPUS_FRAME_SAMPLES as u32, csrcs.as_slice(), false);
                }
                Err(reason) => {
                    warn!(
                        "multi-device opus encode failed for {}/{}: {reason}",
                        self.sink_id, lane.receiver.receiver_id
                    );
                    session.send_rtp_packet(&[], OPUS_FRAME_SAMPLES as u32, csrcs.as_slice(), false);
                }
            }
        }
    }
}

impl NetworkSender for MultiDeviceRtpSender {
    fn setup(&mut self) -> bool {
        let payload_type = self.payload_type();
        let mut any_succeeded = false;
        for (index, lane_lock) in self.lanes.iter().enumerate() {
            let mut lane = lane_lock.lock();
            let destination = SocketAddr::new(lane.receiver.output_ip, lane.receiver.output_port);
            let ssrc = self.ssrc_base.wrapping_add(index as u32 + 1);

            let session = match RtpSessionCore::new(destination, ssrc, payload_type) {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    warn!(
                        "multi-device receiver {} setup failed for {}: {err}",
                        lane.receiver.receiver_id, self.sink_id
                    );
                    continue;
                }
            };

            let rtcp_dest = SocketAddr::new(destination.ip(), destination.port() + 1);
            if let Ok(rtcp_socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
                let _ = rtcp_socket.connect(rtcp_dest);
                let rtcp_session = Arc::clone(&session);
                lane.rtcp = RtcpController::spawn(rtcp_socket, ssrc, self.time_sync_delay_ms, move || {
                    (
                        rtcp_session.timestamp(),
                        rtcp_session.packet_count() as u32,
                        rtcp_session.octet_count() as u32,
                    )
                })
                .ok();
            }

            let is_opus = matches!(self.codec, Codec::Opus { .. });
            let codec_name = if is_opus { "opus" } else { "L16" }.to_string();
            let source_ip = self.source_ip;
            let sink_id = format!("{}/{}", self.sink_id, lane.receiver.receiver_id);
            let sample_rate = if is_opus { 48_000 } else { self.sample_rate };
            lane.sap = SapAnnouncer::spawn(move || SdpDescriptor {
                ssrc,
                source_ip,
                sink_id: sink_id.clone(),
                destination_ip: destination.ip(),
                destination_port: destination.port(),
                payload_type,
                codec_name: codec_name.clone(),
                clock_rate: sample_rate,
                channels: 2,
                fmtp: None,
                is_opus,
                channel_map_indices: None,
            })
            .ok();

            lane.session = Some(session);
            any_succeeded = true;
        }
        self.next_ssrc_offset.store(self.lanes.len() as u32, Ordering::Relaxed);
        any_succeeded
    }

    fn send_payload(&self, bytes: &[u8], csrcs: &CsrcSet) {
        // bytes are interleaved N-channel 16-bit PCM, big-endian (the mixer's
        // downscale staging always writes big-endian samples)
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();

        for lane_lock in &self.lanes {
            let lane = lane_lock.lock();
            let stereo = self.extract_stereo(&samples, &lane.receiver);
            match &self.codec {
                Codec::L16 { bytes_per_sample } => {
                    self.send_l16(&lane, &stereo, csrcs, *bytes_per_sample);
                }
                Codec::Opus { encoder, frame_buffer } => {
                    self.ingest_opus(&lane, &stereo, csrcs, encoder, frame_buffer);
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for lane_lock in &self.lanes {
            let mut lane = lane_lock.lock();
            if let Some(mut sap) = lane.sap.take() {
                sap.stop();
            }
            if let Some(mut rtcp) = lane.rtcp.take() {
                rtcp.stop();
            }
            lane.session = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(id: &str, left: u16, right: u16) -> MultiDeviceReceiver {
        MultiDeviceReceiver {
            receiver_id: id.into(),
            output_ip: "127.0.0.1".parse().unwrap(),
            output_port: 5000,
            left_channel_index: left,
            right_channel_index: right,
        }
    }

    #[test]
    fn extract_stereo_pulls_configured_channels() {
        let sender = MultiDeviceRtpSender::new_l16(
            "sink".into(),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            0,
            6,
            48_000,
            2,
            0,
            vec![receiver("front", 0, 1), receiver("rear", 4, 5)],
        );
        // one frame of 6 channels: 0,1,2,3,4,5
        let pcm: Vec<i16> = vec![0, 1, 2, 3, 4, 5];
        let front = sender.extract_stereo(&pcm, &sender.lanes[0].lock().receiver);
        assert_eq!(front, vec![0, 1]);
        let rear = sender.extract_stereo(&pcm, &sender.lanes[1].lock().receiver);
        assert_eq!(rear, vec![4, 5]);
    }

    #[test]
    fn out_of_range_channel_index_reads_silence() {
        let sender = MultiDeviceRtpSender::new_l16(
            "sink".into(),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            0,
            2,
            48_000,
            2,
            0,
            vec![receiver("bad", 0, 9)],
        );
        let pcm: Vec<i16> = vec![11, 22];
        let extracted = sender.extract_stereo(&pcm, &sender.lanes[0].lock().receiver);
        assert_eq!(extracted, vec![11, 0]);
    }

    #[test]
    fn close_before_setup_is_safe() {
        let mut sender = MultiDeviceRtpSender::new_l16(
            "sink".into(),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            0,
            2,
            48_000,
            2,
            0,
            vec![receiver("front", 0, 1)],
        );
        sender.close();
        sender.close();
    }
}
