//! Session Announcement Protocol (RFC 2974) multicast announcer, run as an
//! independent timed thread per RTP sender.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::protocol_constants::{
    SAP_ANNOUNCE_INTERVAL, SAP_MULTICAST_ADDR_GLOBAL, SAP_MULTICAST_ADDR_LOCAL,
    SAP_MULTICAST_TTL, SAP_PORT, SAP_PAYLOAD_TYPE, SAP_VERSION,
};

/// Fields needed to render the minimum SDP body the spec requires.
#[derive(Debug, Clone)]
pub struct SdpDescriptor {
    pub ssrc: u32,
    pub source_ip: Ipv4Addr,
    pub sink_id: String,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: Option<String>,
    pub is_opus: bool,
    /// `channelmap` indices, rendered only when `channels >= 3 && !is_opus`.
    pub channel_map_indices: Option<Vec<u16>>,
}

impl SdpDescriptor {
    /// Builds the session description exactly as the wire format section
    /// specifies: `o=screamrouter <ssrc> ...` is the literal origin line
    /// every receiver in the ecosystem expects.
    #[must_use]
    pub fn render(&self) -> String {
        let mut body = String::new();
        body.push_str("v=0\r\n");
        body.push_str(&format!(
            "o=screamrouter {} 1 IN IP4 {}\r\n",
            self.ssrc, self.source_ip
        ));
        body.push_str(&format!("s={}\r\n", self.sink_id));
        body.push_str(&format!("c=IN IP4 {}\r\n", self.destination_ip));
        body.push_str("t=0 0\r\n");
        body.push_str(&format!(
            "m=audio {} RTP/AVP {}\r\n",
            self.destination_port, self.payload_type
        ));
        let rtpmap = if self.channels > 1 {
            format!(
                "a=rtpmap:{} {}/{}/{}\r\n",
                self.payload_type, self.codec_name, self.clock_rate, self.channels
            )
        } else {
            format!(
                "a=rtpmap:{} {}/{}\r\n",
                self.payload_type, self.codec_name, self.clock_rate
            )
        };
        body.push_str(&rtpmap);
        if let Some(fmtp) = &self.fmtp {
            body.push_str(&format!("a=fmtp:{} {}\r\n", self.payload_type, fmtp));
        }
        if self.is_opus {
            body.push_str("a=ptime:20\r\n");
        }
        if !self.is_opus && self.channels >= 3 {
            if let Some(indices) = &self.channel_map_indices {
                let joined = indices
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                body.push_str(&format!(
                    "a=channelmap:{} {} {}\r\n",
                    self.payload_type, self.channels, joined
                ));
            }
        }
        body
    }
}

/// Wraps an SDP body in the RFC 2974 SAP header.
#[must_use]
pub fn build_sap_packet(descriptor: &SdpDescriptor, msg_id_hash: u16) -> Vec<u8> {
    let sdp = descriptor.render();
    let mut packet = Vec::with_capacity(8 + sdp.len() + SAP_PAYLOAD_TYPE.len() + 2);

    // byte 0: V(3)=1, A=0(ipv4), R=0, T=0(announce), E=0, C=0
    let byte0 = SAP_VERSION << 5;
    packet.push(byte0);
    packet.push(0); // auth length = 0
    packet.extend_from_slice(&msg_id_hash.to_be_bytes());
    packet.extend_from_slice(&descriptor.source_ip.octets());
    packet.extend_from_slice(SAP_PAYLOAD_TYPE.as_bytes());
    packet.push(0);
    packet.extend_from_slice(sdp.as_bytes());
    packet
}

fn sap_destinations() -> [SocketAddr; 2] {
    [
        SocketAddr::V4(SocketAddrV4::new(
            SAP_MULTICAST_ADDR_GLOBAL.parse().unwrap(),
            SAP_PORT,
        )),
        SocketAddr::V4(SocketAddrV4::new(
            SAP_MULTICAST_ADDR_LOCAL.parse().unwrap(),
            SAP_PORT,
        )),
    ]
}

/// Owns the per-sender SAP announcement thread.
pub struct SapAnnouncer {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SapAnnouncer {
    /// `descriptor_source` is polled once per announce interval to get the
    /// current SDP descriptor (the session id derived from SSRC is stable
    /// per sender, so repeated announcements stay byte-identical within the
    /// interval).
    pub fn spawn(
        descriptor_source: impl Fn() -> SdpDescriptor + Send + 'static,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_multicast_ttl_v4(SAP_MULTICAST_TTL)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("sap-announcer".into())
            .spawn(move || {
                let destinations = sap_destinations();
                while !thread_stop.load(Ordering::Acquire) {
                    let descriptor = descriptor_source();
                    // low 16 bits of an arbitrary monotonic value serve as
                    // the msg-id-hash; the sequence number field on the RTP
                    // session is the natural source, but the announcer only
                    // has the descriptor, so derive it from the ssrc tick.
                    let msg_id_hash = (descriptor.ssrc & 0xFFFF) as u16;
                    let packet = build_sap_packet(&descriptor, msg_id_hash);
                    for dest in &destinations {
                        if let Err(err) = socket.send_to(&packet, dest) {
                            warn!("sap announce to {dest} failed: {err}");
                        }
                    }
                    let mut slept = std::time::Duration::ZERO;
                    while slept < SAP_ANNOUNCE_INTERVAL && !thread_stop.load(Ordering::Acquire) {
                        let step = std::time::Duration::from_millis(100);
                        std::thread::sleep(step);
                        slept += step;
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SapAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SdpDescriptor {
        SdpDescriptor {
            ssrc: 0x1234_5678,
            source_ip: Ipv4Addr::new(192, 168, 1, 10),
            sink_id: "living-room".into(),
            destination_ip: IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)),
            destination_port: 4010,
            payload_type: 127,
            codec_name: "L16".into(),
            clock_rate: 48_000,
            channels: 2,
            fmtp: None,
            is_opus: false,
            channel_map_indices: None,
        }
    }

    #[test]
    fn sdp_body_contains_required_origin_line() {
        let sdp = descriptor().render();
        assert!(sdp.contains("o=screamrouter 305419896 1 IN IP4 192.168.1.10"));
        assert!(sdp.contains("m=audio 4010 RTP/AVP 127"));
        assert!(sdp.contains("a=rtpmap:127 L16/48000/2"));
    }

    #[test]
    fn opus_sdp_includes_ptime_and_no_channelmap() {
        let mut d = descriptor();
        d.payload_type = 111;
        d.codec_name = "opus".into();
        d.is_opus = true;
        let sdp = d.render();
        assert!(sdp.contains("a=ptime:20"));
        assert!(!sdp.contains("channelmap"));
    }

    #[test]
    fn multichannel_non_opus_includes_channelmap() {
        let mut d = descriptor();
        d.channels = 6;
        d.channel_map_indices = Some(vec![0, 1, 2, 3, 4, 5]);
        let sdp = d.render();
        assert!(sdp.contains("a=channelmap:127 6 0,1,2,3,4,5"));
    }

    #[test]
    fn two_emissions_within_one_second_are_byte_identical() {
        let d = descriptor();
        let first = build_sap_packet(&d, 0x5678);
        let second = build_sap_packet(&d, 0x5678);
        assert_eq!(first, second);
    }

    #[test]
    fn sap_header_has_expected_version_bits() {
        let d = descriptor();
        let packet = build_sap_packet(&d, 0x5678);
        assert_eq!(packet[0] >> 5, SAP_VERSION);
    }
}
