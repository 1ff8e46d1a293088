//! RTP header wire format and the session core shared by every RTP-based
//! sender variant: sequence number, SSRC, timestamp, header assembly,
//! UDP/multicast send, MTU slicing.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use log::warn;
use socket2::{Domain, Protocol, Socket, Type};

use crate::protocol_constants::{
    DSCP_EXPEDITED_FORWARDING, RTP_FIXED_HEADER_LEN, RTP_MAX_CSRC_COUNT, RTP_MULTICAST_TTL,
    RTP_VERSION,
};

/// A 12-byte-plus-CSRC RTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
}

impl RtpHeader {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RTP_FIXED_HEADER_LEN + self.csrcs.len() * 4
    }

    /// Serializes the header, big-endian, network byte order, exactly per
    /// RFC 3550 section 5.1.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let csrc_count = self.csrcs.len().min(RTP_MAX_CSRC_COUNT) as u8;
        let byte0 = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | csrc_count;
        let byte1 = ((self.marker as u8) << 7) | self.payload_type;
        buf.push(byte0);
        buf.push(byte1);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in self.csrcs.iter().take(RTP_MAX_CSRC_COUNT) {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
        buf
    }

    /// Parses a header from the front of `data`. Returns the header and the
    /// number of bytes consumed.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < RTP_FIXED_HEADER_LEN {
            return None;
        }
        let byte0 = data[0];
        let version = byte0 >> 6;
        let padding = (byte0 & 0x20) != 0;
        let extension = (byte0 & 0x10) != 0;
        let csrc_count = (byte0 & 0x0F) as usize;
        let byte1 = data[1];
        let marker = (byte1 & 0x80) != 0;
        let payload_type = byte1 & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let consumed_before_csrcs = RTP_FIXED_HEADER_LEN;
        let needed = consumed_before_csrcs + csrc_count * 4;
        if data.len() < needed {
            return None;
        }
        let mut csrcs = Vec::with_capacity(csrc_count);
        for i in 0..csrc_count {
            let offset = consumed_before_csrcs + i * 4;
            csrcs.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
        }

        Some((
            Self {
                version,
                padding,
                extension,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrcs,
            },
            needed,
        ))
    }
}

/// Rounds `mtu_payload_cap` down to the nearest whole multiple of
/// `bytes_per_frame`, so no RTP packet ever splits a frame across two
/// packets.
#[must_use]
pub fn mtu_slice_len(mtu_payload_cap: usize, bytes_per_frame: usize) -> usize {
    if bytes_per_frame == 0 {
        return mtu_payload_cap;
    }
    let frames = mtu_payload_cap / bytes_per_frame;
    (frames.max(1)) * bytes_per_frame
}

/// Splits `payload` into MTU-bounded, frame-aligned slices.
pub fn slice_payload(payload: &[u8], mtu_payload_cap: usize, bytes_per_frame: usize) -> Vec<&[u8]> {
    let slice_len = mtu_slice_len(mtu_payload_cap, bytes_per_frame);
    if slice_len == 0 {
        return vec![payload];
    }
    payload.chunks(slice_len).collect()
}

/// Shared RTP session state: SSRC, sequence number, timestamp, and
/// cumulative counters, plus the UDP socket used to emit packets. Owned
/// (by composition, not inheritance) by every RTP-based sender variant.
pub struct RtpSessionCore {
    socket: UdpSocket,
    destination: SocketAddr,
    ssrc: u32,
    payload_type: u8,
    sequence_number: AtomicU16,
    timestamp: AtomicU32,
    packet_count: AtomicU64,
    octet_count: AtomicU64,
}

impl RtpSessionCore {
    /// Binds a UDP socket via `socket2` (so TTL and DSCP are set on the
    /// socket before it's ever handed a destination), sets multicast TTL
    /// (when the destination is in 224.0.0.0/4) and DSCP EF where the
    /// platform exposes `IP_TOS`, and returns the session core ready to
    /// send.
    pub fn new(destination: SocketAddr, ssrc: u32, payload_type: u8) -> io::Result<Self> {
        let domain = if destination.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let raw_socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        let bind_addr: SocketAddr = if destination.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        raw_socket.bind(&bind_addr.into())?;
        raw_socket.connect(&destination.into())?;

        if destination.is_ipv4() && is_multicast(destination.ip()) {
            raw_socket.set_multicast_ttl_v4(RTP_MULTICAST_TTL)?;
        }

        configure_dscp_ef(&raw_socket, destination);

        let socket: UdpSocket = raw_socket.into();

        Ok(Self {
            socket,
            destination,
            ssrc,
            payload_type,
            sequence_number: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
            packet_count: AtomicU64::new(0),
            octet_count: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    #[must_use]
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn octet_count(&self) -> u64 {
        self.octet_count.load(Ordering::Relaxed)
    }

    /// Assembles a header, appends `payload`, and sends over UDP. Sequence
    /// number and RTP timestamp advance regardless of send success -- a
    /// dropped packet must not desynchronize the stream's pacing.
    ///
    /// Returns `true` if the underlying `sendto` succeeded.
    pub fn send_rtp_packet(
        &self,
        payload: &[u8],
        frames_in_payload: u32,
        csrcs: &[u32],
        marker: bool,
    ) -> bool {
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::AcqRel);
        let timestamp = self.timestamp.load(Ordering::Acquire);

        let header = RtpHeader {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker,
            payload_type: self.payload_type,
            sequence_number,
            timestamp,
            ssrc: self.ssrc,
            csrcs: csrcs.to_vec(),
        };

        let mut packet = header.to_bytes();
        packet.extend_from_slice(payload);

        self.timestamp
            .fetch_add(frames_in_payload, Ordering::AcqRel);

        let sent = match self.socket.send(&packet) {
            Ok(_) => true,
            Err(err) => {
                warn!("rtp send to {} failed: {err}", self.destination);
                false
            }
        };

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.octet_count
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        sent
    }
}

#[must_use]
fn is_multicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

#[cfg(not(windows))]
fn configure_dscp_ef(socket: &Socket, destination: SocketAddr) {
    if let Err(err) = socket.set_tos(u32::from(DSCP_EXPEDITED_FORWARDING)) {
        warn!("failed to set DSCP EF on rtp socket to {destination}: {err}");
    }
}

#[cfg(windows)]
fn configure_dscp_ef(_socket: &Socket, _destination: SocketAddr) {
    // IP_TOS is not exposed on Windows sockets; DSCP marking ships without
    // it there rather than fail sender setup.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            marker: true,
            payload_type: 127,
            sequence_number: 4242,
            timestamp: 0xdead_beef,
            ssrc: 0x1234_5678,
            csrcs: vec![1, 2, 3],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 12 + 12);
        let (decoded, consumed) = RtpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn marker_and_payload_type_share_byte1_correctly() {
        let header = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 111,
            sequence_number: 1,
            timestamp: 1,
            ssrc: 1,
            csrcs: vec![],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[1], 111);
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn csrc_count_is_capped_at_fifteen_on_encode() {
        let header = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 127,
            sequence_number: 1,
            timestamp: 1,
            ssrc: 1,
            csrcs: (0..20).collect(),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0] & 0x0F, 15);
        assert_eq!(bytes.len(), 12 + 15 * 4);
    }

    #[test]
    fn mtu_slice_len_rounds_down_to_whole_frames() {
        // 4 bytes/frame (stereo 16-bit), cap 1152 -> already a multiple
        assert_eq!(mtu_slice_len(1152, 4), 1152);
        // cap 1150 is not a multiple of 4 -> rounds down to 1148
        assert_eq!(mtu_slice_len(1150, 4), 1148);
    }

    #[test]
    fn slice_payload_never_splits_a_frame() {
        let payload = vec![0u8; 10];
        let slices = slice_payload(&payload, 7, 2);
        // slice_len = 6 (3 frames of 2 bytes), so slices are 6 then 4
        assert_eq!(slices[0].len(), 6);
        assert_eq!(slices[1].len(), 4);
        assert_eq!(slices[0].len() + slices[1].len(), 10);
    }

    #[test]
    fn sequence_and_timestamp_advance_regardless_of_csrcs() {
        // uses a loopback UDP socket so send() succeeds deterministically in CI
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = server.local_addr().unwrap();
        let session = RtpSessionCore::new(dest, 0xAAAA_BBBB, 127).unwrap();
        assert!(session.send_rtp_packet(&[0u8; 8], 2, &[], false));
        assert_eq!(session.sequence_number(), 1);
        assert_eq!(session.timestamp(), 2);
        assert!(session.send_rtp_packet(&[0u8; 8], 2, &[], true));
        assert_eq!(session.sequence_number(), 2);
        assert_eq!(session.timestamp(), 4);
        assert_eq!(session.packet_count(), 2);
    }
}
