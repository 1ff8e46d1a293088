//! Legacy Scream UDP sender: a 5-byte header prepended to raw PCM at the
//! sink's configured bit depth.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::error::SenderError;
use crate::mixer::mixing::CsrcSet;
use crate::protocol_constants::SCREAM_SAMPLE_RATE_44K_FLAG;

use super::NetworkSender;

/// Encodes the Scream sample-rate byte: bit 7 set selects the 48k family
/// (multiplier relative to 48000 Hz), bit 7 clear selects the 44.1k family
/// (multiplier relative to 44100 Hz); the low 7 bits carry that multiplier.
#[must_use]
pub fn encode_sample_rate_flag(sample_rate: u32) -> u8 {
    if sample_rate % 48_000 == 0 {
        let multiplier = (sample_rate / 48_000).max(1);
        SCREAM_SAMPLE_RATE_44K_FLAG | (multiplier as u8 & 0x7F)
    } else {
        let multiplier = (sample_rate / 44_100).max(1);
        multiplier as u8 & 0x7F
    }
}

/// Builds the 5-byte Scream header: `[rate_flag, bit_depth, channels,
/// layout_lo, layout_hi]`.
#[must_use]
pub fn build_scream_header(
    sample_rate: u32,
    bit_depth: u16,
    channels: u16,
    channel_layout_mask: u32,
) -> [u8; 5] {
    [
        encode_sample_rate_flag(sample_rate),
        bit_depth as u8,
        channels as u8,
        (channel_layout_mask & 0xFF) as u8,
        ((channel_layout_mask >> 8) & 0xFF) as u8,
    ]
}

pub struct ScreamLegacySender {
    destination: SocketAddr,
    socket: Option<UdpSocket>,
    header: [u8; 5],
    closed: AtomicBool,
}

impl ScreamLegacySender {
    #[must_use]
    pub fn new(destination: SocketAddr, sample_rate: u32, bit_depth: u16, channels: u16, channel_layout_mask: u32) -> Self {
        Self {
            destination,
            socket: None,
            header: build_scream_header(sample_rate, bit_depth, channels, channel_layout_mask),
            closed: AtomicBool::new(false),
        }
    }

    fn bind(&self) -> Result<UdpSocket, SenderError> {
        let bind_addr: SocketAddr = if self.destination.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).map_err(|source| SenderError::SocketBind {
            sink_id: self.destination.to_string(),
            source,
        })?;
        socket
            .connect(self.destination)
            .map_err(|source| SenderError::SocketBind {
                sink_id: self.destination.to_string(),
                source,
            })?;
        Ok(socket)
    }
}

impl NetworkSender for ScreamLegacySender {
    fn setup(&mut self) -> bool {
        match self.bind() {
            Ok(socket) => {
                self.socket = Some(socket);
                true
            }
            Err(err) => {
                warn!("scream sender setup failed: {err}");
                false
            }
        }
    }

    fn send_payload(&self, bytes: &[u8], _csrcs: &CsrcSet) {
        let Some(socket) = &self.socket else { return };
        let mut packet = Vec::with_capacity(self.header.len() + bytes.len());
        packet.extend_from_slice(&self.header);
        packet.extend_from_slice(bytes);
        if let Err(err) = socket.send(&packet) {
            warn!("scream send to {} failed: {err}", self.destination);
        }
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_48k_family_sets_flag_bit() {
        assert_eq!(encode_sample_rate_flag(48_000), 0x81);
        assert_eq!(encode_sample_rate_flag(96_000), 0x82);
    }

    #[test]
    fn sample_rate_44k_family_has_flag_bit_clear() {
        assert_eq!(encode_sample_rate_flag(44_100), 0x01);
        assert_eq!(encode_sample_rate_flag(88_200), 0x02);
    }

    #[test]
    fn header_matches_spec_scenario_one() {
        // stereo 16-bit 48kHz -> [0x81, 16, 2, 0x03, 0x00] per spec's
        // worked example
        let header = build_scream_header(48_000, 16, 2, 0x0003);
        assert_eq!(header, [0x81, 16, 2, 0x03, 0x00]);
    }

    #[test]
    fn close_is_idempotent() {
        let mut sender = ScreamLegacySender::new(
            "127.0.0.1:4010".parse().unwrap(),
            48_000,
            16,
            2,
            0x3,
        );
        sender.setup();
        sender.close();
        sender.close();
        assert!(sender.socket.is_none());
    }
}
