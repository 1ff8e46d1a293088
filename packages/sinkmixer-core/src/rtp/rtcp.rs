//! RTCP Sender Report emission and Receiver Report / SDES / BYE / APP
//! parsing for the RTCP loop each RTP sender runs alongside its data path.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::protocol_constants::{
    NTP_UNIX_EPOCH_OFFSET_SECS, RTCP_PT_APP, RTCP_PT_BYE, RTCP_PT_RECEIVER_REPORT, RTCP_PT_SDES,
    RTCP_PT_SENDER_REPORT, RTCP_RECV_TIMEOUT,
};

/// A 64-bit NTP timestamp: seconds since the NTP epoch in the upper 32
/// bits, fractional seconds in the lower 32.
#[must_use]
pub fn ntp_timestamp_from_wall_clock(now: SystemTime, time_sync_delay_ms: i64) -> (u32, u32) {
    let adjusted = if time_sync_delay_ms >= 0 {
        now + Duration::from_millis(time_sync_delay_ms as u64)
    } else {
        now - Duration::from_millis((-time_sync_delay_ms) as u64)
    };
    let since_unix_epoch = adjusted
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let ntp_seconds = since_unix_epoch.as_secs() + NTP_UNIX_EPOCH_OFFSET_SECS;
    let fraction = since_unix_epoch.subsec_nanos();
    // convert nanoseconds to a 32-bit binary fraction of a second
    let ntp_fraction = ((u64::from(fraction) << 32) / 1_000_000_000) as u32;
    (ntp_seconds as u32, ntp_fraction)
}

/// Builds an RTCP Sender Report packet: header, SSRC, NTP timestamp pair,
/// RTP timestamp, packet count, octet count. Length field is fixed at 6
/// (7 words minus 1), since this report carries no report blocks.
#[must_use]
pub fn build_sender_report(
    ssrc: u32,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
    time_sync_delay_ms: i64,
) -> Vec<u8> {
    let (ntp_msw, ntp_lsw) = ntp_timestamp_from_wall_clock(SystemTime::now(), time_sync_delay_ms);
    let mut buf = Vec::with_capacity(28);
    // V=2, P=0, RC=0
    buf.push(0x80);
    buf.push(RTCP_PT_SENDER_REPORT);
    buf.extend_from_slice(&6u16.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(&ntp_msw.to_be_bytes());
    buf.extend_from_slice(&ntp_lsw.to_be_bytes());
    buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
    buf.extend_from_slice(&packet_count.to_be_bytes());
    buf.extend_from_slice(&octet_count.to_be_bytes());
    buf
}

/// A parsed Receiver Report's reception-quality fields, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReportStats {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub jitter: u32,
}

/// What the RTCP receive loop observed in one incoming packet.
#[derive(Debug, Clone)]
pub enum RtcpEvent {
    ReceiverReport(Vec<ReceiverReportStats>),
    Sdes,
    Bye { reason: Option<String> },
    App,
    Unknown { packet_type: u8 },
}

/// Parses the RTCP packet type from the first packet in a (possibly
/// compound) RTCP payload and extracts the fields the component design
/// requires the receive loop to log.
#[must_use]
pub fn parse_rtcp_packet(data: &[u8]) -> Option<RtcpEvent> {
    if data.len() < 8 {
        return None;
    }
    let rc = data[0] & 0x1F;
    let packet_type = data[1];
    match packet_type {
        RTCP_PT_RECEIVER_REPORT => {
            let mut reports = Vec::new();
            let mut offset = 8usize;
            for _ in 0..rc {
                if offset + 24 > data.len() {
                    break;
                }
                let ssrc = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
                let fraction_lost = data[offset + 4];
                let cumulative_lost = u32::from_be_bytes([
                    0,
                    data[offset + 5],
                    data[offset + 6],
                    data[offset + 7],
                ]);
                let jitter = u32::from_be_bytes(
                    data[offset + 12..offset + 16].try_into().unwrap(),
                );
                reports.push(ReceiverReportStats {
                    ssrc,
                    fraction_lost,
                    cumulative_lost,
                    jitter,
                });
                offset += 24;
            }
            Some(RtcpEvent::ReceiverReport(reports))
        }
        RTCP_PT_SDES => Some(RtcpEvent::Sdes),
        RTCP_PT_BYE => {
            let reason = if data.len() > 8 {
                let reason_len = data[8] as usize;
                data.get(9..9 + reason_len)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            } else {
                None
            };
            Some(RtcpEvent::Bye { reason })
        }
        RTCP_PT_APP => Some(RtcpEvent::App),
        other => Some(RtcpEvent::Unknown { packet_type: other }),
    }
}

/// Runs the per-sender RTCP loop: emits a Sender Report every
/// [`crate::protocol_constants::RTCP_SR_INTERVAL`] and listens (bounded at
/// [`RTCP_RECV_TIMEOUT`]) for incoming RR/SDES/BYE/APP on the same socket.
pub struct RtcpController {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RtcpController {
    /// `report_source` is called once per SR interval to fetch the current
    /// `(rtp_timestamp, packet_count, octet_count)` snapshot from the owning
    /// RTP session.
    pub fn spawn(
        socket: UdpSocket,
        ssrc: u32,
        time_sync_delay_ms: i64,
        report_source: impl Fn() -> (u32, u32, u32) + Send + 'static,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(RTCP_RECV_TIMEOUT))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(format!("rtcp-{ssrc:08x}"))
            .spawn(move || {
                let mut last_report = std::time::Instant::now()
                    - crate::protocol_constants::RTCP_SR_INTERVAL;
                let mut buf = [0u8; 1500];
                while !thread_stop.load(Ordering::Acquire) {
                    if last_report.elapsed() >= crate::protocol_constants::RTCP_SR_INTERVAL {
                        let (rtp_timestamp, packet_count, octet_count) = report_source();
                        let sr = build_sender_report(
                            ssrc,
                            rtp_timestamp,
                            packet_count,
                            octet_count,
                            time_sync_delay_ms,
                        );
                        if let Err(err) = socket.send(&sr) {
                            warn!("rtcp SR send failed for ssrc {ssrc:08x}: {err}");
                        }
                        last_report = std::time::Instant::now();
                    }

                    match socket.recv(&mut buf) {
                        Ok(len) => {
                            if let Some(event) = parse_rtcp_packet(&buf[..len]) {
                                log_rtcp_event(ssrc, &event);
                            }
                        }
                        Err(err)
                            if err.kind() == io::ErrorKind::WouldBlock
                                || err.kind() == io::ErrorKind::TimedOut => {}
                        Err(err) => {
                            debug!("rtcp recv error for ssrc {ssrc:08x}: {err}");
                        }
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

impl Drop for RtcpController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_rtcp_event(ssrc: u32, event: &RtcpEvent) {
    match event {
        RtcpEvent::ReceiverReport(reports) => {
            for report in reports {
                info!(
                    "rtcp RR for ssrc {ssrc:08x}: reporter={:08x} fraction_lost={} cumulative_lost={} jitter={}",
                    report.ssrc, report.fraction_lost, report.cumulative_lost, report.jitter
                );
            }
        }
        RtcpEvent::Bye { reason } => {
            info!("rtcp BYE for ssrc {ssrc:08x}: {reason:?}");
        }
        RtcpEvent::Sdes => debug!("rtcp SDES for ssrc {ssrc:08x}"),
        RtcpEvent::App => debug!("rtcp APP for ssrc {ssrc:08x}"),
        RtcpEvent::Unknown { packet_type } => {
            debug!("rtcp unknown packet type {packet_type} for ssrc {ssrc:08x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_timestamp_applies_epoch_offset() {
        let (msw, _lsw) = ntp_timestamp_from_wall_clock(UNIX_EPOCH, 0);
        assert_eq!(msw, NTP_UNIX_EPOCH_OFFSET_SECS as u32);
    }

    #[test]
    fn sender_report_has_fixed_length_six() {
        let sr = build_sender_report(0xAAAA, 1000, 5, 5000, 0);
        let length_field = u16::from_be_bytes([sr[2], sr[3]]);
        assert_eq!(length_field, 6);
        assert_eq!(sr.len(), 28);
        assert_eq!(sr[1], RTCP_PT_SENDER_REPORT);
    }

    #[test]
    fn parses_receiver_report_fields() {
        let mut data = vec![0x81, RTCP_PT_RECEIVER_REPORT, 0, 7];
        data.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes()); // sender ssrc
        data.extend_from_slice(&0x1234_5678u32.to_be_bytes()); // reporter ssrc
        data.push(10); // fraction lost
        data.extend_from_slice(&[0, 0, 3]); // cumulative lost = 3
        data.extend_from_slice(&[0u8; 4]); // extended highest seq
        data.extend_from_slice(&42u32.to_be_bytes()); // jitter
        data.extend_from_slice(&[0u8; 8]); // LSR + DLSR

        let event = parse_rtcp_packet(&data).unwrap();
        match event {
            RtcpEvent::ReceiverReport(reports) => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].ssrc, 0x1234_5678);
                assert_eq!(reports[0].fraction_lost, 10);
                assert_eq!(reports[0].cumulative_lost, 3);
                assert_eq!(reports[0].jitter, 42);
            }
            other => panic!("expected ReceiverReport, got {other:?}"),
        }
    }

    #[test]
    fn parses_bye_with_reason() {
        let mut data = vec![0x81, RTCP_PT_BYE, 0, 1];
        data.extend_from_slice(&0xAAAAu32.to_be_bytes());
        data.push(4);
        data.extend_from_slice(b"done");
        let event = parse_rtcp_packet(&data).unwrap();
        match event {
            RtcpEvent::Bye { reason } => assert_eq!(reason.as_deref(), Some("done")),
            other => panic!("expected Bye, got {other:?}"),
        }
    }
}
