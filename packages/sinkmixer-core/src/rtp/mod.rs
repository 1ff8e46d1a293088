//! RTP session core shared by every RTP-based sender variant, plus the
//! RTCP and SAP side-channels each RTP sender drives on independent timed
//! threads.

pub mod rtcp;
pub mod sap;
pub mod session;

pub use rtcp::{ntp_timestamp_from_wall_clock, RtcpController, RtcpEvent};
pub use sap::{SapAnnouncer, SdpDescriptor};
pub use session::{mtu_slice_len, slice_payload, RtpHeader, RtpSessionCore};
