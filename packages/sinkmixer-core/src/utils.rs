//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// IP Address Validation
// ─────────────────────────────────────────────────────────────────────────────

use std::net::{IpAddr, Ipv4Addr};

use crate::error::ErrorCode;

/// Error returned when an IP address is not valid as a network sink
/// destination (RTP/Scream/multi-device receivers). `SystemAudio` sinks
/// validate their `output_ip` separately, since a loopback address is the
/// deliberate signal that selects the local FIFO/ALSA/WASAPI backend --
/// see [`crate::sender::system_audio::is_loopback_target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpValidationError {
    /// IPv6 addresses are not supported.
    Ipv6NotSupported,
    /// Loopback address (127.x.x.x).
    Loopback,
    /// Unspecified address (0.0.0.0).
    Unspecified,
    /// Broadcast address (255.255.255.255).
    Broadcast,
    /// Link-local address (169.254.x.x).
    LinkLocal,
}

impl ErrorCode for IpValidationError {
    fn code(&self) -> &'static str {
        "invalid_ip"
    }
}

impl IpValidationError {
    /// Returns a human-readable description of the error.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ipv6NotSupported => "IPv6 addresses are not supported for network sink destinations",
            Self::Loopback => "loopback addresses cannot be used as a network sink destination",
            Self::Unspecified => "unspecified address (0.0.0.0) is not a valid destination",
            Self::Broadcast => "broadcast addresses cannot be used as a network sink destination",
            Self::LinkLocal => "link-local addresses (169.254.x.x) cannot be used as a network sink destination",
        }
    }
}

impl std::fmt::Display for IpValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for IpValidationError {}

/// Validates that an IP address is suitable as a network sink destination.
/// Multicast addresses are accepted (RTP/SAP both target multicast groups);
/// everything else non-unicast-routable is rejected. Returns the validated
/// IPv4 address for canonical storage.
///
/// # Examples
///
/// ```
/// use std::net::IpAddr;
/// use sinkmixer_core::validate_sink_destination_ip;
///
/// let ip: IpAddr = "192.168.1.100".parse().unwrap();
/// assert!(validate_sink_destination_ip(&ip).is_ok());
///
/// let ip: IpAddr = "::1".parse().unwrap();
/// assert!(validate_sink_destination_ip(&ip).is_err());
///
/// let ip: IpAddr = "239.1.2.3".parse().unwrap();
/// assert!(validate_sink_destination_ip(&ip).is_ok());
/// ```
pub fn validate_sink_destination_ip(ip: &IpAddr) -> Result<Ipv4Addr, IpValidationError> {
    let ipv4 = match ip {
        IpAddr::V4(v4) => *v4,
        IpAddr::V6(_) => return Err(IpValidationError::Ipv6NotSupported),
    };

    if ipv4.is_loopback() {
        return Err(IpValidationError::Loopback);
    }
    if ipv4.is_unspecified() {
        return Err(IpValidationError::Unspecified);
    }
    if ipv4.is_broadcast() {
        return Err(IpValidationError::Broadcast);
    }
    if ipv4.is_link_local() {
        return Err(IpValidationError::LinkLocal);
    }

    Ok(ipv4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_destination_ip_valid_private() {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        let result = validate_sink_destination_ip(&ip);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().to_string(), "192.168.1.100");
    }

    #[test]
    fn test_validate_destination_ip_valid_public() {
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(validate_sink_destination_ip(&ip).is_ok());
    }

    #[test]
    fn test_validate_destination_ip_multicast_accepted() {
        let ip: IpAddr = "239.1.2.3".parse().unwrap();
        assert!(validate_sink_destination_ip(&ip).is_ok());
    }

    #[test]
    fn test_validate_destination_ip_ipv6_rejected() {
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Ipv6NotSupported)
        );
    }

    #[test]
    fn test_validate_destination_ip_ipv6_global_rejected() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Ipv6NotSupported)
        );
    }

    #[test]
    fn test_validate_destination_ip_loopback() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Loopback)
        );
    }

    #[test]
    fn test_validate_destination_ip_loopback_range() {
        let ip: IpAddr = "127.255.255.255".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Loopback)
        );
    }

    #[test]
    fn test_validate_destination_ip_unspecified() {
        let ip: IpAddr = "0.0.0.0".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Unspecified)
        );
    }

    #[test]
    fn test_validate_destination_ip_broadcast() {
        let ip: IpAddr = "255.255.255.255".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::Broadcast)
        );
    }

    #[test]
    fn test_validate_destination_ip_link_local() {
        let ip: IpAddr = "169.254.1.1".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::LinkLocal)
        );
    }

    #[test]
    fn test_validate_destination_ip_link_local_range() {
        let ip: IpAddr = "169.254.254.254".parse().unwrap();
        assert_eq!(
            validate_sink_destination_ip(&ip),
            Err(IpValidationError::LinkLocal)
        );
    }

    #[test]
    fn test_ip_validation_error_code() {
        assert_eq!(IpValidationError::Ipv6NotSupported.code(), "invalid_ip");
        assert_eq!(IpValidationError::Loopback.code(), "invalid_ip");
        assert_eq!(IpValidationError::LinkLocal.code(), "invalid_ip");
    }

    #[test]
    fn test_ip_validation_error_message() {
        assert!(IpValidationError::Ipv6NotSupported
            .message()
            .contains("IPv6"));
        assert!(IpValidationError::Loopback.message().contains("Loopback"));
        assert!(IpValidationError::LinkLocal.message().contains("169.254"));
    }
}
