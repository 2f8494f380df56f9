//! Timing and redundancy settings for a session.

use web_time::Duration;

use crate::{NetplayError, REDUNDANT_FRAMES};

/// Configuration for the frame and command protocol.
///
/// # Example
///
/// ```
/// use netplay_rollback::ProtocolConfig;
/// use web_time::Duration;
///
/// // A flaky link: resend sooner and tolerate longer stalls.
/// let config = ProtocolConfig {
///     resend_interval: Duration::from_millis(200),
///     stall_timeout: Duration::from_secs(30),
///     ..ProtocolConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// How often the input window is sent again while stalled.
    ///
    /// Every produced frame already sends the window once; resends only matter when the
    /// session stops producing frames and the last packets were lost.
    ///
    /// Default: 500ms
    pub resend_interval: Duration,

    /// How long a stall may last before the session gives up.
    ///
    /// Default: 10s
    pub stall_timeout: Duration,

    /// How long the handshake may take.
    ///
    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Frames repeated in every datagram.
    ///
    /// The effective window is never shorter than twice the ring capacity, so this only
    /// raises redundancy above that floor.
    ///
    /// Default: 16
    pub redundancy: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            redundancy: REDUNDANT_FRAMES,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for LAN and competitive play.
    ///
    /// Resends quickly and gives up early; a stall of a few seconds on a good link means
    /// the peer is gone.
    pub fn competitive() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            redundancy: REDUNDANT_FRAMES,
        }
    }

    /// Configuration preset for high-latency WAN connections.
    ///
    /// More redundancy per packet and a much longer patience for stalls and setup.
    pub fn high_latency() -> Self {
        Self {
            resend_interval: Duration::from_millis(750),
            stall_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            redundancy: 2 * REDUNDANT_FRAMES,
        }
    }

    /// Validates the protocol configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetplayError::InvalidRequest` if any value is out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        check_duration("resend_interval", self.resend_interval, 1, 10_000)?;
        check_duration("stall_timeout", self.stall_timeout, 100, 600_000)?;
        check_duration("handshake_timeout", self.handshake_timeout, 100, 600_000)?;
        if self.stall_timeout <= self.resend_interval {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "stall_timeout ({}ms) must exceed resend_interval ({}ms)",
                    self.stall_timeout.as_millis(),
                    self.resend_interval.as_millis()
                ),
            });
        }
        // A datagram of 64 frames is still well under a kilobyte.
        if self.redundancy < 1 || self.redundancy > 64 {
            return Err(NetplayError::InvalidRequest {
                info: format!("redundancy must be between 1 and 64, got {}", self.redundancy),
            });
        }
        Ok(())
    }
}

fn check_duration(
    field: &str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), NetplayError> {
    if value < Duration::from_millis(min_ms) || value > Duration::from_millis(max_ms) {
        return Err(NetplayError::InvalidRequest {
            info: format!(
                "{field} must be between {min_ms}ms and {max_ms}ms, got {}ms",
                value.as_millis()
            ),
        });
    }
    Ok(())
}
