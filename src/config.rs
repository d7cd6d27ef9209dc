//! Shared configuration for discovery, calibration, and acquisition.
//!
//! The IT03.2 host protocol is driven by a handful of timing constants that
//! the firmware and the PC side must agree on. They are carried in one value
//! so each component can be run (and tested) with different parameters
//! instead of reaching for process-wide constants.

use std::time::Duration;

/// Connection and timing parameters for one device link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Serial baud rate. The IT03.2 firmware is fixed at 9600.
    pub baud_rate: u32,
    /// Upper bound for assembling one record line; also the probe timeout
    /// during discovery and the cancellation latency bound for acquisition.
    pub read_timeout: Duration,
    /// Wait after opening a port before the first read. The board auto-resets
    /// when the host asserts DTR and needs a moment to start streaming.
    pub settle_delay: Duration,
    /// Number of lines to inspect per port during discovery.
    pub probe_lines: usize,
    /// Number of read attempts in one calibration pass.
    pub calibration_samples: usize,
    /// Pause between calibration attempts, valid or not.
    pub calibration_delay: Duration,
    /// Pause between acquisition cycles after a complete line was read.
    pub read_delay: Duration,
    /// Tick for re-sending the current actuator set-points, or `None` to
    /// disable the periodic refresh.
    pub command_refresh: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            probe_lines: 10,
            calibration_samples: 10,
            calibration_delay: Duration::from_millis(500),
            read_delay: Duration::from_millis(500),
            command_refresh: Some(Duration::from_millis(500)),
        }
    }
}

impl LinkConfig {
    /// Configuration with all delays collapsed, for driving the stack from
    /// in-memory transports.
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            read_timeout: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
            calibration_delay: Duration::ZERO,
            read_delay: Duration::from_millis(1),
            command_refresh: None,
            ..Self::default()
        }
    }
}
