//! Automatic detection of the serial port the tower is connected to.
//!
//! The IT03.2 has no identification command: in PC mode it simply streams
//! records. Discovery therefore opens each port in turn and watches for a
//! line that decodes as a five-channel record. The probe connection is
//! closed again before the caller reopens the winning port for real use.

use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::device::{open_port, Dkt032};
use crate::errors::{DriverError, Result};

/// Find the first serial port streaming valid records.
///
/// Ports that cannot be opened (permissions, already in use) are skipped.
/// A port producing only malformed lines for the whole probe window is
/// treated as non-matching, not as an error.
///
/// # Errors
/// [`DriverError::DeviceNotFound`] when no port qualifies; the caller may
/// retry or fall back to a manually supplied port name.
pub fn discover(config: &LinkConfig) -> Result<String> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        warn!("no serial ports present on this system");
        return Err(DriverError::DeviceNotFound);
    }

    for info in ports {
        let name = info.port_name;
        debug!("probing {name}");
        match probe_port(&name, config) {
            Ok(true) => {
                info!("device detected on {name}");
                return Ok(name);
            }
            Ok(false) => {}
            Err(e) => debug!("skipping {name}: {e}"),
        }
    }

    warn!("no port produced a valid record; is the selector switch on PC mode?");
    Err(DriverError::DeviceNotFound)
}

fn probe_port(name: &str, config: &LinkConfig) -> Result<bool> {
    let port = match open_port(name, config) {
        Ok(p) => p,
        Err(e) => {
            debug!("cannot open {name}: {e}");
            return Ok(false);
        }
    };
    let mut probe = Dkt032::from_transport(Box::new(port), config);
    Ok(probe_device(&mut probe, config.probe_lines))
}

/// Inspect up to `max_lines` lines from an open device; true on the first
/// line that decodes as a record.
fn probe_device(device: &mut Dkt032, max_lines: usize) -> bool {
    for _ in 0..max_lines {
        match device.read_sample() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            // Read failures during a probe disqualify the port, nothing more.
            Err(e) => {
                debug!("probe read failed: {e}");
                return false;
            }
        }
    }
    false
}
