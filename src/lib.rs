//! Driver for the DIKOIN IT03.2 natural/forced convection tower.
//!
//! The tower's microcontroller streams five tab-separated sensor values per
//! line over USB serial (inlet, outlet and thermocouple temperatures, air
//! velocity, heater power) and accepts fixed-width `FAN###`/`HEAT###`
//! commands on the same port. This crate covers the host side of that link:
//!
//! 1. [`discover`] the port the tower is connected to
//! 2. [`Session::connect`], then [`Session::calibrate`] a zero baseline
//! 3. [`Session::start`] the acquisition worker and consume corrected,
//!    outlier-filtered samples from the returned channel
//! 4. drive the fan and heater through [`Session::set_actuator`]
//!
//! Presentation (plots, tables, export formats) is left to the consumer;
//! the CLI binary in this crate is a minimal example of one.

pub mod acquisition;
pub mod calibration;
pub mod command;
pub mod config;
pub mod device;
pub mod discovery;
pub mod errors;
pub mod history;
pub mod logging;
pub mod protocol;
pub mod session;

pub use acquisition::{AcquisitionHandle, CorrectedSample, OutlierFilter};
pub use calibration::{calibrate, Calibration, Offsets};
pub use command::{Commander, RefreshHandle};
pub use config::LinkConfig;
pub use device::{open_port, Dkt032, Transport};
pub use discovery::discover;
pub use errors::{DriverError, Result};
pub use history::History;
pub use protocol::{decode_line, encode_command, ActuatorKind, ChannelSample, CHANNEL_COUNT};
pub use session::{Session, SessionStatus};
