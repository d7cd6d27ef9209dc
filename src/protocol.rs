//! Line protocol between the host and the IT03.2 microcontroller.
//!
//! Inbound, the board streams one record per line: five tab-separated
//! decimal fields terminated by a newline. Outbound, the host sends
//! fixed-width ASCII actuator commands such as `FAN127\n` or `HEAT045\n`;
//! the firmware reads exactly three characters after the tag, so the width
//! is part of the wire format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DriverError;

/// Number of analog channels in every record.
pub const CHANNEL_COUNT: usize = 5;

// ============================================================================
// Data Types
// ============================================================================

/// One decoded sensor record, in logical channel order.
///
/// The wire carries the outlet temperature before the inlet temperature;
/// [`decode_line`] swaps them so this struct is always in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    /// Air temperature at the tower inlet (TE), °C.
    pub inlet_temp: f64,
    /// Air temperature at the tower outlet (TS), °C.
    pub outlet_temp: f64,
    /// Heater surface thermocouple (TC), °C.
    pub thermocouple_temp: f64,
    /// Air velocity, m/s.
    pub air_velocity: f64,
    /// Heater electrical power, W.
    pub power: f64,
}

impl ChannelSample {
    /// Channel values as an array, in logical order.
    #[inline]
    pub fn as_array(&self) -> [f64; CHANNEL_COUNT] {
        [
            self.inlet_temp,
            self.outlet_temp,
            self.thermocouple_temp,
            self.air_velocity,
            self.power,
        ]
    }

    /// Build a sample from an array in logical order.
    #[inline]
    pub fn from_array(values: [f64; CHANNEL_COUNT]) -> Self {
        Self {
            inlet_temp: values[0],
            outlet_temp: values[1],
            thermocouple_temp: values[2],
            air_velocity: values[3],
            power: values[4],
        }
    }
}

/// The two actuators the board exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorKind {
    /// Tower fan, PWM duty 0-255.
    Fan,
    /// Heating element, PWM duty 0-255.
    Heat,
}

impl ActuatorKind {
    /// Wire tag for this actuator.
    pub fn as_str(self) -> &'static str {
        match self {
            ActuatorKind::Fan => "FAN",
            ActuatorKind::Heat => "HEAT",
        }
    }
}

impl fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActuatorKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FAN" => Ok(ActuatorKind::Fan),
            "HEAT" => Ok(ActuatorKind::Heat),
            other => Err(DriverError::InvalidCommand(format!(
                "unknown actuator kind '{other}' (expected FAN or HEAT)"
            ))),
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Decode one raw line into a [`ChannelSample`].
///
/// Returns `None` for anything that is not a complete record: empty lines,
/// a field count other than five, or non-numeric fields. Malformed lines are
/// frequent around connection setup and are not errors.
pub fn decode_line(raw: &str) -> Option<ChannelSample> {
    let line = raw.trim_end();
    if line.is_empty() {
        return None;
    }

    let mut values = [0.0f64; CHANNEL_COUNT];
    let mut count = 0usize;
    for field in line.split('\t') {
        if count == CHANNEL_COUNT {
            return None;
        }
        values[count] = field.trim().parse::<f64>().ok()?;
        count += 1;
    }
    if count != CHANNEL_COUNT {
        return None;
    }

    // Protocol quirk: the board emits outlet before inlet. Swap here, once,
    // so everything downstream sees logical inlet-then-outlet order.
    values.swap(0, 1);

    Some(ChannelSample::from_array(values))
}

/// Encode an actuator command into its wire frame.
///
/// The duty value is clamped to `[0, 255]`; out-of-range input is coerced,
/// never rejected. The frame is `{KIND}{value:03}\n`, e.g. `FAN007\n`.
pub fn encode_command(kind: ActuatorKind, value: i32) -> String {
    let duty = value.clamp(0, 255);
    format!("{}{:03}\n", kind.as_str(), duty)
}

/// Clamp a requested duty value to the valid range.
#[inline]
pub fn clamp_duty(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
