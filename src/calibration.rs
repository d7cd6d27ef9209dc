//! Zero-baseline calibration of the five analog channels.
//!
//! At session start the tower is assumed to be at rest; the mean of the
//! first readings becomes the per-channel offset subtracted from every
//! subsequent raw sample.

use std::thread;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::device::Dkt032;
use crate::errors::Result;
use crate::protocol::{ChannelSample, CHANNEL_COUNT};

/// Per-channel baseline subtracted from every raw reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offsets(pub [f64; CHANNEL_COUNT]);

impl Offsets {
    /// The no-op baseline: leaves readings unchanged.
    pub fn zero() -> Self {
        Self([0.0; CHANNEL_COUNT])
    }

    /// Subtract this baseline from a raw sample, element-wise.
    pub fn apply(&self, raw: &ChannelSample) -> ChannelSample {
        let mut values = raw.as_array();
        for (v, o) in values.iter_mut().zip(self.0.iter()) {
            *v -= o;
        }
        ChannelSample::from_array(values)
    }
}

/// Outcome of one calibration pass.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub offsets: Offsets,
    /// Valid samples that went into the mean. Zero means the device sent
    /// nothing usable and the offsets fell back to the zero vector.
    pub samples_used: usize,
}

/// Collect up to `calibration_samples` readings and average them.
///
/// Each attempt is followed by `calibration_delay` whether or not it yielded
/// a valid sample; invalid lines are skipped without aborting the pass.
/// Zero valid samples is a warning, not an error: acquisition then proceeds
/// uncorrected. I/O failures propagate, they are connection-level.
pub fn calibrate(device: &mut Dkt032, config: &LinkConfig) -> Result<Calibration> {
    let attempts = config.calibration_samples;
    let mut sums = [0.0f64; CHANNEL_COUNT];
    let mut count = 0usize;

    info!("calibrating over {attempts} read attempts");
    for attempt in 1..=attempts {
        if let Some(sample) = device.read_sample()? {
            for (sum, v) in sums.iter_mut().zip(sample.as_array().iter()) {
                *sum += v;
            }
            count += 1;
            info!("calibration sample {attempt}/{attempts}: {sample:?}");
        }
        if !config.calibration_delay.is_zero() {
            thread::sleep(config.calibration_delay);
        }
    }

    if count == 0 {
        warn!("no valid samples during calibration; proceeding with zero offsets");
        return Ok(Calibration {
            offsets: Offsets::zero(),
            samples_used: 0,
        });
    }

    let mut means = [0.0f64; CHANNEL_COUNT];
    for (mean, sum) in means.iter_mut().zip(sums.iter()) {
        *mean = sum / count as f64;
    }
    let offsets = Offsets(means);
    info!("calibration complete over {count} samples: {offsets:?}");
    Ok(Calibration {
        offsets,
        samples_used: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ScriptTransport;

    fn calibrate_over(lines: &[&str], attempts: usize) -> Calibration {
        let mut config = LinkConfig::fast();
        config.calibration_samples = attempts;
        let mut dev = Dkt032::from_transport(Box::new(ScriptTransport::from_lines(lines)), &config);
        calibrate(&mut dev, &config).unwrap()
    }

    #[test]
    fn offsets_are_per_channel_means() {
        // Symmetric fields, so the decode swap cannot mask an ordering bug.
        let cal = calibrate_over(&["1\t1\t1\t1\t1", "3\t3\t3\t3\t3"], 2);
        assert_eq!(cal.offsets, Offsets([2.0; CHANNEL_COUNT]));
        assert_eq!(cal.samples_used, 2);
    }

    #[test]
    fn means_are_computed_on_logical_channel_order() {
        let cal = calibrate_over(&["1\t2\t3\t4\t5"], 1);
        // Wire order outlet-first; logical order inlet-first.
        assert_eq!(cal.offsets, Offsets([2.0, 1.0, 3.0, 4.0, 5.0]));
    }

    #[test]
    fn invalid_lines_are_skipped_not_counted() {
        let cal = calibrate_over(&["2\t2\t2\t2\t2", "garbage", "4\t4\t4\t4\t4"], 3);
        assert_eq!(cal.offsets, Offsets([3.0; CHANNEL_COUNT]));
        assert_eq!(cal.samples_used, 2);
    }

    #[test]
    fn no_samples_falls_back_to_zero_vector() {
        let mut config = LinkConfig::fast();
        config.calibration_samples = 3;
        let mut dev =
            Dkt032::from_transport(Box::new(ScriptTransport::silent()), &config);
        let cal = calibrate(&mut dev, &config).unwrap();
        assert_eq!(cal.offsets, Offsets::zero());
        assert_eq!(cal.samples_used, 0);
    }

    #[test]
    fn mean_is_deterministic() {
        let lines = ["1\t2\t3\t4\t5", "5\t4\t3\t2\t1"];
        let a = calibrate_over(&lines, 2);
        let b = calibrate_over(&lines, 2);
        assert_eq!(a.offsets, b.offsets);
    }

    #[test]
    fn apply_subtracts_element_wise() {
        let offsets = Offsets([1.0, 2.0, 3.0, 4.0, 5.0]);
        let raw = ChannelSample::from_array([10.0, 10.0, 10.0, 10.0, 10.0]);
        let corrected = offsets.apply(&raw);
        assert_eq!(corrected.as_array(), [9.0, 8.0, 7.0, 6.0, 5.0]);
    }

    #[test]
    fn zero_offsets_leave_samples_untouched() {
        let raw = ChannelSample::from_array([1.5, -2.0, 0.0, 7.25, 100.0]);
        assert_eq!(Offsets::zero().apply(&raw), raw);
    }
}
