//! Continuous acquisition: the read-correct-filter-publish cycle.
//!
//! The loop runs on a dedicated worker thread so blocking reads never stall
//! the command path or the presentation layer. Results flow out through an
//! mpsc channel; the worker is the only writer of the shared [`History`].
//!
//! # Cancellation
//!
//! The stop flag is checked before every read attempt and inside the
//! inter-cycle pause; an in-flight read is bounded by the configured read
//! timeout, so stop latency is at most one timeout period. [`AcquisitionHandle::stop`]
//! joins the worker and hands the device back, which guarantees the port is
//! never closed while a read is still in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::calibration::Offsets;
use crate::config::LinkConfig;
use crate::device::Dkt032;
use crate::errors::Result;
use crate::history::History;
use crate::protocol::{ChannelSample, CHANNEL_COUNT};

/// Accepted samples required per channel before the outlier filter engages.
const FILTER_WARMUP: usize = 5;

/// Maximum relative deviation from a channel's running mean before the whole
/// sample is rejected as a transient spike.
const MAX_RELATIVE_DEVIATION: f64 = 0.15;

/// Granularity of the stop-aware inter-cycle pause.
const PAUSE_QUANTUM: Duration = Duration::from_millis(25);

// ============================================================================
// Data Types
// ============================================================================

/// A corrected sample stamped with monotonic time since the run started.
///
/// This is the unit published to the presentation layer and retained in the
/// history buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedSample {
    /// Elapsed time since acquisition started.
    pub elapsed: Duration,
    /// Raw reading minus the calibration offsets.
    pub sample: ChannelSample,
}

// ============================================================================
// Outlier Rejection
// ============================================================================

/// Transient-spike filter over the running mean of accepted samples.
///
/// Each channel tracks the mean of the values accepted so far. Once
/// [`FILTER_WARMUP`] samples have been accepted, a new sample is rejected
/// whole (all five channels, never partially) if any channel deviates from
/// its own running mean by more than [`MAX_RELATIVE_DEVIATION`]. A running
/// mean of exactly zero never rejects (no meaningful relative scale).
/// Rejected samples do not enter the means.
#[derive(Debug, Default)]
pub struct OutlierFilter {
    sums: [f64; CHANNEL_COUNT],
    accepted: usize,
}

impl OutlierFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one sample, updating the running means on admit.
    pub fn admit(&mut self, values: &[f64; CHANNEL_COUNT]) -> bool {
        if self.accepted >= FILTER_WARMUP {
            for (v, sum) in values.iter().zip(self.sums.iter()) {
                let mean = sum / self.accepted as f64;
                if mean != 0.0 && ((v - mean) / mean).abs() > MAX_RELATIVE_DEVIATION {
                    return false;
                }
            }
        }
        for (sum, v) in self.sums.iter_mut().zip(values.iter()) {
            *sum += v;
        }
        self.accepted += 1;
        true
    }

    /// Samples accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Handle on a running acquisition worker.
pub struct AcquisitionHandle {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<(Dkt032, Result<()>)>,
}

impl AcquisitionHandle {
    /// Start the acquisition worker.
    ///
    /// The worker owns the device for the duration of the run. Accepted
    /// samples are appended to `history` and sent on `sender`; if the
    /// receiving side goes away the worker winds down cleanly.
    pub fn spawn(
        device: Dkt032,
        offsets: Offsets,
        config: &LinkConfig,
        history: Arc<History>,
        sender: Sender<CorrectedSample>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let config = config.clone();

        let worker = thread::spawn(move || {
            let mut device = device;
            let result = run(&mut device, offsets, &config, &history, &sender, &flag);
            if let Err(ref e) = result {
                error!("acquisition terminated: {e}");
            }
            (device, result)
        });

        Self { stop, worker }
    }

    /// Whether the worker has already exited (e.g. on connection loss).
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Signal the worker and wait for it to exit.
    ///
    /// Returns the device handle together with the worker's terminal result;
    /// an I/O failure that killed the loop surfaces here.
    pub fn stop(self) -> (Dkt032, Result<()>) {
        self.stop.store(true, Ordering::Release);
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

fn run(
    device: &mut Dkt032,
    offsets: Offsets,
    config: &LinkConfig,
    history: &History,
    sender: &Sender<CorrectedSample>,
    stop: &AtomicBool,
) -> Result<()> {
    let started = Instant::now();
    let mut filter = OutlierFilter::new();

    info!("acquisition running");
    while !stop.load(Ordering::Acquire) {
        // Timeouts and malformed lines skip the cycle entirely; the read
        // timeout already paces that path, so no extra delay.
        let raw = match device.read_sample()? {
            Some(sample) => sample,
            None => continue,
        };

        let corrected = offsets.apply(&raw);
        if filter.admit(&corrected.as_array()) {
            let record = CorrectedSample {
                elapsed: started.elapsed(),
                sample: corrected,
            };
            history.append(record);
            if sender.send(record).is_err() {
                debug!("sample receiver dropped; ending acquisition");
                break;
            }
        } else {
            debug!("rejected transient outlier: {corrected:?}");
        }

        pause(stop, config.read_delay);
    }

    info!("acquisition stopped");
    Ok(())
}

/// Sleep for `total`, waking early when the stop flag is raised.
pub(crate) fn pause(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(PAUSE_QUANTUM));
    }
}
