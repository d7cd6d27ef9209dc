//! Session-lifetime store of published corrected samples.

use std::sync::Mutex;

use crate::acquisition::CorrectedSample;

/// Append-only, chronologically ordered buffer of corrected samples.
///
/// Only the acquisition worker appends; every other party reads snapshots.
/// The buffer lives as long as the session and is cleared only by explicit
/// request (e.g. the operator starting a fresh run), never by the core.
#[derive(Debug, Default)]
pub struct History {
    entries: Mutex<Vec<CorrectedSample>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, sample: CorrectedSample) {
        self.entries
            .lock()
            .expect("history lock poisoned")
            .push(sample);
    }

    /// Copy of the buffer, in insertion (chronological) order.
    pub fn snapshot(&self) -> Vec<CorrectedSample> {
        self.entries
            .lock()
            .expect("history lock poisoned")
            .clone()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("history lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
