//! Actuator command dispatch.
//!
//! Commands go out in two modes: directly, when the operator moves a
//! control, and periodically, re-sending the current set-points on a fixed
//! tick so the board's last-known command survives device-side timeouts.
//! Both modes share the write half of the serial link; reads are unaffected.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::acquisition::pause;
use crate::errors::Result;
use crate::protocol::{clamp_duty, encode_command, ActuatorKind};

#[derive(Debug, Default, Clone, Copy)]
struct Setpoints {
    fan: Option<u8>,
    heat: Option<u8>,
}

/// Dispatcher for fan and heater commands.
///
/// Cheap to clone; clones share the write handle and the set-point store.
#[derive(Clone)]
pub struct Commander {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    setpoints: Arc<Mutex<Setpoints>>,
}

impl Commander {
    /// Wrap the write half of an open connection.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            setpoints: Arc::new(Mutex::new(Setpoints::default())),
        }
    }

    /// Validate, clamp, transmit, and record one actuator command.
    ///
    /// Out-of-range values are coerced into `[0, 255]` with a warning; write
    /// failures are returned to the caller and never retried here.
    pub fn send(&self, kind: ActuatorKind, value: i32) -> Result<()> {
        let duty = clamp_duty(value);
        if i32::from(duty) != value {
            warn!("{kind} value {value} out of range; clamped to {duty}");
        }
        self.write_frame(kind, duty)?;

        let mut sp = self.setpoints.lock().expect("setpoint lock poisoned");
        match kind {
            ActuatorKind::Fan => sp.fan = Some(duty),
            ActuatorKind::Heat => sp.heat = Some(duty),
        }
        Ok(())
    }

    /// Last duty values sent, as `(fan, heat)`.
    pub fn setpoints(&self) -> (Option<u8>, Option<u8>) {
        let sp = self.setpoints.lock().expect("setpoint lock poisoned");
        (sp.fan, sp.heat)
    }

    fn write_frame(&self, kind: ActuatorKind, duty: u8) -> Result<()> {
        let frame = encode_command(kind, i32::from(duty));
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer.write_all(frame.as_bytes())?;
        writer.flush()?;
        debug!("sent command {}", frame.trim_end());
        Ok(())
    }

    /// Start the periodic set-point refresh.
    ///
    /// Every `interval`, each set-point that has been explicitly sent at
    /// least once is re-sent, changed or not. A write failure stops the
    /// refresh thread; the error surfaces from [`RefreshHandle::stop`].
    pub fn spawn_refresh(&self, interval: Duration) -> RefreshHandle {
        let commander = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let worker = thread::spawn(move || -> Result<()> {
            loop {
                pause(&flag, interval);
                if flag.load(Ordering::Acquire) {
                    return Ok(());
                }
                let (fan, heat) = commander.setpoints();
                for (kind, duty) in [(ActuatorKind::Fan, fan), (ActuatorKind::Heat, heat)] {
                    if let Some(duty) = duty {
                        if let Err(e) = commander.write_frame(kind, duty) {
                            error!("set-point refresh failed: {e}");
                            return Err(e);
                        }
                    }
                }
            }
        });

        RefreshHandle { stop, worker }
    }
}

/// Handle on the periodic refresh thread.
pub struct RefreshHandle {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<Result<()>>,
}

impl RefreshHandle {
    /// Whether the refresh thread already exited (write failure).
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        match self.worker.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::device::testing::{FailingWriter, SharedWriter};
    use crate::errors::DriverError;

    fn frame_count(buf: &[u8], frame: &str) -> usize {
        String::from_utf8_lossy(buf).matches(frame).count()
    }

    #[test]
    fn send_writes_fixed_width_frames() {
        let (writer, buf) = SharedWriter::new();
        let commander = Commander::new(Box::new(writer));

        commander.send(ActuatorKind::Fan, 7).unwrap();
        commander.send(ActuatorKind::Heat, 128).unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "FAN007\nHEAT128\n");
    }

    #[test]
    fn send_clamps_out_of_range_values() {
        let (writer, buf) = SharedWriter::new();
        let commander = Commander::new(Box::new(writer));

        commander.send(ActuatorKind::Fan, 300).unwrap();
        commander.send(ActuatorKind::Heat, -5).unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "FAN255\nHEAT000\n");
        assert_eq!(commander.setpoints(), (Some(255), Some(0)));
    }

    #[test]
    fn send_reports_write_failure() {
        let commander = Commander::new(Box::new(FailingWriter));
        assert!(matches!(
            commander.send(ActuatorKind::Fan, 10),
            Err(DriverError::Io(_))
        ));
        // A failed send must not be recorded as the device's state.
        assert_eq!(commander.setpoints(), (None, None));
    }

    #[test]
    fn refresh_resends_current_setpoints() {
        let (writer, buf) = SharedWriter::new();
        let commander = Commander::new(Box::new(writer));
        commander.send(ActuatorKind::Fan, 10).unwrap();
        commander.send(ActuatorKind::Heat, 20).unwrap();
        buf.lock().unwrap().clear();

        let refresh = commander.spawn_refresh(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(60));
        refresh.stop().unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert!(frame_count(&bytes, "FAN010\n") >= 2);
        assert!(frame_count(&bytes, "HEAT020\n") >= 2);
    }

    #[test]
    fn refresh_sends_nothing_before_any_setpoint() {
        let (writer, buf) = SharedWriter::new();
        let commander = Commander::new(Box::new(writer));

        let refresh = commander.spawn_refresh(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        refresh.stop().unwrap();

        assert!(buf.lock().unwrap().is_empty());
    }

    /// Succeeds for a fixed number of writes, then reports a dead link.
    struct FlakyWriter {
        writes_left: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.writes_left -= 1;
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn refresh_stops_on_write_failure_and_reports_it() {
        let commander = Commander::new(Box::new(FlakyWriter { writes_left: 1 }));
        commander.send(ActuatorKind::Fan, 42).unwrap();

        let refresh = commander.spawn_refresh(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(50));
        assert!(refresh.is_finished());
        assert!(matches!(refresh.stop(), Err(DriverError::Io(_))));
    }
}
