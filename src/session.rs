//! Session controller: connect, calibrate, acquire, command, disconnect.
//!
//! Owns the connection handle and enforces the session invariants: exactly
//! one reader per connection (the device is handed to the acquisition worker
//! while running and handed back on stop), stop is synchronous, and the port
//! is released only after every worker has exited.

use std::io::Write;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::acquisition::{AcquisitionHandle, CorrectedSample};
use crate::calibration::{calibrate, Calibration, Offsets};
use crate::command::{Commander, RefreshHandle};
use crate::config::LinkConfig;
use crate::device::{open_port, Dkt032, Transport};
use crate::discovery::discover;
use crate::errors::{DriverError, Result};
use crate::history::History;
use crate::protocol::ActuatorKind;

/// Where a session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No device attached.
    Disconnected,
    /// Connected, not acquiring.
    Idle,
    /// Acquisition worker owns the device.
    Running,
}

enum State {
    Disconnected,
    Idle {
        device: Dkt032,
        commander: Commander,
        refresh: Option<RefreshHandle>,
    },
    Running {
        handle: AcquisitionHandle,
        commander: Commander,
        refresh: Option<RefreshHandle>,
    },
}

/// One operator session against one tower.
pub struct Session {
    config: LinkConfig,
    history: Arc<History>,
    offsets: Offsets,
    state: State,
}

impl Session {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            history: Arc::new(History::new()),
            offsets: Offsets::zero(),
            state: State::Disconnected,
        }
    }

    /// Build a connected session over an arbitrary transport and write half.
    ///
    /// `connect` is the serial-port front end of this; tests and mock rigs
    /// attach in-memory transports directly.
    pub fn attach(
        transport: Box<dyn Transport>,
        writer: Box<dyn Write + Send>,
        config: LinkConfig,
    ) -> Self {
        let device = Dkt032::from_transport(transport, &config);
        let commander = Commander::new(writer);
        let refresh = config
            .command_refresh
            .map(|interval| commander.spawn_refresh(interval));
        Self {
            config,
            history: Arc::new(History::new()),
            offsets: Offsets::zero(),
            state: State::Idle {
                device,
                commander,
                refresh,
            },
        }
    }

    /// Connect to the tower, discovering the port when none is given.
    ///
    /// Returns the name of the port in use. Any existing connection is torn
    /// down first.
    pub fn connect(&mut self, port: Option<&str>) -> Result<String> {
        if !matches!(self.state, State::Disconnected) {
            debug!("reconnect requested; dropping current connection");
            self.disconnect()?;
        }

        let name = match port {
            Some(p) => p.to_string(),
            None => discover(&self.config)?,
        };
        let serial = open_port(&name, &self.config)?;
        let writer = serial.try_clone()?;
        let device = Dkt032::from_transport(Box::new(serial), &self.config);
        let commander = Commander::new(Box::new(writer));
        let refresh = self
            .config
            .command_refresh
            .map(|interval| commander.spawn_refresh(interval));

        self.state = State::Idle {
            device,
            commander,
            refresh,
        };
        info!("session connected on {name}");
        Ok(name)
    }

    /// Run a calibration pass and adopt its offsets for subsequent runs.
    ///
    /// Requires exclusive use of the reader, so it is rejected while
    /// acquisition is running. Earlier history is left untouched.
    pub fn calibrate(&mut self) -> Result<Calibration> {
        match &mut self.state {
            State::Disconnected => Err(DriverError::NotConnected),
            State::Running { .. } => Err(DriverError::AlreadyRunning),
            State::Idle { device, .. } => {
                let cal = calibrate(device, &self.config)?;
                self.offsets = cal.offsets;
                Ok(cal)
            }
        }
    }

    /// Hand the device to a fresh acquisition worker.
    ///
    /// Corrected samples arrive on the returned channel; the channel closes
    /// when the worker exits, including on connection loss.
    pub fn start(&mut self) -> Result<Receiver<CorrectedSample>> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Idle {
                device,
                commander,
                refresh,
            } => {
                let (tx, rx) = mpsc::channel();
                let handle = AcquisitionHandle::spawn(
                    device,
                    self.offsets,
                    &self.config,
                    Arc::clone(&self.history),
                    tx,
                );
                self.state = State::Running {
                    handle,
                    commander,
                    refresh,
                };
                Ok(rx)
            }
            state @ State::Running { .. } => {
                self.state = state;
                Err(DriverError::AlreadyRunning)
            }
            State::Disconnected => Err(DriverError::NotConnected),
        }
    }

    /// Stop acquisition and take the device back.
    ///
    /// Does not return until the worker has observed cancellation and
    /// exited; an I/O failure that already killed the worker surfaces here.
    /// Stopping an idle session is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Running {
                handle,
                commander,
                refresh,
            } => {
                let (device, result) = handle.stop();
                self.state = State::Idle {
                    device,
                    commander,
                    refresh,
                };
                result
            }
            state @ State::Idle { .. } => {
                self.state = state;
                Ok(())
            }
            State::Disconnected => Err(DriverError::NotConnected),
        }
    }

    /// Dispatch one actuator command immediately.
    pub fn set_actuator(&self, kind: ActuatorKind, value: i32) -> Result<()> {
        match &self.state {
            State::Disconnected => Err(DriverError::NotConnected),
            State::Idle { commander, .. } | State::Running { commander, .. } => {
                commander.send(kind, value)
            }
        }
    }

    /// Release the connection, stopping acquisition and the refresh first.
    pub fn disconnect(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Disconnected => Ok(()),
            State::Idle { refresh, .. } => {
                stop_refresh(refresh);
                info!("session disconnected");
                Ok(())
            }
            State::Running {
                handle, refresh, ..
            } => {
                // The worker must exit before the port handle is dropped.
                let (device, result) = handle.stop();
                drop(device);
                stop_refresh(refresh);
                info!("session disconnected");
                result
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            State::Disconnected => SessionStatus::Disconnected,
            State::Idle { .. } => SessionStatus::Idle,
            State::Running { .. } => SessionStatus::Running,
        }
    }

    /// Offsets currently applied to published samples.
    pub fn offsets(&self) -> Offsets {
        self.offsets
    }

    /// The session's corrected-sample buffer.
    pub fn history(&self) -> Arc<History> {
        Arc::clone(&self.history)
    }

    /// Drop all buffered samples (operator starting a fresh run).
    pub fn clear_history(&self) {
        self.history.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !matches!(self.state, State::Disconnected) {
            if let Err(e) = self.disconnect() {
                warn!("disconnect during drop: {e}");
            }
        }
    }
}

fn stop_refresh(refresh: Option<RefreshHandle>) {
    if let Some(handle) = refresh {
        if let Err(e) = handle.stop() {
            warn!("set-point refresh ended with error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::device::testing::{ScriptTransport, SharedWriter};

    fn attached(lines: &[&str], config: LinkConfig) -> (Session, Arc<Mutex<Vec<u8>>>) {
        let transport = ScriptTransport::from_lines(lines);
        let (writer, buf) = SharedWriter::new();
        let session = Session::attach(Box::new(transport), Box::new(writer), config);
        (session, buf)
    }

    #[test]
    fn calibrate_then_acquire_applies_offsets() {
        let mut config = LinkConfig::fast();
        config.calibration_samples = 1;
        let (mut session, _buf) = attached(&["1\t1\t1\t1\t1", "3\t3\t3\t3\t3"], config);

        let cal = session.calibrate().unwrap();
        assert_eq!(cal.samples_used, 1);
        assert_eq!(session.offsets(), Offsets([1.0; 5]));

        let rx = session.start().unwrap();
        assert_eq!(session.status(), SessionStatus::Running);

        let record = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.sample.as_array(), [2.0; 5]);

        session.stop().unwrap();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn start_twice_is_rejected() {
        let (mut session, _buf) = attached(&[], LinkConfig::fast());
        let _rx = session.start().unwrap();
        assert!(matches!(session.start(), Err(DriverError::AlreadyRunning)));
        session.stop().unwrap();
    }

    #[test]
    fn calibrate_while_running_is_rejected() {
        let (mut session, _buf) = attached(&[], LinkConfig::fast());
        let _rx = session.start().unwrap();
        assert!(matches!(
            session.calibrate(),
            Err(DriverError::AlreadyRunning)
        ));
        session.stop().unwrap();
    }

    #[test]
    fn operations_require_a_connection() {
        let mut session = Session::new(LinkConfig::fast());
        assert!(matches!(session.calibrate(), Err(DriverError::NotConnected)));
        assert!(matches!(session.start(), Err(DriverError::NotConnected)));
        assert!(matches!(session.stop(), Err(DriverError::NotConnected)));
        assert!(matches!(
            session.set_actuator(ActuatorKind::Fan, 10),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let (mut session, _buf) = attached(&[], LinkConfig::fast());
        session.stop().unwrap();
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn actuator_commands_reach_the_write_half() {
        let (session, buf) = attached(&[], LinkConfig::fast());
        session.set_actuator(ActuatorKind::Fan, 7).unwrap();
        session.set_actuator(ActuatorKind::Heat, 999).unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "FAN007\nHEAT255\n");
    }

    #[test]
    fn commands_still_flow_while_running() {
        let (mut session, buf) = attached(&[], LinkConfig::fast());
        let _rx = session.start().unwrap();
        session.set_actuator(ActuatorKind::Fan, 50).unwrap();
        session.stop().unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "FAN050\n");
    }

    #[test]
    fn history_is_cleared_only_on_request() {
        let mut config = LinkConfig::fast();
        config.calibration_samples = 0;
        let (mut session, _buf) = attached(&["4\t4\t4\t4\t4"], config);

        let rx = session.start().unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        session.stop().unwrap();

        assert_eq!(session.history().len(), 1);
        session.clear_history();
        assert!(session.history().is_empty());
    }

    #[test]
    fn disconnect_while_running_stops_the_worker_first() {
        let (mut session, _buf) = attached(&[], LinkConfig::fast());
        let _rx = session.start().unwrap();
        session.disconnect().unwrap();
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }
}
