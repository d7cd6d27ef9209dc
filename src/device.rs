//! Driver for the IT03.2 convection tower's serial link.
//!
//! The board streams one five-field record per line (see [`crate::protocol`])
//! and accepts fixed-width actuator commands on the same port. Reads and
//! writes are independent directions; the session layer clones the port's
//! write half so command dispatch never waits on an in-flight read.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use crate::config::LinkConfig;
use crate::errors::{DriverError, Result};
use crate::protocol::{decode_line, encode_command, ActuatorKind, ChannelSample};

/// Longest line fragment kept while waiting for a newline. Anything beyond
/// this is line noise, not a record (real records are under 50 bytes).
const MAX_LINE_BYTES: usize = 256;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Open a serial port the way the IT03.2 expects.
///
/// The board auto-resets when the host asserts DTR, so after opening we wait
/// for it to reboot and then discard whatever was buffered during the reset.
/// The returned port can be `try_clone()`d for an independent write handle.
pub fn open_port(name: &str, config: &LinkConfig) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(name, config.baud_rate)
        .timeout(config.read_timeout)
        .open()?;
    if !config.settle_delay.is_zero() {
        std::thread::sleep(config.settle_delay);
    }
    port.clear(ClearBuffer::All)?;
    info!("opened serial port {} at {} baud", name, config.baud_rate);
    Ok(port)
}

// ============================================================================
// Dkt032 Driver
// ============================================================================

/// IT03.2 device driver.
///
/// Owns one transport and assembles the board's newline-terminated records
/// from it. A partially received line is kept across calls, so a record that
/// straddles two read timeouts is still delivered intact.
pub struct Dkt032 {
    transport: Box<dyn Transport>,
    read_timeout: Duration,
    pending: Vec<u8>,
}

impl Dkt032 {
    /// Connect to the device on a named serial port.
    pub fn connect(port_name: &str, config: &LinkConfig) -> Result<Self> {
        let port = open_port(port_name, config)?;
        Ok(Self::from_transport(Box::new(port), config))
    }

    /// Build a driver over an already-open transport.
    ///
    /// This is how the discovery probe reuses the line reader, and how tests
    /// drive the driver from scripted byte streams.
    pub fn from_transport(transport: Box<dyn Transport>, config: &LinkConfig) -> Self {
        Self {
            transport,
            read_timeout: config.read_timeout,
            pending: Vec::with_capacity(64),
        }
    }

    /// Read one record, blocking up to the configured read timeout.
    ///
    /// Returns `Ok(None)` when no complete, well-formed record arrived in
    /// time: timeouts, empty lines, and malformed lines are all
    /// skip-and-continue conditions, never errors. A closed stream is
    /// [`DriverError::ConnectionLost`].
    pub fn read_sample(&mut self) -> Result<Option<ChannelSample>> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            let mut byte = [0u8; 1];
            match self.transport.read(&mut byte) {
                Ok(0) => {
                    return Err(DriverError::ConnectionLost(
                        "serial stream closed".to_string(),
                    ))
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        let line = String::from_utf8_lossy(&self.pending).into_owned();
                        self.pending.clear();
                        let sample = decode_line(&line);
                        if sample.is_none() && !line.trim_end().is_empty() {
                            debug!("discarding malformed line: {:?}", line.trim_end());
                        }
                        return Ok(sample);
                    }
                    self.pending.push(byte[0]);
                    if self.pending.len() > MAX_LINE_BYTES {
                        debug!(
                            "discarding {} bytes of line noise without a newline",
                            self.pending.len()
                        );
                        self.pending.clear();
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Send one actuator command and flush it out.
    pub fn send(&mut self, kind: ActuatorKind, value: i32) -> Result<()> {
        let frame = encode_command(kind, value);
        self.transport.write_all(frame.as_bytes())?;
        self.transport.flush()?;
        debug!("sent command {}", frame.trim_end());
        Ok(())
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    /// In-memory transport fed from a script of byte chunks.
    ///
    /// Each `read` hands out bytes from the front of the script; once the
    /// script is drained it times out forever (like an idle serial port) or,
    /// with `eof_when_drained`, reports a closed stream.
    pub(crate) struct ScriptTransport {
        chunks: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        eof_when_drained: bool,
    }

    impl ScriptTransport {
        pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect(),
                written: Arc::new(Mutex::new(Vec::new())),
                eof_when_drained: false,
            }
        }

        /// One chunk per line, newline appended.
        pub fn from_lines(lines: &[&str]) -> Self {
            Self::from_chunks(
                lines
                    .iter()
                    .map(|l| format!("{l}\n").into_bytes())
                    .collect(),
            )
        }

        /// No data at all; every read times out.
        pub fn silent() -> Self {
            Self::from_chunks(Vec::new())
        }

        /// Report a closed stream once the script is drained.
        pub fn with_eof(mut self) -> Self {
            self.eof_when_drained = true;
            self
        }

        /// Handle on everything written to this transport.
        pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
            Arc::clone(&self.written)
        }
    }

    impl Read for ScriptTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None if self.eof_when_drained => Ok(0),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for ScriptTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written
                .lock()
                .expect("writer lock poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Write half backed by a shared buffer, for dispatcher tests.
    pub(crate) struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

    impl SharedWriter {
        pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let buf = Arc::new(Mutex::new(Vec::new()));
            (Self(Arc::clone(&buf)), buf)
        }
    }

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .expect("writer lock poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Write half that fails every write, for disconnect tests.
    pub(crate) struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
