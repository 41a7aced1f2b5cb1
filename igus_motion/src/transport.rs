//! Byte-level duplex channel to the robot controller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A blocking, timeout-bounded serial channel.
pub trait Link: Send {
    /// Writes `bytes` and returns how many of them could NOT be written.
    /// Anything but 0 means the pipe is broken.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Reads whatever is available into `buf`, waiting at most `timeout` for
    /// the first byte. Returns the number of bytes read.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize;

    /// Blocks until at least one byte is readable or the timeout expires.
    fn wait_event(&mut self, timeout: Duration) -> bool;

    fn close(&mut self) {}
}

/// Opens candidate port number `index`. Used for the round robin port scan.
pub trait PortOpener: Send {
    fn open(&mut self, index: usize) -> Option<Box<dyn Link>>;
}

#[cfg(feature = "driver")]
pub use serial::*;

#[cfg(feature = "driver")]
mod serial {
    use super::*;
    use std::io::{Read, Write};

    use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
    use tracing::{debug, info};

    pub struct SerialLink {
        name: String,
        port: Box<dyn SerialPort>,
    }

    impl SerialLink {
        pub fn open(name: &str, baud_rate: u32) -> Result<Self, crate::MotionError> {
            let port = serialport::new(name, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| crate::MotionError::PortOpen(format!("{}: {}", name, e)))?;
            Ok(Self { name: name.to_string(), port })
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    impl Link for SerialLink {
        fn write(&mut self, bytes: &[u8]) -> usize {
            match self.port.write_all(bytes).and_then(|_| self.port.flush()) {
                Ok(()) => 0,
                Err(e) => {
                    debug!("Write to {} failed: {}", self.name, e);
                    bytes.len()
                }
            }
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
            if self.port.set_timeout(timeout.max(Duration::from_millis(1))).is_err() {
                return 0;
            }
            match self.port.read(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                Err(e) => {
                    debug!("Read from {} failed: {}", self.name, e);
                    0
                }
            }
        }

        fn wait_event(&mut self, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            loop {
                if matches!(self.port.bytes_to_read(), Ok(n) if n > 0) {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn close(&mut self) {
            info!("Closing port {}", self.name);
        }
    }

    /// Opens serial ports by index, either from an explicit list or from the
    /// platform naming scheme (`/dev/ttyUSB<n>`, `COM<n>`).
    #[derive(Debug, Clone)]
    pub struct SerialPortOpener {
        pub ports: Vec<String>,
        pub baud_rate: u32,
    }

    impl SerialPortOpener {
        pub fn new(ports: Vec<String>, baud_rate: u32) -> Self {
            Self { ports, baud_rate }
        }

        pub fn port_name(&self, index: usize) -> String {
            if !self.ports.is_empty() {
                return self.ports[index % self.ports.len()].clone();
            }
            if cfg!(windows) {
                format!("COM{}", index)
            } else {
                format!("/dev/ttyUSB{}", index)
            }
        }
    }

    impl PortOpener for SerialPortOpener {
        fn open(&mut self, index: usize) -> Option<Box<dyn Link>> {
            let name = self.port_name(index);
            match SerialLink::open(&name, self.baud_rate) {
                Ok(link) => {
                    info!("Opened port {}", name);
                    Some(Box::new(link))
                }
                Err(e) => {
                    debug!("{}", e);
                    None
                }
            }
        }
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    broken: bool,
    responder: Option<Responder>,
}

/// In-memory link for tests. Bytes written are recorded; a responder closure
/// may answer each write with reply bytes.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let link = Self::default();
        if let Ok(mut state) = link.state.lock() {
            state.responder = Some(Box::new(responder));
        }
        link
    }

    /// Queues bytes as if the robot had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            state.incoming.extend(bytes.iter().copied());
        }
    }

    /// Takes everything written so far.
    pub fn take_written(&self) -> Vec<u8> {
        self.state.lock().map(|mut s| std::mem::take(&mut s.written)).unwrap_or_default()
    }

    pub fn set_broken(&self, broken: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.broken = broken;
        }
    }
}

impl Link for MockLink {
    fn write(&mut self, bytes: &[u8]) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return bytes.len();
        };
        if state.broken {
            return bytes.len();
        }
        state.written.extend_from_slice(bytes);
        if let Some(mut responder) = state.responder.take() {
            let reply = responder(bytes);
            state.incoming.extend(reply);
            state.responder = Some(responder);
        }
        0
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let n = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn wait_event(&mut self, timeout: Duration) -> bool {
        let ready = self.state.lock().map(|s| !s.incoming.is_empty()).unwrap_or(false);
        if !ready {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        ready
    }
}

/// Port opener handing out clones of a fixed set of links. `None` entries
/// fail to open.
#[derive(Clone, Default)]
pub struct MockPortOpener {
    pub links: Vec<Option<MockLink>>,
    pub attempts: Arc<Mutex<Vec<usize>>>,
}

impl MockPortOpener {
    pub fn new(links: Vec<Option<MockLink>>) -> Self {
        Self { links, attempts: Arc::default() }
    }
}

impl PortOpener for MockPortOpener {
    fn open(&mut self, index: usize) -> Option<Box<dyn Link>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(index);
        }
        let link = self.links.get(index).cloned().flatten()?;
        Some(Box::new(link))
    }
}

/// Reads until a carriage return arrives, `max` bytes are buffered or the
/// timeout expires.
pub fn read_line(link: &mut dyn Link, max: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(max);
    let mut buf = vec![0u8; max];
    while out.len() < max {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = link.read(&mut buf[..max - out.len()], remaining);
        out.extend_from_slice(&buf[..n]);
        if out.last() == Some(&b'\r') {
            break;
        }
        if n == 0 {
            if remaining.is_zero() {
                break;
            }
            link.wait_event(remaining.min(Duration::from_millis(5)));
        }
    }
    out
}
