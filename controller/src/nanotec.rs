//! Driver for the Nanotec axis controllers on the RS-485 bus.
//!
//! The axis protocol is line based ASCII at 115200 baud, so a signed byte can
//! take four characters on the wire. Every command is a `#<id>...` line that
//! the axis answers with a `\r` terminated echo or register value.

use core::fmt::Write;

use heapless::String;
use tracing::trace;

#[cfg(feature = "axis-write-cache")]
use igus_motion::protocol::NUM_AXES;

/// One line on the axis bus.
pub type Line = String<20>;

/// Byte pipe to the axis controllers.
pub trait AxisBus {
    /// Puts `bytes` on the bus and waits until they are out.
    fn send(&mut self, bytes: &[u8]);

    fn receive(&mut self) -> Option<u8>;

    /// Idles while waiting for a reply byte.
    fn wait_us(&mut self, us: u32);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    Reset = 0,
    Search = 1,
    Idle = 2,
    Compliance = 3,
}

impl AxisState {
    pub fn from_value(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Reset),
            1 => Some(Self::Search),
            2 => Some(Self::Idle),
            3 => Some(Self::Compliance),
            _ => None,
        }
    }
}

#[cfg(feature = "axis-write-cache")]
#[derive(Debug, Clone, Copy)]
struct CachedTargets {
    dest: u16,
    velocity: u16,
}

#[cfg(feature = "axis-write-cache")]
impl Default for CachedTargets {
    fn default() -> Self {
        // values no axis is ever set to
        Self { dest: 0xFFFF, velocity: 0xFFFF }
    }
}

pub struct Nanotec<A: AxisBus> {
    bus: A,
    #[cfg(feature = "axis-write-cache")]
    cache: [CachedTargets; NUM_AXES],
}

impl<A: AxisBus> Nanotec<A> {
    pub fn new(bus: A) -> Self {
        Self {
            bus,
            #[cfg(feature = "axis-write-cache")]
            cache: [CachedTargets::default(); NUM_AXES],
        }
    }

    pub fn bus(&mut self) -> &mut A {
        &mut self.bus
    }

    fn write_line(&mut self, command: &str) {
        trace!("axis <- {}", command);
        self.bus.send(command.as_bytes());
        self.bus.send(b"\r");
    }

    /// Reads one reply line. Gives up after 255 idle waits of 30 us.
    pub fn read_response(&mut self) -> Option<Line> {
        let mut line = Line::new();
        loop {
            let mut timeout = 0u8;
            let c = loop {
                if let Some(c) = self.bus.receive() {
                    break c;
                }
                self.bus.wait_us(30);
                timeout += 1;
                if timeout == 255 {
                    return None;
                }
            };
            if c == b'\r' {
                trace!("axis -> {}", line);
                return Some(line);
            }
            // overlong replies are truncated
            let _ = line.push(c as char);
        }
    }

    fn is_response(&mut self, expected: &str) -> bool {
        self.read_response().is_some_and(|r| r.starts_with(expected))
    }

    fn chat(&mut self, command: &str, expected: &str) -> bool {
        self.write_line(command);
        self.is_response(expected)
    }

    pub fn ping(&mut self, id: u8) -> bool {
        let mut cmd = Line::new();
        let mut answer = Line::new();
        let _ = write!(cmd, "#{}ZP", id);
        let _ = write!(answer, "{}ZP+", id);
        self.chat(&cmd, &answer)
    }

    /// Reads register `reg`, answered as `<id>Z<reg><value>`.
    pub fn read_register(&mut self, id: u8, reg: char) -> Option<i16> {
        let mut cmd = Line::new();
        let _ = write!(cmd, "#{}Z{}", id, reg);
        self.write_line(&cmd);

        let response = self.read_response()?;
        if response.len() < 4 {
            return None;
        }
        let mut chars = response.chars();
        if chars.next() != char::from_digit(id as u32, 10)
            || chars.next() != Some('Z')
            || chars.next() != Some(reg)
        {
            return None;
        }
        chars.as_str().parse().ok()
    }

    pub fn state(&mut self, id: u8) -> Option<AxisState> {
        self.read_register(id, 'P').and_then(AxisState::from_value)
    }

    pub fn set_state(&mut self, id: u8, state: AxisState) {
        let mut cmd = Line::new();
        let _ = write!(cmd, "#{}P{}", id, state as u8);
        self.write_line(&cmd);
        self.read_response();
    }

    /// Starts the motion program stored on the axis controller.
    pub fn start_program(&mut self, id: u8) -> bool {
        let mut cmd = Line::new();
        let mut answer = Line::new();
        let _ = write!(cmd, "#{}(JA", id);
        let _ = write!(answer, "{}(JA+", id);
        self.chat(&cmd, &answer)
    }

    /// Sets the biased target position.
    pub fn set_destination(&mut self, id: u8, dest: u16) {
        #[cfg(feature = "axis-write-cache")]
        if self.cache[id as usize - 1].dest == dest {
            return;
        }

        let mut cmd = Line::new();
        let _ = write!(cmd, "#{}n{}", id, dest);
        let _acked = self.chat(&cmd, &cmd[1..]);

        #[cfg(feature = "axis-write-cache")]
        if _acked {
            self.cache[id as usize - 1].dest = dest;
        }
    }

    pub fn set_velocity(&mut self, id: u8, velocity: u16) {
        #[cfg(feature = "axis-write-cache")]
        if self.cache[id as usize - 1].velocity == velocity {
            return;
        }

        let mut cmd = Line::new();
        let _ = write!(cmd, "#{}o{}", id, velocity);
        let _acked = self.chat(&cmd, &cmd[1..]);

        #[cfg(feature = "axis-write-cache")]
        if _acked {
            self.cache[id as usize - 1].velocity = velocity;
        }
    }

    /// Unbiased encoder position.
    pub fn encoder_position(&mut self, id: u8) -> Option<i16> {
        self.read_register(id, 'I')
    }

    /// Position the axis is currently commanded to.
    pub fn command_position(&mut self, id: u8) -> Option<i16> {
        self.read_register(id, 's')
    }
}
