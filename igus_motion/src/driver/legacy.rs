//! ASCII request/response exchanges with the axis controllers, used before
//! extended mode is entered and while the compliance mode changes.

use tracing::{debug, trace, warn};

use super::RobotInterface;
use crate::protocol::POSITION_BIAS;
use crate::transport::read_line;

/// Reply of a `txrx` whose write failed.
pub const PORT_BROKEN: &str = "PORTBROKEN";

impl RobotInterface {
    /// Sends one ASCII command and returns the reply without its trailing
    /// carriage return. Empty replies from a connected robot use up the
    /// retry budget; when it runs out the robot counts as lost.
    pub(super) fn txrx(&mut self, command: &str) -> String {
        let Some(link) = self.link.as_mut() else {
            return String::new();
        };

        if link.write(command.as_bytes()) != 0 {
            warn!("Port {} disconnected.", self.port_number);
            self.close_link();
            if self.connected {
                self.disconnect_robot();
            }
            return PORT_BROKEN.to_string();
        }

        let raw = read_line(link.as_mut(), self.config.reply_buffer, self.config.reply_timeout());
        let mut response = String::from_utf8_lossy(&raw).into_owned();
        if response.ends_with('\r') {
            response.pop();
        }
        trace!("Plain cmd: {:?} -> {:?}", command, response);

        if raw.is_empty() && self.connected {
            self.timeout_ticks_left = self.timeout_ticks_left.saturating_sub(1);
            if self.timeout_ticks_left == 0 {
                self.timeout_ticks_left = self.config.retry_budget;
                debug!("Timeout");
                self.disconnect_robot();
            }
        } else {
            self.timeout_ticks_left = self.config.retry_budget;
        }

        response
    }

    /// Sends `#<command>\r` and checks that the reply echoes `command`.
    pub(super) fn chat_echo(&mut self, command: &str) -> bool {
        self.txrx(&format!("#{}\r", command)).ends_with(command)
    }

    /// Reads a signed register value, e.g. `"1I"` for the encoder of axis 1.
    pub fn poll_register(&mut self, register: &str) -> Option<i32> {
        let response = self.txrx(&format!("#{}\r", register));
        register_value(&response, register).and_then(|v| i32::try_from(v).ok())
    }

    /// Reads a register that packs encoder and motor position into one
    /// value. Returns `(encoder, motor)`.
    pub fn poll_piggyback_register(&mut self, register: &str) -> Option<(i32, i32)> {
        let response = self.txrx(&format!("#{}\r", register));
        register_value(&response, register).map(|v| decode_piggyback(v as u32))
    }
}

/// Finds `register` in `response` and parses the signed number after it.
pub fn register_value(response: &str, register: &str) -> Option<i64> {
    let mut rest = response;
    while let Some(at) = rest.find(register) {
        let tail = &rest[at + register.len()..];
        let (sign, digits) = match tail.as_bytes().first() {
            Some(b'+') => (1, &tail[1..]),
            Some(b'-') => (-1, &tail[1..]),
            _ => (1, tail),
        };
        let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
        if end > 0 {
            return digits[..end].parse::<i64>().ok().map(|v| sign * v);
        }
        rest = &rest[at + 1..];
    }
    None
}

/// Splits a packed position register into its 12 bit encoder and 20 bit
/// motor fields, both returned unbiased.
pub fn decode_piggyback(value: u32) -> (i32, i32) {
    let encoder = ((value & 0xFFF0_0000) >> 20) as i32 - POSITION_BIAS;
    let motor = (value & 0x000F_FFFF) as i32 - 524_288;
    (encoder, motor)
}
