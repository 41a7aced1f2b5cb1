use std::time::Duration;

use serde::{Deserialize, Serialize};

/// ```rust,ignore
/// let config = RobotInterfaceConfig::new(vec!["/dev/ttyUSB0".to_string()], 115200);
///
/// if let Err(e) = config.validate() {
///     println!("Configuration error: {}", e);
///     return;
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RobotInterfaceConfig {
    /// Explicit candidate ports. Empty means the platform naming scheme.
    pub ports: Vec<String>,
    /// Index the port scan starts at.
    pub first_port: usize,
    /// Number of port indices the scan cycles through.
    pub port_cycle: usize,
    pub baud_rate: u32,
    /// How long a legacy ASCII request waits for its reply.
    pub reply_timeout_ms: u64,
    /// Legacy reply buffer size.
    pub reply_buffer: usize,
    /// Empty legacy replies tolerated before the robot counts as lost.
    pub retry_budget: u32,
    /// Read attempts for one binary exchange.
    pub ext_read_attempts: u32,
    /// Wait between two empty reads of a binary exchange.
    pub ext_wait_ms: u64,
    pub compliance_timeout_ms: u64,
    /// Upper bound for commanded joint velocities, rad/s.
    pub servo_speed_max: f64,
}

impl RobotInterfaceConfig {
    pub fn new(ports: Vec<String>, baud_rate: u32) -> Self {
        Self { ports, baud_rate, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port_cycle == 0 {
            return Err("Port cycle must be greater than 0.".to_string());
        }
        if self.baud_rate == 0 {
            return Err("Baud rate must be greater than 0.".to_string());
        }
        if self.reply_buffer < 8 {
            return Err("Reply buffer must hold at least 8 bytes.".to_string());
        }
        if self.retry_budget == 0 {
            return Err("Retry budget must be greater than 0.".to_string());
        }
        if self.ext_read_attempts == 0 {
            return Err("Extended read attempts must be greater than 0.".to_string());
        }
        if !(self.servo_speed_max > 0.0) {
            return Err("Servo speed maximum must be positive.".to_string());
        }
        Ok(())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn ext_wait(&self) -> Duration {
        Duration::from_millis(self.ext_wait_ms)
    }

    pub fn compliance_timeout(&self) -> Duration {
        Duration::from_millis(self.compliance_timeout_ms)
    }
}

impl Default for RobotInterfaceConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            first_port: 0,
            port_cycle: 15,
            baud_rate: 115_200,
            reply_timeout_ms: 200,
            reply_buffer: 64,
            retry_budget: 10,
            ext_read_attempts: 10,
            ext_wait_ms: 50,
            compliance_timeout_ms: 2000,
            servo_speed_max: crate::SERVO_SPEED_MAX,
        }
    }
}
