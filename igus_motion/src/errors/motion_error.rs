use std::error::Error;
use std::fmt;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum MotionError {
    Serialization(String),
    ConfigParse(String),
    InvalidGroup(String),
    MissingSetting { group: String, key: String },
    InvalidName(String),
    DuplicateAddress(u8),
    AddressGap(u8),
    IndexGap(usize),
    KeyframeParse(String),
    PortOpen(String),
    PortBroken(String),
    Timeout,
    ChecksumMismatch { expected: u8, found: u8 },
    UnexpectedHeader,
    VersionMismatch { expected: u8, found: u8 },
    PayloadSize { expected: usize, found: usize },
    HandshakeTimeout(String),
    TransferFailed(String),
    TooManyAxes(usize),
    TooManyKeyframes(usize),
    SegmentTooLong { index: usize, millis: u64 },
    Disconnected(),
}

impl Error for MotionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MotionError::Serialization(ref msg) => write!(f, "Serialization error: {}", msg),
            MotionError::ConfigParse(ref msg) => write!(f, "Could not parse joint configuration: {}", msg),
            MotionError::InvalidGroup(ref group) => write!(f, "Invalid group name {} in joint configuration", group),
            MotionError::MissingSetting { ref group, ref key } => {
                write!(f, "Mandatory setting {}/{} is missing", group, key)
            }
            MotionError::InvalidName(ref name) => write!(f, "Invalid joint name {}", name),
            MotionError::DuplicateAddress(addr) => write!(f, "Address {} is used by more than one joint", addr),
            MotionError::AddressGap(addr) => write!(f, "Joint addresses are not contiguous, {} is missing", addr),
            MotionError::IndexGap(index) => write!(f, "Joint indices are not contiguous, Joint{} is missing", index),
            MotionError::KeyframeParse(ref msg) => write!(f, "Invalid keyframe: {}", msg),
            MotionError::PortOpen(ref msg) => write!(f, "Could not open port: {}", msg),
            MotionError::PortBroken(ref msg) => write!(f, "Port broken: {}", msg),
            MotionError::Timeout => write!(f, "Timed out waiting for the robot"),
            MotionError::ChecksumMismatch { expected, found } => {
                write!(f, "Checksum mismatch: expected {:#04x}, found {:#04x}", expected, found)
            }
            MotionError::UnexpectedHeader => write!(f, "Reply does not start with the expected header"),
            MotionError::VersionMismatch { expected, found } => {
                write!(f, "Protocol version {} does not match {}", found, expected)
            }
            MotionError::PayloadSize { expected, found } => {
                write!(f, "Payload has {} bytes, expected {}", found, expected)
            }
            MotionError::HandshakeTimeout(ref msg) => write!(f, "Handshake timed out: {}", msg),
            MotionError::TransferFailed(ref msg) => write!(f, "Keyframe transfer failed: {}", msg),
            MotionError::TooManyAxes(n) => write!(f, "{} axes configured, the controller supports at most 8", n),
            MotionError::TooManyKeyframes(n) => write!(f, "{} keyframes, the controller stores at most 128", n),
            MotionError::SegmentTooLong { index, millis } => {
                write!(f, "Keyframe {} takes {} ms, the controller times segments up to {} ms", index, millis, u16::MAX)
            }
            MotionError::Disconnected() => write!(f, "Robot appears to be disconnected"),
        }
    }
}

impl From<bincode::Error> for MotionError {
    fn from(err: bincode::Error) -> Self {
        MotionError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MotionError {
    fn from(err: toml::de::Error) -> Self {
        MotionError::ConfigParse(err.to_string())
    }
}
