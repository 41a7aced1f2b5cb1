use super::payloads::WirePayload;
use super::{Command, END_BYTE, START_BYTE, VERSION};
use crate::errors::MotionError;
use tracing::warn;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = 6;

/// One's complement of the byte sum of version, command, length and payload.
pub fn checksum(version: u8, command: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(version.wrapping_add(command).wrapping_add(payload.len() as u8), |acc, b| {
            acc.wrapping_add(*b)
        });
    !sum
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame without payload. Acknowledgements are simple frames of the
    /// command they acknowledge.
    pub fn simple(command: Command) -> Self {
        Self { version: VERSION, command, payload: Vec::new() }
    }

    pub fn with_payload<P: WirePayload>(command: Command, payload: &P) -> Result<Self, MotionError> {
        Ok(Self { version: VERSION, command, payload: payload.to_bytes()? })
    }

    pub fn payload_as<P: WirePayload>(&self) -> Result<P, MotionError> {
        P::from_bytes(&self.payload)
    }

    /// The three bytes every frame of this command starts with.
    pub fn header(&self) -> [u8; 3] {
        [START_BYTE, self.version, self.command.into()]
    }

    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.version, self.command.into(), &self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header());
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum());
        out.push(END_BYTE);
        out
    }

    /// Validates a complete frame of the current protocol version.
    /// Trailing bytes are not allowed.
    pub fn decode(bytes: &[u8]) -> Result<Self, MotionError> {
        if bytes.len() < FRAME_OVERHEAD || bytes[0] != START_BYTE {
            return Err(MotionError::UnexpectedHeader);
        }
        if bytes[1] != VERSION {
            warn!("Frame has protocol version {}, expected {}", bytes[1], VERSION);
            return Err(MotionError::VersionMismatch { expected: VERSION, found: bytes[1] });
        }
        let command = Command::try_from(bytes[2]).map_err(|_| MotionError::UnexpectedHeader)?;
        let length = bytes[3] as usize;
        if bytes.len() != length + FRAME_OVERHEAD {
            return Err(MotionError::PayloadSize { expected: length, found: bytes.len() - FRAME_OVERHEAD });
        }
        let frame = Frame { version: bytes[1], command, payload: bytes[4..4 + length].to_vec() };
        let expected = frame.checksum();
        let found = bytes[4 + length];
        if expected != found {
            return Err(MotionError::ChecksumMismatch { expected, found });
        }
        if bytes[5 + length] != END_BYTE {
            return Err(MotionError::UnexpectedHeader);
        }
        Ok(frame)
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::simple(command)
    }
}
