use tracing::trace;

use super::frame::checksum;
use super::{Command, Frame, END_BYTE, START_BYTE, VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    Start,
    Version,
    Command,
    Length,
    Payload,
    Checksum,
    End,
}

/// Byte-at-a-time frame parser.
///
/// Anything that does not fit the frame grammar drops the parser back to
/// [`ParserState::Start`]. The offending byte is looked at once more as a
/// possible start byte, so a frame directly following garbage is not lost.
#[derive(Debug, Clone)]
pub struct FrameParser {
    version: u8,
    state: ParserState,
    command: Command,
    length: u8,
    payload: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_version(VERSION)
    }

    pub fn with_version(version: u8) -> Self {
        Self {
            version,
            state: ParserState::Start,
            command: Command::Init,
            length: 0,
            payload: Vec::with_capacity(u8::MAX as usize),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ParserState::Start;
        self.payload.clear();
    }

    /// Feeds one byte. Returns a frame once its terminator has been seen and
    /// its checksum matched.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            ParserState::Start => {
                if byte == START_BYTE {
                    self.state = ParserState::Version;
                }
            }
            ParserState::Version => {
                if byte == self.version {
                    self.state = ParserState::Command;
                } else {
                    trace!("Parser: unexpected version {}", byte);
                    self.reject(byte);
                }
            }
            ParserState::Command => match Command::try_from(byte) {
                Ok(command) => {
                    self.command = command;
                    self.state = ParserState::Length;
                }
                Err(_) => {
                    trace!("Parser: unknown command {}", byte);
                    self.reject(byte);
                }
            },
            ParserState::Length => {
                self.length = byte;
                self.payload.clear();
                self.state = if byte == 0 { ParserState::Checksum } else { ParserState::Payload };
            }
            ParserState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.length as usize {
                    self.state = ParserState::Checksum;
                }
            }
            ParserState::Checksum => {
                let expected = checksum(self.version, self.command.into(), &self.payload);
                if byte == expected {
                    self.state = ParserState::End;
                } else {
                    trace!("Parser: checksum mismatch, expected {:#04x} got {:#04x}", expected, byte);
                    self.reject(byte);
                }
            }
            ParserState::End => {
                self.state = ParserState::Start;
                if byte == END_BYTE {
                    return Some(Frame {
                        version: self.version,
                        command: self.command,
                        payload: std::mem::take(&mut self.payload),
                    });
                }
                trace!("Parser: missing terminator, got {:#04x}", byte);
                self.reject(byte);
            }
        }
        None
    }

    /// Feeds a slice and collects every frame completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }

    fn reject(&mut self, byte: u8) {
        self.payload.clear();
        self.state = if byte == START_BYTE { ParserState::Version } else { ParserState::Start };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReadKeyframePayload, WirePayload};

    #[test]
    fn zero_length_goes_straight_to_checksum() {
        let mut parser = FrameParser::new();
        for b in [0xFF, VERSION, Command::Stop.into(), 0] {
            assert!(parser.push(b).is_none());
        }
        assert_eq!(parser.state(), ParserState::Checksum);
    }

    #[test]
    fn unknown_command_resets() {
        let mut parser = FrameParser::new();
        parser.push(0xFF);
        parser.push(VERSION);
        parser.push(Command::COUNT);
        assert_eq!(parser.state(), ParserState::Start);
    }

    #[test]
    fn start_byte_in_version_position_restarts_frame() {
        let mut parser = FrameParser::new();
        let mut bytes = vec![0xFF];
        bytes.extend(Frame::simple(Command::Init).encode());
        let frames = parser.feed(&bytes);
        assert_eq!(frames, vec![Frame::simple(Command::Init)]);
    }

    #[test]
    fn payload_frame_is_returned_once() {
        let frame = Frame::with_payload(Command::ReadKeyframe, &ReadKeyframePayload { index: 3 }).unwrap();
        let mut parser = FrameParser::new();
        let frames = parser.feed(&frame.encode());
        assert_eq!(frames.len(), 1);
        assert_eq!(ReadKeyframePayload::from_bytes(&frames[0].payload).unwrap().index, 3);
        assert_eq!(parser.state(), ParserState::Start);
    }
}
