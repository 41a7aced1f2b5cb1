//! Binary packet protocol spoken between the host and the robot controller.
//!
//! A frame is `0xFF, version, command, length, payload.., checksum, 0x0D`.
//! Payloads are packed little-endian records, see [`payloads`].

mod frame;
mod parser;
mod sync;
pub mod payloads;

pub use frame::*;
pub use parser::*;
pub use sync::*;
pub use payloads::*;

use int_enum::IntEnum;
use serde::{Deserialize, Serialize};

pub const VERSION: u8 = 10;
pub const NUM_AXES: usize = 8;
pub const MAX_KEYFRAMES: usize = 128;
pub const POSITION_BIAS: i32 = 16384;

pub const START_BYTE: u8 = 0xFF;
pub const END_BYTE: u8 = 0x0D;

/// Axis reported no position in a feedback packet.
pub const NO_POSITION: i16 = 0x7FFF;

/// Feedback flag: the controller is running its stored sequence.
pub const FF_PLAYING: u8 = 1;
/// Play flag: repeat the stored sequence until stopped.
pub const PF_LOOP: u8 = 1;

/// Key that must accompany a `Reset` packet before the controller jumps
/// into its bootloader.
pub const RESET_KEY: [u8; 8] = [0x0A, 0x65, 0x38, 0x47, 0x82, 0xAB, 0xBF, 0x00];

#[repr(u8)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, IntEnum)]
pub enum Command {
    Init = 0,
    Reset = 1,
    Config = 2,
    ReadKeyframe = 3,
    SaveKeyframe = 4,
    Exit = 5,
    Commit = 6,
    Play = 7,
    Stop = 8,
    Feedback = 9,
    Motion = 10,
}

impl Command {
    pub const COUNT: u8 = 11;
}

/// Digital output action fired when a keyframe is reached.
#[repr(u8)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntEnum)]
pub enum OutputCommand {
    #[default]
    Nop = 0,
    Set = 1,
    Reset = 2,
}

impl OutputCommand {
    /// Lenient conversion used for wire records, unknown values are treated as no-op.
    pub fn from_wire(value: u8) -> Self {
        OutputCommand::try_from(value).unwrap_or(OutputCommand::Nop)
    }
}
