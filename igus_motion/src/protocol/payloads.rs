use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{NUM_AXES, RESET_KEY};
use crate::errors::MotionError;

/// A fixed-size packed record that travels as a frame payload.
pub trait WirePayload: Serialize + DeserializeOwned {
    const SIZE: usize;

    fn to_bytes(&self) -> Result<Vec<u8>, MotionError> {
        let bytes = bincode::serialize(self)?;
        debug_assert_eq!(bytes.len(), Self::SIZE);
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MotionError> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::PayloadSize { expected: Self::SIZE, found: bytes.len() });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One stored keyframe in controller form. Ticks are biased encoder positions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyframeRecord {
    /// Time to reach this frame from the previous one, in milliseconds.
    pub duration: u16,
    pub ticks: [u16; NUM_AXES],
    pub output_command: u8,
}

impl WirePayload for KeyframeRecord {
    const SIZE: usize = 19;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveKeyframePayload {
    pub index: u8,
    pub keyframe: KeyframeRecord,
}

impl WirePayload for SaveKeyframePayload {
    const SIZE: usize = 20;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadKeyframePayload {
    pub index: u8,
}

impl WirePayload for ReadKeyframePayload {
    const SIZE: usize = 1;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigPayload {
    pub num_keyframes: u16,
    pub active_axes: u16,
    /// Encoder to motor step ratio per axis, fixed point with 8 fractional bits.
    pub enc_to_mot: [u16; NUM_AXES],
    /// Lookahead horizon in milliseconds, 0 disables velocity correction.
    pub lookahead: u16,
}

impl WirePayload for ConfigPayload {
    const SIZE: usize = 22;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedbackPayload {
    pub num_axes: u8,
    pub flags: u8,
    pub positions: [i16; NUM_AXES],
}

impl WirePayload for FeedbackPayload {
    const SIZE: usize = 18;
}

impl FeedbackPayload {
    pub fn is_playing(&self) -> bool {
        self.flags & super::FF_PLAYING != 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayPayload {
    pub flags: u8,
}

impl WirePayload for PlayPayload {
    const SIZE: usize = 1;
}

impl PlayPayload {
    pub fn looped(looped: bool) -> Self {
        Self { flags: if looped { super::PF_LOOP } else { 0 } }
    }

    pub fn is_looped(&self) -> bool {
        self.flags & super::PF_LOOP != 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPayload {
    pub key: [u8; 8],
}

impl WirePayload for ResetPayload {
    const SIZE: usize = 8;
}

impl Default for ResetPayload {
    fn default() -> Self {
        Self { key: RESET_KEY }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionPayload {
    pub ticks: [u16; NUM_AXES],
    pub velocity: [u16; NUM_AXES],
    pub num_axes: u8,
    pub output_command: u8,
}

impl WirePayload for MotionPayload {
    const SIZE: usize = 34;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_sizes_match_declared_sizes() {
        assert_eq!(KeyframeRecord::default().to_bytes().unwrap().len(), KeyframeRecord::SIZE);
        assert_eq!(SaveKeyframePayload::default().to_bytes().unwrap().len(), SaveKeyframePayload::SIZE);
        assert_eq!(ConfigPayload::default().to_bytes().unwrap().len(), ConfigPayload::SIZE);
        assert_eq!(FeedbackPayload::default().to_bytes().unwrap().len(), FeedbackPayload::SIZE);
        assert_eq!(MotionPayload::default().to_bytes().unwrap().len(), MotionPayload::SIZE);
        assert_eq!(ResetPayload::default().to_bytes().unwrap().len(), ResetPayload::SIZE);
    }

    #[test]
    fn fields_are_little_endian_without_padding() {
        let record = KeyframeRecord {
            duration: 0x0201,
            ticks: [0x0403, 0, 0, 0, 0, 0, 0, 0x0605],
            output_command: 2,
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[16..], &[0x05, 0x06, 0x02]);
    }

    #[test]
    fn feedback_flags_and_wrong_size() {
        let fb = FeedbackPayload { num_axes: 2, flags: 1, positions: [-5, 7, 0, 0, 0, 0, 0, 0] };
        let bytes = fb.to_bytes().unwrap();
        assert_eq!(&bytes[2..4], &(-5i16).to_le_bytes());
        let back = FeedbackPayload::from_bytes(&bytes).unwrap();
        assert!(back.is_playing());
        match FeedbackPayload::from_bytes(&bytes[..10]) {
            Err(MotionError::PayloadSize { expected: 18, found: 10 }) => {}
            other => panic!("Expected a payload size error, got {:?}", other),
        }
    }
}
