//! Host side of the igus robolink keyframe motion system.
//!
//! The wire codec in [`protocol`] is shared with the `controller` crate, which
//! runs the same frames on the microcontroller side.

pub mod protocol;
pub mod transport;
pub mod joints;
pub mod keyframe;
pub mod timeline;
pub mod player;

pub mod driver;

pub mod errors;
pub use errors::*;

pub use joints::{JointInfo, JointTable};
pub use keyframe::Keyframe;
pub use protocol::{Command, OutputCommand};

/// Fastest joint speed the servos accept, in radians per second.
pub const SERVO_SPEED_MAX: f64 = 4.0;

/// Rate at which the player emits target updates.
pub const MOTION_SAMPLE_RATE: f64 = 50.0;
