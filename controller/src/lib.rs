//! Controller side of the igus robolink keyframe motion system.
//!
//! [`Controller`] is the microcontroller firmware: it passes the ASCII axis
//! protocol through from the PC, switches into the binary protocol when it
//! sees an `Init` frame, stores keyframes and plays them back on the axis
//! controllers. Hardware access goes through the [`Board`] and
//! [`AxisBus`] traits; [`simulated`] implements both in software.

pub mod board;
pub mod clock;
pub mod combuf;
pub mod error;
pub mod io;
pub mod nanotec;
pub mod storage;

mod dispatcher;
mod firmware;
mod motion;

pub mod simulated;

pub use board::Board;
pub use clock::Clock;
pub use combuf::ComBuffer;
pub use error::ControllerError;
pub use firmware::Controller;
pub use nanotec::{AxisBus, AxisState, Nanotec};
pub use storage::{Eeprom, FileEeprom, MemoryEeprom, Storage};
