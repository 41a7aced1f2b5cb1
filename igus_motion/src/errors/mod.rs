mod motion_error;
pub use motion_error::*;
