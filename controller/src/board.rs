//! Board level I/O the firmware needs besides the axis bus.

use crate::combuf::ComBuffer;

pub trait Board {
    fn delay_ms(&mut self, ms: u32);

    fn delay_us(&mut self, us: u32);

    /// Start button or switch.
    fn button(&mut self) -> bool;

    /// Digital output switched by keyframe output commands.
    fn set_output(&mut self, active: bool);

    /// Level of the synchronisation line.
    fn sync_line(&mut self) -> bool;

    /// Releases (pull-up) or drives low the synchronisation line.
    fn release_sync(&mut self, released: bool);

    /// Kicks off transmission of `to_pc` and returns once it went out.
    fn transmit(&mut self, to_pc: &ComBuffer);

    /// Enables forwarding of axis bus replies to the PC.
    fn set_passthrough(&mut self, enabled: bool);

    fn set_led(&mut self, _on: bool) {}

    /// Jumps into the bootloader. Real hardware never returns.
    fn enter_bootloader(&mut self);
}
