//! Millisecond clock driven by a 1 kHz timer interrupt.

use core::cell::Cell;

use critical_section::Mutex;

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    running: bool,
    ticks: u32,
    /// Ticks since the last deadline reset.
    delta: u32,
    dest: u32,
    reached: bool,
}

/// Logical clock shared between the timer interrupt and the main loop.
/// All access goes through a critical section.
#[derive(Debug)]
pub struct Clock {
    state: Mutex<Cell<ClockState>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            state: Mutex::new(Cell::new(ClockState::default())),
        }
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ClockState) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            let ret = f(&mut state);
            cell.set(state);
            ret
        })
    }

    /// Timer interrupt body. Does nothing while the clock is stopped.
    pub fn tick(&self) {
        self.update(|s| {
            if !s.running {
                return;
            }
            s.delta = s.delta.wrapping_add(1);
            s.ticks = s.ticks.wrapping_add(1);
            if !s.reached && s.ticks >= s.dest {
                s.reached = true;
            }
        })
    }

    /// Advances by `ms` ticks at once.
    pub fn advance(&self, ms: u32) {
        for _ in 0..ms {
            self.tick();
        }
    }

    pub fn start(&self) {
        self.update(|s| {
            s.ticks = 0;
            s.running = true;
        })
    }

    pub fn stop(&self) {
        self.update(|s| s.running = false)
    }

    pub fn is_running(&self) -> bool {
        self.update(|s| s.running)
    }

    pub fn now(&self) -> u32 {
        self.update(|s| s.ticks)
    }

    /// Milliseconds since the last [`Clock::reset_deadline`].
    pub fn elapsed(&self) -> u32 {
        self.update(|s| s.delta)
    }

    pub fn reset_deadline(&self, ms: u32) {
        self.update(|s| {
            s.dest = s.ticks.wrapping_add(ms);
            s.delta = 0;
            s.reached = false;
        })
    }

    pub fn deadline_passed(&self) -> bool {
        self.update(|s| s.reached)
    }
}
