//! Simulated axis controllers and board, used by the `controller` binary and
//! the tests.
//!
//! Time comes from a [`SimTime`], either the wall clock or a virtual clock
//! that advances with every byte on the axis bus and every delay. The virtual
//! clock also drives the controller [`Clock`], so a whole sequence plays back
//! in a few milliseconds of test time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use igus_motion::protocol::{NUM_AXES, POSITION_BIAS};
use tracing::{debug, trace};

use crate::board::Board;
use crate::clock::Clock;
use crate::combuf::ComBuffer;
use crate::nanotec::{AxisBus, AxisState};

/// One byte at 115200 baud, 8N1.
const BYTE_TIME_US: u64 = 87;

pub struct SimTime {
    start: Instant,
    virtual_us: Option<AtomicU64>,
    clock: Arc<Clock>,
}

impl SimTime {
    /// Wall clock time. The controller clock needs its own ticker, see
    /// [`spawn_ticker`].
    pub fn realtime(clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self { start: Instant::now(), virtual_us: None, clock })
    }

    /// Virtual time that ticks `clock` once per simulated millisecond.
    pub fn virtual_time(clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self { start: Instant::now(), virtual_us: Some(AtomicU64::new(0)), clock })
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_us.is_some()
    }

    pub fn now_us(&self) -> u64 {
        match &self.virtual_us {
            Some(us) => us.load(Ordering::SeqCst),
            None => self.start.elapsed().as_micros() as u64,
        }
    }

    /// Lets `us` microseconds pass.
    pub fn pass_us(&self, us: u64) {
        match &self.virtual_us {
            Some(now) => {
                let before = now.fetch_add(us, Ordering::SeqCst);
                for _ in before / 1000..(before + us) / 1000 {
                    self.clock.tick();
                }
            }
            None => thread::sleep(Duration::from_micros(us)),
        }
    }

    /// Accounts for `bytes` going over a serial line. Free in real time,
    /// where the line is not simulated.
    pub fn transfer(&self, bytes: usize) {
        if self.is_virtual() {
            self.pass_us(bytes as u64 * BYTE_TIME_US);
        }
    }
}

/// Ticks `clock` at 1 kHz until `running` is cleared. Stands in for the timer
/// interrupt.
pub fn spawn_ticker(clock: Arc<Clock>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        let period = Duration::from_millis(1);
        let mut next = Instant::now() + period;
        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next {
                thread::sleep(next - now);
            }
            clock.tick();
            next += period;
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedAxis {
    pub state: AxisState,
    pub program_running: bool,
    /// Unbiased encoder position.
    pub position: f64,
    /// Unbiased target position.
    pub destination: f64,
    /// Motor steps per second.
    pub velocity: u16,
    pub hold_current: u16,
    pub max_current: u16,
    search_left_us: u64,
}

impl SimulatedAxis {
    fn new() -> Self {
        Self {
            state: AxisState::Reset,
            program_running: true,
            position: 0.0,
            destination: 0.0,
            velocity: 0,
            hold_current: 20,
            max_current: 50,
            search_left_us: 0,
        }
    }

    pub fn encoder(&self) -> i16 {
        self.position.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

/// Axis controllers with ids `1..=n` on one bus.
pub struct SimulatedAxes {
    time: Arc<SimTime>,
    axes: Vec<SimulatedAxis>,
    encoder_per_motor: f64,
    search_us: u64,
    line: Vec<u8>,
    replies: VecDeque<u8>,
    last_update_us: u64,
    commands: Vec<String>,
}

impl SimulatedAxes {
    pub fn new(num_axes: usize, time: Arc<SimTime>) -> Self {
        let last_update_us = time.now_us();
        Self {
            time,
            axes: vec![SimulatedAxis::new(); num_axes.min(NUM_AXES)],
            encoder_per_motor: 1.0,
            search_us: 300_000,
            line: Vec::new(),
            replies: VecDeque::new(),
            last_update_us,
            commands: Vec::new(),
        }
    }

    /// Encoder ticks per motor step, the same for every axis.
    pub fn with_encoder_ratio(mut self, encoder_per_motor: f64) -> Self {
        self.encoder_per_motor = encoder_per_motor;
        self
    }

    pub fn with_search_time(mut self, ms: u64) -> Self {
        self.search_us = ms * 1000;
        self
    }

    pub fn with_state(mut self, state: AxisState) -> Self {
        for axis in self.axes.iter_mut() {
            axis.state = state;
        }
        self
    }

    pub fn with_program_stopped(mut self) -> Self {
        for axis in self.axes.iter_mut() {
            axis.program_running = false;
        }
        self
    }

    pub fn with_positions(mut self, positions: &[i16]) -> Self {
        for (axis, position) in self.axes.iter_mut().zip(positions) {
            axis.position = *position as f64;
            axis.destination = *position as f64;
        }
        self
    }

    pub fn axis(&mut self, id: u8) -> Option<SimulatedAxis> {
        self.update();
        self.axes.get((id as usize).checked_sub(1)?).copied()
    }

    pub fn position(&mut self, id: u8) -> Option<i16> {
        self.axis(id).map(|a| a.encoder())
    }

    /// Moves an axis by hand.
    pub fn push_axis(&mut self, id: u8, position: i16) {
        self.update();
        if let Some(axis) = (id as usize).checked_sub(1).and_then(|i| self.axes.get_mut(i)) {
            axis.position = position as f64;
        }
    }

    /// Every command line the axes received, without the leading `#`.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    fn update(&mut self) {
        let now = self.time.now_us();
        let dt = now.saturating_sub(self.last_update_us) as f64 / 1e6;
        let dt_us = now.saturating_sub(self.last_update_us);
        self.last_update_us = now;

        for axis in self.axes.iter_mut() {
            match axis.state {
                AxisState::Search => {
                    axis.search_left_us = axis.search_left_us.saturating_sub(dt_us);
                    if axis.search_left_us == 0 {
                        axis.state = AxisState::Idle;
                        axis.destination = axis.position;
                    }
                }
                AxisState::Idle => {
                    let step = axis.velocity as f64 * self.encoder_per_motor * dt;
                    let distance = axis.destination - axis.position;
                    if distance.abs() <= step {
                        axis.position = axis.destination;
                    } else {
                        axis.position += step.copysign(distance);
                    }
                }
                AxisState::Reset | AxisState::Compliance => {}
            }
        }
    }

    fn process(&mut self, line: &str) {
        self.update();

        let Some(text) = line.strip_prefix('#') else {
            trace!("Axes ignore {:?}", line);
            return;
        };
        self.commands.push(text.to_string());

        let digits = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
        let Ok(id) = text[..digits].parse::<usize>() else {
            return;
        };
        let Some(axis) = id.checked_sub(1).and_then(|i| self.axes.get_mut(i)) else {
            return;
        };
        let command = &text[digits..];
        let value = |s: &str| s.parse::<i64>().ok();

        let reply = if command == "ZP" {
            format!("{}ZP{:+}", id, axis.state as u8)
        } else if let Some(register) = command.strip_prefix('Z') {
            match register {
                "I" => format!("{}ZI{:+}", id, axis.encoder()),
                "s" => format!("{}Zs{:+}", id, (axis.destination.round() as i64).clamp(i16::MIN as i64, i16::MAX as i64)),
                _ => text.to_string(),
            }
        } else if command == "I" {
            format!("{}I{:+}", id, axis.encoder())
        } else if command == "(JA" {
            axis.program_running = true;
            format!("{}(JA+", id)
        } else if let Some(state) = command.strip_prefix('P') {
            match value(state) {
                Some(0) => axis.state = AxisState::Reset,
                Some(1) if axis.program_running => {
                    axis.state = AxisState::Search;
                    axis.search_left_us = self.search_us.max(1);
                }
                Some(2) => axis.state = AxisState::Idle,
                Some(3) => axis.state = AxisState::Compliance,
                _ => {}
            }
            text.to_string()
        } else if let Some(dest) = command.strip_prefix('n').and_then(value) {
            axis.destination = (dest - POSITION_BIAS as i64) as f64;
            text.to_string()
        } else if let Some(velocity) = command.strip_prefix('o').and_then(value) {
            axis.velocity = velocity.clamp(0, u16::MAX as i64) as u16;
            text.to_string()
        } else if let Some(current) = command.strip_prefix('r').and_then(value) {
            axis.hold_current = current.clamp(0, u16::MAX as i64) as u16;
            text.to_string()
        } else if let Some(current) = command.strip_prefix('i').and_then(value) {
            axis.max_current = current.clamp(0, u16::MAX as i64) as u16;
            text.to_string()
        } else {
            text.to_string()
        };

        trace!("Axes answer {:?}", reply);
        self.replies.extend(reply.bytes());
        self.replies.push_back(b'\r');
    }
}

impl AxisBus for SimulatedAxes {
    fn send(&mut self, bytes: &[u8]) {
        self.time.transfer(bytes.len());
        for &c in bytes {
            match c {
                b'\r' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    self.process(&line);
                }
                b'#' => {
                    self.line.clear();
                    self.line.push(c);
                }
                _ => self.line.push(c),
            }
        }
    }

    fn receive(&mut self) -> Option<u8> {
        let c = self.replies.pop_front()?;
        self.time.transfer(1);
        Some(c)
    }

    fn wait_us(&mut self, us: u32) {
        self.time.pass_us(us as u64);
    }
}

/// Pending presses of the start button, shared with whoever presses it.
#[derive(Debug, Clone, Default)]
pub struct ButtonHandle(Arc<AtomicU32>);

impl ButtonHandle {
    pub fn press(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

pub struct SimulatedBoard {
    time: Arc<SimTime>,
    button: ButtonHandle,
    output: bool,
    output_changes: Vec<bool>,
    sync_released: bool,
    passthrough: bool,
    bootloader_requests: usize,
}

impl SimulatedBoard {
    pub fn new(time: Arc<SimTime>) -> Self {
        Self {
            time,
            button: ButtonHandle::default(),
            output: false,
            output_changes: Vec::new(),
            sync_released: false,
            passthrough: false,
            bootloader_requests: 0,
        }
    }

    pub fn button_handle(&self) -> ButtonHandle {
        self.button.clone()
    }

    pub fn press_button(&mut self) {
        self.button.press();
    }

    pub fn output(&self) -> bool {
        self.output
    }

    /// Every level the output was set to, in order.
    pub fn output_changes(&self) -> &[bool] {
        &self.output_changes
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn bootloader_requests(&self) -> usize {
        self.bootloader_requests
    }
}

impl Board for SimulatedBoard {
    fn delay_ms(&mut self, ms: u32) {
        self.time.pass_us(ms as u64 * 1000);
    }

    fn delay_us(&mut self, us: u32) {
        self.time.pass_us(us as u64);
    }

    fn button(&mut self) -> bool {
        self.button.take()
    }

    fn set_output(&mut self, active: bool) {
        self.output = active;
        self.output_changes.push(active);
    }

    /// Nobody else is on the line, so it follows our own driver.
    fn sync_line(&mut self) -> bool {
        self.sync_released
    }

    fn release_sync(&mut self, released: bool) {
        self.sync_released = released;
    }

    fn transmit(&mut self, to_pc: &ComBuffer) {
        self.time.transfer(to_pc.len());
    }

    fn set_passthrough(&mut self, enabled: bool) {
        self.passthrough = enabled;
    }

    fn enter_bootloader(&mut self) {
        debug!("Bootloader requested");
        self.bootloader_requests += 1;
    }
}
