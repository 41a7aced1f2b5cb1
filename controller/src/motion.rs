//! Keyframe sequence execution on the axis controllers.

use igus_motion::protocol::{
    KeyframeRecord, MotionPayload, OutputCommand, MAX_KEYFRAMES, NO_POSITION, NUM_AXES, POSITION_BIAS,
};
use tracing::{debug, info, trace};

use crate::board::Board;
use crate::firmware::Controller;
use crate::io;
use crate::nanotec::AxisBus;
use crate::storage::Eeprom;

/// Largest encoder distance in ticks at which a keyframe counts as reached.
const REACHED_TOLERANCE: i64 = 50;

const START_TIMEOUT_MS: u32 = 8000;
/// Consecutive reached reads needed before the start pose is accepted.
const START_CONFIRMATIONS: u8 = 10;
/// Slow approach speed to the start pose, scaled by `enc_to_mot / 256`.
const START_SPEED: i64 = 94;

/// Axes never get slower than this while following a trajectory.
const MIN_SPEED: i64 = 100;
/// Mechanical speed limit in encoder ticks per second.
const MAX_ENCODER_SPEED: i64 = 7000;
/// Segment length used to hold the final pose of a sequence.
const END_HOLD_MS: i64 = 100;

/// Per axis command computed for one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisCommand {
    dest: i64,
    velocity: i64,
    encoder: Option<i16>,
}

fn to_wire(value: i64) -> u16 {
    value.clamp(0, u16::MAX as i64) as u16
}

impl<B: Board, A: AxisBus, E: Eeprom> Controller<B, A, E> {
    fn active_axes(&self) -> usize {
        (self.config.active_axes as usize).min(NUM_AXES)
    }

    fn num_keyframes(&self) -> usize {
        (self.config.num_keyframes as usize).min(MAX_KEYFRAMES)
    }

    pub(crate) fn execute_output(&mut self, command: u8) {
        match OutputCommand::from_wire(command) {
            OutputCommand::Set => self.board.set_output(true),
            OutputCommand::Reset => self.board.set_output(false),
            OutputCommand::Nop => {}
        }
    }

    /// True when every axis that answers stands within the tolerance of
    /// `keyframe`. Fails when no axis answers at all.
    pub fn keyframe_reached(&mut self, keyframe: &KeyframeRecord) -> bool {
        let mut max_diff = -1i64;
        for j in 0..self.active_axes() {
            let Some(enc) = self.axes.encoder_position(j as u8 + 1) else {
                continue;
            };
            let diff = (keyframe.ticks[j] as i64 - POSITION_BIAS as i64 - enc as i64).abs();
            max_diff = max_diff.max(diff);
        }
        (0..REACHED_TOLERANCE).contains(&max_diff)
    }

    /// Checks the arm against the stored start keyframe and fires its output
    /// command when it is there.
    pub fn is_in_start_position(&mut self) -> bool {
        let start = self.storage.read_keyframe(0);
        let reached = self.keyframe_reached(&start);
        if reached {
            self.execute_output(start.output_command);
        }
        reached
    }

    /// Slowly drives to the first keyframe. Gives up after eight seconds and
    /// switches the axes off.
    pub fn do_start_keyframe(&mut self) -> bool {
        let start = self.keyframe(0);
        let active = self.active_axes();

        self.clock.start();
        self.clock.reset_deadline(START_TIMEOUT_MS);

        let mut confirmations = 0u8;
        while !self.clock.deadline_passed() && !self.should_stop {
            for j in 0..active {
                let id = j as u8 + 1;
                let velocity = self.config.enc_to_mot[j] as i64 * START_SPEED / 256;
                self.axes.set_velocity(id, to_wire(velocity));
                self.axes.set_destination(id, start.ticks[j]);

                if let Some(enc) = self.axes.encoder_position(id) {
                    self.enc_pos[j] = enc;
                }
            }

            if self.keyframe_reached(&start) {
                confirmations += 1;
                if confirmations == START_CONFIRMATIONS {
                    self.clock.stop();
                    self.execute_output(start.output_command);
                    return true;
                }
            } else {
                confirmations = 0;
            }

            self.service_input();
        }

        info!("Start position not reached, switching axes off");
        for j in 0..active {
            self.axes.set_velocity(j as u8 + 1, 0);
        }
        self.clock.stop();
        false
    }

    /// Plays the keyframe buffer. With `force_loop` or while the button is
    /// held at the end of the sequence it starts over.
    pub fn run_sequence(&mut self, force_loop: bool) {
        let n = self.num_keyframes();
        if n == 0 {
            return;
        }
        debug!(
            "Playing sequence with {} keyframes on {} axes, lookahead {}",
            n, self.config.active_axes, self.config.lookahead
        );

        self.should_stop = false;
        self.is_playing = true;

        if !self.is_in_start_position() {
            self.should_stop = !self.do_start_keyframe();
        }

        if self.should_stop {
            self.is_playing = false;
            return;
        }

        let first = self.keyframe(0);
        self.execute_output(first.output_command);
        self.clock.start();

        let active = self.active_axes();
        loop {
            let mut looping = force_loop;

            for i in 1..n {
                let current = self.keyframe(i);
                self.clock.reset_deadline(current.duration.max(1) as u32);

                while !self.clock.deadline_passed() && !self.should_stop {
                    for j in 0..active {
                        let delta = self.clock.elapsed() as i64 + self.config.lookahead as i64;
                        if self.clock.deadline_passed() {
                            break;
                        }
                        let command = self.axis_command(i, j, delta, force_loop, &mut looping);
                        self.send_axis_command(j, command);
                    }

                    self.service_input();
                }

                if self.should_stop {
                    break;
                }
                self.execute_output(current.output_command);
            }

            // a loop commanded by the PC does not wait for the others
            if looping && !force_loop && !self.should_stop {
                io::synchronize(&mut self.board);
            }

            if !looping || self.should_stop || n < 2 {
                break;
            }
        }

        self.clock.stop();
        self.is_playing = false;
        debug!("Sequence finished");
    }

    /// Target for axis `j` while segment `i` runs, `delta` milliseconds into
    /// it. A `delta` past the end of the segment continues along the following
    /// ones, wrapping to segment 1 when looping.
    fn axis_command(&mut self, i: usize, j: usize, mut delta: i64, force_loop: bool, looping: &mut bool) -> AxisCommand {
        let n = self.num_keyframes();
        let bias = POSITION_BIAS as i64;

        let mut from = self.keyframe(i - 1).ticks[j] as i64 - bias;
        let mut to = self.keyframe(i).ticks[j] as i64 - bias;
        let mut k = i;
        let mut segment = self.keyframe(i).duration.max(1) as i64;
        let mut duration = segment;

        while delta > segment {
            if k == n - 1 {
                if self.board.button() || force_loop {
                    *looping = true;
                } else {
                    from = to;
                    duration = END_HOLD_MS;
                    break;
                }
                k = 1;
            } else {
                k += 1;
            }
            delta -= segment;

            let next = self.keyframe(k);
            from = to;
            to = next.ticks[j] as i64 - bias;
            segment = next.duration.max(1) as i64;
            duration = segment;
        }

        let orig_vel = 1000 * (to - from) / duration;
        let enc_to_mot = self.config.enc_to_mot[j] as i64;
        let lookahead = self.config.lookahead as i64;

        if lookahead > 0 {
            if let Some(enc) = self.axes.encoder_position(j as u8 + 1) {
                let max_speed = enc_to_mot * MAX_ENCODER_SPEED / 256;
                let dest = from + delta * orig_vel / 1000;
                let vel = (1000 * (dest - enc as i64) / lookahead).abs() * enc_to_mot / 256;

                // never stop completely
                let velocity = if vel < MIN_SPEED {
                    MIN_SPEED
                } else if vel > max_speed {
                    max_speed
                } else {
                    vel
                };
                return AxisCommand { dest, velocity, encoder: Some(enc) };
            }
        }

        AxisCommand { dest: to, velocity: orig_vel.abs() * enc_to_mot / 256, encoder: None }
    }

    fn send_axis_command(&mut self, j: usize, command: AxisCommand) {
        let id = j as u8 + 1;
        trace!("axis {}: dest {} vel {}", id, command.dest, command.velocity);
        self.axes.set_destination(id, to_wire(command.dest + POSITION_BIAS as i64));
        self.axes.set_velocity(id, to_wire(command.velocity));
        if let Some(enc) = command.encoder {
            self.enc_pos[j] = enc;
        }
    }

    /// Position reported to the PC for axis `index`. `NO_POSITION` when the
    /// encoder does not answer.
    pub fn motion_feedback(&mut self, index: usize) -> i16 {
        if index >= NUM_AXES {
            return 0;
        }
        if self.is_playing {
            return self.enc_pos[index];
        }
        self.axes.encoder_position(index as u8 + 1).unwrap_or(NO_POSITION)
    }

    pub fn execute_single_motion(&mut self, motion: &MotionPayload) {
        for i in 0..(motion.num_axes as usize).min(NUM_AXES) {
            let id = i as u8 + 1;
            self.axes.set_destination(id, motion.ticks[i]);
            self.axes.set_velocity(id, motion.velocity[i]);
        }
        self.execute_output(motion.output_command);
    }
}
