//! Extended mode command handling on the controller side.

use igus_motion::protocol::{
    Command, ConfigPayload, FeedbackPayload, Frame, MotionPayload, PlayPayload, ReadKeyframePayload,
    SaveKeyframePayload, WirePayload, FF_PLAYING, NUM_AXES, RESET_KEY,
};
use tracing::{debug, trace, warn};

use crate::board::Board;
use crate::firmware::Controller;
use crate::nanotec::AxisBus;
use crate::storage::Eeprom;

/// Idle milliseconds after which an extended session ends on its own.
const SESSION_IDLE_MS: u8 = 255;

impl<B: Board, A: AxisBus, E: Eeprom> Controller<B, A, E> {
    /// Feeds one byte from the PC into the frame parser. Returns true when it
    /// completed a frame, which has then been handled.
    pub fn cmd_input(&mut self, c: u8) -> bool {
        match self.parser.push(c) {
            Some(frame) => {
                self.handle_command(&frame);
                true
            }
            None => false,
        }
    }

    pub fn handle_command(&mut self, frame: &Frame) {
        trace!("Handling {:?} with {} payload bytes", frame.command, frame.payload.len());

        match frame.command {
            Command::Init => self.write_answer(&Frame::simple(Command::Init)),
            Command::Exit => {
                self.write_answer(&Frame::simple(Command::Exit));
                self.ext_should_quit = true;
            }
            Command::SaveKeyframe => {
                if self.is_playing {
                    return;
                }
                let Ok(packet) = frame.payload_as::<SaveKeyframePayload>() else {
                    return;
                };
                self.write_to_buffer(packet.index as usize, packet.keyframe);
                self.write_answer(&Frame::simple(Command::SaveKeyframe));
            }
            Command::ReadKeyframe => {
                let Ok(packet) = frame.payload_as::<ReadKeyframePayload>() else {
                    return;
                };
                let keyframe = self.storage.read_keyframe(packet.index as usize);
                self.answer_with(Command::ReadKeyframe, &keyframe);
            }
            Command::Config => {
                if self.is_playing {
                    return;
                }
                if frame.payload.len() == ConfigPayload::SIZE {
                    let Ok(config) = frame.payload_as::<ConfigPayload>() else {
                        return;
                    };
                    debug!("New configuration: {} keyframes on {} axes", config.num_keyframes, config.active_axes);
                    self.config = config;

                    // fires the first output command when already in place
                    self.is_in_start_position();

                    self.write_answer(&Frame::simple(Command::Config));
                } else if frame.payload.is_empty() {
                    let config = self.config;
                    self.answer_with(Command::Config, &config);
                }
            }
            Command::Reset => {
                if frame.payload.len() >= RESET_KEY.len() && frame.payload[..RESET_KEY.len()] == RESET_KEY {
                    warn!("Reset key received, entering bootloader");
                    self.board.enter_bootloader();
                }
            }
            Command::Commit => {
                self.commit();
                self.write_answer(&Frame::simple(Command::Commit));
            }
            Command::Play => {
                let play = frame.payload_as::<PlayPayload>().unwrap_or_default();
                self.write_answer(&Frame::simple(Command::Play));

                if !self.is_playing {
                    self.run_sequence(play.is_looped());
                }
            }
            Command::Stop => {
                self.should_stop = true;
                self.write_answer(&Frame::simple(Command::Stop));
            }
            Command::Motion => {
                if let Ok(motion) = frame.payload_as::<MotionPayload>() {
                    self.execute_single_motion(&motion);
                }
                self.write_feedback(Command::Motion);
            }
            Command::Feedback => self.write_feedback(Command::Feedback),
        }
    }

    /// Services frames from the PC until it sends `Exit` or stays silent for
    /// too long.
    pub fn handle_commands(&mut self) {
        let mut ticks_since_last_msg = 0u8;
        while !self.ext_should_quit {
            while let Some(c) = self.to_bot.get() {
                if self.cmd_input(c) {
                    ticks_since_last_msg = 0;
                }
            }

            self.board.delay_ms(1);
            ticks_since_last_msg += 1;
            if ticks_since_last_msg == SESSION_IDLE_MS {
                debug!("Extended session timed out");
                break;
            }
        }

        self.ext_should_quit = false;
    }

    /// Handles bytes that arrived while a motion is in progress. Stops after
    /// the first complete frame so the PC cannot keep the motion loop from
    /// running.
    pub(crate) fn service_input(&mut self) {
        while let Some(c) = self.to_bot.get() {
            if self.cmd_input(c) {
                break;
            }
        }
    }

    fn answer_with<P: WirePayload>(&mut self, command: Command, payload: &P) {
        match Frame::with_payload(command, payload) {
            Ok(frame) => self.write_answer(&frame),
            Err(e) => warn!("Could not encode {:?} answer: {}", command, e),
        }
    }

    fn write_feedback(&mut self, command: Command) {
        let num_axes = (self.config.active_axes as usize).min(NUM_AXES);
        let mut answer = FeedbackPayload {
            num_axes: num_axes as u8,
            flags: if self.is_playing { FF_PLAYING } else { 0 },
            positions: [0; NUM_AXES],
        };
        for i in 0..num_axes {
            answer.positions[i] = self.motion_feedback(i);
        }
        self.answer_with(command, &answer);
    }
}
