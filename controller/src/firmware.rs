//! The controller main loop: button handling, passthrough of the ASCII axis
//! protocol and the switch into extended mode.

use std::sync::Arc;

use heapless::Vec;
use igus_motion::protocol::{Command, ConfigPayload, Frame, FrameParser, KeyframeRecord, MAX_KEYFRAMES, NUM_AXES};
use tracing::{debug, info, warn};

use crate::board::Board;
use crate::clock::Clock;
use crate::combuf::ComBuffer;
use crate::nanotec::{AxisBus, AxisState, Nanotec};
use crate::storage::{Eeprom, Storage};

/// Polls of an absent axis controller before initialisation gives up.
const MAX_INIT_ERRORS: u8 = 200;

/// Everything the firmware owns. The two byte buffers and the clock are
/// shared with the interrupt handlers (or the threads standing in for them).
pub struct Controller<B: Board, A: AxisBus, E: Eeprom> {
    pub(crate) board: B,
    pub(crate) axes: Nanotec<A>,
    pub(crate) storage: Storage<E>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) to_bot: Arc<ComBuffer>,
    pub(crate) to_pc: Arc<ComBuffer>,

    pub(crate) parser: FrameParser,
    pub(crate) config: ConfigPayload,
    pub(crate) buffer: Vec<KeyframeRecord, MAX_KEYFRAMES>,

    pub(crate) should_stop: bool,
    pub(crate) is_playing: bool,
    pub(crate) ext_should_quit: bool,
    pub(crate) enc_pos: [i16; NUM_AXES],

    program_running: [bool; NUM_AXES],
    is_initialized: bool,
    passthrough: bool,
    init_offset: usize,
    init_packet: [u8; 6],
}

impl<B: Board, A: AxisBus, E: Eeprom> Controller<B, A, E> {
    pub fn new(board: B, bus: A, eeprom: E, clock: Arc<Clock>, to_bot: Arc<ComBuffer>, to_pc: Arc<ComBuffer>) -> Self {
        let mut init_packet = [0u8; 6];
        init_packet.copy_from_slice(&Frame::simple(Command::Init).encode());

        Self {
            board,
            axes: Nanotec::new(bus),
            storage: Storage::new(eeprom),
            clock,
            to_bot,
            to_pc,
            parser: FrameParser::new(),
            config: ConfigPayload::default(),
            buffer: Vec::new(),
            should_stop: false,
            is_playing: false,
            ext_should_quit: false,
            enc_pos: [0; NUM_AXES],
            program_running: [false; NUM_AXES],
            is_initialized: false,
            passthrough: false,
            init_offset: 0,
            init_packet,
        }
    }

    pub fn board(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn bus(&mut self) -> &mut A {
        self.axes.bus()
    }

    pub fn storage(&self) -> &Storage<E> {
        &self.storage
    }

    pub fn config(&self) -> &ConfigPayload {
        &self.config
    }

    pub fn keyframe(&self, index: usize) -> KeyframeRecord {
        self.buffer.get(index).copied().unwrap_or_default()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// Loads configuration and keyframes from storage and opens the
    /// passthrough to the axis bus.
    pub fn boot(&mut self) {
        info!("Loading motion sequence");
        self.config = self.storage.load_config();
        self.load_sequence();
        self.set_passthrough(true);
        info!("Starting up...");
    }

    pub(crate) fn load_sequence(&mut self) {
        self.buffer.clear();
        for i in 0..self.config.num_keyframes as usize {
            let keyframe = self.storage.read_keyframe(i);
            if self.buffer.push(keyframe).is_err() {
                break;
            }
        }
    }

    /// Writes a keyframe into the play buffer, growing it as needed.
    pub(crate) fn write_to_buffer(&mut self, index: usize, keyframe: KeyframeRecord) {
        if index >= MAX_KEYFRAMES {
            return;
        }
        if index >= self.buffer.len() && self.buffer.resize_default(index + 1).is_err() {
            return;
        }
        self.buffer[index] = keyframe;
    }

    /// Persists the first `num_keyframes` buffer entries and the configuration.
    pub(crate) fn commit(&mut self) {
        for i in 0..self.config.num_keyframes as usize {
            let keyframe = self.keyframe(i);
            self.storage.save_keyframe(i, &keyframe);
        }
        self.storage.save_config(&self.config);
        debug!("Committed {} keyframes", self.config.num_keyframes);
    }

    fn set_passthrough(&mut self, enabled: bool) {
        self.passthrough = enabled;
        self.board.set_passthrough(enabled);
    }

    /// Queues a frame for the PC and waits until it went out.
    pub(crate) fn write_answer(&mut self, frame: &Frame) {
        self.to_pc.put_data(&frame.encode());
        self.board.transmit(&self.to_pc);
    }

    /// One pass of the main loop.
    pub fn poll_once(&mut self) {
        if self.board.button() {
            self.set_passthrough(false);

            if !self.is_initialized {
                info!("Doing initialization");
                self.initialize_axes();
                self.board.set_led(false);

                // fires the first output command when already in place
                self.is_in_start_position();
                self.is_initialized = true;
            } else if !self.is_in_start_position() {
                info!("Moving to start position");
                if self.do_start_keyframe() {
                    info!("success");
                } else {
                    warn!("failure");
                }
            } else {
                self.run_sequence(false);
            }

            self.set_passthrough(true);
            return;
        }

        if self.passthrough {
            self.forward_axis_replies();
        }

        if !self.to_bot.available() {
            return;
        }

        // let the rest of the command arrive
        self.board.delay_ms(20);

        while let Some(c) = self.to_bot.get() {
            if c == self.init_packet[self.init_offset] {
                self.init_offset += 1;
            } else {
                // replay what looked like the start of an Init packet
                let matched = self.init_offset;
                let packet = self.init_packet;
                self.axes.bus().send(&packet[..matched]);
                self.axes.bus().send(&[c]);
                self.init_offset = 0;
            }

            if self.init_offset == self.init_packet.len() {
                self.init_offset = 0;
                self.extended_session();
            }
        }
    }

    fn extended_session(&mut self) {
        self.to_bot.flush();
        self.board.set_led(true);
        self.set_passthrough(false);
        debug!("Entering extended mode");

        self.handle_command(&Frame::simple(Command::Init));
        self.handle_commands();

        debug!("Leaving extended mode");
        self.set_passthrough(true);
        self.to_bot.flush();
    }

    fn forward_axis_replies(&mut self) {
        let mut forwarded = false;
        while let Some(c) = self.axes.bus().receive() {
            self.to_pc.put(c);
            forwarded = true;
        }
        if forwarded {
            self.board.transmit(&self.to_pc);
        }
    }

    /// Brings every active axis controller out of reset and waits until all
    /// of them finished their reference search.
    pub fn initialize_axes(&mut self) {
        let mut error_count = 0u8;

        loop {
            let mut ready = true;
            self.board.delay_ms(200);

            for id in 1..=self.config.active_axes.min(NUM_AXES as u16) as u8 {
                let index = id as usize - 1;
                let Some(state) = self.axes.state(id) else {
                    error_count += 1;
                    if error_count == MAX_INIT_ERRORS {
                        // an axis is missing, go on without playback
                        warn!("Axis {} does not answer, disabling playback", id);
                        self.config.num_keyframes = 0;
                        return;
                    }
                    ready = false;
                    continue;
                };
                debug!("Axis {} in state {:?}", id, state);

                if state != AxisState::Reset {
                    self.program_running[index] = true;
                }

                if !self.program_running[index] {
                    self.program_running[index] = self.axes.start_program(id);
                    if self.program_running[index] {
                        info!("Started program on {}", id);
                    } else {
                        warn!("Failed to start program on {}", id);
                    }
                    ready = false;
                    continue;
                }

                match state {
                    AxisState::Reset => {
                        self.axes.set_state(id, AxisState::Search);
                        ready = false;
                    }
                    AxisState::Search => ready = false,
                    AxisState::Idle | AxisState::Compliance => {}
                }
            }

            if ready {
                break;
            }
        }
    }

    /// Runs [`Controller::poll_once`] until `running` returns false.
    pub fn run(&mut self, mut running: impl FnMut() -> bool) {
        while running() {
            self.poll_once();
            self.board.delay_us(100);
        }
    }
}
