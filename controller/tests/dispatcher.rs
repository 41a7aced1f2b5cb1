use std::sync::Arc;

use controller::simulated::{SimTime, SimulatedAxes, SimulatedBoard};
use controller::{AxisState, Board, Clock, ComBuffer, Controller, MemoryEeprom, Storage};
use igus_motion::protocol::*;

type SimController = Controller<SimulatedBoard, SimulatedAxes, MemoryEeprom>;

struct Rig {
    controller: SimController,
    to_bot: Arc<ComBuffer>,
    to_pc: Arc<ComBuffer>,
    parser: FrameParser,
}

impl Rig {
    fn new(eeprom: MemoryEeprom, num_axes: usize, setup: impl FnOnce(SimulatedAxes) -> SimulatedAxes) -> Self {
        let clock = Arc::new(Clock::new());
        let time = SimTime::virtual_time(clock.clone());
        let axes = setup(SimulatedAxes::new(num_axes, time.clone()).with_encoder_ratio(4.0));
        let board = SimulatedBoard::new(time);
        let to_bot = Arc::new(ComBuffer::new());
        let to_pc = Arc::new(ComBuffer::new());
        let mut controller = Controller::new(board, axes, eeprom, clock, to_bot.clone(), to_pc.clone());
        controller.boot();
        Self { controller, to_bot, to_pc, parser: FrameParser::new() }
    }

    fn idle_axes() -> Self {
        Self::new(MemoryEeprom::new(), 2, |axes| axes.with_state(AxisState::Idle))
    }

    fn replies(&mut self) -> Vec<Frame> {
        let mut bytes = Vec::new();
        while let Some(c) = self.to_pc.get() {
            bytes.push(c);
        }
        self.parser.feed(&bytes)
    }

    /// Queues `frames` and runs one extended session over them.
    fn session(&mut self, frames: &[Frame]) -> Vec<Frame> {
        for frame in frames {
            self.to_bot.put_data(&frame.encode());
        }
        self.controller.handle_commands();
        self.replies()
    }

    fn configure(&mut self, num_keyframes: u16, lookahead: u16) {
        let config = two_axis_config(num_keyframes, lookahead);
        let replies = self.session(&[Frame::with_payload(Command::Config, &config).unwrap()]);
        assert_eq!(replies, vec![Frame::simple(Command::Config)]);
    }

    fn save(&mut self, index: u8, keyframe: KeyframeRecord) {
        let frame = Frame::with_payload(Command::SaveKeyframe, &SaveKeyframePayload { index, keyframe }).unwrap();
        assert_eq!(self.session(&[frame]), vec![Frame::simple(Command::SaveKeyframe)]);
    }
}

fn two_axis_config(num_keyframes: u16, lookahead: u16) -> ConfigPayload {
    let mut enc_to_mot = [0u16; NUM_AXES];
    enc_to_mot[..2].copy_from_slice(&[64, 64]);
    ConfigPayload { num_keyframes, active_axes: 2, enc_to_mot, lookahead }
}

fn keyframe(duration: u16, positions: [i32; 2], output: OutputCommand) -> KeyframeRecord {
    let mut ticks = [0u16; NUM_AXES];
    for (tick, position) in ticks.iter_mut().zip(positions) {
        *tick = (position + POSITION_BIAS) as u16;
    }
    KeyframeRecord { duration, ticks, output_command: output.into() }
}

fn feedback_of(frame: &Frame) -> FeedbackPayload {
    match frame.payload_as::<FeedbackPayload>() {
        Ok(feedback) => feedback,
        Err(e) => panic!("Expected feedback in {:?}: {}", frame, e),
    }
}

#[test]
fn erased_eeprom_boots_with_defaults() {
    let rig = Rig::idle_axes();
    assert_eq!(rig.controller.config().active_axes, 4);
    assert_eq!(rig.controller.config().num_keyframes, 0);
}

#[test]
fn config_is_acked_and_read_back() {
    let mut rig = Rig::idle_axes();
    rig.configure(3, 100);

    let replies = rig.session(&[Frame::simple(Command::Config)]);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload_as::<ConfigPayload>().unwrap(), two_axis_config(3, 100));
}

#[test]
fn malformed_payloads_are_ignored() {
    let mut rig = Rig::idle_axes();
    let short_save = Frame { version: VERSION, command: Command::SaveKeyframe, payload: vec![0; 5] };
    let short_config = Frame { version: VERSION, command: Command::Config, payload: vec![0; 4] };
    assert!(rig.session(&[short_save, short_config]).is_empty());
    assert_eq!(rig.controller.config().active_axes, 4);
}

#[test]
fn read_keyframe_answers_from_storage() {
    let mut rig = Rig::idle_axes();
    rig.configure(1, 0);
    let saved = keyframe(250, [10, -10], OutputCommand::Set);
    rig.save(0, saved);
    assert_eq!(rig.controller.keyframe(0), saved);

    let read = Frame::with_payload(Command::ReadKeyframe, &ReadKeyframePayload { index: 0 }).unwrap();
    let replies = rig.session(&[read.clone()]);
    let erased = replies[0].payload_as::<KeyframeRecord>().unwrap();
    assert_eq!(erased.duration, 0xFFFF, "Nothing committed yet");

    assert_eq!(rig.session(&[Frame::simple(Command::Commit)]), vec![Frame::simple(Command::Commit)]);
    let replies = rig.session(&[read]);
    assert_eq!(replies[0].payload_as::<KeyframeRecord>().unwrap(), saved);
}

#[test]
fn committed_sequence_survives_reboot() {
    let mut rig = Rig::idle_axes();
    rig.configure(2, 80);
    rig.save(0, keyframe(0, [0, 0], OutputCommand::Nop));
    rig.save(1, keyframe(400, [100, 200], OutputCommand::Reset));
    rig.session(&[Frame::simple(Command::Commit)]);

    let image = rig.controller.storage().eeprom().image().to_vec();
    let rebooted = Rig::new(MemoryEeprom::from_image(&image), 2, |axes| axes);
    assert_eq!(*rebooted.controller.config(), two_axis_config(2, 80));
    assert_eq!(rebooted.controller.keyframe(1), keyframe(400, [100, 200], OutputCommand::Reset));
}

#[test]
fn reset_needs_the_key() {
    let mut rig = Rig::idle_axes();
    let wrong = Frame::with_payload(Command::Reset, &ResetPayload { key: [0; 8] }).unwrap();
    assert!(rig.session(&[wrong]).is_empty());
    assert_eq!(rig.controller.board().bootloader_requests(), 0);

    let keyed = Frame::with_payload(Command::Reset, &ResetPayload::default()).unwrap();
    rig.session(&[keyed]);
    assert_eq!(rig.controller.board().bootloader_requests(), 1);
}

#[test]
fn exit_ends_the_session() {
    let mut rig = Rig::idle_axes();
    let replies = rig.session(&[Frame::simple(Command::Init), Frame::simple(Command::Exit)]);
    assert_eq!(replies, vec![Frame::simple(Command::Init), Frame::simple(Command::Exit)]);
}

#[test]
fn single_motion_moves_axes_and_reports_feedback() {
    let mut rig = Rig::idle_axes();
    rig.configure(0, 0);

    let mut motion = MotionPayload { num_axes: 2, output_command: OutputCommand::Set.into(), ..Default::default() };
    motion.ticks[..2].copy_from_slice(&[(POSITION_BIAS + 400) as u16, (POSITION_BIAS - 200) as u16]);
    motion.velocity[..2].copy_from_slice(&[1000, 1000]);

    let replies = rig.session(&[Frame::with_payload(Command::Motion, &motion).unwrap()]);
    assert_eq!(replies[0].command, Command::Motion);
    assert_eq!(feedback_of(&replies[0]).num_axes, 2);
    assert!(rig.controller.board().output());

    rig.controller.board().delay_ms(1000);
    let replies = rig.session(&[Frame::simple(Command::Feedback)]);
    let feedback = feedback_of(&replies[0]);
    assert!(!feedback.is_playing());
    assert_eq!(&feedback.positions[..2], &[400, -200]);
}

#[test]
fn silent_axis_reports_no_position() {
    let mut rig = Rig::new(MemoryEeprom::new(), 1, |axes| axes.with_state(AxisState::Idle));
    rig.configure(0, 0);

    let replies = rig.session(&[Frame::simple(Command::Feedback)]);
    let feedback = feedback_of(&replies[0]);
    assert_eq!(feedback.num_axes, 2);
    assert_ne!(feedback.positions[0], NO_POSITION);
    assert_eq!(feedback.positions[1], NO_POSITION);
}

#[test]
fn play_runs_to_the_last_keyframe() {
    let mut rig = Rig::idle_axes();
    rig.configure(3, 100);
    rig.save(0, keyframe(0, [0, 0], OutputCommand::Nop));
    rig.save(1, keyframe(500, [300, -300], OutputCommand::Set));
    rig.save(2, keyframe(500, [0, 100], OutputCommand::Reset));

    let replies = rig.session(&[Frame::with_payload(Command::Play, &PlayPayload::looped(false)).unwrap()]);
    assert_eq!(replies, vec![Frame::simple(Command::Play)]);
    assert!(!rig.controller.is_playing());
    assert_eq!(rig.controller.board().output_changes(), &[true, false]);

    // let the axes settle on the last target
    rig.controller.board().delay_ms(500);
    assert_eq!(rig.controller.bus().position(1), Some(0));
    assert_eq!(rig.controller.bus().position(2), Some(100));
    assert!(rig.controller.bus().commands().iter().any(|c| c.starts_with("1n")));
}

#[test]
fn feedback_during_playback_reports_playing() {
    let mut rig = Rig::idle_axes();
    rig.configure(2, 0);
    rig.save(0, keyframe(0, [0, 0], OutputCommand::Nop));
    rig.save(1, keyframe(200, [100, 100], OutputCommand::Nop));

    let replies = rig.session(&[
        Frame::with_payload(Command::Play, &PlayPayload::looped(false)).unwrap(),
        Frame::simple(Command::Feedback),
        Frame::with_payload(Command::Config, &two_axis_config(0, 0)).unwrap(),
    ]);
    assert_eq!(replies.len(), 2, "Config is ignored while playing: {:?}", replies);
    assert_eq!(replies[0], Frame::simple(Command::Play));
    assert!(feedback_of(&replies[1]).is_playing());
    assert_eq!(rig.controller.config().num_keyframes, 2);
}

#[test]
fn stop_behind_play_aborts_the_approach() {
    let mut rig = Rig::new(MemoryEeprom::new(), 2, |axes| axes.with_state(AxisState::Idle).with_positions(&[2000, 0]));
    rig.configure(2, 0);
    rig.save(0, keyframe(0, [0, 0], OutputCommand::Set));
    rig.save(1, keyframe(200, [100, 100], OutputCommand::Nop));

    let replies = rig.session(&[
        Frame::with_payload(Command::Play, &PlayPayload::looped(true)).unwrap(),
        Frame::simple(Command::Stop),
    ]);
    assert_eq!(replies, vec![Frame::simple(Command::Play), Frame::simple(Command::Stop)]);
    assert!(!rig.controller.is_playing());
    assert!(rig.controller.board().output_changes().is_empty());
    let axis = rig.controller.bus().axis(1).unwrap();
    assert_eq!(axis.velocity, 0, "Axes switched off after the aborted approach");
}

#[test]
fn ascii_commands_pass_through_to_the_axes() {
    let mut rig = Rig::idle_axes();
    rig.to_bot.puts("#1ZP\r");
    rig.controller.poll_once();
    rig.controller.poll_once();

    let mut reply = Vec::new();
    while let Some(c) = rig.to_pc.get() {
        reply.push(c);
    }
    assert_eq!(reply, b"1ZP+2\r");
}

#[test]
fn broken_init_prefix_is_replayed_to_the_axes() {
    let mut rig = Rig::idle_axes();
    rig.to_bot.put_data(&[0xFF, VERSION]);
    rig.to_bot.puts("#2ZP\r");
    rig.controller.poll_once();
    assert_eq!(rig.controller.bus().commands(), &["2ZP".to_string()]);
}

#[test]
fn init_packet_starts_an_extended_session() {
    let mut rig = Rig::idle_axes();
    rig.to_bot.put_data(&Frame::simple(Command::Init).encode());
    rig.controller.poll_once();

    assert_eq!(rig.replies(), vec![Frame::simple(Command::Init)]);
    assert!(rig.controller.board().passthrough(), "Passthrough is back after the session");
    assert!(rig.controller.bus().commands().is_empty());
}

#[test]
fn button_initializes_stopped_axes() {
    let mut rig = Rig::new(MemoryEeprom::new(), 4, |axes| axes.with_program_stopped().with_search_time(500));
    rig.controller.board().press_button();
    rig.controller.poll_once();

    assert!(rig.controller.is_initialized());
    for id in 1..=4 {
        assert_eq!(rig.controller.bus().axis(id).unwrap().state, AxisState::Idle);
    }
    let commands = rig.controller.bus().commands();
    assert!(commands.contains(&"1(JA".to_string()));
    assert!(commands.contains(&"4P1".to_string()));
}

#[test]
fn missing_axes_disable_playback() {
    let mut image = MemoryEeprom::new();
    {
        let mut storage = Storage::new(&mut image);
        storage.save_config(&ConfigPayload { num_keyframes: 2, active_axes: 3, ..Default::default() });
    }
    let mut rig = Rig::new(image, 2, |axes| axes.with_state(AxisState::Idle));
    assert_eq!(rig.controller.config().num_keyframes, 2);

    rig.controller.board().press_button();
    rig.controller.poll_once();
    assert_eq!(rig.controller.config().num_keyframes, 0);
}
