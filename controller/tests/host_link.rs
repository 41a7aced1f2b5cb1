//! Host robot interface talking to the controller firmware over an in-memory
//! serial line, with simulated axes in real time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use controller::simulated::{spawn_ticker, SimTime, SimulatedAxes, SimulatedBoard};
use controller::{Clock, ComBuffer, Controller, MemoryEeprom};
use igus_motion::driver::*;
use igus_motion::timeline::Timeline;
use igus_motion::transport::{Link, PortOpener};
use igus_motion::{JointTable, Keyframe, OutputCommand};
use tokio::sync::broadcast::{self, error::TryRecvError};

const JOINTS: &str = r#"
[global]
lookahead = 120

[Joint0]
name = "Base"
type = "rotational"
address = 1
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000

[Joint1]
name = "Arm"
type = "rotational"
address = 2
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000
"#;

struct BufferLink {
    to_bot: Arc<ComBuffer>,
    to_pc: Arc<ComBuffer>,
}

impl Link for BufferLink {
    fn write(&mut self, bytes: &[u8]) -> usize {
        self.to_bot.put_data(bytes);
        0
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        if !self.wait_event(timeout) {
            return 0;
        }
        self.to_pc.get_into(buf)
    }

    fn wait_event(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.to_pc.available() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_micros(200));
        }
        true
    }
}

struct BufferOpener {
    to_bot: Arc<ComBuffer>,
    to_pc: Arc<ComBuffer>,
}

impl PortOpener for BufferOpener {
    fn open(&mut self, index: usize) -> Option<Box<dyn Link>> {
        if index != 0 {
            return None;
        }
        Some(Box::new(BufferLink { to_bot: self.to_bot.clone(), to_pc: self.to_pc.clone() }))
    }
}

type SimController = Controller<SimulatedBoard, SimulatedAxes, MemoryEeprom>;

struct Firmware {
    running: Arc<AtomicBool>,
    thread: JoinHandle<SimController>,
    ticker: JoinHandle<()>,
}

impl Firmware {
    fn start(to_bot: Arc<ComBuffer>, to_pc: Arc<ComBuffer>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let clock = Arc::new(Clock::new());
        let ticker = spawn_ticker(clock.clone(), running.clone());

        let keep_running = running.clone();
        let thread = thread::spawn(move || {
            let time = SimTime::realtime(clock.clone());
            let axes = SimulatedAxes::new(2, time.clone()).with_encoder_ratio(4.0).with_search_time(100);
            let board = SimulatedBoard::new(time);
            let mut controller = Controller::new(board, axes, MemoryEeprom::new(), clock, to_bot, to_pc);
            controller.boot();
            controller.run(|| keep_running.load(Ordering::SeqCst));
            controller
        });

        Self { running, thread, ticker }
    }

    fn stop(self) -> SimController {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.ticker.join();
        match self.thread.join() {
            Ok(controller) => controller,
            Err(_) => panic!("Firmware thread panicked"),
        }
    }
}

fn setup() -> (RobotInterface, Firmware, broadcast::Receiver<RobotEvent>) {
    let to_bot = Arc::new(ComBuffer::new());
    let to_pc = Arc::new(ComBuffer::new());
    let firmware = Firmware::start(to_bot.clone(), to_pc.clone());

    let config = RobotInterfaceConfig { port_cycle: 1, ext_wait_ms: 10, ..RobotInterfaceConfig::default() };
    let joints = Arc::new(JointTable::from_toml_str(JOINTS).unwrap());
    let (events, receiver) = broadcast::channel(1024);
    let interface = RobotInterface::new(config, joints, Box::new(BufferOpener { to_bot, to_pc }), events);
    (interface, firmware, receiver)
}

fn drain(receiver: &mut broadcast::Receiver<RobotEvent>, seen: &mut Vec<RobotEvent>) {
    loop {
        match receiver.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return,
        }
    }
}

fn bring_up(interface: &mut RobotInterface, receiver: &mut broadcast::Receiver<RobotEvent>) -> Vec<RobotEvent> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::new();
    while !(interface.is_initialized() && interface.is_extended_mode()) {
        assert!(Instant::now() < deadline, "Robot did not come up, stuck in {:?}", interface.phase());
        if interface.is_connected() && !interface.is_initialized() && interface.phase() == Phase::Steady {
            interface.initialize();
        }
        interface.step();
        drain(receiver, &mut seen);
    }
    seen
}

fn sequence() -> Vec<Keyframe> {
    vec![
        Keyframe::new([("Base", 0.0), ("Arm", 0.0)]),
        Keyframe::new([("Base", 0.5), ("Arm", -0.3)]).with_output(OutputCommand::Set),
        Keyframe::new([("Base", 0.0), ("Arm", 0.0)]),
    ]
}

#[test]
fn host_initializes_and_plays_on_the_controller() {
    let (mut interface, firmware, mut receiver) = setup();

    let seen = bring_up(&mut interface, &mut receiver);
    assert!(seen.contains(&RobotEvent::Connected), "Events: {:?}", seen);
    assert!(seen.contains(&RobotEvent::Initialized), "Events: {:?}", seen);
    assert!(interface.rx_angles()["Base"].abs() < 1e-9);

    let timeline = Timeline::build(&sequence(), 1.0, false).unwrap();
    interface.transfer_keyframes(&timeline, KeyframeCommand::Play);
    assert!(interface.is_playing());

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::new();
    let mut farthest = 0.0f64;
    while !seen.contains(&RobotEvent::PlaybackFinished) {
        assert!(Instant::now() < deadline, "Playback did not finish, events: {:?}", seen);
        interface.step();
        drain(&mut receiver, &mut seen);
        farthest = farthest.max(interface.rx_angles()["Base"]);
    }
    assert!(seen.contains(&RobotEvent::KeyframeTransferFinished(true)));
    assert!(farthest > 0.4, "Base only got to {}", farthest);
    assert!(interface.rx_angles()["Base"].abs() < 0.05, "Base ended at {}", interface.rx_angles()["Base"]);

    interface.shutdown();
    let mut controller = firmware.stop();
    assert_eq!(controller.board().output_changes(), &[true]);
    assert_eq!(controller.config().num_keyframes as usize, timeline.len());
}

#[test]
fn committed_sequence_lands_in_eeprom() {
    let (mut interface, firmware, mut receiver) = setup();
    bring_up(&mut interface, &mut receiver);

    let timeline = Timeline::build(&sequence(), 1.0, true).unwrap();
    interface.transfer_keyframes(&timeline, KeyframeCommand::Commit);
    let mut seen = Vec::new();
    drain(&mut receiver, &mut seen);
    assert_eq!(seen.last(), Some(&RobotEvent::KeyframeTransferFinished(true)), "Events: {:?}", seen);

    interface.shutdown();
    let controller = firmware.stop();
    let stored = controller.storage().load_config();
    assert_eq!(stored.num_keyframes as usize, timeline.len());
    assert_eq!(stored.active_axes, 2);
    assert_eq!(stored.lookahead, 120);
    assert_eq!(controller.storage().read_keyframe(1).output_command, u8::from(OutputCommand::Set));
}
