use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ComplianceMode, KeyframeCommand, Phase, RobotEvent, RobotInterfaceConfig, RobotRequest};
use crate::joints::JointTable;
use crate::player::JointAngles;
use crate::protocol::*;
use crate::timeline::Timeline;
use crate::transport::{Link, PortOpener};

/// Handshake flags of one joint. Only the communication thread touches them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct MotorState {
    pub(super) is_reset: bool,
    pub(super) is_initialized: bool,
    pub(super) is_hw_compliant: bool,
}

/// Polling state machine that finds the robot on a serial port, walks it
/// through reset and initialization and then streams motion packets.
///
/// One call to [`RobotInterface::step`] performs one exchange. Run it on a
/// dedicated thread with [`RobotInterface::spawn`], or drive it by hand.
pub struct RobotInterface {
    pub(super) config: RobotInterfaceConfig,
    pub(super) joints: Arc<JointTable>,
    pub(super) motors: Vec<MotorState>,
    pub(super) opener: Box<dyn PortOpener>,
    pub(super) link: Option<Box<dyn Link>>,
    pub(super) port_number: usize,
    pub(super) timeout_ticks_left: u32,

    pub(super) connected: bool,
    pub(super) robot_is_reset: bool,
    pub(super) robot_is_initialized: bool,
    pub(super) do_initialize: bool,
    pub(super) do_check_initialization: bool,
    pub(super) extended_mode: bool,
    pub(super) playing: bool,
    pub(super) stop_playing: bool,

    pub(super) compliance_mode: ComplianceMode,
    pub(super) requested_compliance_mode: ComplianceMode,

    pub(super) rx_angles: JointAngles,
    pub(super) last_rx_angles: JointAngles,
    pub(super) rx_velocities: JointAngles,
    pub(super) tx_angles: JointAngles,
    pub(super) tx_velocities: JointAngles,
    pub(super) tx_output: OutputCommand,
    pub(super) speed_limit: f64,
    pub(super) last_time: Instant,

    pub(super) events: broadcast::Sender<RobotEvent>,
}

impl RobotInterface {
    pub fn new(
        config: RobotInterfaceConfig,
        joints: Arc<JointTable>,
        opener: Box<dyn PortOpener>,
        events: broadcast::Sender<RobotEvent>,
    ) -> Self {
        let mut interface = Self {
            port_number: config.first_port % config.port_cycle.max(1),
            timeout_ticks_left: config.retry_budget,
            speed_limit: config.servo_speed_max,
            config,
            joints: Arc::new(JointTable::default()),
            motors: Vec::new(),
            opener,
            link: None,
            connected: false,
            robot_is_reset: true,
            robot_is_initialized: false,
            do_initialize: false,
            do_check_initialization: true,
            extended_mode: false,
            playing: false,
            stop_playing: false,
            compliance_mode: ComplianceMode::Stiff,
            requested_compliance_mode: ComplianceMode::Stiff,
            rx_angles: JointAngles::new(),
            last_rx_angles: JointAngles::new(),
            rx_velocities: JointAngles::new(),
            tx_angles: JointAngles::new(),
            tx_velocities: JointAngles::new(),
            tx_output: OutputCommand::Nop,
            last_time: Instant::now(),
            events,
        };
        interface.set_joint_config(joints);
        interface
    }

    pub(super) fn emit(&self, event: RobotEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(super) fn message<T: Into<String>>(&self, message: T) {
        let message = message.into();
        info!("{}", message);
        self.emit(RobotEvent::Message(message));
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_initialized(&self) -> bool {
        self.robot_is_initialized
    }

    pub fn is_extended_mode(&self) -> bool {
        self.extended_mode
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn compliance_mode(&self) -> ComplianceMode {
        self.compliance_mode
    }

    pub fn port_number(&self) -> usize {
        self.port_number
    }

    pub fn joints(&self) -> &Arc<JointTable> {
        &self.joints
    }

    pub fn rx_angles(&self) -> &JointAngles {
        &self.rx_angles
    }

    pub fn tx_angles(&self) -> &JointAngles {
        &self.tx_angles
    }

    pub fn tx_velocities(&self) -> &JointAngles {
        &self.tx_velocities
    }

    pub fn tx_output(&self) -> OutputCommand {
        self.tx_output
    }

    /// Replaces the joint table. All handshake flags start over.
    pub fn set_joint_config(&mut self, joints: Arc<JointTable>) {
        self.motors = vec![MotorState::default(); joints.len()];
        self.rx_angles = joints.iter().map(|j| (j.name.clone(), 0.0)).collect();
        self.last_rx_angles = self.rx_angles.clone();
        self.rx_velocities = self.rx_angles.clone();
        self.tx_angles = self.rx_angles.clone();
        self.tx_velocities = self.rx_angles.clone();
        self.joints = joints;
    }

    /// Speed limit as a percentage of the servo maximum, clamped to 1..=100.
    pub fn set_speed_limit(&mut self, percent: i32) {
        self.speed_limit = 0.01 * percent.clamp(1, 100) as f64 * self.config.servo_speed_max;
    }

    pub fn speed_limit(&self) -> f64 {
        self.speed_limit
    }

    /// Sets targets for the next motion packet with a no-op output command.
    pub fn motion_in(&mut self, angles: &JointAngles, velocities: &JointAngles) {
        self.motion_in_with_output(angles, velocities, OutputCommand::Nop);
    }

    /// Sets targets for the next motion packet. Angles are clamped to the
    /// joint limits, velocities to `[0, servo_speed_max]`. The output command
    /// of the most recent call is the one sent.
    pub fn motion_in_with_output(&mut self, angles: &JointAngles, velocities: &JointAngles, output: OutputCommand) {
        for joint in self.joints.iter() {
            if let Some(angle) = angles.get(&joint.name) {
                self.tx_angles.insert(joint.name.clone(), joint.clamp_angle(*angle));
            }
            if let Some(velocity) = velocities.get(&joint.name) {
                let velocity = velocity.abs().min(self.config.servo_speed_max);
                self.tx_velocities.insert(joint.name.clone(), velocity);
            }
        }
        self.tx_output = output;
    }

    /// Holds the arm where it is right now.
    pub fn stop_robot(&mut self) {
        self.tx_angles = self.rx_angles.clone();
        for v in self.tx_velocities.values_mut() {
            *v = 0.0;
        }
    }

    pub fn set_compliance_mode(&mut self, mode: ComplianceMode) {
        if !self.robot_is_initialized {
            self.message("Please initialize the robot first.");
            return;
        }
        self.requested_compliance_mode = mode;
    }

    /// Requests that a running controller playback stops. Stop packets are
    /// sent until the controller reports it is idle.
    pub fn stop_playing(&mut self) {
        self.stop_playing = true;
    }

    /// Starts the slow initialization of all joints.
    pub fn initialize(&mut self) {
        if !self.connected {
            return;
        }
        if self.extended_mode {
            // the axis controllers are only reachable in legacy mode
            if !self.ext_disable() {
                debug!("Could not leave extended mode before initializing");
            }
            self.extended_mode = false;
        }
        self.compliance_mode = ComplianceMode::Stiff;
        self.requested_compliance_mode = ComplianceMode::Stiff;
        for motor in self.motors.iter_mut() {
            motor.is_reset = false;
            motor.is_initialized = false;
        }
        self.robot_is_reset = false;
        self.robot_is_initialized = false;
        self.do_initialize = true;
        self.do_check_initialization = false;
        self.message("Initializing...");
    }

    /// Handles one request. Returns false when the interface should shut down.
    pub fn handle_request(&mut self, request: RobotRequest) -> bool {
        match request {
            RobotRequest::MotionIn { angles, velocities, output } => {
                self.motion_in_with_output(&angles, &velocities, output)
            }
            RobotRequest::SetSpeedLimit(percent) => self.set_speed_limit(percent),
            RobotRequest::Initialize => self.initialize(),
            RobotRequest::SetComplianceMode(mode) => self.set_compliance_mode(mode),
            RobotRequest::StopRobot => self.stop_robot(),
            RobotRequest::TransferKeyframes { timeline, command } => self.transfer_keyframes(&timeline, command),
            RobotRequest::StopPlaying => self.stop_playing(),
            RobotRequest::SetJointConfig(joints) => self.set_joint_config(joints),
            RobotRequest::Shutdown => return false,
        }
        true
    }

    pub fn phase(&self) -> Phase {
        if self.link.is_none() {
            Phase::PortScan
        } else if !self.connected {
            Phase::ConfirmConnection
        } else if !self.robot_is_reset {
            Phase::Reset
        } else if self.do_check_initialization {
            Phase::CheckInitialization
        } else if self.do_initialize {
            Phase::Initialize
        } else if !self.extended_mode {
            Phase::EnterExtended
        } else {
            Phase::Steady
        }
    }

    /// One iteration of the communication loop.
    pub fn step(&mut self) {
        match self.phase() {
            Phase::PortScan => match self.opener.open(self.port_number) {
                Some(link) => {
                    debug!("Trying port {}", self.port_number);
                    self.link = Some(link);
                }
                None => self.set_port_number((self.port_number + 1) % self.config.port_cycle),
            },
            Phase::ConfirmConnection => self.handle_confirm_connection(),
            Phase::Reset => self.handle_robot_reset(),
            Phase::CheckInitialization => self.handle_check_initialization(),
            Phase::Initialize => self.handle_initialize(),
            Phase::EnterExtended => {
                if self.ext_enable() {
                    self.extended_mode = true;
                }
            }
            Phase::Steady => {
                self.handle_check_compliance_mode();
                if self.link.is_some() && self.extended_mode {
                    self.handle_extended_mode();
                }
            }
        }
    }

    /// Closes the current port and continues the scan at `port`.
    pub fn set_port_number(&mut self, port: usize) {
        self.port_number = port;
        self.close_link();
        if self.connected {
            self.disconnect_robot();
        }
    }

    pub(super) fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    /// Forgets everything learned about the robot and goes back to scanning.
    pub(super) fn disconnect_robot(&mut self) {
        if self.compliance_mode == ComplianceMode::Hardware {
            self.compliance_mode = ComplianceMode::Stiff;
        }
        self.requested_compliance_mode = self.compliance_mode;
        for motor in self.motors.iter_mut() {
            *motor = MotorState::default();
        }
        self.connected = false;
        self.robot_is_reset = true;
        self.robot_is_initialized = false;
        self.do_check_initialization = true;
        self.do_initialize = false;
        self.extended_mode = false;
        self.playing = false;
        self.emit(RobotEvent::ConnectionChanged(false));
        self.emit(RobotEvent::Disconnected);
        self.message("ROBOT lost!");
    }

    pub(super) fn handle_confirm_connection(&mut self) {
        // Leave a stale extended session first
        self.ext_disable();

        let response = self.txrx("#1ZP\r");
        if self.link.is_none() {
            return;
        }
        if is_status_reply(&response, 1) {
            info!("Found robot on port {}", self.port_number);
            self.connected = true;
            self.emit(RobotEvent::ConnectionChanged(true));
            self.emit(RobotEvent::Connected);
            self.message("ROBOT connected. Please initialize.");
        } else {
            if !response.is_empty() {
                debug!("Unexpected status reply {:?}", response);
            }
            self.set_port_number((self.port_number + 1) % self.config.port_cycle);
        }
    }

    /// Puts every axis controller into its reset state. A robot left
    /// initialized by an earlier session has to be reset by hand.
    pub(super) fn handle_robot_reset(&mut self) {
        let mut is_reset = true;
        for i in 0..self.motors.len() {
            if self.motors[i].is_reset {
                continue;
            }
            let address = self.joints.joints[i].address;
            if self.txrx(&format!("#{}P0\r", address)).ends_with(&format!("{}P0", address)) {
                self.motors[i].is_reset = true;
            } else {
                is_reset = false;
            }
            if !self.connected {
                return;
            }
        }
        self.robot_is_reset = is_reset;
    }

    /// Checks without initializing whether every axis already reports the
    /// initialized state, which spares a second initialization after a
    /// reconnect.
    pub(super) fn handle_check_initialization(&mut self) {
        if self.poll_initialized(false) {
            self.finish_initialization("ROBOT is already initialized.");
        }
        if self.connected {
            self.do_check_initialization = false;
        }
    }

    pub(super) fn handle_initialize(&mut self) {
        if !self.poll_initialized(true) {
            return;
        }
        self.finish_initialization("Initialization complete. ROBOT is ready for your command.");
        if self.ext_enable() && self.ext_send_config(0) {
            self.extended_mode = true;
            self.playing = false;
        }
    }

    /// Polls the state of every axis not yet known to be initialized. With
    /// `kick`, axes still in reset are told to start their initialization.
    fn poll_initialized(&mut self, kick: bool) -> bool {
        let mut all = true;
        for i in 0..self.motors.len() {
            if self.motors[i].is_initialized {
                continue;
            }
            let address = self.joints.joints[i].address;
            let response = self.txrx(&format!("#{}ZP\r", address));
            if response.ends_with(&format!("{}ZP+2", address)) {
                self.motors[i].is_initialized = true;
            } else {
                all = false;
                if kick && response.ends_with(&format!("{}ZP+0", address)) {
                    self.txrx(&format!("#{}P1\r", address));
                }
            }
            if !self.connected {
                return false;
            }
        }
        all
    }

    fn finish_initialization(&mut self, message: &str) {
        self.robot_is_initialized = true;
        self.do_initialize = false;

        // Seed the live pose from the encoders
        let joints = self.joints.clone();
        for joint in joints.iter() {
            if let Some(ticks) = self.poll_register(&format!("{}I", joint.address)) {
                self.rx_angles.insert(joint.name.clone(), joint.ticks_to_angle(ticks));
            }
        }
        self.last_rx_angles = self.rx_angles.clone();
        self.tx_angles = self.rx_angles.clone();
        self.last_time = Instant::now();

        self.emit(RobotEvent::Initialized);
        self.message(message);
    }

    /// Resolves a pending compliance change. Needs legacy mode, so extended
    /// mode is left for the duration and entered again afterwards.
    pub(super) fn handle_check_compliance_mode(&mut self) {
        if self.compliance_mode == self.requested_compliance_mode {
            return;
        }

        if self.requested_compliance_mode == ComplianceMode::Stiff {
            // Hold the pose the arm was moved to before the currents come back
            self.tx_angles = self.rx_angles.clone();
            let last = self.compliance_mode;
            self.compliance_mode = ComplianceMode::Stiff;
            self.handle_extended_mode();
            self.compliance_mode = last;
        }

        if !self.ext_disable() {
            return;
        }

        let deadline = Instant::now() + self.config.compliance_timeout();
        let target = self.requested_compliance_mode;
        let changed = match target {
            ComplianceMode::Hardware => self.switch_currents(deadline, true),
            ComplianceMode::Stiff => self.switch_currents(deadline, false),
            ComplianceMode::Software => true,
        };
        if self.link.is_none() {
            return;
        }

        if changed {
            match target {
                ComplianceMode::Hardware => self.message("The robot is in hardware compliance mode."),
                ComplianceMode::Stiff => self.message("The robot is stiff."),
                ComplianceMode::Software => self.message("The robot is in software compliance mode."),
            }
        } else {
            warn!("Compliance change to {:?} timed out", target);
            self.message(format!("Failed to change to {:?} compliance mode.", target));
            self.requested_compliance_mode = self.compliance_mode;
        }

        if !self.ext_enable() {
            self.extended_mode = false;
        }
        self.compliance_mode = self.requested_compliance_mode;
        self.emit(RobotEvent::ComplianceChanged(self.compliance_mode));
    }

    /// Cuts (`compliant`) or restores the motor currents of every joint.
    fn switch_currents(&mut self, deadline: Instant, compliant: bool) -> bool {
        loop {
            if Instant::now() >= deadline {
                return false;
            }
            let mut done = true;
            for i in 0..self.motors.len() {
                if self.motors[i].is_hw_compliant == compliant {
                    continue;
                }
                let joint = self.joints.joints[i].clone();
                let (hold, max) = if compliant { (0, 0) } else { (joint.hold_current, joint.max_current) };
                if self.chat_echo(&format!("{}r{}", joint.address, hold))
                    && self.chat_echo(&format!("{}i{}", joint.address, max))
                {
                    self.motors[i].is_hw_compliant = compliant;
                } else {
                    done = false;
                }
                if self.link.is_none() || !self.connected {
                    return false;
                }
            }
            if done {
                return true;
            }
        }
    }

    /// One steady state exchange: a feedback request while the controller
    /// plays or the arm is limp, otherwise a motion packet that also returns
    /// feedback.
    pub(super) fn handle_extended_mode(&mut self) {
        let now = Instant::now();
        let time_passed = now.duration_since(self.last_time).as_secs_f64();
        self.last_time = now;

        let reply = if self.playing || self.compliance_mode == ComplianceMode::Hardware {
            let reply = self.ext_command(&Frame::simple(Command::Feedback), FeedbackPayload::SIZE);
            if reply.is_some() && self.playing && self.stop_playing {
                let stopped = self.ext_chat(&Frame::simple(Command::Stop), &Frame::simple(Command::Stop));
                debug!("Sending stop command: {}", stopped);
            }
            reply
        } else {
            match self.motion_frame() {
                Some(frame) => self.ext_command(&frame, FeedbackPayload::SIZE),
                None => None,
            }
        };

        let feedback = match reply.map(|r| r.payload_as::<FeedbackPayload>()) {
            Some(Ok(feedback)) => feedback,
            Some(Err(e)) => {
                debug!("Bad feedback payload: {}", e);
                self.extended_mode = false;
                return;
            }
            None => {
                debug!("No feedback");
                self.extended_mode = false;
                return;
            }
        };

        self.apply_feedback(&feedback, time_passed);

        if self.compliance_mode == ComplianceMode::Hardware {
            self.tx_angles = self.rx_angles.clone();
        }

        if self.playing && !feedback.is_playing() {
            self.message("Playback finished.");
            self.playing = false;
            self.stop_playing = false;
            // Hold still; a velocity of exactly 0 makes the motors whine
            self.tx_angles = self.rx_angles.clone();
            for v in self.tx_velocities.values_mut() {
                *v = PI / 180.0;
            }
            self.emit(RobotEvent::PlaybackFinished);
            return;
        }

        self.emit(RobotEvent::MotionOut { angles: self.rx_angles.clone(), velocities: self.rx_velocities.clone() });
    }

    /// Motion packet for the current targets, clamped to the joint limits.
    fn motion_frame(&mut self) -> Option<Frame> {
        let mut motion = MotionPayload { output_command: self.tx_output.into(), ..MotionPayload::default() };
        for joint in self.joints.iter() {
            let slot = joint.address as usize - 1;
            if slot >= NUM_AXES {
                continue;
            }
            let angle = joint.clamp_angle(self.tx_angles.get(&joint.name).copied().unwrap_or(0.0));
            self.tx_angles.insert(joint.name.clone(), angle);
            let velocity = self.tx_velocities.get(&joint.name).copied().unwrap_or(0.0);
            motion.ticks[slot] = joint.angle_to_ticks(angle);
            motion.velocity[slot] = joint.velocity_to_motor(velocity);
            motion.num_axes = motion.num_axes.max(joint.address);
        }
        match Frame::with_payload(Command::Motion, &motion) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Could not encode motion packet: {}", e);
                None
            }
        }
    }

    fn apply_feedback(&mut self, feedback: &FeedbackPayload, time_passed: f64) {
        for joint in self.joints.iter() {
            let slot = joint.address as usize - 1;
            let Some(ticks) = feedback.positions.get(slot).copied() else {
                continue;
            };
            if ticks == NO_POSITION {
                continue;
            }
            let angle = joint.ticks_to_angle(ticks as i32);
            let last = self.last_rx_angles.get(&joint.name).copied().unwrap_or(angle);
            let velocity = if time_passed > 0.0 { (angle - last).abs() / time_passed } else { 0.0 };
            self.rx_angles.insert(joint.name.clone(), angle);
            self.rx_velocities.insert(joint.name.clone(), velocity);
        }
        self.last_rx_angles = self.rx_angles.clone();
    }

    /// Uploads `timeline` to the controller, then commits or plays it.
    /// Any failed step abandons the whole transfer.
    pub fn transfer_keyframes(&mut self, timeline: &Timeline, command: KeyframeCommand) {
        self.stop_playing = false;

        if self.link.is_none() || !self.extended_mode {
            self.message("The robot is not ready for a keyframe transfer.");
            self.emit(RobotEvent::KeyframeTransferFinished(false));
            return;
        }

        let records = match timeline.to_records(&self.joints) {
            Ok(records) => records,
            Err(e) => {
                self.message(e.to_string());
                self.emit(RobotEvent::KeyframeTransferFinished(false));
                return;
            }
        };
        for (i, record) in records.iter().enumerate() {
            debug!("Keyframe {}: duration {} ms, output {}, ticks {:?}", i, record.duration, record.output_command, record.ticks);
        }

        if !self.ext_send_config(records.len()) {
            self.emit(RobotEvent::KeyframeTransferFinished(false));
            return;
        }

        for (i, record) in records.iter().enumerate() {
            let payload = SaveKeyframePayload { index: i as u8, keyframe: *record };
            let saved = match Frame::with_payload(Command::SaveKeyframe, &payload) {
                Ok(frame) => self.ext_chat(&frame, &Frame::simple(Command::SaveKeyframe)),
                Err(_) => false,
            };
            if !saved {
                self.message(format!("Could not save keyframe {}", i));
                self.emit(RobotEvent::KeyframeTransferFinished(false));
                return;
            }
        }

        match command {
            KeyframeCommand::Commit => {
                if !self.ext_chat(&Frame::simple(Command::Commit), &Frame::simple(Command::Commit)) {
                    self.message("Could not write to EEPROM");
                    self.emit(RobotEvent::KeyframeTransferFinished(false));
                    return;
                }
            }
            KeyframeCommand::Play | KeyframeCommand::Loop => {
                let play = PlayPayload::looped(command == KeyframeCommand::Loop);
                let started = match Frame::with_payload(Command::Play, &play) {
                    Ok(frame) => self.ext_chat(&frame, &Frame::simple(Command::Play)),
                    Err(_) => false,
                };
                if !started {
                    self.message("Could not start playback");
                    self.emit(RobotEvent::KeyframeTransferFinished(false));
                    return;
                }
                self.emit(RobotEvent::PlaybackStarted);
                self.playing = true;
            }
        }

        self.emit(RobotEvent::KeyframeTransferFinished(true));
    }

    /// Leaves the robot in legacy mode and closes the port.
    pub fn shutdown(&mut self) {
        if self.link.is_some() && self.extended_mode {
            self.ext_disable();
            self.extended_mode = false;
        }
        self.close_link();
    }
}

/// True for a status reply of axis `address`, `<address>ZP+<digit>` at the end.
pub fn is_status_reply(response: &str, address: u8) -> bool {
    let Some(head) = response.strip_suffix(|c: char| c.is_ascii_digit()) else {
        return false;
    };
    head.ends_with(&format!("{}ZP+", address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reply_pattern() {
        assert!(is_status_reply("1ZP+2", 1));
        assert!(is_status_reply("garbage#1ZP1ZP+0", 1));
        assert!(!is_status_reply("1ZP+", 1));
        assert!(!is_status_reply("2ZP+2", 1));
        assert!(!is_status_reply("", 1));
    }
}
