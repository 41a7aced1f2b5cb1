use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::{ComplianceMode, KeyframeCommand, RobotEvent, RobotInterface, RobotRequest};
use crate::joints::JointTable;
use crate::player::JointAngles;
use crate::protocol::OutputCommand;
use crate::timeline::Timeline;

/// Idle time of the communication thread while no port is open.
const PORT_SCAN_INTERVAL: Duration = Duration::from_millis(10);

/// Cloneable front end of a [`RobotInterface`] running on its own thread.
/// Requests are queued and handled between two exchanges with the robot.
#[derive(Clone)]
pub struct RobotHandle {
    requests: mpsc::UnboundedSender<RobotRequest>,
    events: broadcast::Sender<RobotEvent>,
}

impl RobotHandle {
    fn send(&self, request: RobotRequest) {
        if self.requests.send(request).is_err() {
            debug!("Robot interface thread is gone");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RobotEvent> {
        self.events.subscribe()
    }

    pub fn motion_in(&self, angles: JointAngles, velocities: JointAngles) {
        self.motion_in_with_output(angles, velocities, OutputCommand::Nop);
    }

    pub fn motion_in_with_output(&self, angles: JointAngles, velocities: JointAngles, output: OutputCommand) {
        self.send(RobotRequest::MotionIn { angles, velocities, output });
    }

    pub fn set_speed_limit(&self, percent: i32) {
        self.send(RobotRequest::SetSpeedLimit(percent));
    }

    pub fn initialize(&self) {
        self.send(RobotRequest::Initialize);
    }

    pub fn set_compliance_mode(&self, mode: ComplianceMode) {
        self.send(RobotRequest::SetComplianceMode(mode));
    }

    pub fn stop_robot(&self) {
        self.send(RobotRequest::StopRobot);
    }

    pub fn transfer_keyframes(&self, timeline: Timeline, command: KeyframeCommand) {
        self.send(RobotRequest::TransferKeyframes { timeline, command });
    }

    pub fn stop_playing(&self) {
        self.send(RobotRequest::StopPlaying);
    }

    pub fn set_joint_config(&self, joints: Arc<JointTable>) {
        self.send(RobotRequest::SetJointConfig(joints));
    }

    pub fn shutdown(&self) {
        self.send(RobotRequest::Shutdown);
    }
}

impl RobotInterface {
    /// Moves the interface onto its own thread.
    pub fn spawn(self) -> (RobotHandle, thread::JoinHandle<()>) {
        let (requests, receiver) = mpsc::unbounded_channel();
        let handle = RobotHandle { requests, events: self.events.clone() };
        let join = thread::spawn(move || self.run(receiver));
        (handle, join)
    }

    /// Communication loop. Ends on a shutdown request or once every handle
    /// is dropped.
    pub fn run(mut self, mut requests: mpsc::UnboundedReceiver<RobotRequest>) {
        info!("Robot interface started");
        loop {
            loop {
                match requests.try_recv() {
                    Ok(request) => {
                        if !self.handle_request(request) {
                            self.shutdown();
                            info!("Robot interface stopped");
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        info!("Robot interface stopped");
                        return;
                    }
                }
            }

            self.step();

            if self.link.is_none() {
                thread::sleep(PORT_SCAN_INTERVAL);
            }
        }
    }
}
