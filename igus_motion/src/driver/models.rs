use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::joints::JointTable;
use crate::player::JointAngles;
use crate::protocol::OutputCommand;
use crate::timeline::Timeline;

#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub enum ComplianceMode {
    /// Motor currents cut, the arm can be moved by hand.
    Hardware,
    /// The arm holds the commanded pose.
    Stiff,
    /// The arm follows external force. Only tracked, not driven.
    Software,
}

impl Default for ComplianceMode {
    fn default() -> Self {
        Self::Stiff
    }
}

/// What the controller should do with a transferred keyframe sequence.
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub enum KeyframeCommand {
    Commit,
    Play,
    Loop,
}

/// Which step of the connection handshake the next `step()` performs.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    PortScan,
    ConfirmConnection,
    Reset,
    CheckInitialization,
    Initialize,
    EnterExtended,
    Steady,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RobotEvent {
    Connected,
    Disconnected,
    ConnectionChanged(bool),
    Initialized,
    Message(String),
    /// Measured joint angles and speeds.
    MotionOut { angles: JointAngles, velocities: JointAngles },
    PlaybackStarted,
    PlaybackFinished,
    ComplianceChanged(ComplianceMode),
    KeyframeTransferFinished(bool),
}

#[derive(Debug, Clone)]
pub enum RobotRequest {
    MotionIn { angles: JointAngles, velocities: JointAngles, output: OutputCommand },
    SetSpeedLimit(i32),
    Initialize,
    SetComplianceMode(ComplianceMode),
    StopRobot,
    TransferKeyframes { timeline: Timeline, command: KeyframeCommand },
    StopPlaying,
    SetJointConfig(Arc<JointTable>),
    Shutdown,
}
