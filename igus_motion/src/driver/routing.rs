//! Who feeds whom, depending on what the robot is doing.
//!
//! Evaluated once per state transition by whoever owns the producers
//! (player, editor, joystick) and wires them to the robot interface.

use serde::{Deserialize, Serialize};

/// Operator level robot state.
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub enum RobotState {
    Off,
    Stiff,
    SoftwareCompliant,
    HardwareCompliant,
}

/// Source of target poses for the robot.
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub enum Producer {
    None,
    Player,
    Editor,
    /// The controller runs its stored sequence on its own.
    Autonomous,
}

/// What the pose editor displays and forwards.
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub enum EditorSource {
    Joystick,
    Player,
    Robot,
}

#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub struct RouteInput {
    pub state: RobotState,
    /// The host side player is running.
    pub player_playing: bool,
    /// The controller is running a transferred sequence.
    pub robot_playing: bool,
}

#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub robot: Producer,
    pub editor: EditorSource,
    /// Robot feedback is passed to the player for velocity adaption.
    pub feedback_to_player: bool,
    pub player_interpolating: bool,
    pub player_velocity_adaption: bool,
}

pub fn route(input: RouteInput) -> Routing {
    let visualize = Routing {
        robot: Producer::None,
        editor: EditorSource::Player,
        feedback_to_player: false,
        player_interpolating: true,
        player_velocity_adaption: false,
    };
    match input.state {
        RobotState::Off if input.player_playing => visualize,
        RobotState::Off => Routing { editor: EditorSource::Joystick, ..visualize },
        RobotState::Stiff if input.robot_playing => Routing {
            robot: Producer::Autonomous,
            editor: EditorSource::Robot,
            ..visualize
        },
        RobotState::Stiff if input.player_playing => Routing {
            robot: Producer::Player,
            editor: EditorSource::Robot,
            feedback_to_player: true,
            player_interpolating: false,
            player_velocity_adaption: true,
        },
        RobotState::Stiff => Routing { robot: Producer::Editor, editor: EditorSource::Joystick, ..visualize },
        RobotState::SoftwareCompliant | RobotState::HardwareCompliant if input.player_playing => visualize,
        RobotState::SoftwareCompliant | RobotState::HardwareCompliant => {
            Routing { editor: EditorSource::Robot, ..visualize }
        }
    }
}
