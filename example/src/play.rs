use std::error::Error;
use std::time::Duration;

use igus_motion::driver::{route, KeyframeCommand, Producer, RobotEvent, RouteInput, RobotState};
use igus_motion::keyframe::Keyframe;
use igus_motion::player::{JointAngles, KeyframePlayer, PlayerCommand, PlayerEvent};
use igus_motion::protocol::OutputCommand;
use igus_motion::timeline::Timeline;
use igus_motion::SERVO_SPEED_MAX;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::session::{next_event, Session};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
/// Time a stopped controller playback gets to report that it is idle.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

async fn robot_event(events: Option<&mut broadcast::Receiver<RobotEvent>>) -> Option<RobotEvent> {
    match events {
        Some(events) => next_event(events).await,
        None => std::future::pending().await,
    }
}

fn format_pose(angles: &JointAngles) -> String {
    angles.iter().map(|(name, angle)| format!("{}:{:+.4}", name, angle)).collect::<Vec<_>>().join(" ")
}

/// Streams `frames` through the host side player. Without a session the
/// robot counts as off and the pose stream is printed instead.
pub async fn play(mut session: Option<Session>, frames: &[Keyframe], looped: bool, speed: i32) -> Result<(), Box<dyn Error>> {
    if let Some(session) = session.as_mut() {
        session.ready().await?;
    }

    let state = if session.is_some() { RobotState::Stiff } else { RobotState::Off };
    let routing = route(RouteInput { state, player_playing: true, robot_playing: false });

    let mut player = KeyframePlayer::new();
    player.looped = looped;
    player.interpolating = routing.player_interpolating;
    player.velocity_adaption = routing.player_velocity_adaption;
    player.set_speed_limit(speed);
    if !player.play_these_frames(frames) {
        return Err("A sequence needs at least two keyframes".into());
    }
    info!(
        "Playing {} keyframes, {:.2} s per pass, looped: {}",
        frames.len(),
        player.timeline().total_duration(),
        looped
    );

    let (commands, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut player_events) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        player.run(command_rx, event_tx).await;
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    loop {
        tokio::select! {
            event = player_events.recv() => match event {
                Some(PlayerEvent::Motion(frame)) => match (routing.robot, session.as_ref()) {
                    (Producer::Player, Some(session)) => {
                        if frame.output != OutputCommand::Nop {
                            info!("Output {:?}", frame.output);
                        }
                        session.handle.motion_in_with_output(frame.angles, frame.velocities, frame.output);
                    }
                    _ => println!("{}", format_pose(&frame.angles)),
                },
                Some(PlayerEvent::Finished) | None => break,
            },
            event = robot_event(session.as_mut().map(|s| &mut s.events)) => match event {
                Some(RobotEvent::MotionOut { angles, .. }) if routing.feedback_to_player => {
                    let _ = commands.send(PlayerCommand::Feedback(angles));
                }
                Some(RobotEvent::Disconnected) | None => {
                    warn!("Robot lost during playback");
                    let _ = commands.send(PlayerCommand::Stop);
                }
                _ => {}
            },
            _ = &mut ctrl_c, if !stopping => {
                info!("Stopping playback");
                stopping = true;
                let _ = commands.send(PlayerCommand::Stop);
            }
        }
    }

    let _ = task.await;
    if let Some(session) = session {
        session.handle.stop_robot();
        session.close().await;
    }
    info!("Playback finished");
    Ok(())
}

/// Transfers `frames` to the controller and commits or plays them there.
pub async fn upload(mut session: Session, frames: &[Keyframe], command: KeyframeCommand, speed: i32) -> Result<(), Box<dyn Error>> {
    let speed_limit = 0.01 * speed as f64 * SERVO_SPEED_MAX;
    let timeline = Timeline::build(frames, speed_limit, command == KeyframeCommand::Loop)
        .ok_or("A sequence needs at least two keyframes")?;

    session.ready().await?;
    info!("Transferring {} keyframes ({:?})", timeline.len(), command);
    session.handle.transfer_keyframes(timeline, command);

    let deadline = tokio::time::Instant::now() + TRANSFER_TIMEOUT;
    let transferred = loop {
        match tokio::time::timeout_at(deadline, session.next_event()).await {
            Ok(Some(RobotEvent::KeyframeTransferFinished(ok))) => break ok,
            Ok(Some(RobotEvent::Message(message))) => println!("{}", message),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break false,
        }
    };
    if !transferred {
        session.close().await;
        return Err("Keyframe transfer failed".into());
    }
    if command == KeyframeCommand::Commit {
        info!("Sequence stored on the controller");
        session.close().await;
        return Ok(());
    }

    let routing = route(RouteInput { state: RobotState::Stiff, player_playing: false, robot_playing: true });
    info!("Controller plays on its own ({:?}), Ctrl-C stops it", routing.robot);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    loop {
        let timeout = async move {
            match stop_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = session.next_event() => match event {
                Some(RobotEvent::PlaybackFinished) => break,
                Some(RobotEvent::Disconnected) | None => {
                    warn!("Robot lost during playback");
                    break;
                }
                _ => {}
            },
            _ = &mut ctrl_c, if stop_deadline.is_none() => {
                info!("Stopping playback");
                session.handle.stop_playing();
                stop_deadline = Some(tokio::time::Instant::now() + STOP_TIMEOUT);
            }
            _ = timeout => {
                warn!("Controller did not confirm the stop");
                break;
            }
        }
    }

    session.close().await;
    info!("Playback finished");
    Ok(())
}
