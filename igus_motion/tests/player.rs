use approx::assert_abs_diff_eq;
use igus_motion::keyframe::parse_keyframes;
use igus_motion::player::*;
use igus_motion::timeline::Timeline;
use igus_motion::{JointTable, OutputCommand};

const JOINTS: &str = r#"
[Joint0]
name = "Base"
type = "rotational"
address = 1
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000

[Joint1]
name = "Shoulder"
type = "rotational"
address = 2
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000

[Joint2]
name = "Elbow"
type = "rotational"
address = 3
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000
"#;

const KEYFRAMES: &str = "
# home, then reach and come back
speed:50 pause:0.1 output:0 Base:0 Shoulder:0 Elbow:0
speed:100 pause:0.2 output:1 Base:0.6 Shoulder:-0.3 Elbow:0.2
speed:50 pause:0 output:0 Base:0.2 Shoulder:0 Elbow:0
";

fn motions(events: &[PlayerEvent]) -> Vec<&MotionFrame> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::Motion(frame) => Some(frame),
            PlayerEvent::Finished => None,
        })
        .collect()
}

#[test]
fn plays_three_keyframes_to_the_end() {
    let joints = JointTable::from_toml_str(JOINTS).unwrap();
    let keyframes = parse_keyframes(KEYFRAMES).unwrap();
    assert_eq!(keyframes.len(), 3);
    for name in keyframes[0].angles.keys() {
        assert!(joints.get(name).is_some(), "Unknown joint {}", name);
    }

    let mut player = KeyframePlayer::new();
    player.interpolating = true;
    assert!(player.play_these_frames(&keyframes));
    player.start();

    let mut events = Vec::new();
    for _ in 0..100 {
        events.extend(player.step(0.02));
        if !player.is_playing() {
            break;
        }
    }
    assert_eq!(events.last(), Some(&PlayerEvent::Finished), "Playback did not finish");

    let frames = motions(&events);
    for (name, angle) in &keyframes[0].angles {
        assert_abs_diff_eq!(frames[0].angles[name], *angle, epsilon = 1e-9);
    }

    // Inside the first move Base heads strictly toward the second keyframe
    let reach: Vec<f64> = frames
        .iter()
        .map(|f| f.angles["Base"])
        .skip_while(|a| *a <= 1e-9)
        .take_while(|a| *a < 0.6 - 1e-9)
        .collect();
    assert!(reach.len() > 2, "Too few frames inside the move: {:?}", reach);
    assert!(reach.windows(2).all(|w| w[1] > w[0]), "Base did not advance: {:?}", reach);

    let last = frames.last().unwrap();
    for (name, angle) in &keyframes[2].angles {
        assert_abs_diff_eq!(last.angles[name], *angle, epsilon = 1e-9);
    }

    let outputs: Vec<OutputCommand> = frames.iter().map(|f| f.output).filter(|o| *o != OutputCommand::Nop).collect();
    assert_eq!(outputs, vec![OutputCommand::Set]);
}

#[test]
fn records_for_the_controller() {
    let joints = JointTable::from_toml_str(JOINTS).unwrap();
    let keyframes = parse_keyframes(KEYFRAMES).unwrap();
    let timeline = Timeline::build(&keyframes, 4.0, false).unwrap();

    // head, hold, move, hold, move
    assert_eq!(timeline.len(), 5);
    let records = timeline.to_records(&joints).unwrap();
    let durations: Vec<u16> = records.iter().map(|r| r.duration).collect();
    assert_eq!(durations, vec![0, 100, 150, 200, 200]);
    assert_eq!(records[2].output_command, 1);
    assert_eq!(records[3].output_command, 0);
    assert_eq!(records[0].ticks[3], 0, "Unused axes stay zero");
}

#[test]
fn feedback_slows_a_joint_that_is_ahead() {
    let keyframes = parse_keyframes(KEYFRAMES).unwrap();
    let mut player = KeyframePlayer::new();
    assert!(player.play_these_frames(&keyframes));
    player.start();
    player.step(0.15);

    // Already at the target, so there is nothing left to cover
    let at_target = keyframes[1].angles.clone();
    player.joint_angles_in(&at_target);
    assert_abs_diff_eq!(player.correction_factor("Base"), 0.85, epsilon = 1e-12);
}

#[tokio::test]
async fn run_streams_until_finished() {
    use tokio::sync::mpsc;

    let keyframes = parse_keyframes(KEYFRAMES).unwrap();
    let mut player = KeyframePlayer::new();
    player.set_speed_limit(100);
    assert!(player.play_these_frames(&keyframes));

    let (_commands, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    player.run(command_rx, event_tx).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.last(), Some(&PlayerEvent::Finished));
    assert!(!player.is_playing());
}
