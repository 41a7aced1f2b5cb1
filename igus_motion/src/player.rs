//! Real-time keyframe playback on the host.
//!
//! The player advances a slider through a [`Timeline`] and emits target
//! angles and velocities for the robot every step. Live feedback bends the
//! commanded velocities a little so the arm arrives at each keyframe on time.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::keyframe::Keyframe;
use crate::protocol::OutputCommand;
use crate::timeline::Timeline;
use crate::SERVO_SPEED_MAX;

pub type JointAngles = BTreeMap<String, f64>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MotionFrame {
    pub angles: JointAngles,
    pub velocities: JointAngles,
    /// Output command of a keyframe reached during this step, otherwise `Nop`.
    pub output: OutputCommand,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Motion(MotionFrame),
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Feedback(JointAngles),
    Stop,
}

#[derive(Debug, Clone)]
pub struct KeyframePlayer {
    timeline: Timeline,
    current: usize,
    slider: f64,
    speed_limit: f64,
    time_correction: f64,
    adaption_strength: f64,
    pub looped: bool,
    pub interpolating: bool,
    pub velocity_adaption: bool,
    playing: bool,
    last_tick: Option<Instant>,
    rx_angles: JointAngles,
    tx_angles: JointAngles,
    tx_velocities: JointAngles,
    correction: JointAngles,
}

impl Default for KeyframePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyframePlayer {
    pub fn new() -> Self {
        Self {
            timeline: Timeline::default(),
            current: 0,
            slider: 0.0,
            speed_limit: SERVO_SPEED_MAX,
            time_correction: 0.08,
            adaption_strength: 0.15,
            looped: false,
            interpolating: false,
            velocity_adaption: true,
            playing: false,
            last_tick: None,
            rx_angles: JointAngles::new(),
            tx_angles: JointAngles::new(),
            tx_velocities: JointAngles::new(),
            correction: JointAngles::new(),
        }
    }

    /// Speed limit as a percentage of the servo maximum, clamped to 1..=100.
    pub fn set_speed_limit(&mut self, percent: i32) {
        self.speed_limit = 0.01 * percent.clamp(1, 100) as f64 * SERVO_SPEED_MAX;
    }

    pub fn speed_limit(&self) -> f64 {
        self.speed_limit
    }

    /// Time correction as a percentage of half a second. Large values make
    /// the velocity adaption oscillate.
    pub fn set_time_correction(&mut self, percent: i32) {
        self.time_correction = 0.01 * percent as f64 * 0.5;
    }

    pub fn time_correction(&self) -> f64 {
        self.time_correction
    }

    pub fn set_adaption_strength(&mut self, strength: f64) {
        self.adaption_strength = strength.abs();
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn slider_position(&self) -> f64 {
        self.slider
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn correction_factor(&self, joint: &str) -> f64 {
        self.correction.get(joint).copied().unwrap_or(1.0)
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Builds a fresh timeline from `keyframes`. Fewer than two keyframes
    /// leave the player untouched and return false.
    pub fn play_these_frames(&mut self, keyframes: &[Keyframe]) -> bool {
        let Some(timeline) = Timeline::build(keyframes, self.speed_limit, self.looped) else {
            debug!("Need at least two keyframes to play, got {}", keyframes.len());
            return false;
        };
        let names = timeline.joint_names();
        self.slider = 0.0;
        self.current = 0;
        self.tx_angles = keyframes[0].angles.clone();
        self.tx_velocities = names.iter().map(|n| (n.clone(), self.speed_limit)).collect();
        self.correction = names.iter().map(|n| (n.clone(), 1.0)).collect();
        self.timeline = timeline;
        true
    }

    pub fn start(&mut self) {
        if self.timeline.is_empty() {
            return;
        }
        info!("Playing {} timeline items", self.timeline.len());
        self.playing = true;
        self.last_tick = Some(Instant::now());
    }

    /// Stops playback. Calling it again has no effect.
    pub fn stop(&mut self) {
        if self.playing {
            debug!("Player stopped at {:.3}s", self.slider);
        }
        self.playing = false;
        self.last_tick = None;
    }

    /// Latest joint angles measured on the robot.
    pub fn joint_angles_in(&mut self, angles: &JointAngles) {
        self.rx_angles.clone_from(angles);

        let next = self.timeline.next_index(self.current).and_then(|i| self.timeline.get(i));
        match next {
            Some(next) if self.velocity_adaption => {
                let delta_t = next.absolute_time - self.slider + self.time_correction;
                let low = 1.0 - self.adaption_strength;
                let high = 1.0 + self.adaption_strength;
                for (name, factor) in self.correction.iter_mut() {
                    let (Some(tx), Some(rx)) = (self.tx_angles.get(name), self.rx_angles.get(name)) else {
                        *factor = 1.0;
                        continue;
                    };
                    let delta_s = (tx - rx).abs();
                    let velocity = self.tx_velocities.get(name).copied().unwrap_or(self.speed_limit);
                    let ratio = delta_s / (delta_t * velocity);
                    *factor = if ratio.is_nan() { 1.0 } else { ratio.clamp(low, high) };
                }
            }
            _ => self.correction.values_mut().for_each(|f| *f = 1.0),
        }
    }

    /// Measures the wall clock time since the last tick and steps by it.
    pub fn tick(&mut self) -> Vec<PlayerEvent> {
        let now = Instant::now();
        let dt = self.last_tick.map(|t| now.duration_since(t).as_secs_f64()).unwrap_or(0.0);
        self.last_tick = Some(now);
        self.step(dt)
    }

    /// Advances the slider by `dt` seconds.
    pub fn step(&mut self, dt: f64) -> Vec<PlayerEvent> {
        if !self.playing {
            return Vec::new();
        }
        self.slider += dt;

        let mut output = OutputCommand::Nop;
        while let Some(next) = self.timeline.next_index(self.current) {
            if self.timeline.items()[next].absolute_time >= self.slider {
                break;
            }
            self.current = next;
            let reached = self.timeline.items()[next].output;
            if reached != OutputCommand::Nop {
                output = reached;
            }
        }

        let current = &self.timeline.items()[self.current];
        match self.timeline.next_index(self.current).map(|i| &self.timeline.items()[i]) {
            None => {
                self.tx_angles = current.angles();
                for v in self.tx_velocities.values_mut() {
                    *v = self.speed_limit;
                }
                if self.looped {
                    self.slider -= current.absolute_time;
                    self.current = 0;
                } else {
                    self.stop();
                    info!("Playback finished");
                    return vec![PlayerEvent::Motion(self.frame(output)), PlayerEvent::Finished];
                }
            }
            Some(next) => {
                for (name, angle) in self.tx_angles.iter_mut() {
                    let from = current.angle(name);
                    let delta = next.angle(name) - from;
                    *angle = if self.interpolating {
                        from + delta * ((self.slider - current.absolute_time) / next.relative_time).min(1.0)
                    } else {
                        next.angle(name)
                    };
                    let velocity = if delta == 0.0 || next.relative_time == 0.0 {
                        self.speed_limit
                    } else {
                        self.correction.get(name).copied().unwrap_or(1.0)
                            * (delta / (next.relative_time + self.time_correction)).abs()
                    };
                    self.tx_velocities.insert(name.clone(), velocity);
                }
            }
        }
        vec![PlayerEvent::Motion(self.frame(output))]
    }

    fn frame(&self, output: OutputCommand) -> MotionFrame {
        MotionFrame { angles: self.tx_angles.clone(), velocities: self.tx_velocities.clone(), output }
    }

    /// Plays the loaded timeline at [`crate::MOTION_SAMPLE_RATE`] until it
    /// finishes or a stop arrives. Feedback is taken from `commands`.
    #[cfg(feature = "driver")]
    pub async fn run(
        &mut self,
        mut commands: tokio::sync::mpsc::UnboundedReceiver<PlayerCommand>,
        events: tokio::sync::mpsc::UnboundedSender<PlayerEvent>,
    ) {
        use std::time::Duration;
        use tokio::time::MissedTickBehavior;

        let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / crate::MOTION_SAMPLE_RATE));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        self.start();
        while self.is_playing() {
            tokio::select! {
                _ = interval.tick() => {
                    for event in self.tick() {
                        if events.send(event).is_err() {
                            self.stop();
                        }
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(PlayerCommand::Feedback(angles)) => self.joint_angles_in(&angles),
                    Some(PlayerCommand::Stop) => self.stop(),
                    None => commands_open = false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(looped: bool) -> KeyframePlayer {
        let mut player = KeyframePlayer::new();
        player.looped = looped;
        player.interpolating = true;
        let frames = vec![
            Keyframe::new([("j1", 0.0)]),
            Keyframe::new([("j1", 0.4)]).with_speed(50),
        ];
        assert!(player.play_these_frames(&frames));
        player.start();
        player
    }

    #[test]
    fn speed_limit_and_time_correction_are_percentages() {
        let mut player = KeyframePlayer::new();
        player.set_speed_limit(50);
        assert_eq!(player.speed_limit(), 2.0);
        player.set_speed_limit(0);
        assert!((player.speed_limit() - 0.04).abs() < 1e-12);
        player.set_speed_limit(250);
        assert!((player.speed_limit() - SERVO_SPEED_MAX).abs() < 1e-12);
        player.set_time_correction(20);
        assert!((player.time_correction() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn looping_wraps_slider_by_total_duration() {
        let mut player = player(true);
        let total = player.timeline().total_duration();
        assert!((total - 0.4).abs() < 1e-12);
        player.step(0.39);
        assert_eq!(player.current_index(), 1);
        // 0.41 is past the closing item at 0.4
        player.step(0.02);
        assert_eq!(player.current_index(), 0);
        assert!((player.slider_position() - (0.41 - total)).abs() < 1e-9);
        assert!(player.is_playing());
    }

    #[test]
    fn correction_factor_stays_in_band() {
        let mut player = player(false);
        player.step(0.05);
        for rx in [-1000.0, -0.3, 0.0, 0.02, 0.5, 1000.0, f64::NAN] {
            let mut angles = JointAngles::new();
            angles.insert("j1".to_string(), rx);
            player.joint_angles_in(&angles);
            let factor = player.correction_factor("j1");
            assert!((0.85..=1.15).contains(&factor), "factor {:?} for rx {:?}", factor, rx);
        }
    }

    #[test]
    fn stop_is_idempotent_and_silences_output() {
        let mut player = player(false);
        player.stop();
        player.stop();
        assert!(player.step(0.1).is_empty());
    }

    #[test]
    fn keyframe_mode_snaps_to_next_item() {
        let mut player = player(false);
        player.interpolating = false;
        match player.step(0.01).as_slice() {
            [PlayerEvent::Motion(frame)] => assert_eq!(frame.angles["j1"], 0.4),
            other => panic!("Expected one motion event, got {:?}", other),
        }
    }
}
