use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MotionError;
use crate::joints::valid_name;
use crate::protocol::OutputCommand;

pub const DEFAULT_SPEED: u8 = 50;

/// A named pose: joint angles in radians plus how to get there.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Keyframe {
    pub name: String,
    pub angles: BTreeMap<String, f64>,
    /// Percentage (1..=100) of the player's speed limit used to reach this frame.
    pub speed: u8,
    /// Seconds to stay at this frame after reaching it.
    pub pause: f64,
    pub output: OutputCommand,
}

impl Default for Keyframe {
    fn default() -> Self {
        Self {
            name: String::new(),
            angles: BTreeMap::new(),
            speed: DEFAULT_SPEED,
            pause: 0.0,
            output: OutputCommand::Nop,
        }
    }
}

impl Keyframe {
    pub fn new<I, S>(angles: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            angles: angles.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..Self::default()
        }
    }

    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = speed.clamp(1, 100);
        self
    }

    pub fn with_pause(mut self, pause: f64) -> Self {
        self.pause = pause.max(0.0);
        self
    }

    pub fn with_output(mut self, output: OutputCommand) -> Self {
        self.output = output;
        self
    }

    pub fn angle(&self, joint: &str) -> f64 {
        self.angles.get(joint).copied().unwrap_or(0.0)
    }

    /// Maximum norm over this keyframe's joints. Joints the other frame does
    /// not have count as 0 there.
    pub fn distance(&self, other: &Keyframe) -> f64 {
        self.distance_to(&other.angles)
    }

    pub fn distance_to(&self, angles: &BTreeMap<String, f64>) -> f64 {
        self.angles
            .iter()
            .map(|(name, a)| (a - angles.get(name).copied().unwrap_or(0.0)).abs())
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for Keyframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "speed:{} pause:{} output:{}", self.speed, self.pause, u8::from(self.output))?;
        for (name, angle) in &self.angles {
            write!(f, " {}:{}", name, angle)?;
        }
        Ok(())
    }
}

impl FromStr for Keyframe {
    type Err = MotionError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut keyframe = Keyframe::default();
        for part in line.split_whitespace() {
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| MotionError::KeyframeParse(format!("'{}' is not a key:value pair", part)))?;
            let bad_value = || MotionError::KeyframeParse(format!("could not extract value from '{}'", part));
            match key {
                "speed" => {
                    let speed: u8 = value.parse().map_err(|_| bad_value())?;
                    if !(1..=100).contains(&speed) {
                        return Err(MotionError::KeyframeParse(format!("speed {} is outside 1..=100", speed)));
                    }
                    keyframe.speed = speed;
                }
                "pause" => {
                    let pause: f64 = value.parse().map_err(|_| bad_value())?;
                    if !pause.is_finite() || pause < 0.0 {
                        return Err(bad_value());
                    }
                    keyframe.pause = pause;
                }
                "output" => {
                    let raw: u8 = value.parse().map_err(|_| bad_value())?;
                    keyframe.output = OutputCommand::try_from(raw).map_err(|_| bad_value())?;
                }
                joint => {
                    if !valid_name(joint) {
                        return Err(MotionError::KeyframeParse(format!("invalid joint name '{}'", joint)));
                    }
                    let angle: f64 = value.parse().map_err(|_| bad_value())?;
                    if !angle.is_finite() {
                        return Err(bad_value());
                    }
                    keyframe.angles.insert(joint.to_string(), angle);
                }
            }
        }
        Ok(keyframe)
    }
}

/// Parses a keyframe file, one keyframe per line. Blank lines and `#`
/// comments are skipped; frames are named after their line number.
pub fn parse_keyframes(text: &str) -> Result<Vec<Keyframe>, MotionError> {
    let mut frames = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut keyframe: Keyframe = line
            .parse()
            .map_err(|e| MotionError::KeyframeParse(format!("line {}: {}", number + 1, e)))?;
        keyframe.name = format!("kf{}", frames.len());
        frames.push(keyframe);
    }
    Ok(frames)
}

pub fn load_keyframes(path: impl AsRef<Path>) -> Result<Vec<Keyframe>, MotionError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| MotionError::KeyframeParse(format!("{}: {}", path.display(), e)))?;
    parse_keyframes(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_max_norm() {
        let a = Keyframe::new([("j1", 0.1), ("j2", 0.2)]);
        let b = Keyframe::new([("j1", 0.4), ("j2", 0.2)]);
        assert!((a.distance(&b) - 0.3).abs() < 1e-12);
        assert!((b.distance(&a) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn text_form_parses_and_prints() {
        let kf: Keyframe = "speed:80 pause:1.5 output:1 Base:0.25 Arm:-1".parse().unwrap();
        assert_eq!(kf.speed, 80);
        assert_eq!(kf.pause, 1.5);
        assert_eq!(kf.output, OutputCommand::Set);
        assert_eq!(kf.angle("Arm"), -1.0);
        assert_eq!(kf.to_string(), "speed:80 pause:1.5 output:1 Arm:-1 Base:0.25");
        let again: Keyframe = kf.to_string().parse().unwrap();
        assert_eq!(again, kf);
    }

    #[test]
    fn malformed_text_is_rejected() {
        for line in ["speed:0 Base:1", "Base", "Base:abc", "bad name:1", "output:7"] {
            match line.parse::<Keyframe>() {
                Err(MotionError::KeyframeParse(_)) => {}
                other => panic!("Expected a parse error for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for line in ["Base:NaN", "Base:inf", "Base:0 Arm:-inf", "pause:NaN Base:0"] {
            match line.parse::<Keyframe>() {
                Err(MotionError::KeyframeParse(_)) => {}
                other => panic!("Expected a parse error for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn file_skips_comments() {
        let frames = parse_keyframes("# start\nspeed:50 Base:0\n\nspeed:20 Base:1\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].name, "kf1");
    }
}
