//! Timed keyframe sequence built by the player.
//!
//! Items live in a flat arena. Item 0 is the head at time 0; each following
//! item is reached `relative_time` seconds after its predecessor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::MotionError;
use crate::joints::JointTable;
use crate::keyframe::Keyframe;
use crate::protocol::{KeyframeRecord, MAX_KEYFRAMES, NUM_AXES};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisTarget {
    pub angle: f64,
    /// Velocity needed to reach the next item's angle in time.
    pub velocity: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TimelineItem {
    pub joints: BTreeMap<String, AxisTarget>,
    pub relative_time: f64,
    pub absolute_time: f64,
    pub output: crate::protocol::OutputCommand,
}

impl TimelineItem {
    fn from_keyframe(names: &[String], keyframe: &Keyframe) -> Self {
        Self {
            joints: names
                .iter()
                .map(|n| (n.clone(), AxisTarget { angle: keyframe.angle(n), velocity: 0.0 }))
                .collect(),
            output: keyframe.output,
            ..Self::default()
        }
    }

    pub fn angle(&self, joint: &str) -> f64 {
        self.joints.get(joint).map(|j| j.angle).unwrap_or(0.0)
    }

    pub fn angles(&self) -> BTreeMap<String, f64> {
        self.joints.iter().map(|(k, v)| (k.clone(), v.angle)).collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Timeline {
    items: Vec<TimelineItem>,
    looped: bool,
}

impl Timeline {
    /// Builds the sequence for `keyframes`. Needs at least two frames.
    ///
    /// Joints are those of the first keyframe. A keyframe's pause becomes a
    /// hold item right after it; a move item follows whose duration is the
    /// max-norm distance over `0.01 * speed * speed_limit` of the frame moved to.
    /// A looped timeline gets a closing move back to the first frame.
    pub fn build(keyframes: &[Keyframe], speed_limit: f64, looped: bool) -> Option<Self> {
        if keyframes.len() < 2 {
            return None;
        }
        let names: Vec<String> = keyframes[0].angles.keys().cloned().collect();
        let mut items = vec![TimelineItem::from_keyframe(&names, &keyframes[0])];

        let push = |items: &mut Vec<TimelineItem>, mut item: TimelineItem, relative: f64| {
            let previous = items.last().map(|i| i.absolute_time).unwrap_or(0.0);
            item.relative_time = relative;
            item.absolute_time = previous + relative;
            items.push(item);
        };

        for (i, keyframe) in keyframes.iter().enumerate() {
            if keyframe.pause > 0.0 {
                let mut hold = TimelineItem::from_keyframe(&names, keyframe);
                hold.output = Default::default();
                push(&mut items, hold, keyframe.pause);
            }
            let Some(next) = keyframes.get(i + 1) else {
                break;
            };
            let time = move_time(keyframe, next, speed_limit);
            push(&mut items, TimelineItem::from_keyframe(&names, next), time);
        }

        if looped {
            let first = &keyframes[0];
            let last = &keyframes[keyframes.len() - 1];
            let time = move_time(last, first, speed_limit);
            push(&mut items, TimelineItem::from_keyframe(&names, first), time);
        }

        let mut timeline = Self { items, looped };
        timeline.compute_velocities(speed_limit);
        debug!(
            "Built timeline with {} items, {:.3}s total, looped: {}",
            timeline.len(),
            timeline.total_duration(),
            looped
        );
        Some(timeline)
    }

    fn compute_velocities(&mut self, speed_limit: f64) {
        for i in 0..self.items.len().saturating_sub(1) {
            let (head, tail) = self.items.split_at_mut(i + 1);
            let current = &mut head[i];
            let next = &tail[0];
            for (name, target) in current.joints.iter_mut() {
                let delta = next.angle(name) - target.angle;
                target.velocity = if delta == 0.0 || next.relative_time == 0.0 {
                    speed_limit
                } else {
                    (delta / next.relative_time).abs()
                };
            }
        }
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&TimelineItem> {
        self.items.get(index)
    }

    pub fn head(&self) -> Option<&TimelineItem> {
        self.items.first()
    }

    pub fn next_index(&self, index: usize) -> Option<usize> {
        if index + 1 < self.items.len() {
            Some(index + 1)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn joint_names(&self) -> Vec<String> {
        self.head().map(|h| h.joints.keys().cloned().collect()).unwrap_or_default()
    }

    /// Absolute time of the last item.
    pub fn total_duration(&self) -> f64 {
        self.items.last().map(|i| i.absolute_time).unwrap_or(0.0)
    }

    /// Controller form of the timeline. The head becomes frame 0 with no
    /// duration; every later item becomes one frame timed in milliseconds.
    /// Joints missing from `joints` are skipped. Items longer than the
    /// controller's 16 bit millisecond field are refused.
    pub fn to_records(&self, joints: &JointTable) -> Result<Vec<KeyframeRecord>, MotionError> {
        joints.check_axis_count()?;
        if self.items.len() > MAX_KEYFRAMES {
            return Err(MotionError::TooManyKeyframes(self.items.len()));
        }
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut record = KeyframeRecord {
                    duration: if i == 0 { 0 } else { duration_millis(i, item.relative_time)? },
                    output_command: item.output.into(),
                    ..KeyframeRecord::default()
                };
                for (name, target) in &item.joints {
                    if let Some(info) = joints.get(name) {
                        let slot = info.address as usize - 1;
                        if slot < NUM_AXES {
                            record.ticks[slot] = info.angle_to_ticks(target.angle);
                        }
                    }
                }
                Ok(record)
            })
            .collect()
    }
}

fn duration_millis(index: usize, seconds: f64) -> Result<u16, MotionError> {
    let millis = (seconds * 1000.0).round().max(0.0);
    if millis > u16::MAX as f64 {
        return Err(MotionError::SegmentTooLong { index, millis: millis as u64 });
    }
    Ok(millis as u16)
}

/// Seconds needed to move from `from` to `to` at `to`'s share of the speed limit.
pub fn move_time(from: &Keyframe, to: &Keyframe, speed_limit: f64) -> f64 {
    from.distance(to).abs() / (0.01 * to.speed as f64 * speed_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Vec<Keyframe> {
        vec![
            Keyframe::new([("j1", 0.1), ("j2", 0.2)]),
            Keyframe::new([("j1", 0.4), ("j2", 0.2)]).with_speed(50),
        ]
    }

    #[test]
    fn move_duration_follows_distance_and_speed() {
        let timeline = Timeline::build(&frames(), 4.0, false).unwrap();
        assert_eq!(timeline.len(), 2);
        assert!((timeline.items()[1].relative_time - 0.15).abs() < 1e-12);
        assert!((timeline.total_duration() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn segment_velocities() {
        let timeline = Timeline::build(&frames(), 4.0, false).unwrap();
        let head = &timeline.items()[0];
        assert!((head.joints["j1"].velocity - 2.0).abs() < 1e-9);
        // j2 does not move, so it gets the speed limit instead of 0
        assert_eq!(head.joints["j2"].velocity, 4.0);
    }

    #[test]
    fn pause_inserts_hold_item() {
        let mut kfs = frames();
        kfs[0].pause = 0.5;
        let timeline = Timeline::build(&kfs, 4.0, false).unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline.items()[1].angle("j1"), 0.1);
        assert!((timeline.items()[1].absolute_time - 0.5).abs() < 1e-12);
        assert!((timeline.total_duration() - 0.65).abs() < 1e-12);
    }

    #[test]
    fn looped_timeline_returns_to_start() {
        let timeline = Timeline::build(&frames(), 4.0, true).unwrap();
        assert_eq!(timeline.len(), 3);
        let last = &timeline.items()[2];
        assert_eq!(last.angle("j1"), 0.1);
        // back to frame 0 at its default speed of 50%
        assert!((last.relative_time - 0.15).abs() < 1e-12);
        assert!(timeline.is_looped());
    }

    #[test]
    fn single_keyframe_builds_nothing() {
        assert!(Timeline::build(&frames()[..1], 4.0, false).is_none());
    }

    #[test]
    fn long_pause_is_refused_for_the_controller() {
        let joints = JointTable::from_toml_str(
            r#"
[Joint0]
name = "j1"
type = "rotational"
address = 1
encoder_steps_per_turn = 4000
motor_steps_per_turn = 1000
"#,
        )
        .unwrap();
        let kfs = vec![Keyframe::new([("j1", 0.0)]).with_pause(100.0), Keyframe::new([("j1", 0.1)])];
        let timeline = Timeline::build(&kfs, 4.0, false).unwrap();
        assert!((timeline.total_duration() - 100.05).abs() < 1e-9);

        match timeline.to_records(&joints) {
            Err(MotionError::SegmentTooLong { index: 1, millis: 100_000 }) => {}
            other => panic!("Expected SegmentTooLong, got {:?}", other),
        }

        let kfs = vec![Keyframe::new([("j1", 0.0)]).with_pause(65.535), Keyframe::new([("j1", 0.1)])];
        let records = Timeline::build(&kfs, 4.0, false).unwrap().to_records(&joints).unwrap();
        let durations: Vec<u16> = records.iter().map(|r| r.duration).collect();
        assert_eq!(durations, vec![0, 65535, 50]);
    }
}
