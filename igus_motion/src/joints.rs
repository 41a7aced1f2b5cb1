//! Per-joint calibration table loaded from a TOML document.
//!
//! ```toml
//! [global]
//! lookahead = 200
//!
//! [Joint0]
//! name = "Base"
//! type = "rotational"
//! address = 1
//! encoder_steps_per_turn = 4000
//! motor_steps_per_turn = 1000
//! ```

use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::MotionError;
use crate::protocol::{NUM_AXES, POSITION_BIAS};

const MANDATORY: [&str; 5] = ["name", "type", "address", "encoder_steps_per_turn", "motor_steps_per_turn"];

fn default_lower_limit() -> f64 {
    -1.0
}
fn default_upper_limit() -> f64 {
    1.0
}
fn default_length() -> f64 {
    -1.0
}
fn default_joystick_axis() -> i32 {
    -1
}
fn default_max_current() -> u16 {
    50
}
fn default_hold_current() -> u16 {
    20
}
fn default_lookahead() -> u16 {
    200
}

#[derive(Deserialize, Debug)]
struct JointSection {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    address: u8,
    encoder_steps_per_turn: f64,
    motor_steps_per_turn: f64,
    #[serde(default = "default_lower_limit")]
    lower_limit: f64,
    #[serde(default = "default_upper_limit")]
    upper_limit: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default = "default_length")]
    length: f64,
    #[serde(default = "default_joystick_axis")]
    joystick_axis: i32,
    #[serde(default)]
    joystick_invert: bool,
    #[serde(default)]
    invert: bool,
    #[serde(default = "default_max_current")]
    max_current: u16,
    #[serde(default = "default_hold_current")]
    hold_current: u16,
}

#[derive(Deserialize, Debug)]
struct GlobalSection {
    #[serde(default = "default_lookahead")]
    lookahead: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointInfo {
    pub name: String,
    pub kind: String,
    /// 1-based axis controller address.
    pub address: u8,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub offset: f64,
    pub length: f64,
    pub enc_to_rad: f64,
    pub mot_to_rad: f64,
    pub joystick_axis: Option<u8>,
    pub joystick_invert: bool,
    pub invert: bool,
    pub max_current: u16,
    pub hold_current: u16,
}

impl JointInfo {
    pub fn sign(&self) -> f64 {
        if self.invert {
            -1.0
        } else {
            1.0
        }
    }

    pub fn clamp_angle(&self, angle: f64) -> f64 {
        angle.max(self.lower_limit).min(self.upper_limit)
    }

    /// Joint angle to the biased encoder position the controller expects.
    pub fn angle_to_ticks(&self, angle: f64) -> u16 {
        let ticks = ((self.sign() * angle + self.offset) / self.enc_to_rad).round() as i64 + POSITION_BIAS as i64;
        ticks.clamp(0, u16::MAX as i64) as u16
    }

    /// Unbiased encoder position reported in feedback to a joint angle.
    pub fn ticks_to_angle(&self, ticks: i32) -> f64 {
        self.sign() * (ticks as f64 * self.enc_to_rad - self.offset)
    }

    /// Joint velocity to motor steps per second, never below 1.
    pub fn velocity_to_motor(&self, velocity: f64) -> u16 {
        let steps = (velocity / self.mot_to_rad).round().abs();
        steps.clamp(1.0, u16::MAX as f64) as u16
    }

    /// Encoder to motor ratio as 8.8 fixed point.
    pub fn enc_to_mot(&self) -> u16 {
        (256.0 * self.enc_to_rad / self.mot_to_rad).round().clamp(0.0, u16::MAX as f64) as u16
    }
}

/// Immutable joint table, indexed by joint index. Shared as `Arc` snapshots
/// and replaced wholesale on reconfiguration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct JointTable {
    pub joints: Vec<JointInfo>,
    /// Controller side lookahead horizon in milliseconds.
    pub lookahead: u16,
}

impl JointTable {
    pub fn from_toml_str(text: &str) -> Result<Self, MotionError> {
        let doc: toml::Table = text.parse()?;

        let mut lookahead = default_lookahead();
        let mut slots: BTreeMap<usize, JointInfo> = BTreeMap::new();
        let mut addresses = HashSet::new();

        for (group, value) in doc.iter() {
            if group == "global" {
                let global: GlobalSection = value.clone().try_into()?;
                lookahead = global.lookahead;
                continue;
            }
            let index = joint_index(group).ok_or_else(|| MotionError::InvalidGroup(group.clone()))?;
            let table = value.as_table().ok_or_else(|| MotionError::InvalidGroup(group.clone()))?;
            for key in MANDATORY {
                if !table.contains_key(key) {
                    return Err(MotionError::MissingSetting { group: group.clone(), key: key.to_string() });
                }
            }
            let section: JointSection = value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| MotionError::ConfigParse(format!("{}: {}", group, e)))?;

            if section.address == 0 {
                return Err(MotionError::ConfigParse(format!("Invalid address setting in group {}", group)));
            }
            if !addresses.insert(section.address) {
                return Err(MotionError::DuplicateAddress(section.address));
            }
            if !valid_name(&section.name) {
                return Err(MotionError::InvalidName(section.name));
            }
            if section.encoder_steps_per_turn <= 0.0 || section.motor_steps_per_turn <= 0.0 {
                return Err(MotionError::ConfigParse(format!("Steps per turn must be positive in group {}", group)));
            }

            slots.insert(index, JointInfo::from(section));
        }

        let mut joints = Vec::with_capacity(slots.len());
        for (expected, (index, info)) in slots.into_iter().enumerate() {
            if index != expected {
                return Err(MotionError::IndexGap(expected));
            }
            joints.push(info);
        }

        for address in 1..=addresses.len() as u8 {
            if !addresses.contains(&address) {
                return Err(MotionError::AddressGap(address));
            }
        }

        Ok(Self { joints, lookahead })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, MotionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MotionError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        let table = Self::from_toml_str(&text)?;
        info!("Joint configuration loaded: {} joints from {}", table.len(), path.display());
        Ok(Arc::new(table))
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, JointInfo> {
        self.joints.iter()
    }

    pub fn get(&self, name: &str) -> Option<&JointInfo> {
        self.joints.iter().find(|j| j.name == name)
    }

    /// Highest configured address, which is the axis count on the wire.
    pub fn num_axes(&self) -> usize {
        self.joints.iter().map(|j| j.address as usize).max().unwrap_or(0)
    }

    pub fn check_axis_count(&self) -> Result<usize, MotionError> {
        let n = self.num_axes();
        if n > NUM_AXES {
            return Err(MotionError::TooManyAxes(n));
        }
        Ok(n)
    }
}

impl From<JointSection> for JointInfo {
    fn from(s: JointSection) -> Self {
        Self {
            name: s.name,
            kind: s.kind,
            address: s.address,
            lower_limit: s.lower_limit,
            upper_limit: s.upper_limit,
            offset: s.offset,
            length: s.length,
            enc_to_rad: 2.0 * PI / s.encoder_steps_per_turn,
            mot_to_rad: 2.0 * PI / s.motor_steps_per_turn,
            joystick_axis: u8::try_from(s.joystick_axis).ok(),
            joystick_invert: s.joystick_invert,
            invert: s.invert,
            max_current: s.max_current,
            hold_current: s.hold_current,
        }
    }
}

fn joint_index(group: &str) -> Option<usize> {
    let digits = group.strip_prefix("Joint")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Joint names are used as keys in the keyframe text form.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '(' || c == ')')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(index: usize, name: &str, address: u8) -> String {
        format!(
            "[Joint{}]\nname = \"{}\"\ntype = \"rotational\"\naddress = {}\nencoder_steps_per_turn = 4000\nmotor_steps_per_turn = 1000\n",
            index, name, address
        )
    }

    #[test]
    fn loads_defaults() {
        let table = JointTable::from_toml_str(&(joint(0, "Base", 1) + &joint(1, "Arm", 2))).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookahead, 200);
        let base = &table.joints[0];
        assert_eq!(base.lower_limit, -1.0);
        assert_eq!(base.upper_limit, 1.0);
        assert_eq!(base.joystick_axis, None);
        assert!((base.enc_to_rad - 2.0 * PI / 4000.0).abs() < 1e-12);
        assert_eq!(base.enc_to_mot(), 64);
    }

    #[test]
    fn address_gap_is_rejected() {
        let text = joint(0, "Base", 1) + &joint(1, "Arm", 3);
        assert_eq!(JointTable::from_toml_str(&text), Err(MotionError::AddressGap(2)));
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let text = joint(0, "Base", 1) + &joint(1, "Arm", 2) + &joint(2, "Wrist", 2);
        assert_eq!(JointTable::from_toml_str(&text), Err(MotionError::DuplicateAddress(2)));
    }

    #[test]
    fn index_gap_is_rejected() {
        let text = joint(0, "Base", 1) + &joint(2, "Arm", 2);
        assert_eq!(JointTable::from_toml_str(&text), Err(MotionError::IndexGap(1)));
    }

    #[test]
    fn bad_group_and_name_and_missing_key() {
        let text = joint(0, "Base", 1) + "[Gripper]\nname = \"x\"\n";
        assert_eq!(JointTable::from_toml_str(&text), Err(MotionError::InvalidGroup("Gripper".to_string())));

        let text = joint(0, "Base joint", 1);
        assert_eq!(JointTable::from_toml_str(&text), Err(MotionError::InvalidName("Base joint".to_string())));

        let text = "[Joint0]\nname = \"Base\"\naddress = 1\n";
        match JointTable::from_toml_str(text) {
            Err(MotionError::MissingSetting { group, key }) => {
                assert_eq!(group, "Joint0");
                assert_eq!(key, "type");
            }
            other => panic!("Expected a missing setting error, got {:?}", other),
        }
    }

    #[test]
    fn tick_conversion_uses_sign_offset_and_bias() {
        let mut table = JointTable::from_toml_str(&joint(0, "Base", 1)).unwrap();
        let j = &mut table.joints[0];
        assert_eq!(j.angle_to_ticks(0.0), POSITION_BIAS as u16);
        let quarter = PI / 2.0;
        assert_eq!(j.angle_to_ticks(quarter), POSITION_BIAS as u16 + 1000);
        j.invert = true;
        assert_eq!(j.angle_to_ticks(quarter), POSITION_BIAS as u16 - 1000);
        assert!((j.ticks_to_angle(-1000) - quarter).abs() < 1e-9);
        assert_eq!(j.velocity_to_motor(0.0), 1);
    }
}
