//! Motor settings
//!
//! The eleven tunables sent to the motor server before a session starts.
//! Each field has a fixed valid range and default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Valid range and default of one settings field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingRange {
    /// Wire name of the field
    pub name: &'static str,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl SettingRange {
    const fn new(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self {
            name,
            min,
            max,
            default,
        }
    }

    /// Check whether a value lies inside the range (bounds inclusive)
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Ranges in wire order
pub const SETTING_RANGES: [SettingRange; 11] = [
    SettingRange::new("positionKp", 0.5, 15.0, 8.0),
    SettingRange::new("positionKd", 0.01, 3.0, 0.8),
    SettingRange::new("movementSpeed", 0.1, 2.0, 0.8),
    SettingRange::new("maxVelocity", 0.5, 10.0, 4.0),
    SettingRange::new("upperPositionLimit", 0.5, 2.5, 1.8),
    SettingRange::new("lowerPositionLimit", -2.5, -0.5, -1.8),
    SettingRange::new("extensionStrengthScale", 0.3, 1.5, 1.0),
    SettingRange::new("flexionStrengthScale", 0.3, 1.5, 1.0),
    SettingRange::new("minMovementThreshold", 0.05, 0.3, 0.1),
    SettingRange::new("smoothingFactor", 0.01, 0.3, 0.05),
    SettingRange::new("deadzoneThreshold", 0.0, 0.2, 0.05),
];

/// Motor tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MotorSettings {
    /// Position controller stiffness
    pub position_kp: f32,
    /// Position controller damping
    pub position_kd: f32,
    pub movement_speed: f32,

    /// Safety limits
    pub max_velocity: f32,
    pub upper_position_limit: f32,
    pub lower_position_limit: f32,

    /// Strength scaling
    pub extension_strength_scale: f32,
    pub flexion_strength_scale: f32,
    pub min_movement_threshold: f32,

    /// Comfort
    pub smoothing_factor: f32,
    pub deadzone_threshold: f32,
}

impl Default for MotorSettings {
    fn default() -> Self {
        let [kp, kd, speed, vel, upper, lower, ext, flex, threshold, smoothing, deadzone] =
            SETTING_RANGES.map(|r| r.default);
        Self {
            position_kp: kp,
            position_kd: kd,
            movement_speed: speed,
            max_velocity: vel,
            upper_position_limit: upper,
            lower_position_limit: lower,
            extension_strength_scale: ext,
            flexion_strength_scale: flex,
            min_movement_threshold: threshold,
            smoothing_factor: smoothing,
            deadzone_threshold: deadzone,
        }
    }
}

impl MotorSettings {
    /// Field values in the same order as `SETTING_RANGES`
    pub fn values(&self) -> [f32; 11] {
        [
            self.position_kp,
            self.position_kd,
            self.movement_speed,
            self.max_velocity,
            self.upper_position_limit,
            self.lower_position_limit,
            self.extension_strength_scale,
            self.flexion_strength_scale,
            self.min_movement_threshold,
            self.smoothing_factor,
            self.deadzone_threshold,
        ]
    }

    fn from_values(v: [f32; 11]) -> Self {
        Self {
            position_kp: v[0],
            position_kd: v[1],
            movement_speed: v[2],
            max_velocity: v[3],
            upper_position_limit: v[4],
            lower_position_limit: v[5],
            extension_strength_scale: v[6],
            flexion_strength_scale: v[7],
            min_movement_threshold: v[8],
            smoothing_factor: v[9],
            deadzone_threshold: v[10],
        }
    }

    /// Report the first field that is not finite or lies outside its range
    pub fn validate(&self) -> SettingsResult<()> {
        for (range, value) in SETTING_RANGES.iter().zip(self.values()) {
            if !value.is_finite() {
                return Err(SettingsError::NotFinite { field: range.name });
            }
            if !range.contains(value) {
                return Err(SettingsError::OutOfRange {
                    field: range.name,
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }

    /// Copy with every field pulled into its range (non-finite fields fall back to the default)
    pub fn clamped(&self) -> Self {
        let mut values = self.values();
        for (value, range) in values.iter_mut().zip(SETTING_RANGES.iter()) {
            *value = if value.is_finite() {
                value.clamp(range.min, range.max)
            } else {
                range.default
            };
        }
        Self::from_values(values)
    }

    /// Serialize to the flat JSON object the motor server expects
    pub fn to_json(&self) -> SettingsResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SettingsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let settings = MotorSettings::default();
        assert_ok!(settings.validate());
        assert_eq!(settings.position_kp, 8.0);
        assert_eq!(settings.lower_position_limit, -1.8);
        assert_eq!(settings.deadzone_threshold, 0.05);
    }

    #[test]
    fn test_out_of_range_names_field() {
        let settings = MotorSettings {
            max_velocity: 12.0,
            ..Default::default()
        };
        match settings.validate() {
            Err(SettingsError::OutOfRange { field, .. }) => assert_eq!(field, "maxVelocity"),
            other => panic!("Expected out of range, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_is_rejected() {
        let settings = MotorSettings {
            smoothing_factor: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::NotFinite {
                field: "smoothingFactor"
            })
        ));
        assert_eq!(settings.clamped().smoothing_factor, 0.05);
    }

    #[test]
    fn test_clamped() {
        let settings = MotorSettings {
            position_kp: 100.0,
            lower_position_limit: 0.0,
            ..Default::default()
        };
        let clamped = settings.clamped();
        assert_eq!(clamped.position_kp, 15.0);
        assert_eq!(clamped.lower_position_limit, -0.5);
        assert_ok!(clamped.validate());
        assert_err!(settings.validate());
    }

    #[test]
    fn test_json_uses_wire_names() {
        let json = MotorSettings::default().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 11);
        for range in SETTING_RANGES.iter() {
            assert!(object[range.name].is_number(), "missing {}", range.name);
        }

        let parsed = MotorSettings::from_json(&json).unwrap();
        assert_eq!(parsed, MotorSettings::default());
    }

    #[test]
    fn test_bad_json_keeps_source() {
        let err = assert_err!(MotorSettings::from_json(r#"{"positionKp": "stiff"}"#));
        assert!(matches!(err, SettingsError::Json(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
