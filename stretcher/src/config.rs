//! Rig configuration for the stretch bench.
//!
//! Stores the serial port, stage calibration, and default protocol parameters
//! as determined during bench commissioning. Configs persist as JSON so a rig
//! can be re-run without re-entering calibration numbers.

use hardware::zaber::{StepScale, DEFAULT_MICROSTEP_UM};
use serde::{Deserialize, Serialize};

/// Calibration and defaults for one stretcher rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Serial port the stage pair is attached to
    pub port: String,
    /// Linear travel per microstep in micrometers
    pub microstep_um: f64,
    /// Stage position (in microsteps) at which the grips just touch the sample
    pub zero_position: i32,
    /// Sample rest length in millimeters when both stages sit at `zero_position`
    pub rest_length_mm: f64,
    /// Stage speed used for homing and manual jogs, in mm/s
    pub default_speed_mm_per_sec: f64,
    /// Default target strain in percent of rest length
    pub default_strain_pct: f64,
    /// Default strain rate in percent of rest length per second
    pub default_strain_rate_pct_per_sec: f64,
    /// Default countdown between trigger commit and motion start, in seconds
    pub default_pause_s: u64,
    /// Status poll period in milliseconds
    pub poll_interval_ms: u64,
}

impl RigConfig {
    /// Step/mm conversion scale for this rig's actuators.
    pub fn scale(&self) -> StepScale {
        StepScale::new(self.microstep_um)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Default for RigConfig {
    /// Calibration values for the reference rig.
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            microstep_um: DEFAULT_MICROSTEP_UM,
            zero_position: 503_937,
            rest_length_mm: 12.0,
            default_speed_mm_per_sec: 5.0,
            default_strain_pct: 50.0,
            default_strain_rate_pct_per_sec: 0.5,
            default_pause_s: 10,
            poll_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn temp_config_path() -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        std::env::temp_dir().join(format!("rig_config_test_{nanos}.json"))
    }

    #[test]
    fn test_default_calibration() {
        let config = RigConfig::default();
        assert_eq!(config.zero_position, 503_937);
        assert_relative_eq!(config.rest_length_mm, 12.0);
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_scale_uses_configured_microstep() {
        let config = RigConfig {
            microstep_um: 0.09525,
            ..Default::default()
        };
        assert_eq!(config.scale().mm_to_steps(1.0), 10_499);
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = temp_config_path();
        let config = RigConfig {
            port: "/dev/ttyUSB1".to_string(),
            default_strain_pct: 25.0,
            ..Default::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = RigConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.port, "/dev/ttyUSB1");
        assert_eq!(loaded.zero_position, config.zero_position);
        assert_relative_eq!(loaded.default_strain_pct, 25.0);
        assert_relative_eq!(loaded.microstep_um, config.microstep_um);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("rig_config_does_not_exist.json");
        assert!(RigConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let path = temp_config_path();
        std::fs::write(&path, "{ not json").unwrap();
        let result = RigConfig::load_from_file(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }
}
