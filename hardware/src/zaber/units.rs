//! Unit conversion between physical lengths/speeds and device units
//!
//! Positions are commanded in microsteps; target speed is a register whose
//! unit is microsteps per 1.6384 s timer tick.

/// Microstep size of the stage leadscrew, in micrometers per step.
pub const DEFAULT_MICROSTEP_UM: f64 = 0.047625;

/// Period of the firmware speed timer, in seconds. The target-speed
/// register counts microsteps per tick.
pub const SPEED_TIMEBASE_S: f64 = 1.6384;

/// Conversion scale for one stage model.
///
/// The microstep size is a per-rig calibration constant; the default
/// matches the T-LA series actuators the rig is built on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScale {
    microstep_um: f64,
}

impl StepScale {
    /// Create a scale with an explicit microstep size in µm.
    pub fn new(microstep_um: f64) -> Self {
        Self { microstep_um }
    }

    /// Microstep size in µm.
    pub fn microstep_um(&self) -> f64 {
        self.microstep_um
    }

    /// Convert a length in millimeters to microsteps.
    ///
    /// Total over all finite inputs; negative lengths are valid and denote
    /// direction. Rounds half away from zero (`f64::round`).
    pub fn mm_to_steps(&self, mm: f64) -> i32 {
        (mm * 1000.0 / self.microstep_um).round() as i32
    }

    /// Convert microsteps to millimeters.
    ///
    /// Inverse of [`mm_to_steps`](Self::mm_to_steps) up to rounding; the
    /// round trip is accurate to within one step (≈ 0.0000476 mm).
    pub fn steps_to_mm(&self, steps: i32) -> f64 {
        steps as f64 * self.microstep_um / 1000.0
    }

    /// Convert a speed in mm/s to the target-speed register value.
    pub fn mm_per_sec_to_data(&self, mm_per_sec: f64) -> i32 {
        (mm_per_sec * 1000.0 / self.microstep_um * SPEED_TIMEBASE_S).round() as i32
    }

    /// Convert a target-speed register value to mm/s.
    pub fn data_to_mm_per_sec(&self, data: i32) -> f64 {
        data as f64 / SPEED_TIMEBASE_S * self.microstep_um / 1000.0
    }
}

impl Default for StepScale {
    fn default() -> Self {
        Self::new(DEFAULT_MICROSTEP_UM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mm_to_steps_reference_values() {
        let scale = StepScale::default();
        assert_eq!(scale.mm_to_steps(0.0), 0);
        // 1000 / 0.047625 = 20997.375... rounds down
        assert_eq!(scale.mm_to_steps(1.0), 20997);
        // 12000 / 0.047625 = 251968.503... rounds up
        assert_eq!(scale.mm_to_steps(12.0), 251969);
    }

    #[test]
    fn test_negative_lengths_mirror() {
        let scale = StepScale::default();
        assert_eq!(scale.mm_to_steps(-1.0), -20997);
        assert_eq!(scale.mm_to_steps(-12.0), -251969);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let scale = StepScale::default();
        for mm in [0.0, 0.5, 1.0, 3.0, 12.0, 18.0, 24.0, -6.0] {
            let back = scale.steps_to_mm(scale.mm_to_steps(mm));
            assert_relative_eq!(back, mm, epsilon = 0.0000477);
        }
    }

    #[test]
    fn test_steps_to_mm() {
        let scale = StepScale::default();
        assert_relative_eq!(scale.steps_to_mm(503937), 23.999999625, epsilon = 1e-9);
        assert_eq!(scale.steps_to_mm(0), 0.0);
    }

    #[test]
    fn test_speed_register_values() {
        let scale = StepScale::default();
        // 5 mm/s * 1000 / 0.047625 * 1.6384 = 172010.498...
        assert_eq!(scale.mm_per_sec_to_data(5.0), 172010);
        // protocol default stretch rate: 0.06 mm/s
        assert_eq!(scale.mm_per_sec_to_data(0.06), 2064);
        assert_eq!(scale.mm_per_sec_to_data(0.0), 0);
    }

    #[test]
    fn test_speed_round_trip() {
        let scale = StepScale::default();
        for mm_per_sec in [0.06, 0.5, 2.5, 5.0] {
            let back = scale.data_to_mm_per_sec(scale.mm_per_sec_to_data(mm_per_sec));
            assert_relative_eq!(back, mm_per_sec, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_custom_microstep() {
        let scale = StepScale::new(0.09525);
        assert_eq!(scale.mm_to_steps(1.0), 10499);
    }
}
