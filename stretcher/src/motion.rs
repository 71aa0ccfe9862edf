//! Synchronized dual-stage motion.
//!
//! The two stages grip opposite ends of the sample, so a stretch is always
//! a mirrored pair of moves: each stage travels half the length change at
//! half the commanded speed, toward a shared absolute target measured from
//! the calibrated zero position. [`StagePair`] composes those pairs on top
//! of the shared [`StageLink`], issuing each pair under a single lock
//! acquisition so polling reads never interleave with half an update.

use std::sync::{Arc, Mutex};

use hardware::zaber::{LinkError, StageId, StageLink, StepScale};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the motion layer.
#[derive(Error, Debug)]
pub enum MotionError {
    /// Operation attempted without an open link.
    #[error("not connected")]
    NotConnected,

    /// Underlying link failure.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// One or both stages failed to acknowledge the stop write.
    #[error("stop incomplete: {} of 2 stages failed", .failures.len())]
    StopIncomplete {
        /// Which stages failed and how.
        failures: Vec<(StageId, LinkError)>,
    },
}

/// Result type for motion operations.
pub type MotionResult<T> = Result<T, MotionError>;

/// One combined-length reading of the stage pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthSample {
    /// Sum of both stages' distances from the zero position, in steps.
    /// Zero when the sample is at rest length.
    pub extension_steps: i32,
    /// Combined sample length in millimeters.
    pub length_mm: f64,
}

/// Symmetric motion controller for the stage pair.
///
/// Cheap to clone; clones share the same link and calibration.
#[derive(Clone)]
pub struct StagePair {
    link: Arc<Mutex<StageLink>>,
    zero_position: i32,
    rest_length_mm: f64,
}

impl StagePair {
    /// Wrap a shared link with the rig's calibration.
    ///
    /// # Arguments
    ///
    /// * `zero_position` - stage position (steps) where the grips just
    ///   touch the sample
    /// * `rest_length_mm` - sample length when both stages sit at
    ///   `zero_position`
    pub fn new(link: Arc<Mutex<StageLink>>, zero_position: i32, rest_length_mm: f64) -> Self {
        Self {
            link,
            zero_position,
            rest_length_mm,
        }
    }

    /// Sample length when unstretched, in mm.
    pub fn rest_length_mm(&self) -> f64 {
        self.rest_length_mm
    }

    // ==================== Lifecycle ====================

    /// Open the port and discover both stages.
    pub fn connect(&self, port: &str) -> MotionResult<()> {
        self.link.lock().unwrap().connect(port)?;
        Ok(())
    }

    /// Release the serial channel.
    pub fn disconnect(&self) -> MotionResult<()> {
        self.link.lock().unwrap().disconnect()?;
        Ok(())
    }

    /// True while the link is open.
    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().is_connected()
    }

    // ==================== Motion ====================

    /// Home both stages with one broadcast frame.
    ///
    /// Does not block until homing completes; the firmware only replies
    /// once each stage reaches home, and nothing waits for that. Callers
    /// treat the homed state as optimistic.
    pub fn home(&self) -> MotionResult<()> {
        let mut link = self.connected_link()?;
        info!("homing both stages");
        link.home_all()?;
        Ok(())
    }

    /// Move the sample to an absolute length.
    ///
    /// Each stage gets half the commanded speed, then the same absolute
    /// step target derived from the zero position. Positive lengths above
    /// the rest length stretch the sample.
    ///
    /// # Arguments
    ///
    /// * `target_mm` - combined sample length to move to
    /// * `speed_mm_per_sec` - closure speed of the whole sample; each
    ///   stage moves at half this
    ///
    /// # Errors
    ///
    /// [`MotionError::NotConnected`] without a link; link failures
    /// otherwise. The move itself is fire-and-forget.
    pub fn move_to_length(&self, target_mm: f64, speed_mm_per_sec: f64) -> MotionResult<()> {
        let mut link = self.connected_link()?;
        let steps = self.shared_target_steps(target_mm, link.scale());
        info!("move to {target_mm} mm at {speed_mm_per_sec} mm/s (stage target {steps} steps)");
        for id in StageId::ALL {
            link.set_target_speed(id, speed_mm_per_sec / 2.0)?;
        }
        for id in StageId::ALL {
            link.move_absolute(id, steps)?;
        }
        Ok(())
    }

    /// Change the sample length by a signed amount.
    ///
    /// Positive `delta_mm` stretches: both stages move outward by half the
    /// delta. Mirrors [`move_to_length`](Self::move_to_length) in speed
    /// handling.
    pub fn move_by(&self, delta_mm: f64, speed_mm_per_sec: f64) -> MotionResult<()> {
        let mut link = self.connected_link()?;
        let delta_steps = link.scale().mm_to_steps(-delta_mm / 2.0);
        info!("move by {delta_mm:+} mm at {speed_mm_per_sec} mm/s ({delta_steps:+} steps per stage)");
        for id in StageId::ALL {
            link.set_target_speed(id, speed_mm_per_sec / 2.0)?;
        }
        for id in StageId::ALL {
            link.move_relative(id, delta_steps)?;
        }
        Ok(())
    }

    /// Move back to the unstretched rest length.
    pub fn return_to_rest(&self, speed_mm_per_sec: f64) -> MotionResult<()> {
        self.move_to_length(self.rest_length_mm, speed_mm_per_sec)
    }

    /// Stop both stages.
    ///
    /// Best-effort: a failure on one stage never prevents the stop write
    /// to the other. Failures are collected into
    /// [`MotionError::StopIncomplete`].
    pub fn stop(&self) -> MotionResult<()> {
        let mut link = self.connected_link()?;
        let mut failures = Vec::new();
        for id in StageId::ALL {
            if let Err(e) = link.stop(id) {
                warn!("stop failed on stage {id}: {e}");
                failures.push((id, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MotionError::StopIncomplete { failures })
        }
    }

    // ==================== Reads ====================

    /// Read both stage positions in steps.
    ///
    /// The stages mirror each other during normal operation; a
    /// disagreement is logged as a diagnostic, not treated as an error.
    pub fn positions(&self) -> MotionResult<(i32, i32)> {
        let mut link = self.connected_link()?;
        Self::read_pair(&mut link)
    }

    /// Read both positions and derive the combined sample length.
    pub fn sample(&self) -> MotionResult<LengthSample> {
        let mut link = self.connected_link()?;
        let (p1, p2) = Self::read_pair(&mut link)?;
        let extension_steps = (self.zero_position - p1) + (self.zero_position - p2);
        let length_mm = link.scale().steps_to_mm(extension_steps) + self.rest_length_mm;
        Ok(LengthSample {
            extension_steps,
            length_mm,
        })
    }

    /// Combined sample length in mm.
    pub fn sample_length(&self) -> MotionResult<f64> {
        Ok(self.sample()?.length_mm)
    }

    // ==================== Helpers ====================

    /// Absolute step target both stages share for a given sample length.
    /// Each stage covers half the length change, moving toward the sample
    /// (below zero position) to stretch.
    fn shared_target_steps(&self, target_mm: f64, scale: StepScale) -> i32 {
        self.zero_position - scale.mm_to_steps((target_mm - self.rest_length_mm) / 2.0)
    }

    fn connected_link(&self) -> MotionResult<std::sync::MutexGuard<'_, StageLink>> {
        let link = self.link.lock().unwrap();
        if !link.is_connected() {
            return Err(MotionError::NotConnected);
        }
        Ok(link)
    }

    fn read_pair(link: &mut StageLink) -> MotionResult<(i32, i32)> {
        let p1 = link.read_position(StageId::One)?;
        let p2 = link.read_position(StageId::Two)?;
        if p1 != p2 {
            debug!("stage positions differ: {p1} vs {p2}");
        }
        Ok((p1, p2))
    }
}
