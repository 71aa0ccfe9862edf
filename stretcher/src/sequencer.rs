//! Stretch protocol sequencing.
//!
//! A protocol run is: validate parameters, count down the pause, then issue
//! one symmetric absolute move and return to idle. The sequencer never
//! waits for the stages to arrive; completion is observed by the status
//! poller. Parameters are canonically strain-based, with the
//! `{target length, speed}` form converted at construction.

use std::fmt;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::BenchEvent;
use crate::motion::{MotionError, StagePair};

/// Parameter validation errors, caught before anything reaches the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ParamError {
    /// Rest length must be finite and positive.
    #[error("rest length must be positive, got {0} mm")]
    InvalidRestLength(f64),

    /// Strain must be finite and leave a non-negative target length.
    #[error("strain must be finite and at least -100 %, got {0} %")]
    InvalidStrain(f64),

    /// Strain rate must be finite and positive.
    #[error("strain rate must be positive, got {0} %/s")]
    InvalidStrainRate(f64),

    /// Target length must be finite and non-negative.
    #[error("target length must be non-negative, got {0} mm")]
    InvalidTargetLength(f64),

    /// Speed must be finite and positive.
    #[error("speed must be positive, got {0} mm/s")]
    InvalidSpeed(f64),
}

/// Validated stretch protocol parameters.
///
/// Strain-based internally. Construction is the validation boundary: a
/// `StretchParams` that exists is safe to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchParams {
    rest_length_mm: f64,
    strain_pct: f64,
    strain_rate_pct_per_sec: f64,
    pause_s: u64,
}

impl StretchParams {
    /// Build from the strain form.
    ///
    /// # Arguments
    ///
    /// * `rest_length_mm` - unstretched sample length L0
    /// * `strain_pct` - target strain as a percentage of L0
    /// * `strain_rate_pct_per_sec` - stretch rate in % of L0 per second
    /// * `pause_s` - countdown seconds between commit and motion
    pub fn from_strain(
        rest_length_mm: f64,
        strain_pct: f64,
        strain_rate_pct_per_sec: f64,
        pause_s: u64,
    ) -> Result<Self, ParamError> {
        if !rest_length_mm.is_finite() || rest_length_mm <= 0.0 {
            return Err(ParamError::InvalidRestLength(rest_length_mm));
        }
        if !strain_pct.is_finite() || strain_pct < -100.0 {
            return Err(ParamError::InvalidStrain(strain_pct));
        }
        if !strain_rate_pct_per_sec.is_finite() || strain_rate_pct_per_sec <= 0.0 {
            return Err(ParamError::InvalidStrainRate(strain_rate_pct_per_sec));
        }
        Ok(Self {
            rest_length_mm,
            strain_pct,
            strain_rate_pct_per_sec,
            pause_s,
        })
    }

    /// Build from the `{target length, speed}` form, converting to strain.
    pub fn from_target_length(
        rest_length_mm: f64,
        target_length_mm: f64,
        speed_mm_per_sec: f64,
        pause_s: u64,
    ) -> Result<Self, ParamError> {
        if !rest_length_mm.is_finite() || rest_length_mm <= 0.0 {
            return Err(ParamError::InvalidRestLength(rest_length_mm));
        }
        if !target_length_mm.is_finite() || target_length_mm < 0.0 {
            return Err(ParamError::InvalidTargetLength(target_length_mm));
        }
        if !speed_mm_per_sec.is_finite() || speed_mm_per_sec <= 0.0 {
            return Err(ParamError::InvalidSpeed(speed_mm_per_sec));
        }
        Self::from_strain(
            rest_length_mm,
            (target_length_mm / rest_length_mm - 1.0) * 100.0,
            speed_mm_per_sec / rest_length_mm * 100.0,
            pause_s,
        )
    }

    /// Unstretched sample length L0, in mm.
    pub fn rest_length_mm(&self) -> f64 {
        self.rest_length_mm
    }

    /// Target strain in % of L0.
    pub fn strain_pct(&self) -> f64 {
        self.strain_pct
    }

    /// Stretch rate in % of L0 per second.
    pub fn strain_rate_pct_per_sec(&self) -> f64 {
        self.strain_rate_pct_per_sec
    }

    /// Countdown length in whole seconds.
    pub fn pause_s(&self) -> u64 {
        self.pause_s
    }

    /// Absolute sample length the protocol moves to, in mm.
    pub fn target_length_mm(&self) -> f64 {
        self.rest_length_mm * (1.0 + self.strain_pct / 100.0)
    }

    /// Whole-sample closure speed of the move, in mm/s. Halved per stage
    /// by the motion layer.
    pub fn speed_mm_per_sec(&self) -> f64 {
        self.strain_rate_pct_per_sec / 100.0 * self.rest_length_mm
    }
}

/// Protocol machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Nothing armed or running.
    Idle,
    /// Trigger listening, no releases seen yet.
    Armed,
    /// Trigger releases observed, threshold not reached.
    Counting,
    /// Commit signalled; countdown in progress.
    Committed,
    /// Move issued, not yet observed complete.
    Moving,
    /// Trigger reached the cancel threshold; resets to idle.
    Cancelled,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolState::Idle => "idle",
            ProtocolState::Armed => "armed",
            ProtocolState::Counting => "counting",
            ProtocolState::Committed => "committed",
            ProtocolState::Moving => "moving",
            ProtocolState::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// Errors from protocol sequencing.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// The committed move failed; the machine has returned to idle.
    #[error("committed move failed: {0}")]
    Motion(#[from] MotionError),

    /// Operation not legal in the current state.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        /// What was attempted.
        action: &'static str,
        /// State the machine was in.
        state: ProtocolState,
    },
}

/// Runs the stretch protocol against a stage pair.
///
/// Owns the machine state; countdown and move run on the caller's thread.
/// The stage link is only locked per command, so the poller keeps running
/// through the countdown.
pub struct ProtocolSequencer {
    pair: StagePair,
    events: Sender<BenchEvent>,
    state: ProtocolState,
    tick: Duration,
}

impl ProtocolSequencer {
    /// Sequencer with the standard one-second countdown tick.
    pub fn new(pair: StagePair, events: Sender<BenchEvent>) -> Self {
        Self::with_tick_interval(pair, events, Duration::from_secs(1))
    }

    /// Sequencer with an explicit countdown tick period.
    pub fn with_tick_interval(pair: StagePair, events: Sender<BenchEvent>, tick: Duration) -> Self {
        Self {
            pair,
            events,
            state: ProtocolState::Idle,
            tick,
        }
    }

    /// Current machine state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Enter the armed state: a trigger is now listening.
    pub fn arm(&mut self) -> Result<(), SequencerError> {
        match self.state {
            ProtocolState::Idle => {
                self.transition(ProtocolState::Armed);
                Ok(())
            }
            state => Err(SequencerError::InvalidTransition {
                action: "arm",
                state,
            }),
        }
    }

    /// Record that the armed trigger has started counting releases.
    /// A no-op unless armed.
    pub fn note_count(&mut self) {
        match self.state {
            ProtocolState::Armed => self.transition(ProtocolState::Counting),
            ProtocolState::Counting => {}
            state => warn!("trigger count observed while {state}"),
        }
    }

    /// Cancel an armed or counting trigger and return to idle.
    pub fn cancel(&mut self) -> Result<(), SequencerError> {
        match self.state {
            ProtocolState::Armed | ProtocolState::Counting => {
                self.transition(ProtocolState::Cancelled);
                self.transition(ProtocolState::Idle);
                Ok(())
            }
            state => Err(SequencerError::InvalidTransition {
                action: "cancel",
                state,
            }),
        }
    }

    /// Run the committed protocol: countdown, then the symmetric move.
    ///
    /// Legal from idle (direct start) and from armed/counting (trigger
    /// commit). Blocks through the countdown, emitting one
    /// [`BenchEvent::CountdownTick`] per second; the countdown cannot be
    /// cancelled once started. Returns as soon as the move is issued.
    ///
    /// # Errors
    ///
    /// [`SequencerError::Motion`] if the move fails; the machine is back
    /// in idle either way.
    pub fn commit(&mut self, params: &StretchParams) -> Result<(), SequencerError> {
        match self.state {
            ProtocolState::Idle | ProtocolState::Armed | ProtocolState::Counting => {}
            state => {
                return Err(SequencerError::InvalidTransition {
                    action: "commit",
                    state,
                })
            }
        }

        let target_mm = params.target_length_mm();
        let speed = params.speed_mm_per_sec();
        self.transition(ProtocolState::Committed);
        info!(
            "protocol committed: target {target_mm} mm, speed {speed} mm/s, pause {} s",
            params.pause_s
        );

        for seconds_remaining in (1..=params.pause_s).rev() {
            let _ = self.events.send(BenchEvent::CountdownTick { seconds_remaining });
            thread::sleep(self.tick);
        }

        self.transition(ProtocolState::Moving);
        let result = self.pair.move_to_length(target_mm, speed);
        if result.is_ok() {
            let _ = self.events.send(BenchEvent::MoveStarted {
                target_mm,
                speed_mm_per_sec: speed,
            });
        }
        self.transition(ProtocolState::Idle);
        result?;
        Ok(())
    }

    fn transition(&mut self, to: ProtocolState) {
        info!("protocol state: {} -> {to}", self.state);
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crossbeam_channel::unbounded;
    use hardware::zaber::mock::{CommandLog, MockTransport};
    use hardware::zaber::{command, Packet, StageLink};
    use std::sync::{Arc, Mutex};

    fn connected_pair(log: &CommandLog, extra_replies: &[Packet]) -> StagePair {
        let mut replies = vec![
            Packet::new(1, command::RETURN_DEVICE_ID, 6210),
            Packet::new(2, command::RETURN_DEVICE_ID, 6210),
        ];
        replies.extend_from_slice(extra_replies);
        let mut link = StageLink::new();
        link.connect_with(MockTransport::new(log, &replies)).unwrap();
        StagePair::new(Arc::new(Mutex::new(link)), 503_937, 12.0)
    }

    fn disconnected_pair() -> StagePair {
        StagePair::new(Arc::new(Mutex::new(StageLink::new())), 503_937, 12.0)
    }

    #[test]
    fn test_strain_form_reference_case() {
        let params = StretchParams::from_strain(12.0, 50.0, 0.5, 10).unwrap();
        assert_relative_eq!(params.target_length_mm(), 18.0);
        assert_relative_eq!(params.speed_mm_per_sec(), 0.06);
        assert_eq!(params.pause_s(), 10);
    }

    #[test]
    fn test_fast_strain_rate() {
        let params = StretchParams::from_strain(12.0, 50.0, 50.0, 10).unwrap();
        assert_relative_eq!(params.speed_mm_per_sec(), 6.0);
    }

    #[test]
    fn test_target_length_form_converts_to_strain() {
        let params = StretchParams::from_target_length(12.0, 18.0, 0.06, 10).unwrap();
        assert_relative_eq!(params.strain_pct(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(params.strain_rate_pct_per_sec(), 0.5, epsilon = 1e-9);
        assert_relative_eq!(params.target_length_mm(), 18.0, epsilon = 1e-9);
    }

    #[test]
    fn test_parameter_validation() {
        assert_eq!(
            StretchParams::from_strain(0.0, 50.0, 0.5, 10),
            Err(ParamError::InvalidRestLength(0.0))
        );
        assert_eq!(
            StretchParams::from_strain(-12.0, 50.0, 0.5, 10),
            Err(ParamError::InvalidRestLength(-12.0))
        );
        assert!(StretchParams::from_strain(f64::NAN, 50.0, 0.5, 10).is_err());
        assert_eq!(
            StretchParams::from_strain(12.0, -150.0, 0.5, 10),
            Err(ParamError::InvalidStrain(-150.0))
        );
        assert!(StretchParams::from_strain(12.0, f64::INFINITY, 0.5, 10).is_err());
        assert_eq!(
            StretchParams::from_strain(12.0, 50.0, 0.0, 10),
            Err(ParamError::InvalidStrainRate(0.0))
        );
        assert_eq!(
            StretchParams::from_target_length(12.0, -1.0, 0.06, 10),
            Err(ParamError::InvalidTargetLength(-1.0))
        );
        assert_eq!(
            StretchParams::from_target_length(12.0, 18.0, 0.0, 10),
            Err(ParamError::InvalidSpeed(0.0))
        );
    }

    #[test]
    fn test_shrink_to_zero_length_is_valid() {
        let params = StretchParams::from_strain(12.0, -100.0, 0.5, 0).unwrap();
        assert_relative_eq!(params.target_length_mm(), 0.0);
    }

    #[test]
    fn test_commit_counts_down_then_moves() {
        let log = CommandLog::default();
        let pair = connected_pair(
            &log,
            &[
                Packet::new(1, command::SET_TARGET_SPEED, 1032),
                Packet::new(2, command::SET_TARGET_SPEED, 1032),
            ],
        );
        let (tx, rx) = unbounded();
        let mut sequencer =
            ProtocolSequencer::with_tick_interval(pair, tx, Duration::from_millis(2));
        let params = StretchParams::from_strain(12.0, 50.0, 0.5, 3).unwrap();

        sequencer.commit(&params).unwrap();
        assert_eq!(sequencer.state(), ProtocolState::Idle);

        let events: Vec<BenchEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        for (event, expected) in events.iter().zip([3, 2, 1]) {
            assert_eq!(
                *event,
                BenchEvent::CountdownTick {
                    seconds_remaining: expected
                }
            );
        }
        match events[3] {
            BenchEvent::MoveStarted {
                target_mm,
                speed_mm_per_sec,
            } => {
                assert_relative_eq!(target_mm, 18.0);
                assert_relative_eq!(speed_mm_per_sec, 0.06, epsilon = 1e-12);
            }
            ref other => panic!("expected MoveStarted, got {other:?}"),
        }

        let moves = log.with_command(command::MOVE_ABSOLUTE);
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].data, 440_945);
        assert_eq!(moves[1].data, 440_945);
    }

    #[test]
    fn test_zero_pause_skips_countdown() {
        let log = CommandLog::default();
        let pair = connected_pair(
            &log,
            &[
                Packet::new(1, command::SET_TARGET_SPEED, 1032),
                Packet::new(2, command::SET_TARGET_SPEED, 1032),
            ],
        );
        let (tx, rx) = unbounded();
        let mut sequencer =
            ProtocolSequencer::with_tick_interval(pair, tx, Duration::from_millis(2));
        let params = StretchParams::from_strain(12.0, 50.0, 0.5, 0).unwrap();

        sequencer.commit(&params).unwrap();

        let events: Vec<BenchEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BenchEvent::MoveStarted { .. }));
    }

    #[test]
    fn test_commit_failure_returns_to_idle() {
        let (tx, rx) = unbounded();
        let mut sequencer = ProtocolSequencer::with_tick_interval(
            disconnected_pair(),
            tx,
            Duration::from_millis(1),
        );
        let params = StretchParams::from_strain(12.0, 50.0, 0.5, 1).unwrap();

        let err = sequencer.commit(&params).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::Motion(MotionError::NotConnected)
        ));
        assert_eq!(sequencer.state(), ProtocolState::Idle);

        // the tick still fired, but no move was announced
        let events: Vec<BenchEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![BenchEvent::CountdownTick {
                seconds_remaining: 1
            }]
        );
    }

    #[test]
    fn test_trigger_path_transitions() {
        let (tx, _rx) = unbounded();
        let mut sequencer = ProtocolSequencer::new(disconnected_pair(), tx);

        sequencer.arm().unwrap();
        assert_eq!(sequencer.state(), ProtocolState::Armed);

        sequencer.note_count();
        assert_eq!(sequencer.state(), ProtocolState::Counting);
        sequencer.note_count();
        assert_eq!(sequencer.state(), ProtocolState::Counting);

        sequencer.cancel().unwrap();
        assert_eq!(sequencer.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_arm_twice_is_rejected() {
        let (tx, _rx) = unbounded();
        let mut sequencer = ProtocolSequencer::new(disconnected_pair(), tx);

        sequencer.arm().unwrap();
        let err = sequencer.arm().unwrap_err();
        assert!(matches!(
            err,
            SequencerError::InvalidTransition {
                action: "arm",
                state: ProtocolState::Armed
            }
        ));
    }

    #[test]
    fn test_cancel_requires_armed() {
        let (tx, _rx) = unbounded();
        let mut sequencer = ProtocolSequencer::new(disconnected_pair(), tx);

        let err = sequencer.cancel().unwrap_err();
        assert!(matches!(
            err,
            SequencerError::InvalidTransition {
                action: "cancel",
                state: ProtocolState::Idle
            }
        ));
    }

    #[test]
    fn test_commit_from_counting() {
        let log = CommandLog::default();
        let pair = connected_pair(
            &log,
            &[
                Packet::new(1, command::SET_TARGET_SPEED, 1032),
                Packet::new(2, command::SET_TARGET_SPEED, 1032),
            ],
        );
        let (tx, _rx) = unbounded();
        let mut sequencer =
            ProtocolSequencer::with_tick_interval(pair, tx, Duration::from_millis(1));
        let params = StretchParams::from_strain(12.0, 50.0, 0.5, 0).unwrap();

        sequencer.arm().unwrap();
        sequencer.note_count();
        sequencer.commit(&params).unwrap();
        assert_eq!(sequencer.state(), ProtocolState::Idle);
    }
}
