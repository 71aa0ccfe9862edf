//! Control core for the dual-stage sample stretcher.
//!
//! Two linear actuators grip opposite ends of a sample and stretch it
//! symmetrically over a Zaber binary serial link (the `hardware` crate).
//! This crate layers the bench logic on top: calibration config, the
//! symmetric motion controller, the countdown-and-move protocol
//! sequencer, the hands-free pointer trigger, and the background status
//! poller that infers run state from position samples. Front ends attach
//! by draining the [`events::BenchEvent`] bus.

pub mod config;
pub mod events;
pub mod motion;
pub mod sequencer;
pub mod status;
pub mod trigger;

pub use config::RigConfig;
pub use events::{BenchEvent, RunStatus};
pub use motion::{LengthSample, MotionError, MotionResult, StagePair};
pub use sequencer::{
    ParamError, ProtocolSequencer, ProtocolState, SequencerError, StretchParams,
};
pub use status::StatusPoller;
pub use trigger::{
    PointerEvent, PointerSource, TriggerArmer, TriggerOutcome, TriggerSession, TriggerSignal,
    RELEASE_THRESHOLD,
};

#[cfg(target_os = "linux")]
pub use trigger::MiceSource;
