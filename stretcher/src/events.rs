//! Events published by the control core for display surfaces.
//!
//! The poller and sequencer hold cloned senders onto one
//! `crossbeam_channel`; trigger signals are translated onto the same bus
//! by whoever runs the protocol. Whatever front end is attached (the
//! `stretch_bench` binary, for now) drains the receiver and renders.

use std::fmt;

/// Run status derived by the poller each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No link, or position reads are failing
    Disconnected,
    /// Sample length unchanged since the previous sample
    Idle,
    /// Sample length changed since the previous sample
    Running,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Disconnected => "disconnected",
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
        };
        write!(f, "{label}")
    }
}

/// One message on the bench event bus.
///
/// Connection state rides on [`Status`](BenchEvent::Status):
/// [`RunStatus::Disconnected`] is emitted whenever the link goes away.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchEvent {
    /// Countdown in progress; fires once per second
    CountdownTick { seconds_remaining: u64 },
    /// Committed protocol move issued to both stages
    MoveStarted {
        target_mm: f64,
        speed_mm_per_sec: f64,
    },
    /// Derived run status changed
    Status(RunStatus),
    /// Combined sample length from the latest poll
    Length { mm: f64 },
    /// Trigger release counts changed
    TriggerCount { primary: u32, secondary: u32 },
    /// Trigger reached the commit threshold
    TriggerCommitted,
    /// Trigger reached the cancel threshold
    TriggerCancelled,
}
