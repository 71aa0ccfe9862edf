//! Hands-free protocol trigger.
//!
//! The operator's hands hold the sample, so the protocol is armed and
//! fired from a pointer device on the floor: three primary-button releases
//! commit the run, three secondary-button releases cancel it. The armer
//! reads the raw button stream on its own thread, independent of any
//! display loop, and reports through a channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{info, warn};

/// Releases of one button that end a trigger session.
pub const RELEASE_THRESHOLD: u32 = 3;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Button state carried by one pointer packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEvent {
    /// Primary (left) button held down.
    pub primary: bool,
    /// Secondary (right) button held down.
    pub secondary: bool,
}

impl PointerEvent {
    /// Decode the status byte of a PS/2 packet: bit 0 is the primary
    /// button, bit 1 the secondary.
    pub fn from_ps2(status: u8) -> Self {
        Self {
            primary: status & 0x01 != 0,
            secondary: status & 0x02 != 0,
        }
    }
}

/// Source of pointer button events.
///
/// Production reads the kernel's aggregate mouse device; tests script the
/// stream.
pub trait PointerSource: Send {
    /// Wait up to `timeout` for the next button-state event.
    /// `Ok(None)` means nothing arrived in time.
    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<PointerEvent>>;
}

/// How a trigger session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Primary releases hit the threshold: run the protocol.
    Committed,
    /// Secondary releases hit the threshold: stand down.
    Cancelled,
}

/// Release counters for one arm-to-fire session.
///
/// Counts press-to-release edges per button. The session ends the moment
/// either counter hits [`RELEASE_THRESHOLD`]; every event after that is a
/// no-op, so the outcome is reported exactly once.
#[derive(Debug, Default)]
pub struct TriggerSession {
    primary_releases: u32,
    secondary_releases: u32,
    primary_down: bool,
    secondary_down: bool,
    outcome: Option<TriggerOutcome>,
}

impl TriggerSession {
    /// Fresh session with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release counts so far: `(primary, secondary)`.
    pub fn counts(&self) -> (u32, u32) {
        (self.primary_releases, self.secondary_releases)
    }

    /// Terminal outcome, once reached.
    pub fn outcome(&self) -> Option<TriggerOutcome> {
        self.outcome
    }

    /// Feed one button-state event.
    ///
    /// Returns the outcome on exactly the event that reaches a threshold;
    /// `None` before that and for every event after the session ended.
    pub fn observe(&mut self, event: PointerEvent) -> Option<TriggerOutcome> {
        if self.outcome.is_some() {
            return None;
        }

        let primary_released = self.primary_down && !event.primary;
        let secondary_released = self.secondary_down && !event.secondary;
        self.primary_down = event.primary;
        self.secondary_down = event.secondary;

        if primary_released {
            self.primary_releases += 1;
        }
        if secondary_released {
            self.secondary_releases += 1;
        }

        if self.primary_releases >= RELEASE_THRESHOLD {
            self.outcome = Some(TriggerOutcome::Committed);
        } else if self.secondary_releases >= RELEASE_THRESHOLD {
            self.outcome = Some(TriggerOutcome::Cancelled);
        }
        self.outcome
    }
}

/// Signals from an armed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSignal {
    /// A release was counted; current totals attached.
    Count { primary: u32, secondary: u32 },
    /// Commit threshold reached. Final signal.
    Committed,
    /// Cancel threshold reached. Final signal.
    Cancelled,
}

/// Armed trigger listening on its own thread.
pub struct TriggerArmer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TriggerArmer {
    /// Arm: spawn the listener over `source`, reporting on `signals`.
    ///
    /// The thread ends after sending [`TriggerSignal::Committed`] or
    /// [`TriggerSignal::Cancelled`], when the receiver is dropped, or on
    /// [`disarm`](Self::disarm).
    pub fn arm(source: Box<dyn PointerSource>, signals: Sender<TriggerSignal>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            Self::listen(source, signals, stop_flag);
        });
        info!("trigger armed");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Tear the listener down without emitting any signal.
    pub fn disarm(mut self) {
        self.shutdown();
        info!("trigger disarmed");
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn listen(
        mut source: Box<dyn PointerSource>,
        signals: Sender<TriggerSignal>,
        stop: Arc<AtomicBool>,
    ) {
        let mut session = TriggerSession::new();
        while !stop.load(Ordering::Relaxed) {
            let event = match source.poll_event(POLL_TIMEOUT) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!("pointer source failed: {e}");
                    return;
                }
            };

            let before = session.counts();
            let outcome = session.observe(event);
            if session.counts() != before {
                let (primary, secondary) = session.counts();
                if signals
                    .send(TriggerSignal::Count { primary, secondary })
                    .is_err()
                {
                    return;
                }
            }
            match outcome {
                Some(TriggerOutcome::Committed) => {
                    let _ = signals.send(TriggerSignal::Committed);
                    return;
                }
                Some(TriggerOutcome::Cancelled) => {
                    let _ = signals.send(TriggerSignal::Cancelled);
                    return;
                }
                None => {}
            }
        }
    }
}

impl Drop for TriggerArmer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(target_os = "linux")]
pub use mice::MiceSource;

#[cfg(target_os = "linux")]
mod mice {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::unix::fs::OpenOptionsExt;
    use std::time::{Duration, Instant};

    use super::{PointerEvent, PointerSource};

    const DEVICE: &str = "/dev/input/mice";
    const PACKET_LEN: usize = 3;

    /// PS/2 button stream from the kernel's aggregate mouse device.
    ///
    /// Packets are three bytes; byte 0 carries the button bits and has
    /// bit 3 set, which is what the resync check keys on. Motion bytes
    /// are ignored. The device is opened non-blocking so the armer thread
    /// can observe its stop flag between packets.
    pub struct MiceSource {
        file: File,
        pending: Vec<u8>,
    }

    impl MiceSource {
        /// Open `/dev/input/mice`. Needs read access to the device node.
        pub fn open() -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(DEVICE)?;
            Ok(Self {
                file,
                pending: Vec::with_capacity(PACKET_LEN),
            })
        }
    }

    impl PointerSource for MiceSource {
        fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<PointerEvent>> {
            let deadline = Instant::now() + timeout;
            loop {
                let mut byte = [0u8; 1];
                match self.file.read(&mut byte) {
                    Ok(0) => return Ok(None),
                    Ok(_) => {
                        // a packet starts with bit 3 set; drop desync bytes
                        if self.pending.is_empty() && byte[0] & 0x08 == 0 {
                            continue;
                        }
                        self.pending.push(byte[0]);
                        if self.pending.len() == PACKET_LEN {
                            let status = self.pending[0];
                            self.pending.clear();
                            return Ok(Some(PointerEvent::from_ps2(status)));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
