//! Background status polling.
//!
//! The firmware only replies to motion commands on completion, so run
//! state is inferred by sampling: the poller reads both positions on a
//! fixed interval and derives `running` when the combined length changed
//! since the previous sample, `idle` when it did not, and `disconnected`
//! whenever the link is down or a read fails. Samples and status changes
//! go out on the bench event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::warn;

use crate::events::{BenchEvent, RunStatus};
use crate::motion::StagePair;

/// Samples the stage pair on a fixed interval from a background thread.
///
/// The first connected sample is compared against the rest length, so a
/// freshly connected idle rig reads `idle`, not `running`.
pub struct StatusPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// Start polling `pair` every `interval`.
    ///
    /// Emits [`BenchEvent::Length`] for every successful sample and
    /// [`BenchEvent::Status`] whenever the derived status changes. Read
    /// failures are logged and surface as `disconnected` for that tick;
    /// the loop itself never gives up. Exits when the event receiver is
    /// dropped or [`stop`](Self::stop) is called.
    pub fn start(pair: StagePair, interval: Duration, events: Sender<BenchEvent>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            Self::poll_loop(pair, interval, events, stop_flag);
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop polling and join the background thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn poll_loop(
        pair: StagePair,
        interval: Duration,
        events: Sender<BenchEvent>,
        stop: Arc<AtomicBool>,
    ) {
        // extension 0 is the rest length, the seed for the first sample
        let mut last_extension: i32 = 0;
        let mut last_status: Option<RunStatus> = None;

        while !stop.load(Ordering::Relaxed) {
            let status = if !pair.is_connected() {
                last_extension = 0;
                RunStatus::Disconnected
            } else {
                match pair.sample() {
                    Ok(sample) => {
                        let moved = sample.extension_steps != last_extension;
                        last_extension = sample.extension_steps;
                        if events
                            .send(BenchEvent::Length {
                                mm: sample.length_mm,
                            })
                            .is_err()
                        {
                            return;
                        }
                        if moved {
                            RunStatus::Running
                        } else {
                            RunStatus::Idle
                        }
                    }
                    Err(e) => {
                        warn!("position poll failed: {e}");
                        last_extension = 0;
                        RunStatus::Disconnected
                    }
                }
            };

            if last_status != Some(status) {
                last_status = Some(status);
                if events.send(BenchEvent::Status(status)).is_err() {
                    return;
                }
            }

            thread::sleep(interval);
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use hardware::zaber::mock::{CommandLog, MockTransport};
    use hardware::zaber::{command, setting, Packet, StageLink};
    use std::sync::Mutex;
    use std::time::Instant;

    const ZERO: i32 = 503_937;

    fn position_pair(p1: i32, p2: i32) -> [Packet; 2] {
        [
            Packet::new(1, setting::CURRENT_POSITION, p1),
            Packet::new(2, setting::CURRENT_POSITION, p2),
        ]
    }

    fn collect_statuses(
        rx: &crossbeam_channel::Receiver<BenchEvent>,
        count: usize,
    ) -> Vec<RunStatus> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut statuses = Vec::new();
        while statuses.len() < count && Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(BenchEvent::Status(status)) => statuses.push(status),
                Ok(_) => {}
                Err(_) => {}
            }
        }
        statuses
    }

    #[test]
    fn test_status_transitions_from_samples() {
        let log = CommandLog::default();
        let mut replies = vec![
            Packet::new(1, command::RETURN_DEVICE_ID, 6210),
            Packet::new(2, command::RETURN_DEVICE_ID, 6210),
        ];
        // tick 1: at rest; ticks 2-3: stretched; then silence = read failure
        replies.extend_from_slice(&position_pair(ZERO, ZERO));
        replies.extend_from_slice(&position_pair(440_945, 440_945));
        replies.extend_from_slice(&position_pair(440_945, 440_945));

        let mut link = StageLink::new();
        link.connect_with(MockTransport::new(&log, &replies)).unwrap();
        let pair = StagePair::new(Arc::new(Mutex::new(link)), ZERO, 12.0);

        let (tx, rx) = unbounded();
        let poller = StatusPoller::start(pair, Duration::from_millis(5), tx);

        let statuses = collect_statuses(&rx, 4);
        poller.stop();

        assert_eq!(
            statuses,
            vec![
                RunStatus::Idle,
                RunStatus::Running,
                RunStatus::Idle,
                RunStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn test_lengths_follow_positions() {
        let log = CommandLog::default();
        let mut replies = vec![
            Packet::new(1, command::RETURN_DEVICE_ID, 6210),
            Packet::new(2, command::RETURN_DEVICE_ID, 6210),
        ];
        replies.extend_from_slice(&position_pair(ZERO, ZERO));
        replies.extend_from_slice(&position_pair(440_945, 440_945));

        let mut link = StageLink::new();
        link.connect_with(MockTransport::new(&log, &replies)).unwrap();
        let pair = StagePair::new(Arc::new(Mutex::new(link)), ZERO, 12.0);

        let (tx, rx) = unbounded();
        let poller = StatusPoller::start(pair, Duration::from_millis(5), tx);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lengths = Vec::new();
        while lengths.len() < 2 && Instant::now() < deadline {
            if let Ok(BenchEvent::Length { mm }) = rx.recv_timeout(Duration::from_millis(50)) {
                lengths.push(mm);
            }
        }
        poller.stop();

        assert_eq!(lengths.len(), 2);
        assert!((lengths[0] - 12.0).abs() < 1e-6);
        assert!((lengths[1] - 18.0).abs() < 1e-3);
    }

    #[test]
    fn test_disconnected_link_reports_disconnected() {
        let pair = StagePair::new(Arc::new(Mutex::new(StageLink::new())), ZERO, 12.0);
        let (tx, rx) = unbounded();
        let poller = StatusPoller::start(pair, Duration::from_millis(5), tx);

        let statuses = collect_statuses(&rx, 1);
        poller.stop();

        assert_eq!(statuses, vec![RunStatus::Disconnected]);
    }

    #[test]
    fn test_stop_joins_cleanly() {
        let pair = StagePair::new(Arc::new(Mutex::new(StageLink::new())), ZERO, 12.0);
        let (tx, rx) = unbounded();
        let poller = StatusPoller::start(pair, Duration::from_millis(5), tx);

        poller.stop();
        // the thread is gone, so the channel drains and disconnects
        while rx.try_recv().is_ok() {}
        assert!(rx.try_recv().is_err());
    }
}
