//! Scripted in-memory transport for driver and bench tests.
//!
//! Mirrors the serial transport's contract without hardware: writes are
//! decoded into a shared [`CommandLog`], reads pop a scripted reply queue.
//! An exhausted queue reads as silence, which the link reports as a
//! timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::packet::{Packet, FRAME_LEN};
use super::transport::BinaryTransport;

/// Shared log of every frame written to a [`MockTransport`], decoded.
///
/// Clones share the same log, so a test keeps one handle while the
/// transport box moves into the link.
#[derive(Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<Packet>>>);

impl CommandLog {
    /// Every frame written so far, in write order.
    pub fn commands(&self) -> Vec<Packet> {
        self.0.lock().unwrap().clone()
    }

    /// Frames written so far with the given command byte.
    pub fn with_command(&self, command: u8) -> Vec<Packet> {
        self.commands()
            .into_iter()
            .filter(|p| p.command == command)
            .collect()
    }

    fn push(&self, packet: Packet) {
        self.0.lock().unwrap().push(packet);
    }
}

/// Shared reply script. Clones share the same queue, so a test can feed
/// replies while the transport is already owned by a link.
#[derive(Clone, Default)]
pub struct ReplyQueue(Arc<Mutex<VecDeque<[u8; FRAME_LEN]>>>);

impl ReplyQueue {
    /// Append one reply frame to the script.
    pub fn push(&self, reply: Packet) {
        self.0.lock().unwrap().push_back(reply.encode());
    }

    /// Append several reply frames to the script.
    pub fn extend(&self, replies: &[Packet]) {
        let mut queue = self.0.lock().unwrap();
        queue.extend(replies.iter().map(Packet::encode));
    }

    /// True once every scripted reply has been consumed.
    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    fn pop(&self) -> Option<[u8; FRAME_LEN]> {
        self.0.lock().unwrap().pop_front()
    }
}

/// Transport that records writes and hands back scripted replies.
pub struct MockTransport {
    log: CommandLog,
    replies: ReplyQueue,
    write_count: usize,
    failing_writes: Vec<usize>,
}

impl MockTransport {
    /// Transport with a fixed reply script.
    pub fn new(log: &CommandLog, replies: &[Packet]) -> Box<Self> {
        let queue = ReplyQueue::default();
        queue.extend(replies);
        Self::with_queue(log, &queue)
    }

    /// Transport that reads replies from a shared queue the caller keeps
    /// a handle to.
    pub fn with_queue(log: &CommandLog, replies: &ReplyQueue) -> Box<Self> {
        Box::new(Self {
            log: log.clone(),
            replies: replies.clone(),
            write_count: 0,
            failing_writes: Vec::new(),
        })
    }

    /// Make the writes at the given zero-based indices fail with a broken
    /// pipe. The discovery broadcast is write 0.
    pub fn with_failing_writes(
        log: &CommandLog,
        replies: &[Packet],
        failing: &[usize],
    ) -> Box<Self> {
        let mut transport = Self::new(log, replies);
        transport.failing_writes = failing.to_vec();
        transport
    }
}

impl BinaryTransport for MockTransport {
    fn write_frame(&mut self, frame: &[u8; FRAME_LEN]) -> std::io::Result<()> {
        let index = self.write_count;
        self.write_count += 1;
        if self.failing_writes.contains(&index) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("scripted write failure at index {index}"),
            ));
        }
        self.log.push(Packet::decode(frame));
        Ok(())
    }

    fn read_frame(&mut self) -> std::io::Result<Option<[u8; FRAME_LEN]>> {
        Ok(self.replies.pop())
    }

    fn set_read_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }
}
