//! Zaber binary-protocol link to the stage pair
//!
//! This module owns the serial connection and the two actuator handles for
//! the stretcher rig. It exposes the primitive device commands (home, move,
//! stop, speed, position/status reads) plus the connect/disconnect
//! lifecycle; symmetric dual-stage motion is composed a layer up.
//!
//! # Connection and discovery
//!
//! [`StageLink::connect`] opens the port and broadcasts `RETURN_DEVICE_ID`.
//! Every device on the chain answers with its own device number, in chain
//! order. The rig needs exactly two stages; fewer is a
//! [`LinkError::DiscoveryFailed`] and the port is closed before the error
//! surfaces, so a failed connect never leaves a half-open channel.
//!
//! # Fire-and-forget motion
//!
//! The firmware replies to home/move/stop only when the operation
//! *completes*, so there is no useful acknowledgement to wait for. Motion
//! commands return as soon as the frame is written; the only way to observe
//! completion is to poll [`read_position`](StageLink::read_position). Late
//! completion frames are discarded when matching the reply to a later
//! query.
//!
//! # Example
//!
//! ```no_run
//! use hardware::zaber::{StageId, StageLink};
//!
//! let mut link = StageLink::new();
//! link.connect("/dev/ttyUSB0")?;
//!
//! link.home(StageId::One)?;
//! link.home(StageId::Two)?;
//!
//! let pos = link.read_position(StageId::One)?;
//! println!("stage 1 at {pos} steps");
//! # Ok::<(), hardware::zaber::LinkError>(())
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::packet::{command, error_message, setting, Packet, StageStatus, BROADCAST};
use super::transport::{BinaryTransport, SerialTransport, DEFAULT_TIMEOUT};
use super::units::StepScale;

/// Number of stages the rig is built from.
pub const STAGE_COUNT: usize = 2;

/// Window during which discovery collects answers to the ID broadcast.
const DISCOVERY_WINDOW: Duration = Duration::from_millis(400);

/// Errors from the stage link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Low-level I/O error on the serial channel.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened.
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    /// Fewer than two stages answered the discovery broadcast.
    #[error("discovery failed: found {found} of 2 stages")]
    DiscoveryFailed { found: usize },

    /// Operation attempted without an open connection.
    #[error("not connected")]
    NotConnected,

    /// Connect attempted while a connection is already open.
    #[error("already connected")]
    AlreadyConnected,

    /// No matching reply arrived within the timeout window.
    #[error("timeout waiting for reply to command {command} from device {device}")]
    Timeout { device: u8, command: u8 },

    /// The device answered with an error frame.
    ///
    /// Common codes:
    /// - 20: absolute position invalid
    /// - 21: relative position invalid
    /// - 43: target speed above maximum
    /// - 255: busy, command rejected while moving
    #[error("device {device} rejected command: {message} (code {code})")]
    Rejected {
        /// Protocol device number that answered.
        device: u8,
        /// Firmware error code.
        code: i32,
        /// Human-readable description of the code.
        message: String,
    },
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// One of the two stages, identified by discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageId {
    /// First stage on the chain.
    One,
    /// Second stage on the chain.
    Two,
}

impl StageId {
    /// Both stages, in discovery order.
    pub const ALL: [StageId; 2] = [StageId::One, StageId::Two];

    fn index(self) -> usize {
        match self {
            StageId::One => 0,
            StageId::Two => 1,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageId::One => write!(f, "1"),
            StageId::Two => write!(f, "2"),
        }
    }
}

/// Link to the two-stage chain over one serial channel.
///
/// Starts disconnected; [`connect`](Self::connect) opens the port and
/// discovers the stages. Every device operation requires a live
/// connection and fails with [`LinkError::NotConnected`] otherwise.
///
/// The link itself is not thread-safe; callers that share it across
/// threads wrap it in a mutex so wire commands stay serialized.
pub struct StageLink {
    transport: Option<Box<dyn BinaryTransport>>,
    devices: [u8; STAGE_COUNT],
    scale: StepScale,
}

impl StageLink {
    /// Create a disconnected link with the default unit scale.
    pub fn new() -> Self {
        Self::with_scale(StepScale::default())
    }

    /// Create a disconnected link with an explicit unit scale.
    pub fn with_scale(scale: StepScale) -> Self {
        Self {
            transport: None,
            devices: [0; STAGE_COUNT],
            scale,
        }
    }

    /// Open the serial port and discover the stage pair.
    ///
    /// # Arguments
    ///
    /// * `port_name` - OS port path, e.g. `/dev/ttyUSB0` or `COM3`
    ///
    /// # Errors
    ///
    /// [`LinkError::PortUnavailable`] if the port cannot be opened,
    /// [`LinkError::DiscoveryFailed`] if fewer than two stages answer.
    /// On any failure the channel is closed before the error is returned.
    pub fn connect(&mut self, port_name: &str) -> LinkResult<()> {
        let transport = SerialTransport::open(port_name)
            .map_err(|e| LinkError::PortUnavailable(format!("{port_name}: {e}")))?;
        self.connect_with(Box::new(transport))
    }

    /// Discover the stage pair over an already-open transport.
    ///
    /// Useful for alternative transports; [`connect`](Self::connect) is the
    /// serial-port front end to this.
    pub fn connect_with(&mut self, mut transport: Box<dyn BinaryTransport>) -> LinkResult<()> {
        if self.transport.is_some() {
            return Err(LinkError::AlreadyConnected);
        }

        transport.set_read_timeout(DISCOVERY_WINDOW)?;
        transport.write_frame(&Packet::broadcast(command::RETURN_DEVICE_ID, 0).encode())?;

        let mut found: Vec<(u8, i32)> = Vec::new();
        loop {
            match transport.read_frame()? {
                Some(frame) => {
                    let reply = Packet::decode(&frame);
                    if reply.command == command::RETURN_DEVICE_ID && reply.device != BROADCAST {
                        debug!("discovered device {} (id {})", reply.device, reply.data);
                        found.push((reply.device, reply.data));
                    } else {
                        trace!("ignoring frame during discovery: {reply:?}");
                    }
                }
                None => break,
            }
        }

        if found.len() < STAGE_COUNT {
            return Err(LinkError::DiscoveryFailed { found: found.len() });
        }
        if found.len() > STAGE_COUNT {
            warn!("found {} devices on the chain, using the first two", found.len());
        }

        found.sort_by_key(|&(device, _)| device);
        transport.set_read_timeout(DEFAULT_TIMEOUT)?;

        self.devices = [found[0].0, found[1].0];
        self.transport = Some(transport);
        info!(
            "connected: stage 1 = device {}, stage 2 = device {}",
            self.devices[0], self.devices[1]
        );
        Ok(())
    }

    /// Release the serial channel.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] if no connection is open.
    pub fn disconnect(&mut self) -> LinkResult<()> {
        match self.transport.take() {
            Some(_) => {
                info!("disconnected");
                Ok(())
            }
            None => Err(LinkError::NotConnected),
        }
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Unit scale this link converts speeds with.
    pub fn scale(&self) -> StepScale {
        self.scale
    }

    /// Protocol device numbers of the discovered stages, in stage order.
    /// Meaningful only while connected.
    pub fn device_numbers(&self) -> [u8; STAGE_COUNT] {
        self.devices
    }

    // ==================== Motion Commands ====================

    /// Home one stage. Fire-and-forget: returns once the frame is written;
    /// the firmware replies only when homing completes.
    pub fn home(&mut self, id: StageId) -> LinkResult<()> {
        let device = self.device(id);
        debug!("stage {id}: home");
        self.send(device, command::HOME, 0)
    }

    /// Home every device on the chain with one broadcast frame.
    pub fn home_all(&mut self) -> LinkResult<()> {
        debug!("broadcast home");
        self.send(BROADCAST, command::HOME, 0)
    }

    /// Move one stage to an absolute position in microsteps.
    /// Fire-and-forget.
    pub fn move_absolute(&mut self, id: StageId, steps: i32) -> LinkResult<()> {
        let device = self.device(id);
        debug!("stage {id}: move absolute -> {steps}");
        self.send(device, command::MOVE_ABSOLUTE, steps)
    }

    /// Move one stage by a signed offset in microsteps. Fire-and-forget.
    pub fn move_relative(&mut self, id: StageId, delta: i32) -> LinkResult<()> {
        let device = self.device(id);
        debug!("stage {id}: move relative {delta:+}");
        self.send(device, command::MOVE_RELATIVE, delta)
    }

    /// Stop one stage. Fire-and-forget; the firmware decelerates and
    /// replies with its resting position once stopped.
    pub fn stop(&mut self, id: StageId) -> LinkResult<()> {
        let device = self.device(id);
        debug!("stage {id}: stop");
        self.send(device, command::STOP, 0)
    }

    /// Stop every device on the chain with one broadcast frame.
    pub fn stop_all(&mut self) -> LinkResult<()> {
        debug!("broadcast stop");
        self.send(BROADCAST, command::STOP, 0)
    }

    /// Set one stage's target speed in mm/s.
    ///
    /// Converts to the device speed register via the link's [`StepScale`]
    /// and waits for the setting echo, so a successful return means the
    /// device accepted the value.
    pub fn set_target_speed(&mut self, id: StageId, mm_per_sec: f64) -> LinkResult<()> {
        let device = self.device(id);
        let data = self.scale.mm_per_sec_to_data(mm_per_sec);
        debug!("stage {id}: target speed {mm_per_sec} mm/s -> {data}");
        self.query(device, command::SET_TARGET_SPEED, data, command::SET_TARGET_SPEED)?;
        Ok(())
    }

    // ==================== Reads ====================

    /// Read one stage's current position in microsteps.
    pub fn read_position(&mut self, id: StageId) -> LinkResult<i32> {
        self.read_setting(id, setting::CURRENT_POSITION)
    }

    /// Read one stage's firmware status. Diagnostic: run/idle inference
    /// for the rig is done by position polling, not by this.
    pub fn status(&mut self, id: StageId) -> LinkResult<StageStatus> {
        let device = self.device(id);
        let code = self.query(device, command::RETURN_STATUS, 0, command::RETURN_STATUS)?;
        Ok(StageStatus::from_code(code))
    }

    /// Read a setting register from one stage.
    ///
    /// The reply echoes the setting number in the command byte, which is
    /// what the reply matcher keys on.
    pub fn read_setting(&mut self, id: StageId, setting: u8) -> LinkResult<i32> {
        let device = self.device(id);
        self.query(device, command::RETURN_SETTING, setting as i32, setting)
    }

    // ==================== Wire Helpers ====================

    fn device(&self, id: StageId) -> u8 {
        self.devices[id.index()]
    }

    /// Write one frame without waiting for any reply.
    fn send(&mut self, device: u8, cmd: u8, data: i32) -> LinkResult<()> {
        let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
        transport.write_frame(&Packet::new(device, cmd, data).encode())?;
        Ok(())
    }

    /// Write one frame and wait for the matching reply from the same
    /// device, discarding unrelated frames (typically late completion
    /// replies from earlier motion commands).
    fn query(&mut self, device: u8, cmd: u8, data: i32, reply_command: u8) -> LinkResult<i32> {
        let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
        transport.write_frame(&Packet::new(device, cmd, data).encode())?;

        loop {
            let Some(frame) = transport.read_frame()? else {
                return Err(LinkError::Timeout {
                    device,
                    command: cmd,
                });
            };

            let reply = Packet::decode(&frame);
            if reply.device != device {
                trace!("discarding frame from device {}: {reply:?}", reply.device);
                continue;
            }
            if reply.is_error() {
                return Err(LinkError::Rejected {
                    device,
                    code: reply.data,
                    message: error_message(reply.data),
                });
            }
            if reply.command == reply_command {
                return Ok(reply.data);
            }
            trace!("discarding stale reply: {reply:?}");
        }
    }
}

impl Default for StageLink {
    fn default() -> Self {
        Self::new()
    }
}
