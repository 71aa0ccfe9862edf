//! Zaber T-series binary protocol driver for the stretcher stages
//!
//! This module provides frame encoding, the serial transport, and the
//! [`StageLink`] driver for the two linear actuators that stretch the
//! sample. Unit conversion between millimeters and device microsteps
//! lives in [`units`].

pub mod link;
pub mod mock;
pub mod packet;
pub mod transport;
pub mod units;

pub use link::{LinkError, LinkResult, StageId, StageLink, STAGE_COUNT};
pub use packet::{command, error_message, setting, Packet, StageStatus, BROADCAST, FRAME_LEN};
pub use transport::{BinaryTransport, SerialTransport, BAUD_RATE, DEFAULT_TIMEOUT};
pub use units::{StepScale, DEFAULT_MICROSTEP_UM, SPEED_TIMEBASE_S};
