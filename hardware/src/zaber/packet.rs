//! Zaber binary protocol framing
//!
//! The T-series binary protocol exchanges fixed 6-byte frames in both
//! directions:
//!
//! ```text
//! [ device | command | data0 | data1 | data2 | data3 ]
//! ```
//!
//! `device` is the daisy-chain device number (0 broadcasts to every device
//! on the chain), `command` selects the operation, and the remaining four
//! bytes are a 32-bit signed little-endian payload.
//!
//! Reply framing is identical, with two quirks that shape the driver above
//! this module:
//!
//! - Motion commands (home, move, stop) reply only on *completion*, so a
//!   move of several seconds parks its reply on the wire until the stage
//!   arrives. The driver treats these commands as fire-and-forget and
//!   discards their late replies when matching a query.
//! - A reply to `RETURN_SETTING` echoes the *setting* number in the command
//!   byte, not 53.
//!
//! A device that rejects a command replies with command byte 255 and a
//! diagnostic code in the data field; see [`error_message`].

/// Broadcast device number: every device on the chain executes the command.
pub const BROADCAST: u8 = 0;

/// Length of every frame on the wire.
pub const FRAME_LEN: usize = 6;

/// Command numbers used by this driver.
pub mod command {
    /// Move to the home sensor and zero the position counter.
    pub const HOME: u8 = 1;
    /// Move to an absolute position (data = target, microsteps).
    pub const MOVE_ABSOLUTE: u8 = 20;
    /// Move by a signed offset (data = delta, microsteps).
    pub const MOVE_RELATIVE: u8 = 21;
    /// Decelerate and stop.
    pub const STOP: u8 = 23;
    /// Set the target speed register (data = speed, device units).
    pub const SET_TARGET_SPEED: u8 = 42;
    /// Return the device ID (replies from every device when broadcast).
    pub const RETURN_DEVICE_ID: u8 = 50;
    /// Read a setting register (data = setting number).
    pub const RETURN_SETTING: u8 = 53;
    /// Return the current operation status.
    pub const RETURN_STATUS: u8 = 54;
    /// Reply-only: the device rejected a command.
    pub const ERROR: u8 = 255;
}

/// Setting numbers readable via [`command::RETURN_SETTING`].
pub mod setting {
    /// Target speed register (device speed units).
    pub const TARGET_SPEED: u8 = 42;
    /// Maximum position limit (microsteps).
    pub const MAXIMUM_POSITION: u8 = 44;
    /// Current position (microsteps).
    pub const CURRENT_POSITION: u8 = 45;
}

/// One protocol frame, either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Device number (0 = broadcast on commands).
    pub device: u8,
    /// Command number, or echoed command/setting number in replies.
    pub command: u8,
    /// 32-bit signed payload.
    pub data: i32,
}

impl Packet {
    /// Build a frame addressed to one device.
    pub fn new(device: u8, command: u8, data: i32) -> Self {
        Self {
            device,
            command,
            data,
        }
    }

    /// Build a broadcast frame (device number 0).
    pub fn broadcast(command: u8, data: i32) -> Self {
        Self::new(BROADCAST, command, data)
    }

    /// Serialize to the 6-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let d = self.data.to_le_bytes();
        [self.device, self.command, d[0], d[1], d[2], d[3]]
    }

    /// Parse a 6-byte wire frame. Total: every byte pattern is a valid frame.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Self {
        Self {
            device: frame[0],
            command: frame[1],
            data: i32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]),
        }
    }

    /// True if this frame is a rejection reply.
    pub fn is_error(&self) -> bool {
        self.command == command::ERROR
    }
}

/// Firmware operation status, from a [`command::RETURN_STATUS`] reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// No operation in progress.
    Idle,
    /// Executing a home command.
    Homing,
    /// Executing a move-absolute command.
    MovingAbsolute,
    /// Executing a move-relative command.
    MovingRelative,
    /// Executing a constant-speed move.
    MovingAtVelocity,
    /// Decelerating after a stop command.
    Stopping,
    /// Any other status code reported by the firmware.
    Other(i32),
}

impl StageStatus {
    /// Decode the status code from a `RETURN_STATUS` reply payload.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StageStatus::Idle,
            1 => StageStatus::Homing,
            20 => StageStatus::MovingAbsolute,
            21 => StageStatus::MovingRelative,
            22 => StageStatus::MovingAtVelocity,
            23 => StageStatus::Stopping,
            other => StageStatus::Other(other),
        }
    }

    /// True if the firmware reports any motion in progress.
    pub fn is_busy(&self) -> bool {
        !matches!(self, StageStatus::Idle)
    }
}

/// Get a human-readable message for a device error code.
pub fn error_message(code: i32) -> String {
    match code {
        1 => "cannot home: device homed previously and is in a mode that restricts homing".to_string(),
        2 => "device number invalid".to_string(),
        14 => "supply voltage too low".to_string(),
        15 => "supply voltage too high".to_string(),
        20 => "absolute position invalid (outside 0..maximum position)".to_string(),
        21 => "relative position invalid (target outside range)".to_string(),
        22 => "constant-speed velocity invalid".to_string(),
        36 => "peripheral id invalid".to_string(),
        37 => "microstep resolution invalid".to_string(),
        38 => "baud rate invalid".to_string(),
        42 => "home speed above maximum".to_string(),
        43 => "target speed above maximum".to_string(),
        44 => "maximum position out of range".to_string(),
        45 => "current position out of range".to_string(),
        53 => "setting number invalid".to_string(),
        64 => "command number invalid".to_string(),
        255 => "device busy: command rejected while moving".to_string(),
        _ => format!("unknown error ({code})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_broadcast_home() {
        let frame = Packet::broadcast(command::HOME, 0).encode();
        assert_eq!(frame, [0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_move_absolute() {
        // 503937 = 0x0007B081, little-endian on the wire
        let frame = Packet::new(1, command::MOVE_ABSOLUTE, 503937).encode();
        assert_eq!(frame, [1, 20, 0x81, 0xB0, 0x07, 0x00]);
    }

    #[test]
    fn test_encode_negative_data() {
        let frame = Packet::new(2, command::MOVE_RELATIVE, -1).encode();
        assert_eq!(frame, [2, 21, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_decode_position_reply() {
        let packet = Packet::decode(&[1, 45, 0x81, 0xB0, 0x07, 0x00]);
        assert_eq!(packet.device, 1);
        assert_eq!(packet.command, setting::CURRENT_POSITION);
        assert_eq!(packet.data, 503937);
        assert!(!packet.is_error());
    }

    #[test]
    fn test_decode_error_reply() {
        let packet = Packet::decode(&[1, 255, 20, 0, 0, 0]);
        assert!(packet.is_error());
        assert_eq!(packet.data, 20);
        assert!(error_message(packet.data).contains("absolute position"));
    }

    #[test]
    fn test_round_trip() {
        let original = Packet::new(2, command::SET_TARGET_SPEED, -172010);
        let decoded = Packet::decode(&original.encode());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StageStatus::from_code(0), StageStatus::Idle);
        assert_eq!(StageStatus::from_code(1), StageStatus::Homing);
        assert_eq!(StageStatus::from_code(20), StageStatus::MovingAbsolute);
        assert_eq!(StageStatus::from_code(99), StageStatus::Other(99));
        assert!(!StageStatus::Idle.is_busy());
        assert!(StageStatus::Homing.is_busy());
    }

    #[test]
    fn test_unknown_error_message() {
        assert!(error_message(9000).contains("9000"));
    }
}
