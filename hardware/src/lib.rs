//! Hardware drivers for the stretcher rig.
//!
//! This crate provides the device-level driver for the rig's actuators:
//! two Zaber linear stages daisy-chained on one serial port, speaking the
//! T-series binary protocol. Everything above the wire (symmetric motion,
//! the stretch protocol, status polling) lives in the `stretcher` crate.

pub mod zaber;
