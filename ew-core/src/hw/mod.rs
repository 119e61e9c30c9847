//! Hardware interaction modules
//!
//! Contains the low-level access to the sensor board.

pub mod serial;

pub use serial::{parse_literal, SampleFramer, SerialPort};
