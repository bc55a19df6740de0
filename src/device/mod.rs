//! Device module - physical source and virtual sink handling
//!
//! This module provides:
//! - The raw input_event wire codec
//! - The grabbed physical source device (evdev)
//! - The synthesized virtual output device (uinput)

pub mod event;
mod sink;
mod source;
mod traits;

pub use sink::VirtualDevice;
pub use source::{enumerate_devices, Capabilities, SourceDevice};
pub use traits::{DeviceError, DeviceResult, EventSink, EventSource, ReadStatus};
