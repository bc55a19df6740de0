//! Device trait definitions
//!
//! Defines the interfaces the event loop drives, so the pipeline can be
//! exercised against in-memory fakes with no device I/O.

use std::time::Duration;
use thiserror::Error;

use super::event::RawEvent;

/// Errors that can occur during device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to open device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind device {path}: {reason}")]
    Bind { path: String, reason: String },

    #[error("Exclusive grab rejected: {0}")]
    Grab(String),

    #[error("Failed to create virtual device: {0}")]
    Create(String),

    #[error("Read error on source device: {0}")]
    Read(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Outcome of a single non-blocking read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// One complete event was decoded
    Event(RawEvent),
    /// Nothing buffered right now; not an error
    Empty,
}

/// A physical event source the loop can grab and drain
pub trait EventSource {
    /// Request exclusive delivery of this device's events
    fn grab(&mut self) -> DeviceResult<()>;

    /// Give the device back to the rest of the system
    fn release(&mut self) -> DeviceResult<()>;

    fn is_grabbed(&self) -> bool;

    /// Pull one decoded event, or `Empty` when nothing is buffered.
    /// Hard I/O failures surface as `DeviceError::Read`.
    fn next_event(&mut self) -> DeviceResult<ReadStatus>;

    /// Block until the device is readable or the timeout elapses.
    /// Returns `true` if there is something to read.
    fn wait_readable(&mut self, timeout: Duration) -> DeviceResult<bool>;
}

/// A sink that re-emits events as a synthesized input device
pub trait EventSink {
    /// Emit one event through the virtual device
    fn write_event(&mut self, type_: u16, code: u16, value: i32) -> DeviceResult<()>;

    /// Tear the virtual device down; called exactly once, after the
    /// source has been released.
    fn destroy(&mut self) -> DeviceResult<()>;
}
