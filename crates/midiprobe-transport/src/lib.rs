//! Latency-compensated MIDI transport core.
//!
//! Outbound events are scheduled against a shared monotonic [`Clock`], inbound
//! traffic is buffered for a non-blocking poll/read loop, and every native
//! connection is tracked in a process-wide [`registry`] so it is released even
//! when the owning session does not clean up after itself.

use thiserror::Error;

pub mod backend_midir;
pub mod clock;
pub mod config;
pub mod device;
pub mod handle;
mod input;
pub mod loopback;
pub mod message;
mod output;
pub mod registry;

pub use backend_midir::MidirBackend;
pub use clock::Clock;
pub use config::SessionConfig;
pub use device::{
    Direction, EndpointDescriptor, EndpointDirectory, InputSink, MidiBackend, NativeInput,
    NativeOutput, OpenParams, ParamKey, MAX_OPEN_PARAMS,
};
pub use handle::{EndpointHandle, OpenOptions, DEFAULT_INPUT_BUFFER_SIZE};
pub use loopback::LoopbackBackend;
pub use message::{ChannelMask, FilterMask, MidiEvent, MidiMessage};
pub use registry::HandleId;

/// Milliseconds elapsed since a [`Clock`] was started.
pub type Timestamp = u32;

/// Identifier of an endpoint as reported by an [`EndpointDirectory`].
pub type DeviceId = usize;

/// Errors surfaced by endpoint handles and backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The device does not exist or does not support the requested direction.
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    /// More open parameters were supplied than a handle can carry.
    #[error("too many open parameters (limit is {limit})")]
    TooManyParameters { limit: usize },
    /// The handle has already been closed.
    #[error("endpoint handle is closed")]
    HandleClosed,
    /// An output operation was attempted on an input handle.
    #[error("not an output handle")]
    NotOutputHandle,
    /// An input operation was attempted on an output handle.
    #[error("not an input handle")]
    NotInputHandle,
    /// A clock-dependent handle was opened before the clock was started.
    #[error("clock has not been started")]
    ClockNotRunning,
    /// Incoming messages were dropped because the poll buffer was full.
    #[error("input buffer overflow")]
    BufferOverflow,
    /// The host driver refused to open the endpoint.
    #[error("driver error: {0}")]
    Driver(String),
    /// The host driver failed while transmitting.
    #[error("host error: {0}")]
    Host(String),
    /// The transport broke one of its own guarantees. Fatal for the session.
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),
}

impl TransportError {
    /// Whether the error indicates a transport bug rather than a caller or host failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ProtocolInvariantViolation(_))
    }
}

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
