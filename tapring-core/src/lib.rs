//! TAPRING core: the stream engine.
//!
//! A capture adapter exposes unidirectional streams backed by large
//! circular memory holes that hardware and software mutate concurrently.
//! This crate implements the ring protocol over those holes: attaching and
//! locking streams, the burst-manager handshake, the safety-window cursor
//! discipline, zero-copy record iteration, transmit space reservation, and
//! the reverse-mode synchronizer that lets a software stack stand in for
//! the hardware side.
//!
//! The design is deliberately synchronous. The adapter has no interrupt
//! path; every blocking call sleeps in short increments while polling
//! hardware-visible memory, and the only background activity in the
//! process is the single reverse-mode synchronizer task.

pub mod capture;
pub mod cursor;
pub mod stream;

mod reader;
mod syncd;
mod writer;

pub use capture::Capture;
pub use stream::{PollConfig, StreamStats, StreamToken};

use tapring_io::DeviceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    /// Operation on a stream that is not attached (or no longer attached).
    #[error("operation on a stream that is not attached")]
    BadHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Another owner holds the advisory lock for this stream.
    #[error("stream is locked by another owner")]
    Locked,

    /// No memory hole is assigned to the stream, or a reverse-mode peer is
    /// unavailable.
    #[error("no memory hole available for this stream")]
    OutOfMemory,

    /// Neither a burst manager nor an embedded-processor path exists for
    /// the requested operation.
    #[error("no burst manager or processor path on this device")]
    NoSuchDevice,

    /// Corrupt record framing. Fatal to the capture session; the cursor
    /// has not advanced and retrying will not help.
    #[error("record framing corrupt: {0}")]
    Io(#[from] tapring_erf::RecordError),

    /// A bounded poll exceeded its deadline. Recoverable; the caller may
    /// retry.
    #[error("bounded poll exceeded its deadline")]
    TimedOut,

    /// Non-blocking mode and the request cannot be satisfied right now.
    /// Not a failure.
    #[error("would block")]
    WouldBlock,

    #[error("device failure: {0}")]
    Device(std::io::Error),
}

impl From<DeviceError> for StreamError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Locked(_) => StreamError::Locked,
            DeviceError::NoSuchStream(_) => StreamError::InvalidArgument("no such stream"),
            DeviceError::Unsupported => StreamError::NoSuchDevice,
            DeviceError::BadHoleSize(_) => {
                StreamError::InvalidArgument("hole size is not page-aligned")
            }
            DeviceError::Os(err) => StreamError::Device(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
