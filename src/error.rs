//! Error taxonomy.
//!
//! Producer-side failures (`ObservationError`) never leave the adapter that
//! raised them; they are counted and dropped. Buffer overwrites are not
//! errors at all and surface as statistics. Decode failures are per-record
//! and skipped by the collector. Only a failed delivery channel is fatal,
//! and even that ends in an orderly detach.

use std::time::Duration;
use thiserror::Error;

/// Collector-side, per-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record block truncated ({got} bytes)")]
    Truncated { got: usize },
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown event kind tag {0:#04x}")]
    BadTag(u8),
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

/// A single notification could not be normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ObservationError {
    #[error("notification has no subject process")]
    NoSubject,
    #[error("notification carried an empty {0}")]
    Empty(&'static str),
}

/// The delivery channel or its host transport is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("delivery channel invalidated")]
    Invalidated,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host rejected callback registration: {0}")]
    Rejected(String),
    #[error("host callbacks already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("ring capacity {0} must be a power of two between 1 and 65536")]
    InvalidCapacity(usize),
    #[error("host registration failed: {0}")]
    Host(#[from] HostError),
    #[error("collector did not finish its final drain within {0:?}")]
    DrainTimeout(Duration),
    #[error("collector failed: {0}")]
    Collector(String),
}
