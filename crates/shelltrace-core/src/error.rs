//! Error types for shelltrace-core

use thiserror::Error;

use crate::record::InstanceId;
use crate::version::{MAXIMUM_VERSION, MINIMUM_VERSION};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shelltrace-core
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed trace line — the record is dropped, ingestion continues.
    #[error("malformed trace line: {0}")]
    Parse(String),

    /// Handshake declared a version outside the supported range.
    /// Fatal only to the instance attempting it.
    #[error("unsupported protocol version {declared} (supported {MINIMUM_VERSION}..={MAXIMUM_VERSION})")]
    UnsupportedVersion { declared: u64 },

    /// A single record is larger than the whole configured ceiling.
    /// The record is dropped and counted; ingestion keeps running.
    #[error("record of {cost} bytes exceeds memory ceiling of {ceiling} bytes")]
    BudgetExceeded { cost: usize, ceiling: usize },

    /// Store request rejected by the access gate.
    #[error("store denied: instance {0} is restricted")]
    PermissionDenied(InstanceId),

    /// The pid already maps to a non-reclaimed instance.
    #[error("pid {0} is already registered")]
    DuplicatePid(u32),

    /// No instance with that id is currently known.
    #[error("no such instance: {0}")]
    NoSuchInstance(InstanceId),

    /// Activation attempted on an instance no longer awaiting one.
    #[error("instance {0} is not pending activation")]
    NotPending(InstanceId),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this condition is local to one record and should never
    /// interrupt the owning instance's ingestion loop.
    #[must_use]
    pub fn is_per_record(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::BudgetExceeded { .. })
    }
}
