//! Error kinds per the error handling design: each variant maps to one of
//! the recovery policies the engine promises its callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad parameters: M < m, backing store too small, malformed cipher
    /// spec, key length mismatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// `MAGIC` present but `INDEX_HASH`/`DATA_HASH`/`SEQNOS_HASH` mismatch.
    /// Recovery: refuse to open the partition.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Two partitions claim the same macroblock, or a unique-id is
    /// already open under a different name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backing-store read/write failure. Not recoverable within the
    /// current operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Insufficient unassigned macroblocks to satisfy an allocation.
    /// Recoverable: caller can retry with a smaller request.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Partition in use when close/resize was attempted.
    #[error("busy: {0}")]
    Busy(String),

    /// Name lookup failure.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self { Error::Config(msg.into()) }
    pub fn integrity(msg: impl Into<String>) -> Self { Error::Integrity(msg.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Error::Conflict(msg.into()) }
    pub fn out_of_space(msg: impl Into<String>) -> Self { Error::OutOfSpace(msg.into()) }
    pub fn busy(msg: impl Into<String>) -> Self { Error::Busy(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Error::NotFound(msg.into()) }

    /// The single-line form the control protocol puts after `ERR\n`.
    pub fn wire_message(&self) -> String { self.to_string() }
}
