//! Error Types for the Wirepack Pipeline
//!
//! This module defines all error kinds that can occur on either side of the
//! pipeline, plus the process exit codes the binaries map them to.
//!
//! ## Error Categories
//!
//! ### Input Errors
//! - `BadMessage`: a producer handed us something that cannot become a
//!   canonical record (non-object JSON, invalid topic, oversized payload)
//!
//! ### Codec Errors
//! - `Compression`: the compressor failed on a batch
//! - `CorruptFrame`: a payload did not decompress to the advertised length
//!
//! ### Wire Errors
//! - `FrameProtocol`: malformed frame on the wire (short read, bad length
//!   prefix, unparseable or out-of-range header)
//! - `UnknownDict`: the collector has no dictionary for `(topic, dict_id)`
//! - `Network`: socket-level failure while shipping
//!
//! ### Startup Errors
//! - `FatalConfig`: unusable configuration, exit code 2
//! - `FatalIo`: cannot bind/open a required resource at startup, exit code 3
//!
//! ## Propagation Policy
//!
//! Recoverable errors (everything except the two fatal variants) are absorbed
//! inside the pipeline and surfaced through the metrics registry; they never
//! reach producer callers once a message has been accepted. Only startup
//! errors terminate the process.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Message rejected before batching (validation or normalization).
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Compressor failure; the batch is dropped and counted.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Malformed frame on the wire; the connection is closed.
    #[error("frame protocol violation: {0}")]
    FrameProtocol(String),

    /// The collector has no resident dictionary for this frame.
    #[error("unknown dictionary {dict_id} for topic '{topic}'")]
    UnknownDict { topic: String, dict_id: u32 },

    /// Payload failed to decompress to exactly `raw_len` bytes.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// Socket-level failure; feeds the circuit breaker.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Unusable configuration at startup.
    #[error("configuration error: {0}")]
    FatalConfig(String),

    /// Unrecoverable I/O during startup (e.g. cannot bind the listener).
    #[error("startup I/O error: {0}")]
    FatalIo(String),
}

impl Error {
    /// Process exit code for this error when it reaches a binary's `main`.
    ///
    /// `0` is reserved for clean shutdown; recoverable kinds share `1` but
    /// should never surface at that level.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::FatalConfig(_) => 2,
            Error::FatalIo(_) => 3,
            _ => 1,
        }
    }

    /// True for the error kinds that terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalConfig(_) | Error::FatalIo(_))
    }
}
