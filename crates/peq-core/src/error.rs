//! Error types for the EQ signal path
//!
//! Block-rate processing never fails; errors exist only for prepare-time
//! configuration (channel count, sample rate).

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum PeqError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),

    #[error("Invalid channel count: {0} (supported: 1..={1})")]
    InvalidChannelCount(usize, usize),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),
}

/// Result type alias
pub type PeqResult<T> = Result<T, PeqError>;
