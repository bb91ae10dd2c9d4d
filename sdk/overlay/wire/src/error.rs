//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u32),

    /// Unknown content type
    #[error("unknown content type {0}")]
    Type(u32),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,

    /// Body is not valid UTF-8
    #[error("body is not valid utf-8")]
    Utf8,
}
