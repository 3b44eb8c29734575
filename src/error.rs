//! Error types for convcache.

use thiserror::Error;

/// Error type for convcache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes found while rebuilding the index
    #[error("corrupt cache file at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// A variable-length size does not fit in 64 bits
    #[error("variable-length size overflows 64 bits")]
    VarintOverflow,

    /// Indexed record is larger than addressable memory
    #[error("record too large to load: {0} bytes")]
    RecordTooLarge(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for convcache operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            offset,
            reason: reason.into(),
        }
    }
}
