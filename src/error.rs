use thiserror::Error;

/// The status taxonomy shared by every fallible operation in the engine.
///
/// Decoders return `Corruption` with a short static reason and never panic
/// on malformed input; I/O failures are carried through unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("corruption: {0}")]
    Corruption(&'static str),

    #[error("corruption: {0}")]
    CorruptionString(String),

    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("compression failed: {0}")]
    CompressedFailed(#[from] snap::Error),
}

impl Error {
    /// Returns true iff this error marks on-disk corruption.
    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::CorruptionString(_))
    }
}

pub type IResult<T> = std::result::Result<T, Error>;
