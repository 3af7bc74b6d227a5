use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by the revision pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("cache corruption: {0}")]
    Corruption(String),
    #[error("cache is out of date (version {0}) - please run a cache check")]
    OutOfDate(u32),
    #[error("unknown cache version number {0} - please run a cache check")]
    UnknownVersion(u32),
    #[error("unable to lock cache {0}, it may be used by another instance")]
    Locked(String),
    #[error("operation cancelled")]
    Stopped,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// True for the cache conditions that `check(force = true)` can repair.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Error::OutOfDate(_) | Error::UnknownVersion(_))
    }
}
