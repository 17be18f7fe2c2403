//! Error types for rongyok-dl
//!
//! One error enum covers resolution, transfer, storage and merge failures.
//! Transfer failures never escape the download engine as errors; they are
//! folded into a [`TransferOutcome`](crate::TransferOutcome) instead.

use std::fmt;

/// Main error type for rongyok-dl operations
#[derive(Debug)]
pub enum Error {
    /// The resolver could not find a source URL for the episode
    EpisodeNotFound { series_id: u64, episode: u32 },

    /// Unexpected HTTP status or malformed range response
    HttpError(String),

    /// Connection failure, timeout or interrupted body
    NetworkError(String),

    /// File I/O error (artifacts, snapshot, concat list)
    IoError(std::io::Error),

    /// Session snapshot could not be serialized
    StateError(String),

    /// Invalid configuration or parameters
    InvalidInput(String),

    /// External merge tool missing or failed
    MergeFailed(String),
}

impl Error {
    /// True for failures that leave a resumable partial artifact behind
    pub fn is_transfer_error(&self) -> bool {
        matches!(self, Error::HttpError(_) | Error::NetworkError(_))
    }

    /// True for failures writing artifacts or the session snapshot
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::IoError(_) | Error::StateError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EpisodeNotFound { series_id, episode } => {
                write!(f, "Could not resolve a video URL for episode {episode} of series {series_id}")
            }
            Error::HttpError(msg) => {
                write!(f, "HTTP error: {msg}")
            }
            Error::NetworkError(msg) => {
                write!(f, "Network error: {msg}")
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {err}")
            }
            Error::StateError(msg) => {
                write!(f, "State error: {msg}")
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
            Error::MergeFailed(msg) => {
                write!(f, "Merge failed: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_status() {
            Error::HttpError(err.to_string())
        } else {
            // connect, timeout, body and decode failures are all resumable
            Error::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StateError(err.to_string())
    }
}

/// Convenience result type for rongyok-dl operations
pub type Result<T> = std::result::Result<T, Error>;
