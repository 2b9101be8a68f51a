// =============================================================================
// Matrixon Matrix NextServer - Error Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Error taxonomy for the sliding sync engine. Client input errors are
//   reported without touching tracked window state; collaborator failures
//   are retryable for the failing request only.
//
// =============================================================================

use std::io;

use thiserror::Error;

/// Matrixon sliding sync error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Overlapping ranges in list {list}: {first} and {second}")]
    OverlappingRanges {
        list: String,
        first: String,
        second: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stale position token: {0}")]
    StaleToken(String),

    #[error("Another sync request is already in flight for connection {0}")]
    ConcurrentRequest(String),

    #[error("Too many sliding sync connections for user {0}")]
    ConnectionLimit(String),

    #[error("Item fetch failed: {0}")]
    ItemFetch(String),

    #[error("Ordering source failed: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] ruma::IdParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors caused by the request itself; the client must change the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRange(_)
                | Error::InvalidRequest(_)
                | Error::OverlappingRanges { .. }
                | Error::ConcurrentRequest(_)
                | Error::ConnectionLimit(_)
        )
    }

    /// Errors the client may retry with the same token.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ItemFetch(_) | Error::Source(_))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::BadConfig(err.to_string())
    }
}

/// Matrixon sliding sync result type
pub type Result<T> = std::result::Result<T, Error>;
