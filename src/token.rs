// =============================================================================
// Matrixon Matrix NextServer - Position Token Module
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
//   Opaque `pos` cursor handed to sliding sync clients. A token names the
//   server epoch it was minted in, the global change stream position it
//   covers, and the connection generation whose window state it acknowledges.
//
// =============================================================================

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Global change stream position
pub type StreamPosition = u64;

/// Identifies one process lifetime; tokens from another epoch are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerEpoch(pub u32);

impl ServerEpoch {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_u128() as u32)
    }
}

/// `pos` token: `{epoch:08x}_{stream}_{connection}` on the wire
///
/// Two tokens only compare when they share an epoch; across epochs
/// `partial_cmp` returns `None` and every ordering comparison is false.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PositionToken {
    epoch: u32,
    stream: StreamPosition,
    connection: u64,
}

impl PositionToken {
    pub fn new(epoch: ServerEpoch, stream: StreamPosition, connection: u64) -> Self {
        Self {
            epoch: epoch.0,
            stream,
            connection,
        }
    }

    pub fn epoch(&self) -> ServerEpoch {
        ServerEpoch(self.epoch)
    }

    pub fn stream(&self) -> StreamPosition {
        self.stream
    }

    /// Generation of the connection's window state this token acknowledges.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn is_from(&self, epoch: ServerEpoch) -> bool {
        self.epoch == epoch.0
    }
}

impl PartialOrd for PositionToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some(
            self.stream
                .cmp(&other.stream)
                .then(self.connection.cmp(&other.connection)),
        )
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}_{}_{}", self.epoch, self.stream, self.connection)
    }
}

impl FromStr for PositionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let stale = || Error::StaleToken(format!("unrecognized token {s:?}"));

        let mut parts = s.split('_');
        let (Some(epoch), Some(stream), Some(connection), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(stale());
        };

        Ok(Self {
            epoch: u32::from_str_radix(epoch, 16).map_err(|_| stale())?,
            stream: stream.parse().map_err(|_| stale())?,
            connection: connection.parse().map_err(|_| stale())?,
        })
    }
}

impl TryFrom<String> for PositionToken {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PositionToken> for String {
    fn from(token: PositionToken) -> Self {
        token.to_string()
    }
}
