// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Library
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
//   Sliding window synchronization engine. Clients subscribe to ranges of
//   server-ordered lists and receive incremental list operations plus the
//   payloads of the items those operations reference, over long-polling
//   requests that resume from an opaque position token.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod metrics;
pub mod service;
pub mod token;
pub mod types;
pub mod utils;

pub use config::SlidingSyncConfig;
pub use database::MemoryRoomStore;
pub use metrics::{MetricsSnapshot, SlidingSyncMetrics};
pub use service::sync::{
    ExtensionSource, ItemSource, ListRequest, ListSource, Notifier, SlidingSyncRequest, SlidingSyncService,
    WakeKey, WakeSignal,
};
pub use token::{PositionToken, ServerEpoch, StreamPosition};
pub use types::{ConnectionId, ItemId, ListKey, Operation, Range, SyncResult, WindowList};
pub use utils::error::{Error, Result};

pub use ruma;
