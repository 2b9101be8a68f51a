// =============================================================================
// Matrixon Matrix NextServer - Sync Module
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
//   Sliding window sync: diff engine, window tracker, notifier, result
//   assembler and the request handler that drives them.
//
// =============================================================================

pub mod assembler;
pub mod diff;
pub mod notifier;
pub mod sliding_sync;
pub mod sources;
pub mod tracker;

pub use assembler::ResultAssembler;
pub use diff::{diff, DensityThreshold};
pub use notifier::{Notifier, WakeKey, WakeSignal, Waiter};
pub use sliding_sync::{ListRequest, SlidingSyncRequest, SlidingSyncService};
pub use sources::{ExtensionSource, ItemSource, ListSource, NoExtensions};
pub use tracker::{Acknowledgement, WindowState, WindowTracker};
