//! Core types for the sliding sync engine
//!
//! Window ranges, list operations and the assembled result that the transport
//! layer serializes. The wire shape follows the sliding sync JSON used by
//! Synapse and the Matrix clients that speak it.

use std::{
    collections::BTreeMap,
    fmt,
};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

use crate::{token::PositionToken, Error, Result};

/// Identifier of one client-defined ordered view ("all_rooms", "favourites", ...)
pub type ListKey = String;

/// Identifier of an entry in an ordered collection
pub type ItemId = OwnedRoomId;

/// Opaque per-item payload produced by the item source
pub type ItemResult = serde_json::Value;

/// Opaque extension payloads keyed by extension name
pub type Extensions = BTreeMap<String, serde_json::Value>;

/// Stable identity of one sliding sync connection
///
/// Several clients of one user may share a `conn_id`, so the device is part
/// of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub conn_id: String,
}

impl ConnectionId {
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, conn_id: impl Into<String>) -> Self {
        Self {
            user_id,
            device_id,
            conn_id: conn_id.into(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.device_id, self.conn_id)
    }
}

/// Inclusive window range `[start, end]`
///
/// Serialized as a two element array. Deserialization does not validate;
/// call [`normalize_ranges`] on request input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl Range {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange(format!("start {start} > end {end}")));
        }
        Ok(Self { start, end })
    }

    /// Number of positions covered, both ends included.
    ///
    /// Saturates at `u64::MAX` for the full `[0, u64::MAX]` range.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Exact number of positions covered.
    pub fn width(&self) -> u128 {
        u128::from(self.end - self.start) + 1
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn positions(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl From<(u64, u64)> for Range {
    fn from((start, end): (u64, u64)) -> Self {
        Self { start, end }
    }
}

impl From<Range> for (u64, u64) {
    fn from(range: Range) -> Self {
        (range.start, range.end)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Validate the ranges a client requested for one list and return them sorted.
///
/// Rejects `start > end`, more than `max_ranges` ranges, and ranges that
/// overlap once sorted.
pub fn normalize_ranges(list_key: &str, ranges: &[Range], max_ranges: usize) -> Result<Vec<Range>> {
    if ranges.len() > max_ranges {
        return Err(Error::InvalidRange(format!(
            "list {list_key} requested {} ranges, at most {max_ranges} allowed",
            ranges.len()
        )));
    }

    let mut sorted = Vec::with_capacity(ranges.len());
    for range in ranges {
        sorted.push(Range::new(range.start, range.end)?);
    }
    sorted.sort();

    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(Error::OverlappingRanges {
                list: list_key.to_owned(),
                first: pair[0].to_string(),
                second: pair[1].to_string(),
            });
        }
    }

    Ok(sorted)
}

/// Discriminant of [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Sync,
    Insert,
    Delete,
    Invalidate,
}

/// One step the client applies to its sparse copy of a list
///
/// Shifts never cross the boundary of the requested range holding the
/// position: `Delete` pulls the rest of the range back by one and leaves the
/// range's last slot empty, `Insert` pushes items toward the nearest empty
/// slot of the range (dropping the last item when the range is full).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Authoritative contents of `range`; anything known there is replaced.
    Sync {
        range: Range,
        #[serde(rename = "room_ids")]
        item_ids: Vec<ItemId>,
    },
    Insert {
        index: u64,
        #[serde(rename = "room_id")]
        item_id: ItemId,
    },
    Delete {
        index: u64,
    },
    /// The client may keep its copy of `range` but must treat it as unknown.
    Invalidate {
        range: Range,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Sync { .. } => OperationKind::Sync,
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Invalidate { .. } => OperationKind::Invalidate,
        }
    }

    /// Item ids whose content the client needs after applying this operation.
    pub fn item_ids(&self) -> &[ItemId] {
        match self {
            Operation::Sync { item_ids, .. } => item_ids,
            Operation::Insert { item_id, .. } => std::slice::from_ref(item_id),
            Operation::Delete { .. } | Operation::Invalidate { .. } => &[],
        }
    }
}

/// Operations for one list key plus the full collection size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowList {
    pub count: u64,
    pub ops: Vec<Operation>,
}

/// Everything one sliding sync response carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    #[serde(rename = "pos")]
    pub next_pos: PositionToken,
    pub lists: BTreeMap<ListKey, WindowList>,
    #[serde(rename = "rooms")]
    pub items: BTreeMap<ItemId, ItemResult>,
    pub extensions: Extensions,
}

impl SyncResult {
    pub fn empty(next_pos: PositionToken) -> Self {
        Self {
            next_pos,
            lists: BTreeMap::new(),
            items: BTreeMap::new(),
            extensions: Extensions::new(),
        }
    }

    /// True when there is nothing to tell the client; drives the long-poll loop.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty() && self.items.is_empty() && self.extensions.is_empty()
    }
}
