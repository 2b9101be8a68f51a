// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Window Tracker Module
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
//   In-memory cache of the window each connection last acknowledged, per list
//   key. State is kept per connection generation (the `connection` part of a
//   position token) so a client that re-sends a request after losing the
//   response is diffed against what it actually holds. Losing an entry is
//   always safe: the next request takes the full SYNC path.
//
// =============================================================================

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use ruma::UserId;
use tracing::{debug, info, warn};

use crate::{
    metrics::SlidingSyncMetrics,
    token::PositionToken,
    types::{ConnectionId, ItemId, ListKey, Range},
};

/// Ids a connection holds for one of its ranges, as a prefix of the range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSlots {
    pub range: Range,
    pub ids: Vec<ItemId>,
}

/// Window of one list as last acknowledged by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    slots: Vec<RangeSlots>,
    count: Option<u64>,
    pos: PositionToken,
}

impl WindowState {
    pub fn new(slots: Vec<(Range, Vec<ItemId>)>, pos: PositionToken) -> Self {
        Self {
            slots: slots
                .into_iter()
                .map(|(range, ids)| RangeSlots { range, ids })
                .collect(),
            count: None,
            pos,
        }
    }

    /// Record the collection size the client was last told.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range> + '_ {
        self.slots.iter().map(|slots| slots.range)
    }

    pub fn slots(&self) -> impl Iterator<Item = &RangeSlots> + '_ {
        self.slots.iter()
    }

    /// Every id in the window, in range order.
    pub fn ordered_ids(&self) -> impl Iterator<Item = &ItemId> + '_ {
        self.slots.iter().flat_map(|slots| slots.ids.iter())
    }

    pub fn pos(&self) -> &PositionToken {
        &self.pos
    }
}

/// Everything one connection generation acknowledged
#[derive(Debug, Clone, Default)]
struct Generation {
    lists: HashMap<ListKey, WindowState>,
    /// Subscribed items whose payload the client already holds
    subscriptions: BTreeSet<ItemId>,
}

#[derive(Debug)]
struct ConnectionEntry {
    generations: BTreeMap<u64, Generation>,
    last_activity: Instant,
}

impl ConnectionEntry {
    fn new() -> Self {
        Self {
            generations: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }
}

/// Whether a request token names window state the tracker still holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// No token, or generation 0: nothing was ever acknowledged
    Fresh,
    /// The named generation is tracked and is now the only one kept
    Known,
    /// The named generation is gone; the connection starts over
    Unknown,
}

/// Per-(connection, list key) window memory
pub struct WindowTracker {
    connections: Mutex<LruCache<ConnectionId, ConnectionEntry>>,
    idle_timeout: Duration,
    metrics: Arc<SlidingSyncMetrics>,
}

impl WindowTracker {
    pub fn new(capacity: NonZeroUsize, idle_timeout: Duration, metrics: Arc<SlidingSyncMetrics>) -> Self {
        Self {
            connections: Mutex::new(LruCache::new(capacity)),
            idle_timeout,
            metrics,
        }
    }

    /// Record that a request acknowledged `generation` (`None` for no token).
    ///
    /// Drops every other generation of the connection: at most the
    /// acknowledged one and the one the response commits survive.
    pub fn acknowledge(&self, conn: &ConnectionId, generation: Option<u64>) -> Acknowledgement {
        let mut connections = self.connections.lock();

        if !connections.contains(conn) {
            if let Some((evicted, _)) = connections.push(conn.clone(), ConnectionEntry::new()) {
                if &evicted != conn {
                    warn!("♻️ Window cache full, evicted connection {}", evicted);
                    SlidingSyncMetrics::incr(&self.metrics.evicted_connections);
                }
            }
        }
        let Some(entry) = connections.get_mut(conn) else {
            return Acknowledgement::Unknown;
        };
        entry.last_activity = Instant::now();

        match generation {
            None | Some(0) => {
                entry.generations.clear();
                Acknowledgement::Fresh
            }
            Some(generation) => {
                let kept = entry.generations.remove(&generation);
                entry.generations.clear();
                match kept {
                    Some(state) => {
                        entry.generations.insert(generation, state);
                        Acknowledgement::Known
                    }
                    None => Acknowledgement::Unknown,
                }
            }
        }
    }

    /// Latest committed window of `list_key`.
    pub fn lookup(&self, conn: &ConnectionId, list_key: &str) -> Option<WindowState> {
        let connections = self.connections.lock();
        connections
            .peek(conn)?
            .generations
            .values()
            .next_back()?
            .lists
            .get(list_key)
            .cloned()
    }

    /// Window of `list_key` as of connection generation `generation`.
    pub fn lookup_at(&self, conn: &ConnectionId, generation: u64, list_key: &str) -> Option<WindowState> {
        let connections = self.connections.lock();
        connections
            .peek(conn)?
            .generations
            .get(&generation)?
            .lists
            .get(list_key)
            .cloned()
    }

    /// Room subscriptions already delivered as of `generation`.
    pub fn subscriptions_at(&self, conn: &ConnectionId, generation: u64) -> BTreeSet<ItemId> {
        let connections = self.connections.lock();
        connections
            .peek(conn)
            .and_then(|entry| entry.generations.get(&generation))
            .map(|generation| generation.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Store the new window of one list, replacing any prior entry.
    pub fn commit(
        &self,
        conn: &ConnectionId,
        list_key: &str,
        slots: Vec<(Range, Vec<ItemId>)>,
        new_pos: PositionToken,
    ) {
        let generation = new_pos.connection();
        self.commit_all(
            conn,
            generation,
            vec![(list_key.to_owned(), WindowState::new(slots, new_pos))],
            None,
        );
    }

    /// Store several lists into `generation` under one lock.
    ///
    /// A new generation starts as a copy of the newest older one, so lists
    /// the request did not mention carry over. `subscriptions`, when given,
    /// replaces the delivered subscription set.
    pub fn commit_all(
        &self,
        conn: &ConnectionId,
        generation: u64,
        lists: Vec<(ListKey, WindowState)>,
        subscriptions: Option<BTreeSet<ItemId>>,
    ) {
        let mut connections = self.connections.lock();
        let entry = connections.get_or_insert_mut(conn.clone(), ConnectionEntry::new);
        entry.last_activity = Instant::now();

        if !entry.generations.contains_key(&generation) {
            let base = entry
                .generations
                .range(..generation)
                .next_back()
                .map(|(_, older)| older.clone())
                .unwrap_or_default();
            entry.generations.insert(generation, base);
        }

        if let Some(target) = entry.generations.get_mut(&generation) {
            let count = lists.len();
            target.lists.extend(lists);
            if let Some(subscriptions) = subscriptions {
                target.subscriptions = subscriptions;
            }
            debug!("💾 Committed {} list window(s) for {} at generation {}", count, conn, generation);
        }
    }

    /// Drop everything tracked for a connection.
    pub fn forget(&self, conn: &ConnectionId) -> bool {
        let removed = self.connections.lock().pop(conn).is_some();
        if removed {
            debug!("🗑️ Forgot sliding sync connection {}", conn);
        }
        removed
    }

    /// Drop every connection idle for longer than the configured timeout.
    pub fn cleanup_idle(&self) -> usize {
        let mut connections = self.connections.lock();
        let now = Instant::now();

        let idle: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > self.idle_timeout)
            .map(|(conn, _)| conn.clone())
            .collect();

        for conn in &idle {
            connections.pop(conn);
        }
        SlidingSyncMetrics::add(&self.metrics.evicted_connections, idle.len() as u64);

        if !idle.is_empty() {
            info!(
                "🧹 Cleaned up {} idle sliding sync connections, {} remaining",
                idle.len(),
                connections.len()
            );
        }
        idle.len()
    }

    pub fn connections_for_user(&self, user_id: &UserId) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|(conn, _)| conn.user_id == user_id)
            .count()
    }

    pub fn is_tracked(&self, conn: &ConnectionId) -> bool {
        self.connections.lock().contains(conn)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
