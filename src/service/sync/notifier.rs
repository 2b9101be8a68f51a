// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Notifier Module
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
//   Wake-up registry for long-polling sync requests. Writers advance the
//   change stream and name the entities they touched; every waiter whose
//   interest set intersects them is signalled. The registry lock is only held
//   to update bookkeeping and to collect signals, never while signalling or
//   while a woken request recomputes its response.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use ruma::OwnedUserId;
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};
use tracing::{debug, info, instrument};

use crate::{token::StreamPosition, types::ItemId};

/// Entity a waiting request cares about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WakeKey {
    User(OwnedUserId),
    Item(ItemId),
}

/// Why a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    Woken,
    TimedOut,
    Shutdown,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    signals: HashMap<u64, (Arc<Notify>, Vec<WakeKey>)>,
    interests: HashMap<WakeKey, HashSet<u64>>,
    positions: HashMap<WakeKey, StreamPosition>,
    /// Key positions at or below this were compacted away
    floor: StreamPosition,
}

impl Registry {
    fn remove(&mut self, id: u64) {
        let Some((_, keys)) = self.signals.remove(&id) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.interests.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.interests.remove(&key);
                }
            }
        }
    }
}

struct Inner {
    registry: Mutex<Registry>,
    position: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Process-wide wait coordinator, created at startup and shared by handle
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Resume the change stream at `position` (e.g. the storage high-water mark).
    pub fn starting_at(position: StreamPosition) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                position: AtomicU64::new(position),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn current_position(&self) -> StreamPosition {
        self.inner.position.load(Ordering::SeqCst)
    }

    /// Advance the change stream for `keys` and wake everyone interested.
    pub fn notify<I>(&self, keys: I) -> StreamPosition
    where
        I: IntoIterator<Item = WakeKey>,
    {
        let (position, woken) = {
            let mut registry = self.inner.registry.lock();
            let position = self.inner.position.fetch_add(1, Ordering::SeqCst) + 1;

            let mut woken: HashMap<u64, Arc<Notify>> = HashMap::new();
            for key in keys {
                if let Some(ids) = registry.interests.get(&key) {
                    for id in ids {
                        if let Some((signal, _)) = registry.signals.get(id) {
                            woken.entry(*id).or_insert_with(|| Arc::clone(signal));
                        }
                    }
                }
                registry.positions.insert(key, position);
            }
            (position, woken)
        };

        for signal in woken.values() {
            signal.notify_one();
        }
        debug!("📣 Stream advanced to {}, woke {} waiter(s)", position, woken.len());
        position
    }

    /// Register interest in `keys`; the waiter is signalled right away when
    /// any of them changed after `since`.
    pub fn register(&self, keys: Vec<WakeKey>, since: StreamPosition) -> Waiter {
        let signal = Arc::new(Notify::new());

        let (id, already) = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;

            let already = since < registry.floor
                || keys
                    .iter()
                    .any(|key| registry.positions.get(key).is_some_and(|p| *p > since));
            for key in &keys {
                registry.interests.entry(key.clone()).or_default().insert(id);
            }
            registry.signals.insert(id, (Arc::clone(&signal), keys));
            (id, already)
        };

        if already || self.is_shutdown() {
            signal.notify_one();
        }

        Waiter {
            id,
            signal,
            notifier: self.clone(),
        }
    }

    /// Block until one of `keys` changes after `since`, or `timeout` elapses.
    #[instrument(level = "debug", skip(self, keys))]
    pub async fn wait_for_update(&self, keys: Vec<WakeKey>, since: StreamPosition, timeout: Duration) -> WakeSignal {
        self.register(keys, since).wait_until(Instant::now() + timeout).await
    }

    /// Forget per-key positions up to the current stream position.
    ///
    /// Registrations older than the compaction point are woken right away,
    /// which only costs the waiter one extra recompute.
    pub fn compact(&self) -> usize {
        let mut registry = self.inner.registry.lock();
        let dropped = registry.positions.len();
        registry.positions.clear();
        registry.floor = self.current_position();
        debug!("🧹 Compacted {} key position(s) below {}", dropped, registry.floor);
        dropped
    }

    /// Number of registered waiters.
    pub fn waiter_count(&self) -> usize {
        self.inner.registry.lock().signals.len()
    }

    /// Wake every waiter for good; later waits return immediately.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let signals: Vec<Arc<Notify>> = self
            .inner
            .registry
            .lock()
            .signals
            .values()
            .map(|(signal, _)| Arc::clone(signal))
            .collect();
        for signal in &signals {
            signal.notify_one();
        }
        info!("🛑 Notifier shut down, released {} waiter(s)", signals.len());
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one waiting request; dropping it deregisters.
pub struct Waiter {
    id: u64,
    signal: Arc<Notify>,
    notifier: Notifier,
}

impl Waiter {
    pub async fn wait_until(&self, deadline: Instant) -> WakeSignal {
        let woken = tokio::time::timeout_at(deadline, self.signal.notified()).await.is_ok();
        if self.notifier.is_shutdown() {
            WakeSignal::Shutdown
        } else if woken {
            WakeSignal::Woken
        } else {
            WakeSignal::TimedOut
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.notifier.inner.registry.lock().remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{owned_room_id, user_id};

    fn alice() -> WakeKey {
        WakeKey::User(user_id!("@alice:matrixon.local").to_owned())
    }

    fn bob() -> WakeKey {
        WakeKey::User(user_id!("@bob:matrixon.local").to_owned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_wakes_interested_waiter() {
        let notifier = Notifier::new();
        let waiter = notifier.register(vec![alice()], notifier.current_position());

        let writer = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.notify([alice()]);
        });

        let signal = waiter.wait_until(Instant::now() + Duration::from_secs(30)).await;
        assert_eq!(signal, WakeSignal::Woken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_notify_does_not_wake() {
        let notifier = Notifier::new();
        let waiter = notifier.register(vec![alice()], 0);
        notifier.notify([bob()]);

        let signal = waiter.wait_until(Instant::now() + Duration::from_secs(30)).await;
        assert_eq!(signal, WakeSignal::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_change_returns_immediately() {
        let notifier = Notifier::new();
        let since = notifier.current_position();
        notifier.notify([WakeKey::Item(owned_room_id!("!a:matrixon.local"))]);

        let started = Instant::now();
        let signal = notifier
            .wait_for_update(
                vec![WakeKey::Item(owned_room_id!("!a:matrixon.local"))],
                since,
                Duration::from_secs(30),
            )
            .await;
        assert_eq!(signal, WakeSignal::Woken);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_since_is_ignored() {
        let notifier = Notifier::new();
        notifier.notify([alice()]);
        let signal = notifier
            .wait_for_update(vec![alice()], notifier.current_position(), Duration::from_secs(5))
            .await;
        assert_eq!(signal, WakeSignal::TimedOut);
    }

    #[tokio::test]
    async fn test_dropping_waiter_deregisters() {
        let notifier = Notifier::new();
        let first = notifier.register(vec![alice(), bob()], 0);
        let second = notifier.register(vec![alice()], 0);
        assert_eq!(notifier.waiter_count(), 2);

        drop(first);
        assert_eq!(notifier.waiter_count(), 1);
        drop(second);
        assert_eq!(notifier.waiter_count(), 0);
        assert!(notifier.inner.registry.lock().interests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_waiters() {
        let notifier = Notifier::new();
        let waiter = notifier.register(vec![alice()], 0);
        let mut shutdown = notifier.subscribe_shutdown();

        notifier.shutdown();
        let signal = waiter.wait_until(Instant::now() + Duration::from_secs(30)).await;
        assert_eq!(signal, WakeSignal::Shutdown);
        assert!(*shutdown.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_keeps_wakeups_correct() {
        let notifier = Notifier::new();
        let before = notifier.current_position();
        notifier.notify([alice()]);
        notifier.notify([bob()]);

        assert_eq!(notifier.compact(), 2);
        assert!(notifier.inner.registry.lock().positions.is_empty());

        // Older than the compaction point: wakes without knowing which key moved.
        let stale = notifier.register(vec![alice()], before);
        assert_eq!(stale.wait_until(Instant::now()).await, WakeSignal::Woken);

        let since = notifier.current_position();
        let current = notifier.register(vec![alice()], since);
        assert_eq!(
            current.wait_until(Instant::now() + Duration::from_secs(5)).await,
            WakeSignal::TimedOut
        );

        notifier.notify([alice()]);
        let after = notifier.register(vec![alice()], since);
        assert_eq!(after.wait_until(Instant::now()).await, WakeSignal::Woken);
    }

    #[test]
    fn test_positions_advance() {
        let notifier = Notifier::starting_at(41);
        assert_eq!(notifier.notify([alice()]), 42);
        assert_eq!(notifier.notify(Vec::new()), 43);
        assert_eq!(notifier.current_position(), 43);
    }
}
