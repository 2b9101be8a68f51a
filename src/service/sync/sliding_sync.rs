// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Service Module
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
//   Request handler of the sliding window sync engine. Validates the
//   requested windows, resolves the position token against the window
//   tracker, computes list operations through the diff engine and long-polls
//   on the notifier until there is something to report or the timeout
//   elapses. Window state is committed only once a non-empty response has
//   been fully assembled.
//
// =============================================================================

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use ruma::UserId;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::SlidingSyncConfig,
    metrics::{MetricsSnapshot, SlidingSyncMetrics},
    service::sync::{
        assembler::ResultAssembler,
        diff::{diff, DensityThreshold},
        notifier::{Notifier, WakeKey, WakeSignal},
        sources::{ExtensionSource, ItemSource, ListSource},
        tracker::{Acknowledgement, WindowState, WindowTracker},
    },
    token::{PositionToken, ServerEpoch, StreamPosition},
    types::{normalize_ranges, ConnectionId, ItemId, ListKey, Range, SyncResult},
    Error, Result,
};

/// Window request for one list key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub ranges: Vec<Range>,
}

/// One sliding sync request as decoded by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingSyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,

    /// Long-poll timeout in milliseconds
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub lists: BTreeMap<ListKey, ListRequest>,

    /// Items streamed regardless of any list window
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub room_subscriptions: BTreeSet<ItemId>,
}

impl SlidingSyncRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pos(mut self, pos: &PositionToken) -> Self {
        self.pos = Some(pos.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_list(mut self, list_key: impl Into<ListKey>, ranges: Vec<Range>) -> Self {
        self.lists.insert(list_key.into(), ListRequest { ranges });
        self
    }

    pub fn with_room_subscription(mut self, item_id: ItemId) -> Self {
        self.room_subscriptions.insert(item_id);
        self
    }
}

/// Outcome of one computation pass, not yet committed
struct Pass {
    result: SyncResult,
    windows: Vec<(ListKey, WindowState)>,
    subscriptions: BTreeSet<ItemId>,
    generation: u64,
    full_resync: bool,
}

/// Marks a connection as having a request in flight until dropped
struct InFlight<'a> {
    requests: &'a Mutex<HashSet<ConnectionId>>,
    conn: ConnectionId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.requests.lock().remove(&self.conn);
    }
}

pub struct SlidingSyncService {
    config: SlidingSyncConfig,
    epoch: ServerEpoch,
    threshold: DensityThreshold,
    tracker: WindowTracker,
    notifier: Notifier,
    lists: Arc<dyn ListSource>,
    items: Arc<dyn ItemSource>,
    extensions: Arc<dyn ExtensionSource>,
    in_flight: Mutex<HashSet<ConnectionId>>,
    metrics: Arc<SlidingSyncMetrics>,
}

impl SlidingSyncService {
    pub fn new(
        config: SlidingSyncConfig,
        notifier: Notifier,
        lists: Arc<dyn ListSource>,
        items: Arc<dyn ItemSource>,
        extensions: Arc<dyn ExtensionSource>,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_connections)
            .ok_or_else(|| Error::BadConfig("max_connections must be positive".to_owned()))?;

        let metrics = Arc::new(SlidingSyncMetrics::default());
        let epoch = ServerEpoch::generate();
        info!("🚀 Sliding sync service started, epoch {:08x}", epoch.0);

        Ok(Self {
            threshold: DensityThreshold::new(config.collapse_threshold_percent),
            tracker: WindowTracker::new(capacity, config.idle_timeout(), Arc::clone(&metrics)),
            config,
            epoch,
            notifier,
            lists,
            items,
            extensions,
            in_flight: Mutex::new(HashSet::new()),
            metrics,
        })
    }

    /// Pin the server epoch, e.g. to simulate a restart against old tokens.
    pub fn with_epoch(mut self, epoch: ServerEpoch) -> Self {
        self.epoch = epoch;
        self
    }

    /// Handle one sliding sync request on `conn`.
    #[instrument(level = "debug", skip(self, conn, request), fields(conn = %conn))]
    pub async fn sliding_sync(&self, conn: &ConnectionId, request: SlidingSyncRequest) -> Result<SyncResult> {
        let started = Instant::now();
        SlidingSyncMetrics::incr(&self.metrics.total_requests);
        debug!("🔄 Sliding sync request on {}", conn);

        let outcome = self.handle_request(conn, request).await;

        let elapsed = started.elapsed();
        self.metrics.last_response_time_us.store(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            std::sync::atomic::Ordering::Relaxed,
        );
        match &outcome {
            Ok(result) => debug!(
                "✅ Sliding sync on {} completed in {:?}: {} list(s), {} item(s), pos {}",
                conn,
                elapsed,
                result.lists.len(),
                result.items.len(),
                result.next_pos
            ),
            Err(e) if e.is_client_error() => {
                SlidingSyncMetrics::incr(&self.metrics.rejected_requests);
                warn!("⚠️ Rejected sliding sync request on {}: {}", conn, e);
            }
            Err(e) => error!("❌ Sliding sync on {} failed: {}", conn, e),
        }
        outcome
    }

    async fn handle_request(&self, conn: &ConnectionId, request: SlidingSyncRequest) -> Result<SyncResult> {
        let _in_flight = self.begin_request(conn)?;
        let lists = self.validate_request(&request)?;
        let subscriptions = &request.room_subscriptions;
        let since = self.resolve_since(conn, request.pos.as_deref())?;
        let timeout = self
            .config
            .effective_timeout(request.timeout_ms.map(Duration::from_millis));

        match since {
            Some(since) if !timeout.is_zero() => {
                self.wait_for_changes(conn, since, &lists, subscriptions, timeout)
                    .await
            }
            since => {
                let pass = self
                    .compute(conn, since.as_ref(), &lists, subscriptions, self.notifier.current_position())
                    .await?;
                Ok(self.finish(conn, pass))
            }
        }
    }

    fn begin_request(&self, conn: &ConnectionId) -> Result<InFlight<'_>> {
        if !self.in_flight.lock().insert(conn.clone()) {
            return Err(Error::ConcurrentRequest(conn.to_string()));
        }
        Ok(InFlight {
            requests: &self.in_flight,
            conn: conn.clone(),
        })
    }

    /// Normalized ranges per requested list.
    fn validate_request(&self, request: &SlidingSyncRequest) -> Result<BTreeMap<ListKey, Vec<Range>>> {
        if request.lists.len() > self.config.max_lists {
            return Err(Error::InvalidRange(format!(
                "{} lists requested, at most {} allowed",
                request.lists.len(),
                self.config.max_lists
            )));
        }
        if request.room_subscriptions.len() > self.config.max_room_subscriptions {
            return Err(Error::InvalidRequest(format!(
                "{} room subscriptions requested, at most {} allowed",
                request.room_subscriptions.len(),
                self.config.max_room_subscriptions
            )));
        }

        request
            .lists
            .iter()
            .map(|(list_key, list)| {
                let ranges = normalize_ranges(list_key, &list.ranges, self.config.max_ranges_per_list)?;
                Ok((list_key.clone(), ranges))
            })
            .collect()
    }

    /// Turn the request token into the position to diff against.
    ///
    /// `None` means first sync: no token, or one that can no longer be used.
    fn resolve_since(&self, conn: &ConnectionId, pos: Option<&str>) -> Result<Option<PositionToken>> {
        if !self.tracker.is_tracked(conn)
            && self.tracker.connections_for_user(&conn.user_id) >= self.config.max_connections_per_user
        {
            return Err(Error::ConnectionLimit(format!(
                "{} already has {} sliding sync connections",
                conn.user_id, self.config.max_connections_per_user
            )));
        }

        let token = match pos.map(|raw| self.validate_token(raw)).transpose() {
            Ok(token) => token,
            Err(e) => {
                warn!("⚠️ {}, restarting connection {}", e, conn);
                self.evict(conn);
                None
            }
        };

        match self.tracker.acknowledge(conn, token.as_ref().map(PositionToken::connection)) {
            Acknowledgement::Fresh | Acknowledgement::Known => Ok(token),
            Acknowledgement::Unknown => {
                warn!("⚠️ Position {:?} is unknown for {}, restarting connection", pos, conn);
                self.evict(conn);
                self.tracker.acknowledge(conn, None);
                Ok(None)
            }
        }
    }

    fn validate_token(&self, raw: &str) -> Result<PositionToken> {
        let token: PositionToken = raw.parse()?;
        if !token.is_from(self.epoch) {
            return Err(Error::StaleToken(format!("{raw} was issued by another server instance")));
        }
        if token.stream() > self.notifier.current_position() {
            return Err(Error::StaleToken(format!("{raw} is ahead of the change stream")));
        }
        Ok(token)
    }

    fn evict(&self, conn: &ConnectionId) {
        if self.tracker.forget(conn) {
            SlidingSyncMetrics::incr(&self.metrics.evicted_connections);
        }
    }

    /// Long-poll loop: register, compute, and either answer or sleep until woken.
    #[instrument(
        level = "debug",
        skip(self, conn, since, lists, subscriptions),
        fields(conn = %conn, since = %since)
    )]
    async fn wait_for_changes(
        &self,
        conn: &ConnectionId,
        since: PositionToken,
        lists: &BTreeMap<ListKey, Vec<Range>>,
        subscriptions: &BTreeSet<ItemId>,
        timeout: Duration,
    ) -> Result<SyncResult> {
        let deadline = Instant::now() + timeout;

        loop {
            let snapshot = self.notifier.current_position();
            let waiter = self
                .notifier
                .register(self.wake_keys(conn, &since, lists, subscriptions), snapshot);

            let pass = self
                .compute(conn, Some(&since), lists, subscriptions, snapshot)
                .await?;
            if !pass.result.is_empty() {
                return Ok(self.finish(conn, pass));
            }

            match waiter.wait_until(deadline).await {
                WakeSignal::Woken => {
                    SlidingSyncMetrics::incr(&self.metrics.wakeups);
                    debug!("⏰ {} woken, recomputing", conn);
                }
                WakeSignal::TimedOut | WakeSignal::Shutdown => {
                    SlidingSyncMetrics::incr(&self.metrics.timed_out_requests);
                    debug!("⌛ No changes for {} within {:?}", conn, timeout);
                    return Ok(pass.result);
                }
            }
        }
    }

    fn wake_keys(
        &self,
        conn: &ConnectionId,
        since: &PositionToken,
        lists: &BTreeMap<ListKey, Vec<Range>>,
        subscriptions: &BTreeSet<ItemId>,
    ) -> Vec<WakeKey> {
        let mut visible = subscriptions.clone();
        for list_key in lists.keys() {
            if let Some(window) = self.tracker.lookup_at(conn, since.connection(), list_key) {
                visible.extend(window.ordered_ids().cloned());
            }
        }

        std::iter::once(WakeKey::User(conn.user_id.clone()))
            .chain(visible.into_iter().map(WakeKey::Item))
            .collect()
    }

    /// One pass of diff plus assembly at stream position `snapshot`.
    async fn compute(
        &self,
        conn: &ConnectionId,
        since: Option<&PositionToken>,
        lists: &BTreeMap<ListKey, Vec<Range>>,
        subscriptions: &BTreeSet<ItemId>,
        snapshot: StreamPosition,
    ) -> Result<Pass> {
        let user_id = &conn.user_id;
        let base = since.map_or(0, PositionToken::connection);
        let generation = base + 1;
        let next_pos = PositionToken::new(self.epoch, snapshot, generation);

        let mut window_lists = BTreeMap::new();
        let mut windows = Vec::with_capacity(lists.len());
        let mut live_items = BTreeSet::new();
        let mut full_resync = false;

        for (list_key, ranges) in lists {
            let previous = since.and_then(|token| self.tracker.lookup_at(conn, token.connection(), list_key));

            let mut slots: Vec<(Range, Vec<ItemId>)> = Vec::with_capacity(ranges.len());
            for &range in ranges {
                let mut ids = self.lists.ordering(user_id, list_key, range, snapshot).await?;
                ids.truncate(usize::try_from(range.len()).unwrap_or(usize::MAX));
                slots.push((range, ids));
            }
            let count = self.lists.count(user_id, list_key, snapshot).await?;
            let count_changed = previous.as_ref().map_or(true, |window| window.count() != Some(count));

            let steady = previous
                .as_ref()
                .is_some_and(|window| window.ranges().eq(ranges.iter().copied()));
            full_resync |= !steady;

            let list = diff(
                previous.as_ref(),
                ranges,
                |range| {
                    slots
                        .iter()
                        .find(|(r, _)| *r == range)
                        .map(|(_, ids)| ids.clone())
                        .unwrap_or_default()
                },
                count,
                self.threshold,
            );

            if let (true, Some(since)) = (steady, since) {
                let referenced: HashSet<&ItemId> = list.ops.iter().flat_map(|op| op.item_ids()).collect();
                let untouched: Vec<ItemId> = slots
                    .iter()
                    .flat_map(|(_, ids)| ids.iter())
                    .filter(|id| !referenced.contains(id))
                    .cloned()
                    .collect();
                if !untouched.is_empty() {
                    live_items.extend(self.items.changed_since(user_id, &untouched, since.stream()).await?);
                }
            }

            windows.push((
                list_key.clone(),
                WindowState::new(slots, next_pos.clone()).with_count(count),
            ));
            if !list.ops.is_empty() || count_changed {
                window_lists.insert(list_key.clone(), list);
            }
        }

        let subscriptions = self.allowed_subscriptions(user_id, subscriptions).await?;
        match since {
            Some(since) => {
                let delivered = self.tracker.subscriptions_at(conn, since.connection());
                let (held, new): (Vec<ItemId>, Vec<ItemId>) =
                    subscriptions.iter().cloned().partition(|id| delivered.contains(id));
                live_items.extend(new);
                if !held.is_empty() {
                    live_items.extend(self.items.changed_since(user_id, &held, since.stream()).await?);
                }
            }
            None => live_items.extend(subscriptions.iter().cloned()),
        }

        let assembler = ResultAssembler::new(self.items.as_ref(), self.extensions.as_ref());
        let mut result = assembler
            .assemble(
                user_id,
                window_lists,
                live_items,
                since.map(PositionToken::stream),
                next_pos,
            )
            .await?;

        if result.is_empty() {
            result.next_pos = PositionToken::new(self.epoch, snapshot, base);
        }

        Ok(Pass {
            result,
            windows,
            subscriptions,
            generation,
            full_resync,
        })
    }

    /// Subscriptions the user may see; the rest are skipped.
    async fn allowed_subscriptions(
        &self,
        user_id: &UserId,
        requested: &BTreeSet<ItemId>,
    ) -> Result<BTreeSet<ItemId>> {
        let mut allowed = BTreeSet::new();
        for item_id in requested {
            if self.items.can_subscribe(user_id, item_id).await? {
                allowed.insert(item_id.clone());
            } else {
                debug!("🚫 {} may not subscribe to {}, skipping", user_id, item_id);
            }
        }
        Ok(allowed)
    }

    /// Commit a pass that is about to be returned.
    fn finish(&self, conn: &ConnectionId, pass: Pass) -> SyncResult {
        let Pass {
            result,
            windows,
            subscriptions,
            generation,
            full_resync,
        } = pass;

        if !result.is_empty() {
            self.tracker.commit_all(conn, generation, windows, Some(subscriptions));

            let ops: usize = result.lists.values().map(|list| list.ops.len()).sum();
            SlidingSyncMetrics::add(&self.metrics.ops_emitted, ops as u64);
            SlidingSyncMetrics::add(&self.metrics.items_fetched, result.items.len() as u64);
            if full_resync {
                SlidingSyncMetrics::incr(&self.metrics.full_resyncs);
            }
        }
        result
    }

    /// Drop everything tracked for `conn`; its next request starts over.
    pub fn forget_connection(&self, conn: &ConnectionId) -> bool {
        let forgotten = self.tracker.forget(conn);
        if forgotten {
            info!("👋 Forgot sliding sync connection {}", conn);
        }
        forgotten
    }

    /// Evict idle connections and compact the notifier once.
    pub fn run_maintenance(&self) -> usize {
        let evicted = self.tracker.cleanup_idle();
        self.notifier.compact();
        evicted
    }

    /// Periodic idle eviction until the notifier shuts down.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown = self.notifier.subscribe_shutdown();
        let period = self.config.cleanup_interval();

        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        service.run_maintenance();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("🛑 Sliding sync maintenance stopped");
        })
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn epoch(&self) -> ServerEpoch {
        self.epoch
    }

    pub fn config(&self) -> &SlidingSyncConfig {
        &self.config
    }

    pub fn tracked_connections(&self) -> usize {
        self.tracker.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ruma::{device_id, owned_room_id, user_id, UserId};
    use serde_json::json;

    use crate::{
        service::sync::sources::NoExtensions,
        types::{Extensions, ItemResult},
    };

    /// Fixed ordering of ten rooms for every list key
    struct StaticRooms;

    fn room(n: u64) -> ItemId {
        ItemId::try_from(format!("!room{n}:matrixon.local")).unwrap()
    }

    #[async_trait]
    impl ListSource for StaticRooms {
        async fn ordering(&self, _: &UserId, _: &str, range: Range, _: StreamPosition) -> Result<Vec<ItemId>> {
            Ok(range.positions().take_while(|p| *p < 10).map(room).collect())
        }

        async fn count(&self, _: &UserId, _: &str, _: StreamPosition) -> Result<u64> {
            Ok(10)
        }
    }

    #[async_trait]
    impl ItemSource for StaticRooms {
        async fn fetch(&self, _: &UserId, item_id: &ItemId) -> Result<ItemResult> {
            Ok(json!({ "name": item_id.as_str() }))
        }
    }

    fn service(config: SlidingSyncConfig) -> SlidingSyncService {
        let rooms = Arc::new(StaticRooms);
        SlidingSyncService::new(
            config,
            Notifier::new(),
            rooms.clone(),
            rooms,
            Arc::new(NoExtensions),
        )
        .unwrap()
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(
            user_id!("@alice:matrixon.local").to_owned(),
            device_id!("DEVICE").to_owned(),
            id,
        )
    }

    #[tokio::test]
    async fn test_request_validation() {
        let service = service(SlidingSyncConfig::default());

        let overlapping = SlidingSyncRequest::new().with_list(
            "all",
            vec![Range::new(0, 5).unwrap(), Range::new(3, 8).unwrap()],
        );
        assert!(matches!(
            service.validate_request(&overlapping),
            Err(Error::OverlappingRanges { .. })
        ));

        let mut config = SlidingSyncConfig::default();
        config.max_lists = 1;
        let service = self::service(config);
        let too_many = SlidingSyncRequest::new()
            .with_list("a", vec![])
            .with_list("b", vec![]);
        assert!(matches!(service.validate_request(&too_many), Err(Error::InvalidRange(_))));

        let mut config = SlidingSyncConfig::default();
        config.max_room_subscriptions = 1;
        let service = self::service(config);
        let subscribed = SlidingSyncRequest::new()
            .with_room_subscription(room(1))
            .with_room_subscription(room(2));
        assert!(matches!(service.validate_request(&subscribed), Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_subscriptions_are_registered_for_wakeups() {
        let service = service(SlidingSyncConfig::default());
        let main = conn("main");
        let request = SlidingSyncRequest::new()
            .with_list("all", vec![Range::new(0, 0).unwrap()])
            .with_room_subscription(room(7));
        let first = service.sliding_sync(&main, request.clone()).await.unwrap();
        assert!(first.items.contains_key(&room(7)));

        let lists = service.validate_request(&request).unwrap();
        let keys = service.wake_keys(&main, &first.next_pos, &lists, &request.room_subscriptions);
        assert!(keys.contains(&WakeKey::Item(room(7))));
        assert!(keys.contains(&WakeKey::Item(room(0))));
        assert!(keys.contains(&WakeKey::User(main.user_id.clone())));
    }

    #[tokio::test]
    async fn test_first_sync_commits_generation_one() {
        let service = service(SlidingSyncConfig::default());
        let request = SlidingSyncRequest::new().with_list("all", vec![Range::new(0, 2).unwrap()]);

        let result = service.sliding_sync(&conn("main"), request).await.unwrap();

        assert_eq!(result.next_pos.connection(), 1);
        assert_eq!(result.lists["all"].count, 10);
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[&owned_room_id!("!room0:matrixon.local")], json!({ "name": "!room0:matrixon.local" }));
        assert_eq!(service.metrics().full_resyncs, 1);
        assert_eq!(service.tracked_connections(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_request_is_rejected() {
        let service = service(SlidingSyncConfig::default());
        let main = conn("main");

        let guard = service.begin_request(&main).unwrap();
        let err = service
            .sliding_sync(&main, SlidingSyncRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentRequest(_)));
        assert_eq!(service.metrics().rejected_requests, 1);

        drop(guard);
        assert!(service.sliding_sync(&main, SlidingSyncRequest::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_limit_per_user() {
        let mut config = SlidingSyncConfig::default();
        config.max_connections_per_user = 1;
        let service = service(config);
        let request = SlidingSyncRequest::new().with_list("all", vec![Range::new(0, 0).unwrap()]);

        service.sliding_sync(&conn("one"), request.clone()).await.unwrap();
        let err = service.sliding_sync(&conn("two"), request.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLimit(_)));

        assert!(service.forget_connection(&conn("one")));
        assert!(service.sliding_sync(&conn("two"), request).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_from_other_epoch_restarts_connection() {
        let service = service(SlidingSyncConfig::default()).with_epoch(ServerEpoch(7));
        let request = SlidingSyncRequest::new().with_list("all", vec![Range::new(0, 1).unwrap()]);

        let first = service.sliding_sync(&conn("main"), request.clone()).await.unwrap();
        let foreign = PositionToken::new(ServerEpoch(8), 0, first.next_pos.connection());

        let again = service
            .sliding_sync(&conn("main"), request.with_pos(&foreign).with_timeout(Duration::ZERO))
            .await
            .unwrap();
        assert!(again.lists["all"]
            .ops
            .iter()
            .all(|op| matches!(op, crate::types::Operation::Sync { .. })));
        assert_eq!(again.next_pos.connection(), 1);
        assert_eq!(service.metrics().evicted_connections, 1);
    }

    #[tokio::test]
    async fn test_config_is_validated() {
        let mut config = SlidingSyncConfig::default();
        config.collapse_threshold_percent = 200;
        let rooms = Arc::new(StaticRooms);
        let built = SlidingSyncService::new(config, Notifier::new(), rooms.clone(), rooms, Arc::new(NoExtensions));
        assert!(matches!(built, Err(Error::BadConfig(_))));
    }

    #[tokio::test]
    async fn test_extensions_alone_are_reported() {
        struct Greeting;

        #[async_trait]
        impl ExtensionSource for Greeting {
            async fn extensions(&self, _: &UserId, since: Option<StreamPosition>) -> Result<Extensions> {
                Ok(match since {
                    None => Extensions::from([("greeting".to_owned(), json!("hello"))]),
                    Some(_) => Extensions::new(),
                })
            }
        }

        let rooms = Arc::new(StaticRooms);
        let service = SlidingSyncService::new(
            SlidingSyncConfig::default(),
            Notifier::new(),
            rooms.clone(),
            rooms,
            Arc::new(Greeting),
        )
        .unwrap();

        let result = service
            .sliding_sync(&conn("main"), SlidingSyncRequest::new())
            .await
            .unwrap();
        assert!(result.lists.is_empty());
        assert_eq!(result.extensions["greeting"], json!("hello"));
        assert_eq!(result.next_pos.connection(), 1);
    }
}
