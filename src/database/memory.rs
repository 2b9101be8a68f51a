// =============================================================================
// Matrixon Matrix NextServer - In-Memory Room Store Module
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
//   Process-local room store backing the sliding sync sources. Every write
//   advances the notifier's change stream while the store lock is held, so
//   a reader never observes data newer than the position it can be woken
//   for. Used by the simulator and the test suites.
//
//   List keys: "favourites" is the user's favourite rooms, every other key
//   is all joined rooms. Both are ordered by most recent activity.
//
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use ruma::{OwnedServerName, OwnedUserId, ServerName, UserId};
use serde_json::json;
use tracing::debug;

use crate::{
    service::sync::{
        notifier::{Notifier, WakeKey},
        sources::{ExtensionSource, ItemSource, ListSource},
    },
    token::StreamPosition,
    types::{Extensions, ItemId, ItemResult, Range},
    Error, Result,
};

/// List key served from the user's favourite tags
pub const FAVOURITES: &str = "favourites";

#[derive(Debug, Clone)]
struct RoomRecord {
    name: String,
    members: BTreeSet<OwnedUserId>,
    last_message: Option<(OwnedUserId, String)>,
    message_count: u64,
    /// Stream position of the last activity that moves the room up
    bump_stamp: StreamPosition,
    /// Stream position of the last change to the room's payload
    changed_at: StreamPosition,
}

#[derive(Debug, Default)]
struct TagRecord {
    favourites: BTreeSet<ItemId>,
    changed_at: StreamPosition,
}

#[derive(Default)]
struct StoreState {
    rooms: HashMap<ItemId, RoomRecord>,
    joined: HashMap<OwnedUserId, BTreeSet<ItemId>>,
    tags: HashMap<OwnedUserId, TagRecord>,
    next_room: u64,
}

impl StoreState {
    fn room_mut(&mut self, room_id: &ItemId) -> Result<&mut RoomRecord> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::Source(format!("unknown room {room_id}")))
    }

    /// Rooms of `list_key` for `user_id`, most recent first.
    fn ordered(&self, user_id: &UserId, list_key: &str) -> Vec<ItemId> {
        let Some(joined) = self.joined.get(user_id) else {
            return Vec::new();
        };
        let favourites = self.tags.get(user_id).map(|tags| &tags.favourites);

        let mut rooms: Vec<(&ItemId, StreamPosition)> = joined
            .iter()
            .filter(|room_id| list_key != FAVOURITES || favourites.is_some_and(|f| f.contains(*room_id)))
            .filter_map(|room_id| self.rooms.get(room_id).map(|room| (room_id, room.bump_stamp)))
            .collect();
        rooms.sort_by(|(a_id, a), (b_id, b)| b.cmp(a).then_with(|| a_id.cmp(b_id)));
        rooms.into_iter().map(|(room_id, _)| room_id.clone()).collect()
    }
}

pub struct MemoryRoomStore {
    server_name: OwnedServerName,
    state: RwLock<StoreState>,
    notifier: Notifier,
}

impl MemoryRoomStore {
    pub fn new(server_name: &ServerName, notifier: Notifier) -> Self {
        Self {
            server_name: server_name.to_owned(),
            state: RwLock::new(StoreState::default()),
            notifier,
        }
    }

    /// Create a room with `creator` as its only member.
    pub fn create_room(&self, name: &str, creator: &UserId) -> Result<ItemId> {
        let mut state = self.state.write();
        let room_id = ItemId::try_from(format!("!room{}:{}", state.next_room, self.server_name))?;
        state.next_room += 1;

        let position = self.notifier.notify([
            WakeKey::Item(room_id.clone()),
            WakeKey::User(creator.to_owned()),
        ]);
        state.rooms.insert(
            room_id.clone(),
            RoomRecord {
                name: name.to_owned(),
                members: BTreeSet::from([creator.to_owned()]),
                last_message: None,
                message_count: 0,
                bump_stamp: position,
                changed_at: position,
            },
        );
        state.joined.entry(creator.to_owned()).or_default().insert(room_id.clone());

        debug!("🏠 Created room {} ({}) at {}", room_id, name, position);
        Ok(room_id)
    }

    pub fn join(&self, room_id: &ItemId, user_id: &UserId) -> Result<StreamPosition> {
        let mut state = self.state.write();
        let room = state.room_mut(room_id)?;
        room.members.insert(user_id.to_owned());
        let keys = Self::room_keys(room_id, room);

        let position = self.notifier.notify(keys);
        let room = state.room_mut(room_id)?;
        room.bump_stamp = position;
        room.changed_at = position;
        state.joined.entry(user_id.to_owned()).or_default().insert(room_id.clone());
        Ok(position)
    }

    pub fn leave(&self, room_id: &ItemId, user_id: &UserId) -> Result<StreamPosition> {
        let mut state = self.state.write();
        let room = state.room_mut(room_id)?;
        let mut keys = Self::room_keys(room_id, room);
        room.members.remove(user_id);
        keys.push(WakeKey::User(user_id.to_owned()));

        let position = self.notifier.notify(keys);
        state.room_mut(room_id)?.changed_at = position;
        if let Some(joined) = state.joined.get_mut(user_id) {
            joined.remove(room_id);
        }
        if let Some(tags) = state.tags.get_mut(user_id) {
            tags.favourites.remove(room_id);
        }
        Ok(position)
    }

    /// New message: the room moves to the top of every member's lists.
    pub fn send_message(&self, room_id: &ItemId, sender: &UserId, body: &str) -> Result<StreamPosition> {
        let mut state = self.state.write();
        let room = state.room_mut(room_id)?;
        if !room.members.contains(sender) {
            return Err(Error::Source(format!("{sender} is not joined to {room_id}")));
        }
        room.last_message = Some((sender.to_owned(), body.to_owned()));
        room.message_count += 1;
        let keys = Self::room_keys(room_id, room);

        let position = self.notifier.notify(keys);
        let room = state.room_mut(room_id)?;
        room.bump_stamp = position;
        room.changed_at = position;
        Ok(position)
    }

    /// Changes the payload without moving the room.
    pub fn rename(&self, room_id: &ItemId, name: &str) -> Result<StreamPosition> {
        let mut state = self.state.write();
        state.room_mut(room_id)?.name = name.to_owned();

        let position = self.notifier.notify([WakeKey::Item(room_id.clone())]);
        state.room_mut(room_id)?.changed_at = position;
        Ok(position)
    }

    pub fn set_favourite(&self, user_id: &UserId, room_id: &ItemId, favourite: bool) -> Result<StreamPosition> {
        let mut state = self.state.write();
        if !state.joined.get(user_id).is_some_and(|rooms| rooms.contains(room_id)) {
            return Err(Error::Source(format!("{user_id} is not joined to {room_id}")));
        }

        let position = self.notifier.notify([WakeKey::User(user_id.to_owned())]);
        let tags = state.tags.entry(user_id.to_owned()).or_default();
        if favourite {
            tags.favourites.insert(room_id.clone());
        } else {
            tags.favourites.remove(room_id);
        }
        tags.changed_at = position;
        Ok(position)
    }

    pub fn rooms_of(&self, user_id: &UserId) -> Vec<ItemId> {
        self.state.read().ordered(user_id, "")
    }

    fn room_keys(room_id: &ItemId, room: &RoomRecord) -> Vec<WakeKey> {
        std::iter::once(WakeKey::Item(room_id.clone()))
            .chain(room.members.iter().cloned().map(WakeKey::User))
            .collect()
    }
}

#[async_trait]
impl ListSource for MemoryRoomStore {
    /// Always answers from the current state; writes advance the stream
    /// under the same lock, so that state is never older than `_at`.
    async fn ordering(&self, user_id: &UserId, list_key: &str, range: Range, _at: StreamPosition) -> Result<Vec<ItemId>> {
        let ordered = self.state.read().ordered(user_id, list_key);
        let start = usize::try_from(range.start).unwrap_or(usize::MAX);
        let len = usize::try_from(range.len()).unwrap_or(usize::MAX);
        Ok(ordered.into_iter().skip(start).take(len).collect())
    }

    async fn count(&self, user_id: &UserId, list_key: &str, _at: StreamPosition) -> Result<u64> {
        Ok(self.state.read().ordered(user_id, list_key).len() as u64)
    }
}

#[async_trait]
impl ItemSource for MemoryRoomStore {
    async fn fetch(&self, _user_id: &UserId, item_id: &ItemId) -> Result<ItemResult> {
        let state = self.state.read();
        let room = state
            .rooms
            .get(item_id)
            .ok_or_else(|| Error::ItemFetch(format!("unknown room {item_id}")))?;

        Ok(json!({
            "name": room.name,
            "joined_count": room.members.len(),
            "notification_count": room.message_count,
            "bump_stamp": room.bump_stamp,
            "last_message": room.last_message.as_ref().map(|(sender, body)| json!({
                "sender": sender,
                "body": body,
            })),
        }))
    }

    async fn changed_since(&self, _user_id: &UserId, item_ids: &[ItemId], since: StreamPosition) -> Result<Vec<ItemId>> {
        let state = self.state.read();
        Ok(item_ids
            .iter()
            .filter(|room_id| state.rooms.get(*room_id).is_some_and(|room| room.changed_at > since))
            .cloned()
            .collect())
    }

    /// Members only; rooms the user left or never joined stay hidden.
    async fn can_subscribe(&self, user_id: &UserId, item_id: &ItemId) -> Result<bool> {
        let state = self.state.read();
        Ok(state.rooms.get(item_id).is_some_and(|room| room.members.contains(user_id)))
    }
}

#[async_trait]
impl ExtensionSource for MemoryRoomStore {
    /// `account_data` with the user's `m.tag` favourites when they changed.
    async fn extensions(&self, user_id: &UserId, since: Option<StreamPosition>) -> Result<Extensions> {
        let state = self.state.read();
        let Some(tags) = state.tags.get(user_id) else {
            return Ok(Extensions::new());
        };
        if since.is_some_and(|since| tags.changed_at <= since) {
            return Ok(Extensions::new());
        }

        let rooms: BTreeMap<String, serde_json::Value> = tags
            .favourites
            .iter()
            .map(|room_id| (room_id.to_string(), json!({ "m.favourite": {} })))
            .collect();
        Ok(Extensions::from([(
            "account_data".to_owned(),
            json!({ "m.tag": { "rooms": rooms } }),
        )]))
    }
}
