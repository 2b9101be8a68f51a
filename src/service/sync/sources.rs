//! Capabilities the sync engine needs from the rest of the server
//!
//! Orderings, item payloads and extensions come from storage the engine does
//! not own. Implementations must answer consistently for one stream position
//! within a single pass.

use async_trait::async_trait;
use ruma::UserId;

use crate::{
    token::StreamPosition,
    types::{Extensions, ItemId, ItemResult, Range},
    Result,
};

/// Ordered collections behind list keys
#[async_trait]
pub trait ListSource: Send + Sync {
    /// Ids at the positions of `range`, in order, as of `at`.
    ///
    /// Returns fewer than `range.len()` ids when the collection ends inside
    /// the range.
    async fn ordering(&self, user_id: &UserId, list_key: &str, range: Range, at: StreamPosition) -> Result<Vec<ItemId>>;

    /// Size of the whole collection as of `at`.
    async fn count(&self, user_id: &UserId, list_key: &str, at: StreamPosition) -> Result<u64>;
}

/// Per-item payloads
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch(&self, user_id: &UserId, item_id: &ItemId) -> Result<ItemResult>;

    /// Which of `item_ids` changed after `since`.
    async fn changed_since(
        &self,
        _user_id: &UserId,
        _item_ids: &[ItemId],
        _since: StreamPosition,
    ) -> Result<Vec<ItemId>> {
        Ok(Vec::new())
    }

    /// Whether `user_id` may subscribe to `item_id` directly.
    async fn can_subscribe(&self, _user_id: &UserId, _item_id: &ItemId) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
pub trait ExtensionSource: Send + Sync {
    /// Extension payloads with news after `since` (everything when `None`).
    async fn extensions(&self, user_id: &UserId, since: Option<StreamPosition>) -> Result<Extensions>;
}

/// Extension source that never has anything to say
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtensions;

#[async_trait]
impl ExtensionSource for NoExtensions {
    async fn extensions(&self, _user_id: &UserId, _since: Option<StreamPosition>) -> Result<Extensions> {
        Ok(Extensions::new())
    }
}
