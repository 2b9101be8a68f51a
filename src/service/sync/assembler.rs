// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Result Assembler Module
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
//   Builds one SyncResult out of the reported lists: every item any
//   operation references is fetched once, concurrently, and extensions are
//   attached. Makes no waiting decisions.
//
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use futures::future::try_join_all;
use ruma::UserId;
use tracing::{debug, instrument};

use crate::{
    service::sync::sources::{ExtensionSource, ItemSource},
    token::{PositionToken, StreamPosition},
    types::{ItemId, ListKey, SyncResult, WindowList},
    Error, Result,
};

pub struct ResultAssembler<'a> {
    items: &'a dyn ItemSource,
    extensions: &'a dyn ExtensionSource,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(items: &'a dyn ItemSource, extensions: &'a dyn ExtensionSource) -> Self {
        Self { items, extensions }
    }

    /// Compose the response for `user_id`.
    ///
    /// `lists` are the lists worth reporting: changed operations or a changed
    /// count. `live_items` are ids whose content changed without moving in any
    /// window, plus room subscriptions; they share the deduplicated fetch with
    /// the ids the operations reference.
    #[instrument(level = "debug", skip(self, lists, live_items))]
    pub async fn assemble(
        &self,
        user_id: &UserId,
        lists: BTreeMap<ListKey, WindowList>,
        live_items: BTreeSet<ItemId>,
        since: Option<StreamPosition>,
        next_pos: PositionToken,
    ) -> Result<SyncResult> {
        let mut wanted: BTreeSet<ItemId> = live_items;
        for list in lists.values() {
            for op in &list.ops {
                wanted.extend(op.item_ids().iter().cloned());
            }
        }

        let fetched = try_join_all(wanted.into_iter().map(|item_id| async move {
            let payload = self.items.fetch(user_id, &item_id).await.map_err(|e| match e {
                Error::ItemFetch(_) => e,
                other => Error::ItemFetch(format!("{item_id}: {other}")),
            })?;
            Ok::<_, Error>((item_id, payload))
        }))
        .await?;

        let extensions = self.extensions.extensions(user_id, since).await?;

        debug!(
            "🧩 Assembled {} list(s), {} item(s), {} extension(s)",
            lists.len(),
            fetched.len(),
            extensions.len()
        );

        Ok(SyncResult {
            next_pos,
            lists,
            items: fetched.into_iter().collect(),
            extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ruma::{owned_room_id, user_id};
    use serde_json::json;

    use crate::{
        service::sync::sources::NoExtensions,
        token::ServerEpoch,
        types::{Extensions, ItemResult, Operation, Range},
    };

    #[derive(Default)]
    struct CountingItems {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ItemSource for CountingItems {
        async fn fetch(&self, _user_id: &UserId, item_id: &ItemId) -> Result<ItemResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Source("storage unavailable".to_owned()));
            }
            Ok(json!({ "name": item_id.as_str() }))
        }
    }

    struct OneExtension;

    #[async_trait]
    impl ExtensionSource for OneExtension {
        async fn extensions(&self, _user_id: &UserId, _since: Option<StreamPosition>) -> Result<Extensions> {
            Ok(Extensions::from([("to_device".to_owned(), json!({ "events": [] }))]))
        }
    }

    fn pos() -> PositionToken {
        PositionToken::new(ServerEpoch(1), 10, 1)
    }

    fn sync_list(ids: Vec<ItemId>) -> WindowList {
        WindowList {
            count: ids.len() as u64,
            ops: vec![Operation::Sync {
                range: Range::new(0, 9).unwrap(),
                item_ids: ids,
            }],
        }
    }

    #[tokio::test]
    async fn test_shared_items_fetched_once() {
        let items = CountingItems::default();
        let assembler = ResultAssembler::new(&items, &NoExtensions);

        let a = owned_room_id!("!a:matrixon.local");
        let b = owned_room_id!("!b:matrixon.local");
        let mut lists = BTreeMap::new();
        lists.insert("all".to_owned(), sync_list(vec![a.clone(), b.clone()]));
        lists.insert(
            "favourites".to_owned(),
            WindowList {
                count: 1,
                ops: vec![Operation::Insert {
                    index: 0,
                    item_id: a.clone(),
                }],
            },
        );

        let result = assembler
            .assemble(user_id!("@alice:matrixon.local"), lists, BTreeSet::from([b.clone()]), None, pos())
            .await
            .unwrap();

        assert_eq!(items.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[&a], json!({ "name": "!a:matrixon.local" }));
        assert_eq!(result.lists.len(), 2);
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_report_is_empty() {
        let items = CountingItems::default();
        let assembler = ResultAssembler::new(&items, &NoExtensions);

        let result = assembler
            .assemble(user_id!("@alice:matrixon.local"), BTreeMap::new(), BTreeSet::new(), Some(3), pos())
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(items.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.next_pos, pos());
    }

    #[tokio::test]
    async fn test_count_only_list_is_kept() {
        let items = CountingItems::default();
        let assembler = ResultAssembler::new(&items, &NoExtensions);

        let mut lists = BTreeMap::new();
        lists.insert("all".to_owned(), WindowList { count: 5, ops: vec![] });

        let result = assembler
            .assemble(user_id!("@alice:matrixon.local"), lists, BTreeSet::new(), Some(3), pos())
            .await
            .unwrap();

        assert_eq!(result.lists["all"].count, 5);
        assert!(result.items.is_empty());
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn test_extensions_make_result_non_empty() {
        let items = CountingItems::default();
        let assembler = ResultAssembler::new(&items, &OneExtension);

        let result = assembler
            .assemble(user_id!("@alice:matrixon.local"), BTreeMap::new(), BTreeSet::new(), Some(3), pos())
            .await
            .unwrap();

        assert!(!result.is_empty());
        assert!(result.extensions.contains_key("to_device"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_item_fetch_error() {
        let items = CountingItems {
            fail: true,
            ..Default::default()
        };
        let assembler = ResultAssembler::new(&items, &NoExtensions);

        let mut lists = BTreeMap::new();
        lists.insert("all".to_owned(), sync_list(vec![owned_room_id!("!a:matrixon.local")]));

        let err = assembler
            .assemble(user_id!("@alice:matrixon.local"), lists, BTreeSet::new(), None, pos())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ItemFetch(_)));
        assert!(err.is_retryable());
    }
}
