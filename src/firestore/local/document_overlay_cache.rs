use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::credentials::User;
use crate::firestore::core::types::BatchId;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, Mutation, Overlay, ResourcePath};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct OverlayTable {
    pub(crate) users: BTreeMap<String, UserOverlays>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct UserOverlays {
    #[serde(with = "crate::firestore::util::serde_entries")]
    pub(crate) overlays: BTreeMap<DocumentKey, Overlay>,
}

/// Net effect of a user's pending writes per document.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key().to_string(),
        }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> Option<Overlay> {
        self.overlays(txn)?.get(key).cloned()
    }

    pub fn get_overlays(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let Some(overlays) = self.overlays(txn) else {
            return BTreeMap::new();
        };
        keys.iter()
            .filter_map(|key| overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect()
    }

    /// Stores one overlay per entry of `overlays`, all tagged with
    /// `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) {
        if overlays.is_empty() {
            return;
        }
        let stored = self.overlays_mut(txn);
        for (key, mutation) in overlays {
            stored.insert(key.clone(), Overlay::new(largest_batch_id, mutation.clone()));
        }
    }

    pub fn remove_overlay(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        let present = self
            .overlays(txn)
            .map_or(false, |overlays| overlays.contains_key(key));
        if present {
            self.overlays_mut(txn).remove(key);
        }
    }

    /// Drops the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) {
        let doomed: Vec<DocumentKey> = match self.overlays(txn) {
            Some(overlays) => keys
                .iter()
                .filter(|key| {
                    overlays
                        .get(*key)
                        .map_or(false, |overlay| overlay.largest_batch_id == batch_id)
                })
                .cloned()
                .collect(),
            None => return,
        };
        if doomed.is_empty() {
            return;
        }
        let overlays = self.overlays_mut(txn);
        for key in doomed {
            overlays.remove(&key);
        }
    }

    /// Overlays of documents directly inside `collection` written by batches
    /// after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let Some(overlays) = self.overlays(txn) else {
            return BTreeMap::new();
        };
        let start = DocumentKey::collection_scan_start(collection);
        overlays
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays in `collection_group` written after `since_batch_id`, taking
    /// whole batches in id order until at least `count` overlays are
    /// collected.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let Some(overlays) = self.overlays(txn) else {
            return BTreeMap::new();
        };
        let mut by_batch: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        for (key, overlay) in overlays {
            if key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }

        let mut result = BTreeMap::new();
        for (_, batch_overlays) in by_batch {
            for overlay in batch_overlays {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }

    fn overlays<'a>(&self, txn: &'a PersistenceTransaction) -> Option<&'a BTreeMap<DocumentKey, Overlay>> {
        txn.overlays()
            .users
            .get(&self.user_key)
            .map(|user| &user.overlays)
    }

    fn overlays_mut<'a>(
        &self,
        txn: &'a mut PersistenceTransaction,
    ) -> &'a mut BTreeMap<DocumentKey, Overlay> {
        &mut txn
            .overlays_mut()
            .users
            .entry(self.user_key.clone())
            .or_default()
            .overlays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::value::MapValue;

    fn overlay_map(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths
            .iter()
            .map(|path| {
                let key = DocumentKey::from_string(path).unwrap();
                (key.clone(), Mutation::set(key, MapValue::empty()))
            })
            .collect()
    }

    #[tokio::test]
    async fn overlays_are_scoped_per_user() {
        let persistence = MemoryPersistence::default();
        persistence.start().await.unwrap();
        run_transaction(&persistence, "users", TransactionMode::ReadWrite, |txn| {
            let alice = DocumentOverlayCache::new(&User::new("alice"));
            let bob = DocumentOverlayCache::new(&User::new("bob"));
            alice.save_overlays(txn, 1, &overlay_map(&["rooms/a"]));
            let key = DocumentKey::from_string("rooms/a")?;
            assert!(alice.get_overlay(txn, &key).is_some());
            assert!(bob.get_overlay(txn, &key).is_none());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn removes_only_overlays_of_batch() {
        let persistence = MemoryPersistence::default();
        persistence.start().await.unwrap();
        run_transaction(&persistence, "remove", TransactionMode::ReadWrite, |txn| {
            let cache = DocumentOverlayCache::new(&User::unauthenticated());
            cache.save_overlays(txn, 1, &overlay_map(&["rooms/a"]));
            cache.save_overlays(txn, 2, &overlay_map(&["rooms/b"]));
            let keys: BTreeSet<DocumentKey> = overlay_map(&["rooms/a", "rooms/b"]).into_keys().collect();
            cache.remove_overlays_for_batch_id(txn, &keys, 1);

            let remaining = cache.get_overlays_for_collection(txn, &ResourcePath::from_string("rooms")?, -1);
            let names: Vec<String> = remaining.keys().map(ToString::to_string).collect();
            assert_eq!(names, vec!["rooms/b"]);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn collection_group_takes_whole_batches() {
        let persistence = MemoryPersistence::default();
        persistence.start().await.unwrap();
        run_transaction(&persistence, "group", TransactionMode::ReadWrite, |txn| {
            let cache = DocumentOverlayCache::new(&User::unauthenticated());
            cache.save_overlays(txn, 1, &overlay_map(&["a/1/msgs/x", "b/2/msgs/y"]));
            cache.save_overlays(txn, 2, &overlay_map(&["c/3/msgs/z"]));
            cache.save_overlays(txn, 3, &overlay_map(&["other/w"]));

            let first = cache.get_overlays_for_collection_group(txn, "msgs", 0, 1);
            assert_eq!(first.len(), 2);
            let later = cache.get_overlays_for_collection_group(txn, "msgs", 1, 10);
            assert_eq!(later.len(), 1);
            Ok(())
        })
        .await
        .unwrap();
    }
}
