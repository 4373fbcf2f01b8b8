//! Garbage collection policies for the document cache.
//!
//! Caches report reference changes to the delegate; the delegate decides at
//! commit time what happens to documents nothing references any more. The
//! eager policy deletes them immediately, the LRU policy stamps them with the
//! transaction's sequence number and removes the oldest ones once the cache
//! grows past its threshold.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::target::TargetData;
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::DocumentKey;
use crate::firestore::util::log::LOGGER;

/// Cache size that disables LRU collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

/// References held by live views, shared with the local store.
pub type InMemoryPins = Arc<StdMutex<ReferenceSet>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

pub trait ReferenceDelegate: Send + Sync {
    /// Installs the references of live views. Pinned documents are never
    /// collected.
    fn set_in_memory_pins(&self, pins: InMemoryPins);

    fn add_reference(&self, txn: &mut PersistenceTransaction, target_id: TargetId, key: &DocumentKey);

    fn remove_reference(&self, txn: &mut PersistenceTransaction, target_id: TargetId, key: &DocumentKey);

    /// A mutation referencing `key` went away.
    fn mark_potentially_orphaned(&self, txn: &mut PersistenceTransaction, key: &DocumentKey);

    /// A limbo resolution wrote `key`.
    fn update_limbo_document(&self, txn: &mut PersistenceTransaction, key: &DocumentKey);

    /// Releases a target whose last listener went away.
    fn remove_target(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) -> FirestoreResult<()>;

    /// Runs before a write transaction commits.
    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<()>;

    /// Removes least recently used targets and documents when the cache is
    /// over its threshold. A no-op for eager collection.
    fn collect_garbage(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults>;
}

fn is_pinned(pins: &StdMutex<Option<InMemoryPins>>, key: &DocumentKey) -> bool {
    let pins = match pins.lock() {
        Ok(pins) => pins.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    match pins {
        Some(pins) => match pins.lock() {
            Ok(set) => set.contains_key(key),
            Err(poisoned) => poisoned.into_inner().contains_key(key),
        },
        None => false,
    }
}

fn is_referenced(txn: &PersistenceTransaction, pins: &StdMutex<Option<InMemoryPins>>, key: &DocumentKey) -> bool {
    txn.targets().contains_key(key) || txn.mutations().contains_key(key) || is_pinned(pins, key)
}

/// Deletes documents from the cache as soon as nothing references them.
#[derive(Default)]
pub struct EagerReferenceDelegate {
    pins: StdMutex<Option<InMemoryPins>>,
}

impl EagerReferenceDelegate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferenceDelegate for EagerReferenceDelegate {
    fn set_in_memory_pins(&self, pins: InMemoryPins) {
        match self.pins.lock() {
            Ok(mut slot) => *slot = Some(pins),
            Err(poisoned) => *poisoned.into_inner() = Some(pins),
        }
    }

    fn add_reference(&self, _txn: &mut PersistenceTransaction, _target_id: TargetId, _key: &DocumentKey) {}

    fn remove_reference(&self, txn: &mut PersistenceTransaction, _target_id: TargetId, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn mark_potentially_orphaned(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn update_limbo_document(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn remove_target(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) -> FirestoreResult<()> {
        TargetCache.remove_target_data(txn, target_data);
        Ok(())
    }

    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<()> {
        let candidates = txn.take_touched_documents();
        let mut removed = 0;
        for key in candidates {
            if !is_referenced(txn, &self.pins, &key) {
                RemoteDocumentCache.remove_entry(txn, &key);
                removed += 1;
            }
        }
        if removed > 0 {
            LOGGER.debug(format!("Eagerly collected {removed} documents"));
        }
        Ok(())
    }

    fn collect_garbage(
        &self,
        _txn: &mut PersistenceTransaction,
        _active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        Ok(LruResults::default())
    }
}

/// Keeps unreferenced documents around, stamped with the sequence number of
/// their last use, until the cache outgrows its threshold.
pub struct LruReferenceDelegate {
    params: LruParams,
    pins: StdMutex<Option<InMemoryPins>>,
}

impl LruReferenceDelegate {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            pins: StdMutex::new(None),
        }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// Sequence number below which `count` of the cached targets and
    /// orphaned documents fall.
    fn nth_sequence_number(&self, txn: &PersistenceTransaction, count: usize) -> Option<ListenSequenceNumber> {
        if count == 0 {
            return None;
        }
        let table = txn.targets();
        let mut sequence_numbers: Vec<ListenSequenceNumber> = table
            .targets
            .values()
            .map(|data| data.sequence_number)
            .chain(table.document_sequence_numbers.values().copied())
            .collect();
        sequence_numbers.sort_unstable();
        sequence_numbers.get(count - 1).copied()
    }

    fn sequence_number_count(&self, txn: &PersistenceTransaction) -> usize {
        let table = txn.targets();
        table.targets.len() + table.document_sequence_numbers.len()
    }

    fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        let candidates: Vec<DocumentKey> = txn
            .targets()
            .document_sequence_numbers
            .iter()
            .filter(|(_, sequence_number)| **sequence_number <= upper_bound)
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in candidates {
            if is_referenced(txn, &self.pins, &key) {
                continue;
            }
            RemoteDocumentCache.remove_entry(txn, &key);
            txn.targets_mut().document_sequence_numbers.remove(&key);
            removed += 1;
        }
        removed
    }
}

impl ReferenceDelegate for LruReferenceDelegate {
    fn set_in_memory_pins(&self, pins: InMemoryPins) {
        match self.pins.lock() {
            Ok(mut slot) => *slot = Some(pins),
            Err(poisoned) => *poisoned.into_inner() = Some(pins),
        }
    }

    fn add_reference(&self, txn: &mut PersistenceTransaction, _target_id: TargetId, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn remove_reference(&self, txn: &mut PersistenceTransaction, _target_id: TargetId, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn mark_potentially_orphaned(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn update_limbo_document(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        txn.touch_document(key);
    }

    fn remove_target(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number();
        let updated = target_data.clone().with_sequence_number(sequence_number);
        TargetCache.update_target_data(txn, &updated)
    }

    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<()> {
        let touched = txn.take_touched_documents();
        if touched.is_empty() {
            return Ok(());
        }
        let sequence_number = txn.current_sequence_number();
        let table = txn.targets_mut();
        for key in touched {
            table.document_sequence_numbers.insert(key, sequence_number);
        }
        Ok(())
    }

    fn collect_garbage(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            LOGGER.debug("Garbage collection skipped; disabled");
            return Ok(LruResults::default());
        }
        let cache_size = RemoteDocumentCache.byte_size(txn);
        if (cache_size as i64) < self.params.cache_size_collection_threshold {
            LOGGER.debug(format!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            ));
            return Ok(LruResults::default());
        }

        let total = self.sequence_number_count(txn);
        let to_collect = (total * self.params.percentile_to_collect as usize / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        let Some(upper_bound) = self.nth_sequence_number(txn, to_collect) else {
            return Ok(LruResults {
                did_run: true,
                ..LruResults::default()
            });
        };

        let targets_removed = TargetCache.remove_targets(txn, upper_bound, active_target_ids);
        // Keys of removed targets were just touched; stamp them before
        // looking for orphans so they survive this pass.
        self.on_transaction_committed(txn)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound);

        LOGGER.debug(format!(
            "LRU garbage collection: {to_collect} sequence numbers, removed {targets_removed} targets and {documents_removed} documents"
        ));
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::types::TargetPurpose;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::model::{MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn found(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            MapValue::empty(),
        )
    }

    #[tokio::test]
    async fn eager_collects_unreferenced_documents_on_commit() {
        let persistence = MemoryPersistence::with_eager_gc();
        persistence.start().await.unwrap();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target = TargetData::new(Query::collection("rooms").unwrap().to_target(), 2, TargetPurpose::Listen, 1);

        let (key_clone, target_clone) = (key.clone(), target.clone());
        run_transaction(&persistence, "listen", TransactionMode::ReadWrite, move |txn| {
            TargetCache.add_target_data(txn, &target_clone)?;
            RemoteDocumentCache.add_entry(txn, &found("rooms/a"), SnapshotVersion::from_seconds(1))?;
            TargetCache.add_matching_keys(txn, &BTreeSet::from([key_clone]), 2);
            Ok(())
        })
        .await
        .unwrap();

        let delegate = persistence.reference_delegate();
        run_transaction(&persistence, "release", TransactionMode::ReadWrite, move |txn| {
            delegate.remove_target(txn, &target)
        })
        .await
        .unwrap();

        let cached = run_transaction(&persistence, "read", TransactionMode::ReadOnly, move |txn| {
            Ok(RemoteDocumentCache.get_entry(txn, &key).is_valid_document())
        })
        .await
        .unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn eager_keeps_pinned_documents() {
        let persistence = MemoryPersistence::with_eager_gc();
        persistence.start().await.unwrap();
        let pins: InMemoryPins = Arc::new(StdMutex::new(ReferenceSet::new()));
        let key = DocumentKey::from_string("rooms/a").unwrap();
        pins.lock().unwrap().add_reference(key.clone(), 2);
        persistence.reference_delegate().set_in_memory_pins(pins);

        let orphan = key.clone();
        run_transaction(&persistence, "write", TransactionMode::ReadWrite, move |txn| {
            RemoteDocumentCache.add_entry(txn, &found("rooms/a"), SnapshotVersion::from_seconds(1))?;
            txn.mark_potentially_orphaned(&orphan);
            Ok(())
        })
        .await
        .unwrap();

        let cached = run_transaction(&persistence, "read", TransactionMode::ReadOnly, move |txn| {
            Ok(RemoteDocumentCache.get_entry(txn, &key).is_valid_document())
        })
        .await
        .unwrap();
        assert!(cached);
    }

    #[tokio::test]
    async fn lru_removes_oldest_orphans_over_threshold() {
        let persistence = MemoryPersistence::with_lru_gc(LruParams {
            cache_size_collection_threshold: 1,
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        });
        persistence.start().await.unwrap();

        for path in ["rooms/a", "rooms/b", "rooms/c", "rooms/d"] {
            run_transaction(&persistence, "orphan", TransactionMode::ReadWrite, move |txn| {
                RemoteDocumentCache.add_entry(txn, &found(path), SnapshotVersion::from_seconds(1))?;
                txn.mark_potentially_orphaned(&DocumentKey::from_string(path)?);
                Ok(())
            })
            .await
            .unwrap();
        }

        let delegate = persistence.reference_delegate();
        let results = run_transaction(&persistence, "gc", TransactionMode::ReadWrite, move |txn| {
            delegate.collect_garbage(txn, &BTreeSet::new())
        })
        .await
        .unwrap();
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 2);

        let remaining = run_transaction(&persistence, "count", TransactionMode::ReadOnly, |txn| {
            Ok(RemoteDocumentCache.document_count(txn))
        })
        .await
        .unwrap();
        assert_eq!(remaining, 2);
    }
}
