use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::credentials::User;
use crate::firestore::core::query::Query;
use crate::firestore::core::types::BatchId;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct MutationTable {
    pub(crate) queues: BTreeMap<String, UserMutationQueue>,
}

impl MutationTable {
    pub(crate) fn contains_key(&self, key: &DocumentKey) -> bool {
        self.queues
            .values()
            .any(|queue| queue.document_index.contains_key(key))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct UserMutationQueue {
    pub(crate) next_batch_id: BatchId,
    pub(crate) batches: BTreeMap<BatchId, MutationBatch>,
    /// Document key to the ids of every queued batch writing it.
    #[serde(with = "crate::firestore::util::serde_entries")]
    pub(crate) document_index: BTreeMap<DocumentKey, BTreeSet<BatchId>>,
    #[serde(with = "crate::firestore::util::serde_base64")]
    pub(crate) last_stream_token: Vec<u8>,
}

impl Default for UserMutationQueue {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            batches: BTreeMap::new(),
            document_index: BTreeMap::new(),
            last_stream_token: Vec::new(),
        }
    }
}

/// Queue of unacknowledged local writes for one user, in batch id order.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key().to_string(),
        }
    }

    /// Ensures the queue exists. An empty queue forgets its stream token,
    /// which only has meaning for batches the backend saw.
    pub fn start(&self, txn: &mut PersistenceTransaction) {
        let needs_reset = match txn.mutations().queues.get(&self.user_key) {
            None => true,
            Some(queue) => queue.batches.is_empty() && !queue.last_stream_token.is_empty(),
        };
        if needs_reset {
            let queue = self.queue_mut(txn);
            if queue.batches.is_empty() {
                queue.last_stream_token.clear();
            }
        }
    }

    pub fn is_empty(&self, txn: &PersistenceTransaction) -> bool {
        self.queue(txn).map_or(true, |queue| queue.batches.is_empty())
    }

    pub fn last_stream_token(&self, txn: &PersistenceTransaction) -> Vec<u8> {
        self.queue(txn)
            .map(|queue| queue.last_stream_token.clone())
            .unwrap_or_default()
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction, token: Vec<u8>) {
        self.queue_mut(txn).last_stream_token = token;
    }

    /// Records the stream token of an acknowledged batch. Only the oldest
    /// batch can be acknowledged.
    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let first = self
            .queue(txn)
            .and_then(|queue| queue.batches.keys().next().copied());
        if first != Some(batch.batch_id()) {
            return Err(internal_error(format!(
                "Can only acknowledge the first batch in the mutation queue, got {}",
                batch.batch_id()
            )));
        }
        self.set_last_stream_token(txn, stream_token);
        Ok(())
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches must not be empty"));
        }
        let queue = self.queue_mut(txn);
        let batch_id = queue.next_batch_id;
        queue.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            queue.document_index.entry(key).or_default().insert(batch_id);
        }
        queue.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.queue(txn)?.batches.get(&batch_id).cloned()
    }

    /// First batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.queue(txn)?
            .batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch.clone())
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction) -> BatchId {
        self.queue(txn)
            .and_then(|queue| queue.batches.keys().next_back().copied())
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction) -> Vec<MutationBatch> {
        self.queue(txn)
            .map(|queue| queue.batches.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let Some(queue) = self.queue(txn) else {
            return Vec::new();
        };
        queue
            .document_index
            .get(key)
            .map(|ids| lookup_all(queue, ids.iter().copied()))
            .unwrap_or_default()
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let Some(queue) = self.queue(txn) else {
            return Vec::new();
        };
        let ids: BTreeSet<BatchId> = keys
            .iter()
            .filter_map(|key| queue.document_index.get(key))
            .flatten()
            .copied()
            .collect();
        lookup_all(queue, ids)
    }

    /// Batches writing any document directly inside the collection of
    /// `query`. Collection group queries are resolved per collection by the
    /// caller.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        if query.is_collection_group_query() {
            return Err(internal_error(
                "Collection group queries must be resolved per collection",
            ));
        }
        let Some(queue) = self.queue(txn) else {
            return Ok(Vec::new());
        };
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            return Ok(queue
                .document_index
                .get(&key)
                .map(|ids| lookup_all(queue, ids.iter().copied()))
                .unwrap_or_default());
        }

        let collection = query.path();
        let start = DocumentKey::collection_scan_start(collection);
        let ids: BTreeSet<BatchId> = queue
            .document_index
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        Ok(lookup_all(queue, ids))
    }

    /// Removes `batch` and its index entries. Removing a batch that is no
    /// longer queued is a no-op.
    pub fn remove_mutation_batch(&self, txn: &mut PersistenceTransaction, batch: &MutationBatch) {
        let queued = self
            .queue(txn)
            .map_or(false, |queue| queue.batches.contains_key(&batch.batch_id()));
        if !queued {
            return;
        }
        let queue = self.queue_mut(txn);
        queue.batches.remove(&batch.batch_id());
        for key in batch.keys() {
            if let Some(ids) = queue.document_index.get_mut(&key) {
                ids.remove(&batch.batch_id());
                if ids.is_empty() {
                    queue.document_index.remove(&key);
                }
            }
        }
        for key in batch.keys() {
            txn.mark_potentially_orphaned(&key);
        }
    }

    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        self.queue(txn)
            .map_or(false, |queue| queue.document_index.contains_key(key))
    }

    fn queue<'a>(&self, txn: &'a PersistenceTransaction) -> Option<&'a UserMutationQueue> {
        txn.mutations().queues.get(&self.user_key)
    }

    fn queue_mut<'a>(&self, txn: &'a mut PersistenceTransaction) -> &'a mut UserMutationQueue {
        txn.mutations_mut()
            .queues
            .entry(self.user_key.clone())
            .or_default()
    }
}

fn lookup_all(queue: &UserMutationQueue, ids: impl IntoIterator<Item = BatchId>) -> Vec<MutationBatch> {
    ids.into_iter()
        .filter_map(|id| queue.batches.get(&id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::value::MapValue;

    fn set(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::empty())
    }

    async fn started() -> MemoryPersistence {
        let persistence = MemoryPersistence::default();
        persistence.start().await.unwrap();
        persistence
    }

    #[tokio::test]
    async fn batch_ids_are_dense_per_user() {
        let persistence = started().await;
        let ids = run_transaction(&persistence, "add", TransactionMode::ReadWrite, |txn| {
            let alice = MutationQueue::new(&User::new("alice"));
            let bob = MutationQueue::new(&User::new("bob"));
            let a1 = alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("docs/a")])?;
            let a2 = alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("docs/b")])?;
            let b1 = bob.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("docs/a")])?;
            Ok(vec![a1.batch_id(), a2.batch_id(), b1.batch_id()])
        })
        .await
        .unwrap();
        assert_eq!(ids, vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn looks_up_by_key_query_and_position() {
        let persistence = started().await;
        run_transaction(&persistence, "lookup", TransactionMode::ReadWrite, |txn| {
            let queue = MutationQueue::new(&User::unauthenticated());
            queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            queue.add_mutation_batch(
                txn,
                Timestamp::now(),
                vec![],
                vec![set("rooms/b"), set("rooms/a/messages/1")],
            )?;
            queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;

            let key = DocumentKey::from_string("rooms/a")?;
            let ids: Vec<BatchId> = queue
                .get_all_mutation_batches_affecting_document_key(txn, &key)
                .iter()
                .map(MutationBatch::batch_id)
                .collect();
            assert_eq!(ids, vec![1, 3]);

            let query = Query::collection("rooms")?;
            let ids: Vec<BatchId> = queue
                .get_all_mutation_batches_affecting_query(txn, &query)?
                .iter()
                .map(MutationBatch::batch_id)
                .collect();
            assert_eq!(ids, vec![1, 2, 3]);

            let next = queue.get_next_mutation_batch_after_batch_id(txn, 1);
            assert_eq!(next.map(|batch| batch.batch_id()), Some(2));
            assert_eq!(queue.get_highest_unacknowledged_batch_id(txn), 3);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let persistence = started().await;
        run_transaction(&persistence, "remove", TransactionMode::ReadWrite, |txn| {
            let queue = MutationQueue::new(&User::unauthenticated());
            let batch = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            queue.remove_mutation_batch(txn, &batch);
            queue.remove_mutation_batch(txn, &batch);
            assert!(queue.is_empty(txn));
            assert!(!queue.contains_key(txn, &DocumentKey::from_string("rooms/a")?));
            assert_eq!(queue.get_highest_unacknowledged_batch_id(txn), BATCH_ID_UNKNOWN);
            Ok(())
        })
        .await
        .unwrap();
    }
}
