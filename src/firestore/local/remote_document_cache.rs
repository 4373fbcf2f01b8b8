use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, ResourcePath, SnapshotVersion};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DocumentTable {
    #[serde(with = "crate::firestore::util::serde_entries")]
    pub(crate) entries: BTreeMap<DocumentKey, MutableDocument>,
}

/// Last known backend state of every cached document, including deletes
/// (`NoDocument`) and documents only known through committed writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    /// Stores `document` as read at `read_time`, replacing any previous entry.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction,
        document: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error(format!(
                "Cannot add document {} with a read time of zero",
                document.key()
            )));
        }
        let mut entry = document.clone();
        entry.set_read_time(read_time);

        IndexManager.add_to_collection_parent_index(txn, &entry.key().collection_path());
        IndexManager.update_index_entries(txn, &entry);
        txn.put_document(entry);
        Ok(())
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        if txn.documents().entries.contains_key(key) {
            txn.remove_document(key);
            IndexManager.remove_index_entries(txn, key);
        }
    }

    /// Cached entry for `key`, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> MutableDocument {
        txn.documents()
            .entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    /// Documents directly inside the collection of `query` that were read
    /// after `offset` and either match the query or are in `mutated_keys`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection = query.path();
        let mut results = BTreeMap::new();
        for (key, document) in self.scan_collection(txn, collection) {
            if !offset.precedes(document.read_time(), key) {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    /// Up to `limit` documents of `collection_group` read after `offset`,
    /// in read time order.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> Vec<MutableDocument> {
        let mut documents: Vec<&MutableDocument> = txn
            .documents()
            .entries
            .values()
            .filter(|document| document.key().has_collection_id(collection_group))
            .filter(|document| offset.precedes(document.read_time(), document.key()))
            .collect();
        documents.sort_by(|left, right| {
            left.read_time()
                .cmp(&right.read_time())
                .then_with(|| left.key().cmp(right.key()))
        });
        documents.into_iter().take(limit).cloned().collect()
    }

    /// Highest read time of any cached document.
    pub fn latest_read_time(&self, txn: &PersistenceTransaction) -> SnapshotVersion {
        txn.documents()
            .entries
            .values()
            .map(MutableDocument::read_time)
            .max()
            .unwrap_or_else(SnapshotVersion::min)
    }

    pub fn document_count(&self, txn: &PersistenceTransaction) -> usize {
        txn.documents().entries.len()
    }

    /// Approximate encoded size of the cache in bytes.
    pub fn byte_size(&self, txn: &PersistenceTransaction) -> u64 {
        txn.documents()
            .entries
            .values()
            .map(|document| serde_json::to_vec(document).map(|bytes| bytes.len()).unwrap_or(0) as u64)
            .sum()
    }

    fn scan_collection<'a>(
        &self,
        txn: &'a PersistenceTransaction,
        collection: &'a ResourcePath,
    ) -> impl Iterator<Item = (&'a DocumentKey, &'a MutableDocument)> + 'a {
        let start = DocumentKey::collection_scan_start(collection);
        txn.documents()
            .entries
            .range(start..)
            .take_while(move |(key, _)| collection.is_prefix_of(key.path()))
            .filter(move |(key, _)| collection.is_immediate_parent_of(key.path()))
    }
}
