use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::credentials::User;
use crate::firestore::core::query::Query;
use crate::firestore::core::types::BatchId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, IndexOffset, MutableDocument, Mutation,
    MutationKind, Overlay, OverlayedDocument, Timestamp,
};

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Local view of documents: the remote cache with the user's overlays
/// applied on top.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    mutation_queue: MutationQueue,
    overlay_cache: DocumentOverlayCache,
}

impl LocalDocumentsView {
    pub fn new(user: &User) -> Self {
        Self {
            mutation_queue: MutationQueue::new(user),
            overlay_cache: DocumentOverlayCache::new(user),
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlay_cache(&self) -> &DocumentOverlayCache {
        &self.overlay_cache
    }

    /// Local view of `key`. Returns an invalid document when neither the
    /// cache nor a pending write knows it.
    pub fn get_document(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> MutableDocument {
        let mut document = RemoteDocumentCache.get_entry(txn, key);
        if let Some(overlay) = self.overlay_cache.get_overlay(txn, key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let documents = RemoteDocumentCache.get_entries(txn, keys);
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Overlays of keys in
    /// `existence_state_changed` are recalculated from the mutation queue
    /// first, since a remote existence change can flip patch preconditions.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: DocumentMap,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let overlays = self.overlays_for(txn, &documents);
        let views = self.compute_views(txn, documents, &overlays, existence_state_changed)?;
        Ok(views
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.overlayed_document))
            .collect())
    }

    /// Like [`Self::get_local_view_of_documents`] but keeps the mask of
    /// fields each overlay changed.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays_for(txn, &documents);
        self.compute_views(txn, documents, &overlays, &BTreeSet::new())
    }

    fn overlays_for(
        &self,
        txn: &PersistenceTransaction,
        documents: &DocumentMap,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        self.overlay_cache.get_overlays(txn, &keys)
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction,
        documents: DocumentMap,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = DocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut views = DocumentMap::new();

        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let is_patch = overlay.map_or(false, |overlay| {
                matches!(overlay.mutation.kind(), MutationKind::Patch { .. })
            });
            if existence_state_changed.contains(&key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key, document);
                continue;
            }
            match overlay {
                Some(overlay) => {
                    let mask = overlay.mutation.field_mask();
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, mask.clone(), Timestamp::now());
                    mutated_fields.insert(key.clone(), mask);
                }
                None => {
                    mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
                }
            }
            views.insert(key, document);
        }

        let recalculated = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        mutated_fields.extend(recalculated);
        views.extend(recalculate);

        Ok(views
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).flatten();
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Replays the queued batches over `documents`, updating them in place,
    /// and stores one overlay per document tagged with the highest batch
    /// that touched it. Returns the mutated-field mask of each document.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        documents: &mut DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, mask);
                masks.insert(key.clone(), mask);
                documents_by_batch
                    .entry(batch.batch_id())
                    .or_default()
                    .insert(key);
            }
        }

        let mut processed: BTreeSet<DocumentKey> = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch.into_iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().flatten();
                match calculate_overlay_mutation(document, mask.as_ref()) {
                    Some(mutation) => {
                        overlays.insert(key, mutation);
                    }
                    None => self.overlay_cache.remove_overlay(txn, &key),
                }
            }
            self.overlay_cache.save_overlays(txn, batch_id, &overlays);
        }

        for key in keys.difference(&processed) {
            self.overlay_cache.remove_overlay(txn, key);
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = RemoteDocumentCache.get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local documents matching `query` that changed after `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key);
            let mut result = DocumentMap::new();
            if document.is_found_document() {
                result.insert(key, document);
            }
            return Ok(result);
        }
        if let Some(collection_id) = query.collection_group_id() {
            let mut result = DocumentMap::new();
            for parent in IndexManager.get_collection_parents(txn, collection_id) {
                let collection_query =
                    query.as_collection_query_at_path(parent.child([collection_id]));
                result.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    offset,
                ));
            }
            return Ok(result);
        }
        Ok(self.get_documents_matching_collection_query(txn, query, offset))
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
    ) -> DocumentMap {
        let overlays = self
            .overlay_cache
            .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id);
        let overlay_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents =
            RemoteDocumentCache.get_documents_matching_query(txn, query, offset, &overlay_keys);

        // A pending write can make a document match even though the cached
        // version was read before `offset`.
        for key in &overlay_keys {
            if !documents.contains_key(key) {
                documents.insert(key.clone(), RemoteDocumentCache.get_entry(txn, key));
            }
        }

        let mut results = DocumentMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut data = MapValue::empty();
        for (field, value) in entries {
            data.set(
                &FieldPath::from_dot_separated(field).unwrap(),
                FirestoreValue::from_integer(*value),
            );
        }
        data
    }

    fn patch(path: &str, entries: &[(&str, i64)]) -> Mutation {
        let mask = FieldMask::new(
            entries
                .iter()
                .map(|(field, _)| FieldPath::from_dot_separated(field).unwrap()),
        );
        Mutation::patch(DocumentKey::from_string(path).unwrap(), map(entries), mask)
    }

    #[tokio::test]
    async fn overlay_equals_sequential_application() {
        let persistence = MemoryPersistence::with_lru_gc(Default::default());
        persistence.start().await.unwrap();

        let view = run_transaction(&persistence, "overlay", TransactionMode::ReadWrite, |txn| {
            let key = DocumentKey::from_string("rooms/a")?;
            let remote = MutableDocument::new_found_document(
                key.clone(),
                SnapshotVersion::from_seconds(1),
                map(&[("x", 0), ("z", 9)]),
            );
            RemoteDocumentCache.add_entry(txn, &remote, SnapshotVersion::from_seconds(1))?;

            let local = LocalDocumentsView::new(&User::unauthenticated());
            let queue = local.mutation_queue().clone();
            queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![patch("rooms/a", &[("x", 2)])])?;
            queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![patch("rooms/a", &[("y", 3)])])?;
            local.recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key.clone()]))?;

            let overlay = local.overlay_cache().get_overlay(txn, &key);
            assert_eq!(overlay.map(|overlay| overlay.largest_batch_id), Some(2));
            Ok(local.get_document(txn, &key))
        })
        .await
        .unwrap();

        assert!(view.has_local_mutations());
        assert_eq!(view.data(), &map(&[("x", 2), ("y", 3), ("z", 9)]));
    }

    #[tokio::test]
    async fn overlay_makes_old_document_match() {
        let persistence = MemoryPersistence::with_lru_gc(Default::default());
        persistence.start().await.unwrap();

        let results = run_transaction(&persistence, "query", TransactionMode::ReadWrite, |txn| {
            let key = DocumentKey::from_string("rooms/a")?;
            let remote = MutableDocument::new_found_document(
                key.clone(),
                SnapshotVersion::from_seconds(1),
                map(&[("x", 0)]),
            );
            RemoteDocumentCache.add_entry(txn, &remote, SnapshotVersion::from_seconds(1))?;

            let local = LocalDocumentsView::new(&User::unauthenticated());
            local.mutation_queue().add_mutation_batch(
                txn,
                Timestamp::now(),
                vec![],
                vec![patch("rooms/a", &[("x", 5)])],
            )?;
            local.recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key]))?;

            let query = Query::collection("rooms")?.filter(
                "x",
                crate::firestore::core::query::FilterOperator::Equal,
                5i64,
            )?;
            let offset = IndexOffset::from_read_time(SnapshotVersion::from_seconds(10), -1);
            local.get_documents_matching_query(txn, &query, &offset)
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
    }
}
