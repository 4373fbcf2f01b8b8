use std::collections::BTreeSet;
use std::sync::Mutex as StdMutex;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::settings::IndexAutoCreationSettings;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, IndexOffset, MutableDocument, ResourcePath, SnapshotVersion, BATCH_ID_UNKNOWN,
};
use crate::firestore::util::log::LOGGER;

/// How the engine produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    DocumentLookup,
    Index,
    PreviousResults,
    FullScan,
}

#[derive(Clone, Debug)]
pub struct QueryEngineResult {
    pub documents: DocumentMap,
    pub strategy: QueryStrategy,
}

/// Picks the cheapest way to answer a query from the local cache.
pub struct QueryEngine {
    settings: IndexAutoCreationSettings,
    /// Collection groups an index was already requested for.
    indexed_groups: StdMutex<BTreeSet<String>>,
}

impl QueryEngine {
    pub fn new(settings: IndexAutoCreationSettings) -> Self {
        Self {
            settings,
            indexed_groups: StdMutex::new(BTreeSet::new()),
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    pub fn run(
        &self,
        txn: &mut PersistenceTransaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<QueryEngineResult> {
        if query.is_document_query() {
            let documents =
                local_documents.get_documents_matching_query(txn, query, &IndexOffset::none())?;
            return Ok(QueryEngineResult {
                documents,
                strategy: QueryStrategy::DocumentLookup,
            });
        }

        if let Some(documents) = self.perform_query_using_index(txn, local_documents, query)? {
            return Ok(QueryEngineResult {
                documents,
                strategy: QueryStrategy::Index,
            });
        }

        if let Some(documents) = self.perform_query_using_remote_keys(
            txn,
            local_documents,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        )? {
            return Ok(QueryEngineResult {
                documents,
                strategy: QueryStrategy::PreviousResults,
            });
        }

        let documents =
            local_documents.get_documents_matching_query(txn, query, &IndexOffset::none())?;
        if self.settings.enabled {
            self.create_cache_indexes(txn, query, documents.len());
        }
        Ok(QueryEngineResult {
            documents,
            strategy: QueryStrategy::FullScan,
        })
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        if IndexManager.get_index_type(txn, &target) == IndexType::None {
            return Ok(None);
        }
        let Some(keys) = IndexManager.get_documents_matching_target(txn, &target) else {
            return Ok(None);
        };

        let indexed = local_documents.get_documents(txn, &keys)?;
        let mut results: DocumentMap = indexed
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect();
        // The index only tracks remote documents; pending writes can add
        // matches of their own.
        let pending = local_documents.get_documents_matching_query(
            txn,
            query,
            &IndexOffset::from_read_time(SnapshotVersion::max(), BATCH_ID_UNKNOWN),
        )?;
        results.extend(pending);

        LOGGER.debug(format!(
            "Query {} answered from index with {} documents",
            query.canonical_id(),
            results.len()
        ));
        Ok(Some(apply_limit(query, results)))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = local_documents.get_documents(txn, remote_keys)?;
        let previous = sorted_matches(query, documents.values());
        if needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }

        LOGGER.debug(format!(
            "Re-using previous result from {:?} to execute query {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        ));
        let mut results = local_documents.get_documents_matching_query(
            txn,
            query,
            &IndexOffset::from_read_time(last_limbo_free_snapshot_version, BATCH_ID_UNKNOWN),
        )?;
        for document in previous {
            results.insert(document.key().clone(), document.clone());
        }
        Ok(Some(results))
    }

    /// Requests an index for the query's collection group when the scan read
    /// many more documents than it returned.
    fn create_cache_indexes(&self, txn: &mut PersistenceTransaction, query: &Query, result_size: usize) {
        let group = query.collection_group_key();
        let already_requested = match self.indexed_groups.lock() {
            Ok(groups) => groups.contains(&group),
            Err(poisoned) => poisoned.into_inner().contains(&group),
        };
        if already_requested {
            return;
        }

        let documents_read = documents_scanned(txn, query);
        if documents_read < self.settings.min_collection_size {
            return;
        }
        if (documents_read as f64) <= self.settings.relative_index_read_cost * result_size as f64 {
            return;
        }

        match self.indexed_groups.lock() {
            Ok(mut groups) => groups.insert(group.clone()),
            Err(poisoned) => poisoned.into_inner().insert(group.clone()),
        };
        if let Some(index) = IndexManager.create_target_indexes(txn, &query.to_target()) {
            LOGGER.debug(format!(
                "Created index {} for '{group}' after scanning {documents_read} documents for {result_size} results",
                index.index_id
            ));
        }
    }
}

fn documents_scanned(txn: &PersistenceTransaction, query: &Query) -> usize {
    let collections: Vec<ResourcePath> = match query.collection_group_id() {
        Some(group) => IndexManager
            .get_collection_parents(txn, group)
            .into_iter()
            .map(|parent| parent.child([group]))
            .collect(),
        None => vec![query.path().clone()],
    };
    txn.documents()
        .entries
        .keys()
        .filter(|key| {
            collections
                .iter()
                .any(|collection| collection.is_immediate_parent_of(key.path()))
        })
        .count()
}

fn sorted_matches<'a>(
    query: &Query,
    documents: impl Iterator<Item = &'a MutableDocument>,
) -> Vec<&'a MutableDocument> {
    let mut matches: Vec<&MutableDocument> = documents.filter(|document| query.matches(document)).collect();
    matches.sort_by(|left, right| query.compare_documents(left, right));
    matches
}

/// Whether a limit query's previous result can no longer be trusted: a
/// document left the result, or the document at the limit edge changed after
/// the last limbo-free snapshot and something else may now sort before it.
fn needs_refill(
    query: &Query,
    sorted_previous: &[&MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
    }
}

fn apply_limit(query: &Query, documents: DocumentMap) -> DocumentMap {
    let Some(limit) = query.limit() else {
        return documents;
    };
    let sorted = sorted_matches(query, documents.values());
    let limit = limit as usize;
    let kept: Vec<&MutableDocument> = match query.limit_type() {
        LimitType::First => sorted.into_iter().take(limit).collect(),
        LimitType::Last => {
            let skip = sorted.len().saturating_sub(limit);
            sorted.into_iter().skip(skip).collect()
        }
    };
    kept.into_iter()
        .map(|document| (document.key().clone(), document.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::credentials::User;
    use crate::firestore::core::query::FilterOperator;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{FieldPath, Mutation, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, version: i64, value: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("v").unwrap(),
            FirestoreValue::from_integer(value),
        );
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(version),
            data,
        )
    }

    async fn persistence_with(documents: Vec<MutableDocument>) -> MemoryPersistence {
        let persistence = MemoryPersistence::with_lru_gc(Default::default());
        persistence.start().await.unwrap();
        run_transaction(&persistence, "seed", TransactionMode::ReadWrite, move |txn| {
            for document in &documents {
                RemoteDocumentCache.add_entry(txn, document, document.version())?;
            }
            Ok(())
        })
        .await
        .unwrap();
        persistence
    }

    fn keys(documents: &DocumentMap) -> Vec<String> {
        documents.keys().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn document_query_uses_lookup() {
        let persistence = persistence_with(vec![doc("rooms/a", 1, 1)]).await;
        let result = run_transaction(&persistence, "query", TransactionMode::ReadOnly, |txn| {
            let engine = QueryEngine::new(IndexAutoCreationSettings::default());
            let view = LocalDocumentsView::new(&User::unauthenticated());
            let query = Query::for_document(&DocumentKey::from_string("rooms/a")?);
            engine.run(txn, &view, &query, SnapshotVersion::min(), &BTreeSet::new())
        })
        .await
        .unwrap();
        assert_eq!(result.strategy, QueryStrategy::DocumentLookup);
        assert_eq!(keys(&result.documents), vec!["rooms/a"]);
    }

    #[tokio::test]
    async fn reuses_previous_results_and_patches_changes() {
        let persistence = persistence_with(vec![
            doc("rooms/a", 1, 1),
            doc("rooms/b", 1, 2),
            doc("rooms/c", 5, 3),
        ])
        .await;
        let result = run_transaction(&persistence, "query", TransactionMode::ReadOnly, |txn| {
            let engine = QueryEngine::new(IndexAutoCreationSettings::default());
            let view = LocalDocumentsView::new(&User::unauthenticated());
            let query = Query::collection("rooms")?.filter("v", FilterOperator::GreaterThan, 0i64)?;
            let remote_keys = BTreeSet::from([
                DocumentKey::from_string("rooms/a")?,
                DocumentKey::from_string("rooms/b")?,
            ]);
            engine.run(txn, &view, &query, SnapshotVersion::from_seconds(2), &remote_keys)
        })
        .await
        .unwrap();
        assert_eq!(result.strategy, QueryStrategy::PreviousResults);
        assert_eq!(keys(&result.documents), vec!["rooms/a", "rooms/b", "rooms/c"]);
    }

    #[tokio::test]
    async fn limit_query_refills_when_edge_changed() {
        let persistence = persistence_with(vec![doc("rooms/a", 1, 1), doc("rooms/b", 5, 2)]).await;
        let result = run_transaction(&persistence, "query", TransactionMode::ReadOnly, |txn| {
            let engine = QueryEngine::new(IndexAutoCreationSettings::default());
            let view = LocalDocumentsView::new(&User::unauthenticated());
            let query = Query::collection("rooms")?
                .filter("v", FilterOperator::GreaterThan, 0i64)?
                .limit_to_first(2);
            let remote_keys = BTreeSet::from([
                DocumentKey::from_string("rooms/a")?,
                DocumentKey::from_string("rooms/b")?,
            ]);
            engine.run(txn, &view, &query, SnapshotVersion::from_seconds(2), &remote_keys)
        })
        .await
        .unwrap();
        assert_eq!(result.strategy, QueryStrategy::FullScan);
    }

    #[tokio::test]
    async fn full_scan_requests_index_once_and_index_path_folds_overlays() {
        let documents: Vec<MutableDocument> = (0..10)
            .map(|i| doc(&format!("rooms/{i}"), 1, i))
            .collect();
        let persistence = persistence_with(documents).await;

        let (first, second) = run_transaction(&persistence, "query", TransactionMode::ReadWrite, |txn| {
            let engine = QueryEngine::new(IndexAutoCreationSettings {
                enabled: true,
                min_collection_size: 5,
                relative_index_read_cost: 2.0,
            });
            let view = LocalDocumentsView::new(&User::unauthenticated());
            let query = Query::collection("rooms")?.filter("v", FilterOperator::Equal, 3i64)?;
            let first = engine.run(txn, &view, &query, SnapshotVersion::min(), &BTreeSet::new())?;

            let mut data = MapValue::empty();
            data.set(&FieldPath::from_dot_separated("v")?, FirestoreValue::from_integer(3));
            let key = DocumentKey::from_string("rooms/7")?;
            view.mutation_queue().add_mutation_batch(
                txn,
                Timestamp::now(),
                vec![],
                vec![Mutation::set(key.clone(), data)],
            )?;
            view.recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key]))?;
            let second = engine.run(txn, &view, &query, SnapshotVersion::min(), &BTreeSet::new())?;
            Ok((first, second))
        })
        .await
        .unwrap();

        assert_eq!(first.strategy, QueryStrategy::FullScan);
        assert_eq!(keys(&first.documents), vec!["rooms/3"]);
        assert_eq!(second.strategy, QueryStrategy::Index);
        assert_eq!(keys(&second.documents), vec!["rooms/3", "rooms/7"]);
    }
}
