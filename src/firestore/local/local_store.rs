use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_lock::Mutex;

use crate::firestore::core::credentials::User;
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::IndexAutoCreationSettings;
use crate::firestore::core::target::{Target, TargetData};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{BatchId, TargetId, TargetPurpose};
use crate::firestore::error::{internal_error, is_primary_lease_lost, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView};
use crate::firestore::local::persistence::{run_transaction, PersistenceArc, TransactionMode};
use crate::firestore::local::query_engine::{QueryEngine, QueryEngineResult};
use crate::firestore::local::reference_delegate::{InMemoryPins, LruResults};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{
    DocumentKey, FieldIndex, IndexSegment, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::util::log::LOGGER;

/// Resume tokens older than this are written to the target cache even when
/// the target saw no document changes, so a restart does not replay too much.
const RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Result of a local write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Batches that appeared and disappeared when switching users, with the
/// local view of every document they touch.
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: DocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents a view added to or removed from its result set.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    user: User,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    /// Targets with at least one active view.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    target_id_generator: TargetIdGenerator,
}

/// Local half of the engine: turns writes into queued batches with overlays,
/// folds remote events and acknowledgements into the caches, and answers
/// reads from the local view.
///
/// Methods are called from async queue tasks, so at most one operation is in
/// flight at a time.
pub struct LocalStore {
    persistence: PersistenceArc,
    state: Mutex<LocalStoreState>,
    local_view_references: InMemoryPins,
}

impl LocalStore {
    pub fn new(persistence: PersistenceArc, index_settings: IndexAutoCreationSettings, user: User) -> Self {
        let local_view_references: InMemoryPins = Arc::new(StdMutex::new(ReferenceSet::new()));
        persistence
            .reference_delegate()
            .set_in_memory_pins(Arc::clone(&local_view_references));
        Self {
            persistence,
            state: Mutex::new(LocalStoreState {
                local_documents: LocalDocumentsView::new(&user),
                user,
                query_engine: QueryEngine::new(index_settings),
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: BTreeMap::new(),
                target_id_generator: TargetIdGenerator::for_target_cache(0),
            }),
            local_view_references,
        }
    }

    pub fn persistence(&self) -> &PersistenceArc {
        &self.persistence
    }

    /// Prepares the mutation queue of the current user, rebuilds the overlays
    /// of its queued batches and seeds the target id sequence from the
    /// target cache.
    pub async fn start(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        let highest_target_id = run_transaction(
            self.persistence.as_ref(),
            "Start LocalStore",
            TransactionMode::ReadWrite,
            |txn| {
                local_documents.mutation_queue().start(txn);
                let pending_keys: BTreeSet<DocumentKey> = local_documents
                    .mutation_queue()
                    .get_all_mutation_batches(txn)
                    .iter()
                    .flat_map(MutationBatch::keys)
                    .collect();
                if !pending_keys.is_empty() {
                    local_documents.recalculate_and_save_overlays_for_document_keys(txn, &pending_keys)?;
                }
                Ok(TargetCache.highest_target_id(txn))
            },
        )
        .await?;
        state.target_id_generator = TargetIdGenerator::for_target_cache(highest_target_id);
        Ok(())
    }

    pub async fn current_user(&self) -> User {
        self.state.lock().await.user.clone()
    }

    /// Switches the mutation queue and overlays to `user`.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut state = self.state.lock().await;
        let old_view = state.local_documents.clone();
        let new_view = LocalDocumentsView::new(&user);

        let result = run_transaction(
            self.persistence.as_ref(),
            "Handle user change",
            TransactionMode::ReadWrite,
            |txn| {
                let old_batches = old_view.mutation_queue().get_all_mutation_batches(txn);
                new_view.mutation_queue().start(txn);
                let new_batches = new_view.mutation_queue().get_all_mutation_batches(txn);

                let mut changed_keys = BTreeSet::new();
                for batch in old_batches.iter().chain(&new_batches) {
                    changed_keys.extend(batch.keys());
                }
                let affected_documents = new_view.get_documents(txn, &changed_keys)?;
                Ok(UserChangeResult {
                    removed_batch_ids: old_batches.iter().map(MutationBatch::batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(MutationBatch::batch_id).collect(),
                    affected_documents,
                })
            },
        )
        .await?;

        state.local_documents = new_view;
        state.user = user;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local view of the
    /// documents it writes.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        run_transaction(
            self.persistence.as_ref(),
            "Locally write mutations",
            TransactionMode::ReadWrite,
            move |txn| {
                let remote_documents = RemoteDocumentCache.get_entries(txn, &keys);
                let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = local_documents.get_overlayed_documents(txn, remote_documents)?;

                // Transforms relative to the current value (increments) keep
                // that value so the local view stays stable if the remote
                // document changes underneath the pending write.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        overlayed
                            .get(mutation.key())
                            .and_then(|document| mutation.extract_base_mutation(&document.overlayed_document))
                    })
                    .collect();

                let batch = local_documents.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations,
                )?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                local_documents
                    .overlay_cache()
                    .save_overlays(txn, batch.batch_id(), &overlays);

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id(),
                    changes: overlayed
                        .into_iter()
                        .map(|(key, document)| (key, document.overlayed_document))
                        .collect(),
                })
            },
        )
        .await
    }

    /// Applies an acknowledged batch to the remote document cache and drops
    /// it from the queue. Acknowledging a batch that is no longer queued
    /// changes nothing.
    pub async fn acknowledge_batch(&self, batch_result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        run_transaction(
            self.persistence.as_ref(),
            "Acknowledge batch",
            TransactionMode::ReadWritePrimary,
            move |txn| {
                let batch = &batch_result.batch;
                let queue = local_documents.mutation_queue();
                if queue.lookup_mutation_batch(txn, batch.batch_id()).is_none() {
                    LOGGER.debug(format!("Batch {} was already removed", batch.batch_id()));
                    return Ok(DocumentMap::new());
                }
                queue.acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;

                let keys = batch.keys();
                for key in &keys {
                    let mut document = RemoteDocumentCache.get_entry(txn, key);
                    let ack_version = batch_result
                        .doc_versions
                        .get(key)
                        .copied()
                        .ok_or_else(|| internal_error(format!("No ack version for {key}")))?;
                    if document.version() < ack_version {
                        batch.apply_to_remote_document(&mut document, &batch_result)?;
                        if document.is_valid_document() {
                            RemoteDocumentCache.add_entry(txn, &document, batch_result.commit_version)?;
                        }
                    }
                }

                queue.remove_mutation_batch(txn, batch);
                local_documents
                    .overlay_cache()
                    .remove_overlays_for_batch_id(txn, &keys, batch.batch_id());
                local_documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                local_documents.get_documents(txn, &keys)
            },
        )
        .await
    }

    /// Drops a batch the backend rejected. Rejecting a batch that is no
    /// longer queued changes nothing.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        run_transaction(
            self.persistence.as_ref(),
            "Reject batch",
            TransactionMode::ReadWritePrimary,
            move |txn| {
                let queue = local_documents.mutation_queue();
                let Some(batch) = queue.lookup_mutation_batch(txn, batch_id) else {
                    LOGGER.debug(format!("Batch {batch_id} was already removed"));
                    return Ok(DocumentMap::new());
                };
                let keys = batch.keys();
                queue.remove_mutation_batch(txn, &batch);
                local_documents
                    .overlay_cache()
                    .remove_overlays_for_batch_id(txn, &keys, batch_id);
                local_documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                local_documents.get_documents(txn, &keys)
            },
        )
        .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.state.lock().await.local_documents.mutation_queue().clone();
        run_transaction(
            self.persistence.as_ref(),
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            move |txn| Ok(queue.get_highest_unacknowledged_batch_id(txn)),
        )
        .await
    }

    /// First queued batch after `after_batch_id`.
    pub async fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.state.lock().await.local_documents.mutation_queue().clone();
        run_transaction(
            self.persistence.as_ref(),
            "Get next mutation batch",
            TransactionMode::ReadOnly,
            move |txn| Ok(queue.get_next_mutation_batch_after_batch_id(txn, after_batch_id)),
        )
        .await
    }

    pub async fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let queue = self.state.lock().await.local_documents.mutation_queue().clone();
        run_transaction(
            self.persistence.as_ref(),
            "Get last stream token",
            TransactionMode::ReadOnly,
            move |txn| Ok(queue.last_stream_token(txn)),
        )
        .await
    }

    pub async fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        let queue = self.state.lock().await.local_documents.mutation_queue().clone();
        run_transaction(
            self.persistence.as_ref(),
            "Set last stream token",
            TransactionMode::ReadWritePrimary,
            move |txn| {
                queue.set_last_stream_token(txn, token);
                Ok(())
            },
        )
        .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        run_transaction(
            self.persistence.as_ref(),
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            |txn| Ok(TargetCache.last_remote_snapshot_version(txn)),
        )
        .await
    }

    /// Folds a consistent watch snapshot into the caches and returns the new
    /// local view of every changed document.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        let mut target_data_by_target = state.target_data_by_target.clone();
        let remote_version = event.snapshot_version;

        let changes = run_transaction(
            self.persistence.as_ref(),
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };
                    TargetCache.remove_matching_keys(txn, &change.removed_documents, *target_id);
                    TargetCache.add_matching_keys(txn, &change.added_documents, *target_id);

                    let mut new_target_data = old_target_data
                        .clone()
                        .with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(&old_target_data, &new_target_data, change) {
                        TargetCache.update_target_data(txn, &new_target_data)?;
                    }
                    target_data_by_target.insert(*target_id, new_target_data);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        txn.reference_delegate().update_limbo_document(txn, key);
                    }
                }

                let mut changed = DocumentMap::new();
                let mut existence_changed = BTreeSet::new();
                let keys: BTreeSet<DocumentKey> = event.document_updates.keys().cloned().collect();
                let existing = RemoteDocumentCache.get_entries(txn, &keys);
                for (key, document) in &event.document_updates {
                    let Some(existing) = existing.get(key) else {
                        continue;
                    };
                    if document.is_found_document() != existing.is_found_document() {
                        existence_changed.insert(key.clone());
                    }
                    if document.is_no_document() && document.version().is_min() {
                        // Deleted through a limbo resolution without a read
                        // time: nothing about the document is known anymore.
                        RemoteDocumentCache.remove_entry(txn, key);
                        changed.insert(key.clone(), document.clone());
                    } else if !existing.is_valid_document()
                        || document.version() > existing.version()
                        || (document.version() == existing.version() && existing.has_pending_writes())
                    {
                        RemoteDocumentCache.add_entry(txn, document, remote_version)?;
                        changed.insert(key.clone(), document.clone());
                    } else {
                        log::debug!(
                            "Ignoring outdated watch update for {key}. Current version: {:?} Watch version: {:?}",
                            existing.version(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last_remote_version = TargetCache.last_remote_snapshot_version(txn);
                    if remote_version < last_remote_version {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot {remote_version:?} < {last_remote_version:?}"
                        )));
                    }
                    TargetCache.set_last_remote_snapshot_version(txn, remote_version);
                }

                local_documents.get_local_view_of_documents(txn, changed, &existence_changed)
            },
        )
        .await?;

        state.target_data_by_target = target_data_by_target;
        Ok(changes)
    }

    /// Returns the cached target data for `target`, creating and persisting
    /// it with a fresh even id on first use.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.state.lock().await;
        let mut generator = state.target_id_generator.clone();
        let target_data = run_transaction(
            self.persistence.as_ref(),
            "Allocate target",
            TransactionMode::ReadWrite,
            |txn| {
                if let Some(cached) = TargetCache.get_target_data(txn, &target) {
                    return Ok(cached);
                }
                let target_data = TargetData::new(
                    target.clone(),
                    generator.next(),
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                TargetCache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            },
        )
        .await?;
        state.target_id_generator = generator;

        let target_id = target_data.target_id;
        let newer = state
            .target_data_by_target
            .get(&target_id)
            .map_or(true, |existing| target_data.snapshot_version > existing.snapshot_version);
        if newer {
            state.target_data_by_target.insert(target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target.canonical_id().to_string(), target_id);
        }
        Ok(state
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or(target_data))
    }

    /// Target data of an active target, or the cached one.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.state.lock().await;
        if let Some(target_data) = state
            .target_id_by_canonical_id
            .get(target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
        {
            return Ok(Some(target_data.clone()));
        }
        run_transaction(
            self.persistence.as_ref(),
            "Get target data",
            TransactionMode::ReadOnly,
            |txn| Ok(TargetCache.get_target_data(txn, target)),
        )
        .await
    }

    /// Forgets an active target. Unless `keep_persisted_target_data`, the
    /// reference delegate decides whether its cached data stays.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            LOGGER.debug(format!("Ignoring release of unknown target {target_id}"));
            return Ok(());
        };

        if !keep_persisted_target_data {
            let result = run_transaction(
                self.persistence.as_ref(),
                "Release target",
                TransactionMode::ReadWritePrimary,
                |txn| txn.reference_delegate().remove_target(txn, &target_data),
            )
            .await;
            match result {
                Ok(()) => {}
                // Another instance owns the caches now; it releases the
                // target when its own listeners go away.
                Err(err) if is_primary_lease_lost(&err) => {
                    LOGGER.debug(format!("Failed to release target {target_id}: {err}"));
                }
                Err(err) => return Err(err),
            }
        }

        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// engine may start from the keys last reported for the query's target.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target()).await?;
        let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
            Some(target_data) => (
                target_data.last_limbo_free_snapshot_version,
                self.get_remote_document_keys(target_data.target_id).await?,
            ),
            None => (SnapshotVersion::min(), BTreeSet::new()),
        };
        let result = if use_previous_results {
            self.get_documents_matching_query(query, last_limbo_free_snapshot_version, &remote_keys)
                .await?
        } else {
            self.get_documents_matching_query(query, SnapshotVersion::min(), &BTreeSet::new())
                .await?
        };
        Ok(QueryResult {
            documents: result.documents,
            remote_keys,
        })
    }

    /// Local documents matching `query`, starting from `remote_keys` when
    /// they are still valid as of `last_limbo_free_snapshot_version`.
    pub async fn get_documents_matching_query(
        &self,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<QueryEngineResult> {
        let state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        let query_engine = &state.query_engine;
        run_transaction(
            self.persistence.as_ref(),
            "Get documents matching query",
            TransactionMode::ReadWrite,
            |txn| query_engine.run(txn, &local_documents, query, last_limbo_free_snapshot_version, remote_keys),
        )
        .await
    }

    /// Keys the backend last reported for `target_id`.
    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        run_transaction(
            self.persistence.as_ref(),
            "Get remote document keys",
            TransactionMode::ReadOnly,
            |txn| Ok(TargetCache.get_matching_keys_for_target_id(txn, target_id)),
        )
        .await
    }

    /// Local view of `key`: the cached document with pending writes applied.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let local_documents = self.state.lock().await.local_documents.clone();
        run_transaction(
            self.persistence.as_ref(),
            "Read document",
            TransactionMode::ReadOnly,
            |txn| Ok(local_documents.get_document(txn, key)),
        )
        .await
    }

    pub async fn get_documents(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<DocumentMap> {
        let local_documents = self.state.lock().await.local_documents.clone();
        run_transaction(
            self.persistence.as_ref(),
            "Get documents",
            TransactionMode::ReadWrite,
            |txn| local_documents.get_documents(txn, keys),
        )
        .await
    }

    /// Pins the documents views currently show and records limbo-free
    /// versions for views that are in sync with the backend.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let pins = Arc::clone(&self.local_view_references);
        let changes = &view_changes;
        run_transaction(
            self.persistence.as_ref(),
            "Notify local view changes",
            TransactionMode::ReadWrite,
            move |txn| {
                for change in changes {
                    {
                        let mut references = match pins.lock() {
                            Ok(references) => references,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        references.add_references(&change.added_keys, change.target_id);
                        references.remove_references(&change.removed_keys, change.target_id);
                    }
                    for key in &change.removed_keys {
                        txn.remove_reference(change.target_id, key);
                    }
                }
                Ok(())
            },
        )
        .await?;

        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = state.target_data_by_target.get(&change.target_id).cloned() {
                // The view is consistent with the backend as of the target's
                // snapshot version.
                let version = target_data.snapshot_version;
                state.target_data_by_target.insert(
                    change.target_id,
                    target_data.with_last_limbo_free_snapshot_version(version),
                );
            }
        }
        Ok(())
    }

    /// Drops everything a view pinned for `target_id`.
    pub fn remove_local_view_references(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        match self.local_view_references.lock() {
            Ok(mut references) => references.remove_references_for_id(target_id),
            Err(poisoned) => poisoned.into_inner().remove_references_for_id(target_id),
        }
    }

    /// Runs the reference delegate's garbage collection with the active
    /// targets protected.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let state = self.state.lock().await;
        let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
        run_transaction(
            self.persistence.as_ref(),
            "Collect garbage",
            TransactionMode::ReadWritePrimary,
            |txn| txn.reference_delegate().collect_garbage(txn, &active),
        )
        .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.state
            .lock()
            .await
            .query_engine
            .set_index_auto_creation_enabled(enabled);
    }

    /// Creates a field index and backfills it from the document cache.
    pub async fn add_field_index(
        &self,
        collection_group: &str,
        segments: Vec<IndexSegment>,
    ) -> FirestoreResult<FieldIndex> {
        run_transaction(
            self.persistence.as_ref(),
            "Add field index",
            TransactionMode::ReadWrite,
            |txn| Ok(IndexManager.add_field_index(txn, collection_group, segments)),
        )
        .await
    }

    pub async fn get_field_indexes(&self, collection_group: Option<&str>) -> FirestoreResult<Vec<FieldIndex>> {
        run_transaction(
            self.persistence.as_ref(),
            "Get field indexes",
            TransactionMode::ReadOnly,
            |txn| Ok(IndexManager.get_field_indexes(txn, collection_group)),
        )
        .await
    }

    /// Whether a bundle with the same id and an equal or newer create time
    /// was already loaded.
    pub async fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        run_transaction(
            self.persistence.as_ref(),
            "Has newer bundle",
            TransactionMode::ReadOnly,
            |txn| {
                Ok(BundleCache
                    .get_bundle_metadata(txn, &metadata.id)
                    .map_or(false, |cached| cached.create_time >= metadata.create_time))
            },
        )
        .await
    }

    pub async fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        run_transaction(
            self.persistence.as_ref(),
            "Save bundle",
            TransactionMode::ReadWrite,
            |txn| {
                BundleCache.save_bundle_metadata(txn, &metadata);
                Ok(())
            },
        )
        .await
    }

    pub async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        run_transaction(
            self.persistence.as_ref(),
            "Get named query",
            TransactionMode::ReadOnly,
            |txn| Ok(BundleCache.get_named_query(txn, name)),
        )
        .await
    }

    pub async fn save_named_query(&self, query: NamedQuery) -> FirestoreResult<()> {
        run_transaction(
            self.persistence.as_ref(),
            "Save named query",
            TransactionMode::ReadWrite,
            |txn| {
                BundleCache.save_named_query(txn, &query);
                Ok(())
            },
        )
        .await
    }
}

/// Whether the new target data must be written now. Resume tokens are kept
/// in memory and only flushed when they are first set, when they grew stale
/// or when the target's documents changed.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE.as_micros() as i64 {
        return true;
    }
    !change.added_documents.is_empty() || !change.modified_documents.is_empty() || !change.removed_documents.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::FilterOperator;
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::persistence::{MemoryPersistence, Persistence};
    use crate::firestore::local::query_engine::QueryStrategy;
    use crate::firestore::local::reference_delegate::LruParams;
    use crate::firestore::model::{FieldPath, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut map = MapValue::empty();
        for (field, value) in entries {
            map.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(*value));
        }
        map
    }

    fn patch(path: &str, entries: &[(&str, i64)]) -> Mutation {
        let data = map(entries);
        let mask = crate::firestore::model::FieldMask::new(
            entries.iter().map(|(field, _)| FieldPath::from_dot_separated(field).unwrap()),
        );
        Mutation::patch(key(path), data, mask)
    }

    async fn store() -> LocalStore {
        let persistence = Arc::new(MemoryPersistence::with_eager_gc());
        persistence.start().await.unwrap();
        let store = LocalStore::new(persistence, IndexAutoCreationSettings::default(), User::unauthenticated());
        store.start().await.unwrap();
        store
    }

    fn ack(batch: MutationBatch, version: i64) -> MutationBatchResult {
        let results = batch
            .mutations()
            .iter()
            .map(|_| MutationResult::new(SnapshotVersion::from_seconds(version), Vec::new()))
            .collect();
        MutationBatchResult::from(batch, SnapshotVersion::from_seconds(version), results, b"token".to_vec()).unwrap()
    }

    async fn batch(store: &LocalStore, batch_id: BatchId) -> MutationBatch {
        store.next_mutation_batch(batch_id - 1).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn local_write_is_visible_with_pending_writes() {
        let store = store().await;
        let result = store
            .local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))])
            .await
            .unwrap();
        assert_eq!(result.batch_id, 1);
        let document = &result.changes[&key("rooms/a")];
        assert!(document.has_local_mutations());
        assert_eq!(document.data(), &map(&[("x", 1)]));

        let read = store.read_document(&key("rooms/a")).await.unwrap();
        assert_eq!(read.data(), &map(&[("x", 1)]));
        assert!(read.has_pending_writes());
    }

    #[tokio::test]
    async fn ack_then_reject_keeps_acknowledged_fields() {
        let store = store().await;
        store.local_write(vec![patch("rooms/a", &[("x", 2)])]).await.unwrap();
        store.local_write(vec![patch("rooms/a", &[("y", 3)])]).await.unwrap();
        let merged = store.read_document(&key("rooms/a")).await.unwrap();
        assert_eq!(merged.data(), &map(&[("x", 2), ("y", 3)]));

        let first = batch(&store, 1).await;
        store.acknowledge_batch(ack(first.clone(), 1)).await.unwrap();
        let changed = store.reject_batch(2).await.unwrap();
        let document = &changed[&key("rooms/a")];
        assert!(!document.has_local_mutations());

        // Replays are no-ops.
        assert!(store.acknowledge_batch(ack(first, 1)).await.unwrap().is_empty());
        assert!(store.reject_batch(2).await.unwrap().is_empty());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), crate::firestore::model::BATCH_ID_UNKNOWN);
        assert_eq!(store.last_stream_token().await.unwrap(), b"token".to_vec());
    }

    #[tokio::test]
    async fn allocates_even_target_ids_and_reuses_targets() {
        let store = store().await;
        let rooms = Query::collection("rooms").unwrap().to_target();
        let users = Query::collection("users").unwrap().to_target();
        let first = store.allocate_target(rooms.clone()).await.unwrap();
        let second = store.allocate_target(users).await.unwrap();
        assert_eq!((first.target_id, second.target_id), (2, 4));
        assert_eq!(store.allocate_target(rooms.clone()).await.unwrap().target_id, 2);
        assert_eq!(store.get_target_data(&rooms).await.unwrap().map(|data| data.target_id), Some(2));
    }

    #[tokio::test]
    async fn remote_event_updates_cache_and_resume_token() {
        let store = store().await;
        let target = Query::collection("rooms").unwrap().to_target();
        let target_data = store.allocate_target(target.clone()).await.unwrap();

        let version = SnapshotVersion::from_seconds(10);
        let document = MutableDocument::new_found_document(key("rooms/a"), version, map(&[("x", 1)]));
        let mut event = RemoteEvent::empty(version);
        event.target_changes.insert(
            target_data.target_id,
            TargetChange {
                resume_token: b"resume".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("rooms/a")]),
                modified_documents: BTreeSet::new(),
                removed_documents: BTreeSet::new(),
            },
        );
        event.document_updates.insert(key("rooms/a"), document);

        let changes = store.apply_remote_event(&event).await.unwrap();
        assert_eq!(changes[&key("rooms/a")].version(), version);
        assert_eq!(store.get_last_remote_snapshot_version().await.unwrap(), version);
        assert_eq!(
            store.get_remote_document_keys(target_data.target_id).await.unwrap(),
            BTreeSet::from([key("rooms/a")])
        );
        let updated = store.get_target_data(&target).await.unwrap().unwrap();
        assert_eq!(updated.resume_token, b"resume".to_vec());

        // Same version again is ignored.
        let stale = MutableDocument::new_found_document(key("rooms/a"), version, map(&[("x", 9)]));
        let mut replay = RemoteEvent::empty(version);
        replay.document_updates.insert(key("rooms/a"), stale);
        assert!(store.apply_remote_event(&replay).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_change_swaps_mutation_queue() {
        let store = store().await;
        store
            .local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))])
            .await
            .unwrap();
        let result = store.handle_user_change(User::new("alice")).await.unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/a")].is_found_document());

        let back = store.handle_user_change(User::unauthenticated()).await.unwrap();
        assert_eq!(back.added_batch_ids, vec![1]);
    }

    #[tokio::test]
    async fn matching_query_reuses_previous_results_once_limbo_free() {
        let store = store().await;
        let query = Query::collection("rooms")
            .unwrap()
            .filter("x", FilterOperator::Equal, 1_i64)
            .unwrap();
        let target_data = store.allocate_target(query.to_target()).await.unwrap();

        let version = SnapshotVersion::from_seconds(10);
        let mut event = RemoteEvent::empty(version);
        event.target_changes.insert(
            target_data.target_id,
            TargetChange {
                resume_token: b"resume".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("rooms/a"), key("rooms/b")]),
                modified_documents: BTreeSet::new(),
                removed_documents: BTreeSet::new(),
            },
        );
        for path in ["rooms/a", "rooms/b"] {
            event
                .document_updates
                .insert(key(path), MutableDocument::new_found_document(key(path), version, map(&[("x", 1)])));
        }
        store.apply_remote_event(&event).await.unwrap();

        let remote_keys = store.get_remote_document_keys(target_data.target_id).await.unwrap();
        let reused = store
            .get_documents_matching_query(&query, version, &remote_keys)
            .await
            .unwrap();
        assert_eq!(reused.strategy, QueryStrategy::PreviousResults);
        assert_eq!(reused.documents.len(), 2);

        let scanned = store
            .get_documents_matching_query(&query, SnapshotVersion::min(), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(scanned.strategy, QueryStrategy::FullScan);
        assert_eq!(
            scanned.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
    }

    #[tokio::test]
    async fn start_rebuilds_overlays_of_queued_batches() {
        let persistence: PersistenceArc = Arc::new(MemoryPersistence::with_lru_gc(LruParams::default()));
        persistence.start().await.unwrap();
        let user = User::unauthenticated();
        let first = LocalStore::new(Arc::clone(&persistence), IndexAutoCreationSettings::default(), user.clone());
        first.start().await.unwrap();
        first.local_write(vec![patch("rooms/a", &[("x", 2)])]).await.unwrap();

        let overlays = DocumentOverlayCache::new(&user);
        run_transaction(persistence.as_ref(), "drop overlay", TransactionMode::ReadWrite, |txn| {
            overlays.remove_overlay(txn, &key("rooms/a"));
            Ok(())
        })
        .await
        .unwrap();
        assert!(!first.read_document(&key("rooms/a")).await.unwrap().has_local_mutations());

        let restarted = LocalStore::new(persistence, IndexAutoCreationSettings::default(), user);
        restarted.start().await.unwrap();
        let document = restarted.read_document(&key("rooms/a")).await.unwrap();
        assert!(document.has_local_mutations());
        assert_eq!(document.data(), &map(&[("x", 2)]));
    }

    #[tokio::test]
    async fn execute_query_includes_pending_writes() {
        let store = store().await;
        store
            .local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))])
            .await
            .unwrap();
        let result = store
            .execute_query(&Query::collection("rooms").unwrap(), true)
            .await
            .unwrap();
        assert_eq!(result.documents.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a")]);
        assert!(result.remote_keys.is_empty());
    }
}
