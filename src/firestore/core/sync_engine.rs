//! Glue between the local store, the remote store and the listeners.
//!
//! The sync engine owns one [`View`] per listened query, turns local writes
//! and remote events into view snapshots, resolves limbo documents with
//! dedicated single-document targets and completes write callbacks once the
//! backend has answered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_lock::Mutex;
use futures::channel::oneshot;
use once_cell::sync::OnceCell;

use crate::firestore::core::credentials::User;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::TargetData;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{BatchId, ListenSequenceNumber, OnlineState, TargetId, TargetPurpose};
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{DocumentViewChangeType, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, is_primary_lease_lost, FirestoreError, FirestoreResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::{DocumentMap, LocalStore, LocalViewChanges};
use crate::firestore::model::{
    DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{
    box_remote_store_future, RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer, TargetChange,
};
use crate::firestore::util::log::LOGGER;

/// Limbo targets are never written to the target cache.
const LIMBO_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Completed once the backend accepted or rejected a write.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receives what the sync engine produces. Implemented by the event manager.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The target of `query` was rejected. The query is no longer listened to.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has reported the document. Decides the
    /// remote keys of the target when the watch stream reconnects.
    received_document: bool,
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which listen targets keep each limbo document in limbo.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: BTreeMap<User, BTreeMap<BatchId, WriteCallback>>,
    /// Keyed by the highest batch id pending when the callback registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    listener: OnceCell<Weak<dyn SyncEngineListener>>,
    state: Mutex<SyncEngineState>,
    /// Copy of the synced keys per target, readable while a task holds
    /// `state`. The remote store asks for them from inside sync engine calls.
    remote_keys: StdMutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_store,
            remote_store,
            max_concurrent_limbo_resolutions,
            listener: OnceCell::new(),
            state: Mutex::new(SyncEngineState {
                current_user,
                online_state: OnlineState::Unknown,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
            remote_keys: StdMutex::new(BTreeMap::new()),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) -> FirestoreResult<()> {
        self.listener
            .set(listener)
            .map_err(|_| internal_error("The sync engine listener is already set"))
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Starts listening to `query` and returns its first snapshot, computed
    /// from local state only.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let mut state = self.state.lock().await;
        if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let target_id = target_data.target_id;
        // Another query may already share the target and know it is current.
        let current = state
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .and_then(|shared| state.query_views.get(&shared.canonical_id()))
            .is_some_and(|query_view| query_view.view.is_current());

        let snapshot = self
            .initialize_view_and_compute_snapshot(&mut state, query, target_id, current, target_data.resume_token.clone())
            .await?;
        if should_listen_to_remote {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None)?;
        let synthesized = TargetChange::synthesized_current_change(
            current && state.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
            .await?;

        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        self.publish_remote_keys(state, target_id);

        view_change
            .snapshot
            .ok_or_else(|| internal_error("The first view change of a query must raise a snapshot"))
    }

    /// Stops listening to `query`. The target is released once no other
    /// query uses it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_from_remote: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let canonical_id = query.canonical_id();
        let Some(query_view) = state.query_views.remove(&canonical_id) else {
            LOGGER.debug(format!("Ignoring unlisten of unknown query {canonical_id}"));
            return Ok(());
        };
        let target_id = query_view.target_id;

        if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|existing| existing.canonical_id() != canonical_id);
                self.publish_remote_keys(&state, target_id);
                return Ok(());
            }
        }

        self.local_store.remove_local_view_references(target_id);
        ignore_if_primary_lease_lost(self.local_store.release_target(target_id, false).await)?;
        if should_unlisten_from_remote {
            self.remote_store.unlisten(target_id).await?;
        }
        self.remove_and_cleanup_target(&mut state, target_id, None).await
    }

    /// Sends `query` to the backend after it was listened to from the cache
    /// only.
    pub async fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let _state = self.state.lock().await;
        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        self.remote_store.listen(target_data).await
    }

    /// Keeps `query` in the local views but stops listening to it remotely.
    pub async fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let state = self.state.lock().await;
        if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
            self.remote_store.unlisten(query_view.target_id).await?;
        }
        Ok(())
    }

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` completes when the backend accepts or rejects the batch.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.local_write(mutations).await {
            Ok(result) => result,
            Err(err) => {
                LOGGER.warn(format!("Failed to persist write: {err}"));
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };

        {
            let mut state = self.state.lock().await;
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, callback);
            self.emit_new_snaps_and_notify_local_store(&mut state, &result.changes, None)
                .await?;
        }
        self.remote_store.fill_write_pipeline().await
    }

    /// `callback` completes once every write queued so far is acknowledged
    /// or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network().await {
            LOGGER.debug(
                "The network is disabled. Waiting for pending writes will not complete until the network is enabled.",
            );
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id().await?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.state
            .lock()
            .await
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Recomputes every view for `changes`, raises the snapshots that changed
    /// and tells the local store which documents the views now show.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut new_snapshots = Vec::new();
        let mut local_view_changes = Vec::new();

        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = state.query_views.get(&canonical_id) else {
                continue;
            };
            let query = query_view.query.clone();
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill {
                // A limited view lost a document; look for the next one in the
                // local cache.
                let query_result = self.local_store.execute_query(&query, false).await?;
                let Some(query_view) = state.query_views.get(&canonical_id) else {
                    continue;
                };
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes))?;
            }

            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let view_change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, target_is_pending_reset);
            self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
                .await?;
            self.publish_remote_keys(state, target_id);

            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(local_view_changes_from(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        if let Some(listener) = self.listener() {
            listener.on_watch_change(new_snapshots);
        }
        self.local_store
            .notify_local_view_changes(local_view_changes)
            .await
    }

    async fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    if !state.active_limbo_targets_by_key.contains_key(&key)
                        && !state.enqueued_limbo_resolutions.contains(&key)
                    {
                        LOGGER.debug(format!("New document in limbo: {key}"));
                        state.enqueued_limbo_resolutions.push_back(key);
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    LOGGER.debug(format!("Document no longer in limbo: {key}"));
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key).await?;
                    }
                }
            }
        }
        self.pump_enqueued_limbo_resolutions(state).await
    }

    /// Starts limbo resolutions while fewer than the configured maximum
    /// are active.
    async fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) -> FirestoreResult<()> {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            self.publish_remote_keys(state, limbo_target_id);
            self.remote_store
                .listen(TargetData::new(
                    Query::for_document(&key).to_target(),
                    limbo_target_id,
                    TargetPurpose::LimboResolution,
                    LIMBO_SEQUENCE_NUMBER,
                ))
                .await?;
        }
        Ok(())
    }

    async fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey) -> FirestoreResult<()> {
        state.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        if let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) {
            self.remote_store.unlisten(limbo_target_id).await?;
            state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
            self.lock_remote_keys().remove(&limbo_target_id);
            self.pump_enqueued_limbo_resolutions(state).await?;
        }
        Ok(())
    }

    async fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
        let listener = self.listener();
        for query in &queries {
            state.query_views.remove(&query.canonical_id());
            if let (Some(error), Some(listener)) = (&error, &listener) {
                listener.on_watch_error(query, error.clone());
            }
        }
        self.lock_remote_keys().remove(&target_id);

        let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !state.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(state, &key).await?;
            }
        }
        Ok(())
    }

    async fn apply_remote_event_locked(&self, state: &mut SyncEngineState, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let changed = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if changed > 1 {
                return Err(internal_error(
                    "Limbo resolution for a single document contains multiple changes",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received a change for a limbo target document without add"));
                }
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
            self.publish_remote_keys(state, *target_id);
        }

        let changes = match self.local_store.apply_remote_event(&event).await {
            Ok(changes) => changes,
            Err(err) if is_primary_lease_lost(&err) => {
                LOGGER.debug(format!("Ignoring remote event after losing the primary lease: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event))
            .await
    }

    async fn apply_online_state_change_locked(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let mut snapshots = Vec::new();
        for query_view in state.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            debug_assert!(
                view_change.limbo_changes.is_empty(),
                "Online state changes must not touch limbo documents"
            );
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        state.online_state = online_state;
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
        Ok(())
    }

    async fn reject_listen_locked(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(resolution) = state.active_limbo_resolutions_by_target.remove(&target_id) {
            // The limbo document is treated as deleted, which resolves it in
            // every view that contains it.
            let key = resolution.key;
            state.active_limbo_targets_by_key.remove(&key);
            self.lock_remote_keys().remove(&target_id);
            self.pump_enqueued_limbo_resolutions(&mut state).await?;

            let mut event = RemoteEvent::empty(SnapshotVersion::min());
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event_locked(&mut state, event).await;
        }

        ignore_if_primary_lease_lost(self.local_store.release_target(target_id, false).await)?;
        self.local_store.remove_local_view_references(target_id);
        self.remove_and_cleanup_target(&mut state, target_id, Some(error))
            .await
    }

    async fn complete_write(
        &self,
        batch_id: BatchId,
        changes: FirestoreResult<DocumentMap>,
        result: FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        let changes = match changes {
            Ok(changes) => changes,
            Err(err) if is_primary_lease_lost(&err) => {
                LOGGER.debug(format!("Ignoring write result after losing the primary lease: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut state = self.state.lock().await;
        let user = state.current_user.clone();
        if let Some(callback) = state
            .mutation_callbacks
            .get_mut(&user)
            .and_then(|callbacks| callbacks.remove(&batch_id))
        {
            let _ = callback.send(result);
        }
        if let Some(callbacks) = state.pending_writes_callbacks.remove(&batch_id) {
            for callback in callbacks {
                let _ = callback.send(Ok(()));
            }
        }
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await
    }

    async fn handle_user_change(&self, user: User) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.current_user == user {
            return Ok(());
        }
        LOGGER.debug(format!("User change. New user: {user}"));
        state.current_user = user.clone();

        for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled(
                    "Waiting for pending writes was cancelled by a user change.",
                )));
            }
        }

        let result = self.local_store.handle_user_change(user).await?;
        self.emit_new_snaps_and_notify_local_store(&mut state, &result.affected_documents, None)
            .await
    }

    /// Refreshes the copy of the synced keys of `target_id`.
    fn publish_remote_keys(&self, state: &SyncEngineState, target_id: TargetId) {
        let keys = if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            }
        } else {
            state
                .queries_by_target
                .get(&target_id)
                .into_iter()
                .flatten()
                .filter_map(|query| state.query_views.get(&query.canonical_id()))
                .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
                .collect()
        };
        self.lock_remote_keys().insert(target_id, keys);
    }

    fn lock_remote_keys(&self) -> MutexGuard<'_, BTreeMap<TargetId, BTreeSet<DocumentKey>>> {
        match self.remote_keys.lock() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Limbo documents and their resolution targets. Exposed for tests.
    pub async fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state.lock().await.active_limbo_targets_by_key.clone()
    }

    pub async fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            self.apply_remote_event_locked(&mut state, event).await
        })
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_locked(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let batch_id = result.batch.batch_id();
            let changes = self.local_store.acknowledge_batch(result).await;
            self.complete_write(batch_id, changes, Ok(())).await
        })
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let changes = self.local_store.reject_batch(batch_id).await;
            self.complete_write(batch_id, changes, Err(error)).await
        })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.lock_remote_keys()
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    fn next_mutation_batch(&self, after_batch_id: BatchId) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_store_future(self.local_store.next_mutation_batch(after_batch_id))
    }

    fn last_remote_snapshot_version(&self) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>> {
        box_remote_store_future(self.local_store.get_last_remote_snapshot_version())
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.local_store.set_last_stream_token(token))
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_user_change(user))
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_online_state_change_locked(online_state))
    }
}

fn local_view_changes_from(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.changes {
        match change.change_type {
            DocumentViewChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            DocumentViewChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            DocumentViewChangeType::Modified | DocumentViewChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

fn ignore_if_primary_lease_lost(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if is_primary_lease_lost(&err) => {
            LOGGER.debug(format!("Unexpectedly lost the primary lease: {err}"));
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::firestore::core::async_queue::AsyncQueue;
    use crate::firestore::core::credentials::EmptyCredentialsProvider;
    use crate::firestore::core::settings::{FirestoreSettings, IndexAutoCreationSettings};
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{MemoryPersistence, Persistence, PersistenceArc};
    use crate::firestore::model::{DatabaseId, FieldPath};
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::core::query::Direction;
    use crate::firestore::remote::bloom_filter::BloomFilter;
    use crate::firestore::remote::datastore::ListenRequest;
    use crate::firestore::remote::watch_change::{
        DocumentDelete, ExistenceFilter, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::platform::runtime;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<FirestoreError>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, _query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push(error);
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        queue: AsyncQueue,
        datastore: InMemoryDatastore,
        engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
    }

    impl Harness {
        async fn new() -> Self {
            let queue = AsyncQueue::new();
            let datastore = InMemoryDatastore::new();
            let persistence = Arc::new(MemoryPersistence::with_eager_gc());
            persistence.start().await.unwrap();
            let persistence: PersistenceArc = persistence;
            let local_store = Arc::new(LocalStore::new(
                persistence,
                IndexAutoCreationSettings::default(),
                User::unauthenticated(),
            ));
            local_store.start().await.unwrap();
            let remote_store = RemoteStore::new(
                queue.clone(),
                DatabaseId::default("project"),
                Arc::new(datastore.clone()),
                Arc::new(EmptyCredentialsProvider),
                &FirestoreSettings::default(),
            );
            let engine = SyncEngine::new(local_store, remote_store.clone(), User::unauthenticated(), 1);
            let syncer: Arc<dyn RemoteSyncer> = engine.clone();
            remote_store.set_syncer(Arc::downgrade(&syncer)).unwrap();
            let listener = Arc::new(RecordingListener::default());
            let sink: Arc<dyn SyncEngineListener> = listener.clone();
            engine.set_listener(Arc::downgrade(&sink)).unwrap();

            let harness = Self {
                queue,
                datastore,
                engine,
                listener,
            };
            harness
                .run(|engine| async move { engine.remote_store().start().await })
                .await;
            harness
        }

        async fn run<F, Fut, T>(&self, op: F) -> T
        where
            F: FnOnce(Arc<SyncEngine>) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = FirestoreResult<T>> + Send + 'static,
            T: Send + 'static,
        {
            let engine = Arc::clone(&self.engine);
            self.queue.enqueue(move || op(engine)).await.unwrap()
        }

        async fn wait_until(&self, mut condition: impl FnMut(&RecordingListener) -> bool) {
            for _ in 0..1_000 {
                self.queue.drain().await.unwrap();
                if condition(self.listener.as_ref()) {
                    return;
                }
                runtime::sleep(Duration::from_millis(2)).await;
            }
            panic!("condition not reached");
        }

        fn last_snapshot(&self) -> ViewSnapshot {
            self.listener.snapshots.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(value));
        map
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    #[tokio::test]
    async fn listen_raises_local_then_remote_snapshots() {
        let harness = Harness::new().await;
        harness.datastore.seed_document(key("rooms/a"), data(1));

        let initial = harness
            .run(|engine| async move { engine.listen(rooms(), true).await })
            .await;
        assert!(initial.from_cache);
        assert!(initial.documents.is_empty());

        harness.datastore.wait_for_target(2).await.unwrap();
        harness.datastore.send_query_snapshot(2, &rooms()).unwrap();
        harness
            .wait_until(|listener| !listener.snapshots.lock().unwrap().is_empty())
            .await;

        let snapshot = harness.last_snapshot();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(
            harness.engine.get_remote_keys_for_target(2),
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[tokio::test]
    async fn write_callback_completes_on_acknowledgement() {
        let harness = Harness::new().await;
        harness
            .run(|engine| async move { engine.listen(rooms(), true).await.map(|_| ()) })
            .await;

        let (sender, receiver) = oneshot::channel();
        harness
            .run(move |engine| async move {
                engine
                    .write(vec![Mutation::set(key("rooms/b"), data(7))], sender)
                    .await
            })
            .await;

        let local = harness.last_snapshot();
        assert!(local.has_pending_writes());
        assert_eq!(local.documents.len(), 1);

        receiver.await.unwrap().unwrap();
        assert_eq!(harness.datastore.document(&key("rooms/b")).unwrap().data(), &data(7));
    }

    #[tokio::test]
    async fn pending_writes_callback_waits_for_acknowledgement() {
        let harness = Harness::new().await;
        harness.datastore.set_auto_ack_writes(false);

        let (write_sender, _write_receiver) = oneshot::channel();
        harness
            .run(move |engine| async move {
                engine
                    .write(vec![Mutation::set(key("rooms/c"), data(1))], write_sender)
                    .await
            })
            .await;
        let (sender, mut receiver) = oneshot::channel();
        harness
            .run(move |engine| async move { engine.register_pending_writes_callback(sender).await })
            .await;
        assert!(receiver.try_recv().unwrap().is_none());

        harness.datastore.wait_for_pending_writes(1).await.unwrap();
        harness.datastore.ack_next_write().unwrap();
        receiver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejected_target_reports_error_to_listeners() {
        let harness = Harness::new().await;
        harness
            .run(|engine| async move { engine.listen(rooms(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(2).await.unwrap();
        harness
            .datastore
            .send_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Remove, vec![2]).with_cause(permission_denied("denied")),
            ))
            .unwrap();
        harness
            .wait_until(|listener| !listener.errors.lock().unwrap().is_empty())
            .await;
        assert_eq!(
            harness.listener.errors.lock().unwrap()[0].code,
            FirestoreErrorCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn unconfirmed_documents_are_resolved_through_limbo_targets() {
        let harness = Harness::new().await;
        harness.datastore.seed_document(key("rooms/a"), data(1));
        harness.datastore.seed_document(key("rooms/b"), data(2));

        // Cache both documents through a first listen.
        harness
            .run(|engine| async move { engine.listen(rooms(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(2).await.unwrap();
        harness.datastore.send_query_snapshot(2, &rooms()).unwrap();
        harness
            .wait_until(|listener| {
                listener
                    .snapshots
                    .lock()
                    .unwrap()
                    .last()
                    .is_some_and(|snapshot| snapshot.documents.len() == 2)
            })
            .await;

        // The backend reports that "rooms/b" left the target without saying
        // why: the reset keeps it in the view until its limbo target answers.
        harness.datastore.remove_document(&key("rooms/b"));
        harness
            .datastore
            .send_watch_changes([
                WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Reset, vec![2])),
                WatchChange::DocumentChange(crate::firestore::remote::watch_change::DocumentChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: Vec::new(),
                    document: harness.datastore.document(&key("rooms/a")).unwrap(),
                }),
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(b"r2".to_vec()),
                ),
                WatchChange::TargetChange(WatchTargetChange::global_snapshot(
                    harness.datastore.current_version(),
                )),
            ])
            .unwrap();

        let mut limbo = BTreeMap::new();
        for _ in 0..1_000 {
            harness.queue.drain().await.unwrap();
            limbo = harness.engine.active_limbo_documents().await;
            if !limbo.is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(limbo, BTreeMap::from([(key("rooms/b"), 1)]));

        harness.datastore.wait_for_target(1).await.unwrap();
        harness
            .datastore
            .send_query_snapshot(1, &Query::for_document(&key("rooms/b")))
            .unwrap();
        harness
            .wait_until(|listener| {
                listener
                    .snapshots
                    .lock()
                    .unwrap()
                    .last()
                    .is_some_and(|snapshot| snapshot.documents.len() == 1 && !snapshot.from_cache)
            })
            .await;
        assert!(harness.engine.active_limbo_documents().await.is_empty());
    }

    fn items() -> Query {
        Query::collection("items").unwrap()
    }

    fn top_five() -> Query {
        items()
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_first(5)
    }

    fn document_change(harness: &Harness, target_id: TargetId, path: &str) -> WatchChange {
        WatchChange::DocumentChange(crate::firestore::remote::watch_change::DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            document: harness.datastore.document(&key(path)).unwrap(),
        })
    }

    /// Sends `paths` as the full result of `target_id` and marks it current.
    fn send_documents(harness: &Harness, target_id: TargetId, paths: &[&str]) {
        let mut changes: Vec<WatchChange> = paths
            .iter()
            .map(|path| document_change(harness, target_id, path))
            .collect();
        changes.push(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(b"r1".to_vec()),
        ));
        changes.push(WatchChange::TargetChange(WatchTargetChange::global_snapshot(
            harness.datastore.current_version(),
        )));
        harness.datastore.send_watch_changes(changes).unwrap();
    }

    fn last_snapshot_for(listener: &RecordingListener, query: &Query) -> Option<ViewSnapshot> {
        listener
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|snapshot| snapshot.query.canonical_id() == query.canonical_id())
            .cloned()
    }

    fn ids(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.documents.keys().map(|key| key.id().to_string()).collect()
    }

    #[tokio::test]
    async fn limit_query_backfills_from_known_documents_without_limbo() {
        let harness = Harness::new().await;
        for rank in 1..=6 {
            harness.datastore.seed_document(key(&format!("items/{rank}")), data(rank));
        }

        harness
            .run(|engine| async move { engine.listen(items(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(2).await.unwrap();
        harness.datastore.send_query_snapshot(2, &items()).unwrap();
        harness
            .wait_until(|listener| last_snapshot_for(listener, &items()).is_some_and(|s| s.documents.len() == 6))
            .await;

        harness
            .run(|engine| async move { engine.listen(top_five(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(4).await.unwrap();
        send_documents(&harness, 4, &["items/1", "items/2", "items/3", "items/4", "items/5"]);
        harness
            .wait_until(|listener| last_snapshot_for(listener, &top_five()).is_some_and(|s| !s.from_cache))
            .await;

        let version = harness.datastore.remove_document(&key("items/5"));
        harness
            .datastore
            .send_watch_changes([
                WatchChange::DocumentDelete(DocumentDelete {
                    key: key("items/5"),
                    read_time: version,
                    removed_target_ids: vec![2, 4],
                }),
                document_change(&harness, 4, "items/6"),
                WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)),
            ])
            .unwrap();
        harness
            .wait_until(|listener| {
                last_snapshot_for(listener, &top_five())
                    .is_some_and(|s| ids(&s) == ["1", "2", "3", "4", "6"] && !s.from_cache)
            })
            .await;

        assert!(harness.engine.active_limbo_documents().await.is_empty());
        assert!(harness.engine.enqueued_limbo_documents().await.is_empty());
    }

    #[tokio::test]
    async fn limit_query_without_backfill_shows_fewer_results_until_current() {
        let harness = Harness::new().await;
        for rank in 1..=5 {
            harness.datastore.seed_document(key(&format!("items/{rank}")), data(rank));
        }
        harness
            .run(|engine| async move { engine.listen(top_five(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(2).await.unwrap();
        send_documents(&harness, 2, &["items/1", "items/2", "items/3", "items/4", "items/5"]);
        harness
            .wait_until(|listener| {
                last_snapshot_for(listener, &top_five()).is_some_and(|s| s.documents.len() == 5 && !s.from_cache)
            })
            .await;

        let version = harness.datastore.remove_document(&key("items/5"));
        let mut changes = vec![WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Reset,
            vec![2],
        ))];
        for path in ["items/1", "items/2", "items/3", "items/4"] {
            changes.push(document_change(&harness, 2, path));
        }
        changes.push(WatchChange::DocumentDelete(DocumentDelete {
            key: key("items/5"),
            read_time: version,
            removed_target_ids: vec![2],
        }));
        changes.push(WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)));
        harness.datastore.send_watch_changes(changes).unwrap();

        harness
            .wait_until(|listener| {
                last_snapshot_for(listener, &top_five()).is_some_and(|s| s.documents.len() == 4 && s.from_cache)
            })
            .await;

        harness
            .datastore
            .send_watch_changes([
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(b"r2".to_vec()),
                ),
                WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)),
            ])
            .unwrap();
        harness
            .wait_until(|listener| {
                last_snapshot_for(listener, &top_five()).is_some_and(|s| s.documents.len() == 4 && !s.from_cache)
            })
            .await;
    }

    #[tokio::test]
    async fn existence_filter_with_bloom_filter_evicts_only_missing_documents() {
        let harness = Harness::new().await;
        for path in ["rooms/a", "rooms/b", "rooms/c"] {
            harness.datastore.seed_document(key(path), data(1));
        }
        harness
            .run(|engine| async move { engine.listen(rooms(), true).await.map(|_| ()) })
            .await;
        harness.datastore.wait_for_target(2).await.unwrap();
        harness.datastore.send_query_snapshot(2, &rooms()).unwrap();
        harness
            .wait_until(|listener| last_snapshot_for(listener, &rooms()).is_some_and(|s| s.documents.len() == 3))
            .await;

        let database_id = DatabaseId::default("project");
        let names: Vec<String> = ["rooms/a", "rooms/b"]
            .iter()
            .map(|path| database_id.document_name(&key(path)))
            .collect();
        let filter = BloomFilter::with_names(names.iter().map(String::as_str), 4_096, 10).unwrap();
        assert!(!filter.might_contain(&database_id.document_name(&key("rooms/c"))));

        harness.datastore.clear_listen_requests();
        let version = harness.datastore.remove_document(&key("rooms/c"));
        harness
            .datastore
            .send_watch_changes([
                WatchChange::ExistenceFilter(ExistenceFilterChange {
                    target_id: 2,
                    existence_filter: ExistenceFilter {
                        count: 2,
                        unchanged_names: Some(filter.to_payload()),
                    },
                }),
                WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)),
            ])
            .unwrap();

        // The only new listen is the single-document lookup for "rooms/c".
        match harness.datastore.next_listen_request().await.unwrap() {
            ListenRequest::AddTarget(target_data) => {
                assert_eq!(target_data.target_id, 1);
                assert_eq!(target_data.purpose, TargetPurpose::LimboResolution);
            }
            other => panic!("unexpected listen request {other:?}"),
        }
        harness
            .datastore
            .send_query_snapshot(1, &Query::for_document(&key("rooms/c")))
            .unwrap();

        harness
            .wait_until(|listener| {
                last_snapshot_for(listener, &rooms()).is_some_and(|s| s.documents.len() == 2 && !s.from_cache)
            })
            .await;
        let snapshot = last_snapshot_for(&harness.listener, &rooms()).unwrap();
        assert_eq!(ids(&snapshot), ["a", "b"]);
        assert!(snapshot.changes.iter().any(|change| {
            change.change_type == DocumentViewChangeType::Removed && change.document.key() == &key("rooms/c")
        }));
        assert!(harness.datastore.active_targets().contains(&2));
    }
}
