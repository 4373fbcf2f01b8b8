use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use once_cell::sync::OnceCell;

use crate::firestore::core::async_queue::{AsyncQueue, TimerId};
use crate::firestore::core::credentials::{CredentialsProviderArc, User};
use crate::firestore::core::settings::FirestoreSettings;
use crate::firestore::core::target::TargetData;
use crate::firestore::core::types::{OnlineState, TargetId};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::datastore::DatastoreArc;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::firestore::remote::stream::{StreamConfig, StreamHandler, WatchStream, WriteStream, WriteStreamDelegate};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};

/// Batches sent on the write stream without an acknowledgement yet.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons the network is disabled. The network is used only while the set
/// is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// Another instance holds the primary lease.
    IsSecondary,
    CredentialChange,
    Shutdown,
}

#[derive(Default)]
struct RemoteStoreState {
    /// Targets to listen to, with the latest resume token of each.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent or about to be sent on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn last_batch_id_retrieved(&self) -> i32 {
        self.write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, MutationBatch::batch_id)
    }
}

/// Target metadata for the aggregator: target data from the listen set,
/// synced keys from the sync engine.
struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

/// Owns the watch and write streams and turns their traffic into calls on
/// the [`RemoteSyncer`].
///
/// All methods run on the async queue. The state lock is never held while
/// the syncer is called, since the syncer calls back into the remote store.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    database_id: DatabaseId,
    syncer: OnceCell<Weak<dyn RemoteSyncer>>,
    state: Mutex<RemoteStoreState>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
}

impl RemoteStore {
    /// Creates the store with the network disabled. Call
    /// [`RemoteStore::set_syncer`] and then [`RemoteStore::start`].
    pub fn new(
        queue: AsyncQueue,
        database_id: DatabaseId,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        settings: &FirestoreSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = WatchStream::new(
                queue.clone(),
                StreamConfig {
                    label: "watch",
                    idle_timer_id: TimerId::ListenStreamIdle,
                    backoff_timer_id: TimerId::ListenStreamConnectionBackoff,
                    idle_timeout: settings.stream_idle_timeout(),
                    backoff: settings.backoff(),
                },
                Arc::clone(&datastore),
                Arc::clone(&credentials),
                Arc::new(RemoteListenDelegate { inner: weak.clone() }),
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                StreamConfig {
                    label: "write",
                    idle_timer_id: TimerId::WriteStreamIdle,
                    backoff_timer_id: TimerId::WriteStreamConnectionBackoff,
                    idle_timeout: settings.stream_idle_timeout(),
                    backoff: settings.backoff(),
                },
                datastore,
                credentials,
                Arc::new(RemoteWriteDelegate { inner: weak.clone() }),
            );
            let change_queue = queue.clone();
            let tracker_owner = weak.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue,
                settings.online_state_timeout(),
                Arc::new(move |online_state| {
                    let owner = tracker_owner.clone();
                    change_queue.enqueue_and_forget(move || async move {
                        let Some(inner) = owner.upgrade() else {
                            return Ok(());
                        };
                        let syncer = RemoteStore { inner }.syncer()?;
                        syncer.apply_online_state_change(online_state).await
                    });
                }),
            );
            let mut state = RemoteStoreState::default();
            // Started by `start`.
            state.offline_causes.insert(OfflineCause::UserDisabled);
            RemoteStoreInner {
                database_id,
                syncer: OnceCell::new(),
                state: Mutex::new(state),
                watch_stream,
                write_stream,
                online_state_tracker,
            }
        });
        Self { inner }
    }

    fn from_weak(weak: &Weak<RemoteStoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) -> FirestoreResult<()> {
        self.inner
            .syncer
            .set(syncer)
            .map_err(|_| internal_error("The remote syncer is already set"))
    }

    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.inner
            .syncer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("The remote store has no syncer"))
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    /// Starts using the network.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    /// Stops both streams. Pending writes stay queued locally and are sent
    /// again once the network is enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            self.disable_network_internal(&mut state).await;
        }
        // Writes may be acknowledged while offline is reported, but
        // listeners should see cached results.
        self.inner.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("RemoteStore shutting down.");
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            self.disable_network_internal(&mut state).await;
        }
        self.inner.watch_stream.shutdown().await;
        self.inner.write_stream.shutdown().await;
        // Listeners are not notified of the final state.
        self.inner.online_state_tracker.set(OnlineState::Unknown);
        Ok(())
    }

    /// Only the primary instance uses the network.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner
                .state
                .lock()
                .await
                .offline_causes
                .remove(&OfflineCause::IsSecondary);
            self.enable_network_internal().await
        } else {
            {
                let mut state = self.inner.state.lock().await;
                state.offline_causes.insert(OfflineCause::IsSecondary);
                self.disable_network_internal(&mut state).await;
            }
            self.inner.online_state_tracker.set(OnlineState::Unknown);
            Ok(())
        }
    }

    /// Restarts the streams with the credentials of `user`. The syncer
    /// switches users while the streams are down.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.can_use_network() {
                log::debug!("RemoteStore restarting streams for new credential");
                state.offline_causes.insert(OfflineCause::CredentialChange);
                self.disable_network_internal(&mut state).await;
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        self.syncer()?.handle_credential_change(user).await?;
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            if self.should_start_watch_stream(&state) {
                self.start_watch_stream(&mut state);
            } else {
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self, state: &mut RemoteStoreState) {
        self.inner.write_stream.stop().await;
        self.inner.watch_stream.stop().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "Stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
    }

    /// Starts listening to `target_data`. Listening to a target twice is a
    /// no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.listen_targets.contains_key(&target_data.target_id) {
            return Ok(());
        }
        state
            .listen_targets
            .insert(target_data.target_id, target_data.clone());

        if self.should_start_watch_stream(&state) {
            self.start_watch_stream(&mut state);
        } else if self.inner.watch_stream.is_open() {
            self.send_watch_request(&mut state, target_data).await?;
        }
        Ok(())
    }

    /// Stops listening to `target_id`. Other targets are not affected.
    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.listen_targets.remove(&target_id);
        if self.inner.watch_stream.is_open() {
            self.send_unwatch_request(&mut state, target_id).await;
        }
        if state.listen_targets.is_empty() {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if state.can_use_network() {
                // Nothing to listen to: the online state cannot be known.
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    async fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        state
            .watch_aggregator
            .get_or_insert_with(WatchChangeAggregator::new)
            .record_pending_target_request(target_id);
        let target_data = if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min()
        {
            let expected = self.syncer()?.get_remote_keys_for_target(target_id).len();
            target_data.with_expected_count(Some(expected as u32))
        } else {
            target_data
        };
        self.inner.watch_stream.watch(target_data).await;
        Ok(())
    }

    async fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) {
        state
            .watch_aggregator
            .get_or_insert_with(WatchChangeAggregator::new)
            .record_pending_target_request(target_id);
        self.inner.watch_stream.unwatch(target_id).await;
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.inner.watch_stream.is_started() && !state.listen_targets.is_empty()
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.watch_aggregator = Some(WatchChangeAggregator::new());
        self.inner.watch_stream.start();
        self.inner.online_state_tracker.handle_watch_stream_start();
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&mut state, target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.watch_aggregator = None;
        if self.should_start_watch_stream(&state) {
            self.inner
                .online_state_tracker
                .handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream(&mut state);
        } else {
            // Closed because nothing is listened to or the network is off.
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    async fn on_watch_stream_change(&self, change: WatchChange) -> FirestoreResult<()> {
        self.inner.online_state_tracker.set(OnlineState::Online);
        let syncer = self.syncer()?;
        let snapshot_version = change.snapshot_version();

        let rejected = {
            let mut guard = self.inner.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };

            match change {
                WatchChange::TargetChange(target_change)
                    if target_change.state == TargetChangeState::Remove && target_change.cause.is_some() =>
                {
                    let cause = target_change
                        .cause
                        .clone()
                        .ok_or_else(|| internal_error("Target rejection without a cause"))?;
                    let mut rejected = Vec::new();
                    for target_id in &target_change.target_ids {
                        if listen_targets.remove(target_id).is_some() {
                            aggregator.remove_target(*target_id);
                            rejected.push(*target_id);
                        }
                    }
                    Some((rejected, cause))
                }
                other => {
                    let metadata = ListenMetadata {
                        listen_targets,
                        syncer: syncer.as_ref(),
                        database_id: &self.inner.database_id,
                    };
                    match other {
                        WatchChange::TargetChange(target_change) => {
                            aggregator.handle_target_change(&metadata, &target_change)
                        }
                        WatchChange::DocumentChange(change) => {
                            aggregator.handle_document_change(&metadata, change.into())
                        }
                        WatchChange::DocumentDelete(delete) => {
                            aggregator.handle_document_change(&metadata, delete.into())
                        }
                        WatchChange::DocumentRemove(remove) => {
                            aggregator.handle_document_change(&metadata, remove.into())
                        }
                        WatchChange::ExistenceFilter(filter) => {
                            aggregator.handle_existence_filter(&metadata, &filter)
                        }
                    }
                    None
                }
            }
        };

        if let Some((target_ids, cause)) = rejected {
            log::debug!("Watch rejected targets {target_ids:?}: {cause}");
            for target_id in target_ids {
                syncer.reject_listen(target_id, cause.clone()).await?;
            }
            return Ok(());
        }

        if !snapshot_version.is_min() {
            let last_remote_snapshot_version = syncer.last_remote_snapshot_version().await?;
            if snapshot_version >= last_remote_snapshot_version {
                // Older snapshots were already applied; re-raising them
                // would move the local state backwards.
                self.raise_watcher_event(syncer.as_ref(), snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Builds the remote event, records new resume tokens and re-listens to
    /// targets whose existence filter did not match.
    async fn raise_watcher_event(&self, syncer: &dyn RemoteSyncer, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let event = {
            let mut guard = self.inner.state.lock().await;
            let event = {
                let RemoteStoreState {
                    listen_targets,
                    watch_aggregator,
                    ..
                } = &mut *guard;
                let Some(aggregator) = watch_aggregator.as_mut() else {
                    return Ok(());
                };
                let metadata = ListenMetadata {
                    listen_targets,
                    syncer,
                    database_id: &self.inner.database_id,
                };
                aggregator.create_remote_event(&metadata, snapshot_version)
            };

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = guard.listen_targets.get_mut(target_id) {
                    *target_data = target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = guard.listen_targets.get(target_id).cloned() else {
                    continue;
                };
                // Forget the resume token so the re-listen returns the full
                // result set.
                guard.listen_targets.insert(
                    *target_id,
                    target_data
                        .clone()
                        .with_resume_token(Vec::new(), target_data.snapshot_version),
                );
                self.send_unwatch_request(&mut guard, *target_id).await;
                let request = TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                );
                self.send_watch_request(&mut guard, request).await?;
            }
            event
        };
        syncer.apply_remote_event(event).await
    }

    /// Pulls queued batches into the write pipeline until it is full and
    /// starts the write stream when there is something to send.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        loop {
            let last_batch_id = {
                let state = self.inner.state.lock().await;
                if !state.can_add_to_write_pipeline() {
                    break;
                }
                state.last_batch_id_retrieved()
            };
            let batch = syncer.next_mutation_batch(last_batch_id).await?;
            let mut state = self.inner.state.lock().await;
            match batch {
                Some(batch) if state.can_add_to_write_pipeline() => {
                    self.add_to_write_pipeline(&mut state, batch).await;
                }
                Some(_) => break,
                None => {
                    if state.write_pipeline.is_empty() {
                        self.inner.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        let state = self.inner.state.lock().await;
        if self.should_start_write_stream(&state) {
            self.inner.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) {
        let mutations = batch.mutations().to_vec();
        state.write_pipeline.push_back(batch);
        if self.inner.write_stream.is_open() && self.inner.write_stream.handshake_complete() {
            self.inner.write_stream.write_mutations(mutations).await;
        }
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.inner.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.inner.write_stream.write_handshake().await;
        Ok(())
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        let token = self.inner.write_stream.last_stream_token();
        self.syncer()?.set_last_stream_token(token).await?;
        let state = self.inner.state.lock().await;
        for batch in &state.write_pipeline {
            self.inner
                .write_stream
                .write_mutations(batch.mutations().to_vec())
                .await;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self
            .inner
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Got a write result without a pending batch"))?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.inner.write_stream.last_stream_token(),
        )?;
        self.syncer()?.apply_successful_write(result).await?;
        // More batches may fit into the pipeline now.
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            let has_pending = !self.inner.state.lock().await.write_pipeline.is_empty();
            if has_pending {
                if self.inner.write_stream.handshake_complete() {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(error).await?;
                }
            }
        }

        let state = self.inner.state.lock().await;
        if self.should_start_write_stream(&state) {
            self.inner.write_stream.start();
        }
        Ok(())
    }

    async fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        // A permanent handshake failure means the stream token is invalid.
        if is_permanent_error(error.code) {
            log::debug!(
                "RemoteStore error before completed handshake; resetting stream token: {error}"
            );
            self.inner.write_stream.set_last_stream_token(Vec::new());
            self.syncer()?.set_last_stream_token(Vec::new()).await?;
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            // Transient: the pipeline is resent on the next stream.
            return Ok(());
        }
        let batch = self
            .inner
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Write stream failed without a pending batch"))?;
        // The failure was the batch's fault, not the connection's.
        self.inner.write_stream.inhibit_backoff();
        self.syncer()?
            .reject_failed_write(batch.batch_id(), error)
            .await?;
        self.fill_write_pipeline().await
    }
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl StreamHandler<WatchChange> for RemoteListenDelegate {
    async fn on_open(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, change: WatchChange) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_watch_stream_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_mutation_result(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.inner) {
            Some(store) => store.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::firestore::core::credentials::EmptyCredentialsProvider;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::types::{BatchId, TargetPurpose};
    use crate::firestore::error::{failed_precondition, permission_denied};
    use crate::firestore::model::{FieldPath, Mutation, Timestamp};
    use crate::firestore::remote::datastore::{InMemoryDatastore, ListenRequest};
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::remote::watch_change::WatchTargetChange;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::platform::runtime;

    #[derive(Default)]
    struct TestSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        rejected_listens: StdMutex<Vec<TargetId>>,
        acknowledged: StdMutex<Vec<BatchId>>,
        rejected_writes: StdMutex<Vec<(BatchId, FirestoreError)>>,
        batches: StdMutex<Vec<MutationBatch>>,
        stream_token: StdMutex<Vec<u8>>,
    }

    impl RemoteSyncer for TestSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push(target_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            let batch_id = result.batch.batch_id();
            self.batches.lock().unwrap().retain(|batch| batch.batch_id() != batch_id);
            self.acknowledged.lock().unwrap().push(batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.batches.lock().unwrap().retain(|batch| batch.batch_id() != batch_id);
            self.rejected_writes.lock().unwrap().push((batch_id, error));
            box_remote_store_future(async { Ok(()) })
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }

        fn next_mutation_batch(&self, after_batch_id: BatchId) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
            let next = self
                .batches
                .lock()
                .unwrap()
                .iter()
                .find(|batch| batch.batch_id() > after_batch_id)
                .cloned();
            box_remote_store_future(async move { Ok(next) })
        }

        fn last_remote_snapshot_version(&self) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>> {
            box_remote_store_future(async { Ok(SnapshotVersion::min()) })
        }

        fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            *self.stream_token.lock().unwrap() = token;
            box_remote_store_future(async { Ok(()) })
        }

        fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }
    }

    struct Harness {
        queue: AsyncQueue,
        datastore: InMemoryDatastore,
        store: RemoteStore,
        syncer: Arc<TestSyncer>,
    }

    impl Harness {
        async fn new() -> Self {
            let queue = AsyncQueue::new();
            let datastore = InMemoryDatastore::new();
            let store = RemoteStore::new(
                queue.clone(),
                DatabaseId::default("project"),
                Arc::new(datastore.clone()),
                Arc::new(EmptyCredentialsProvider),
                &FirestoreSettings::default(),
            );
            let syncer = Arc::new(TestSyncer::default());
            let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&(Arc::clone(&syncer) as Arc<dyn RemoteSyncer>));
            store.set_syncer(weak).unwrap();
            let harness = Self {
                queue,
                datastore,
                store,
                syncer,
            };
            harness.run(|store| async move { store.start().await }).await;
            harness
        }

        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(RemoteStore) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
        {
            let store = self.store.clone();
            self.queue.enqueue(move || op(store)).await.unwrap();
        }

        async fn wait_until(&self, mut condition: impl FnMut(&TestSyncer) -> bool) {
            for _ in 0..1_000 {
                self.queue.drain().await.unwrap();
                if condition(self.syncer.as_ref()) {
                    return;
                }
                runtime::sleep(Duration::from_millis(2)).await;
            }
            panic!("condition not reached");
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

    fn listen_target(target_id: TargetId) -> TargetData {
        TargetData::new(Query::collection("rooms").unwrap().to_target(), target_id, TargetPurpose::Listen, 1)
    }

    #[tokio::test]
    async fn raises_remote_events_and_tracks_resume_tokens() {
        let harness = Harness::new().await;
        harness.datastore.seed_document(key("rooms/a"), data(1));
        harness.run(|store| async move { store.listen(listen_target(2)).await }).await;
        harness.datastore.wait_for_target(2).await.unwrap();

        harness
            .datastore
            .send_query_snapshot(2, &Query::collection("rooms").unwrap())
            .unwrap();
        harness.wait_until(|syncer| !syncer.events.lock().unwrap().is_empty()).await;

        let events = harness.syncer.events.lock().unwrap().clone();
        let change = &events[0].target_changes[&2];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(harness.store.online_state(), OnlineState::Online);

        let state = harness.store.inner.state.lock().await;
        assert!(!state.listen_targets[&2].resume_token.is_empty());
    }

    #[tokio::test]
    async fn reconnects_targets_with_resume_token() {
        let harness = Harness::new().await;
        harness.run(|store| async move { store.listen(listen_target(2)).await }).await;
        harness.datastore.wait_for_target(2).await.unwrap();
        harness
            .datastore
            .send_query_snapshot(2, &Query::collection("rooms").unwrap())
            .unwrap();
        harness.wait_until(|syncer| !syncer.events.lock().unwrap().is_empty()).await;
        harness.datastore.clear_listen_requests();

        harness
            .datastore
            .fail_watch_stream(crate::firestore::error::unavailable("reset"))
            .unwrap();
        for _ in 0..1_000 {
            if harness
                .queue
                .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff)
                || harness.datastore.watch_stream_open_count() >= 2
            {
                break;
            }
            runtime::sleep(Duration::from_millis(2)).await;
        }
        harness
            .queue
            .run_all_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        match harness.datastore.next_listen_request().await.unwrap() {
            ListenRequest::AddTarget(target_data) => {
                assert_eq!(target_data.target_id, 2);
                assert!(!target_data.resume_token.is_empty());
                assert_eq!(target_data.expected_count, Some(0));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_targets_are_reported() {
        let harness = Harness::new().await;
        harness.run(|store| async move { store.listen(listen_target(4)).await }).await;
        harness.datastore.wait_for_target(4).await.unwrap();
        harness
            .datastore
            .send_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Remove, vec![4]).with_cause(permission_denied("no")),
            ))
            .unwrap();
        harness
            .wait_until(|syncer| *syncer.rejected_listens.lock().unwrap() == vec![4])
            .await;
        assert!(harness.store.inner.state.lock().await.listen_targets.is_empty());
    }

    #[tokio::test]
    async fn writes_are_acknowledged_in_order() {
        let harness = Harness::new().await;
        {
            let mut batches = harness.syncer.batches.lock().unwrap();
            batches.push(MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![Mutation::set(key("rooms/a"), data(1))]));
            batches.push(MutationBatch::new(2, Timestamp::now(), Vec::new(), vec![Mutation::set(key("rooms/b"), data(2))]));
        }
        harness.run(|store| async move { store.fill_write_pipeline().await }).await;
        harness
            .wait_until(|syncer| syncer.acknowledged.lock().unwrap().len() == 2)
            .await;
        assert_eq!(*harness.syncer.acknowledged.lock().unwrap(), vec![1, 2]);
        assert!(!harness.syncer.stream_token.lock().unwrap().is_empty());
        assert!(harness.datastore.document(&key("rooms/b")).is_some());
    }

    #[tokio::test]
    async fn permanent_write_errors_reject_the_batch() {
        let harness = Harness::new().await;
        harness.datastore.set_auto_ack_writes(false);
        harness.syncer.batches.lock().unwrap().push(MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("rooms/a"), data(1))],
        ));
        harness.run(|store| async move { store.fill_write_pipeline().await }).await;
        harness.datastore.wait_for_pending_writes(1).await.unwrap();
        harness
            .datastore
            .reject_next_write(failed_precondition("conflict"))
            .unwrap();
        harness
            .wait_until(|syncer| !syncer.rejected_writes.lock().unwrap().is_empty())
            .await;
        let rejected = harness.syncer.rejected_writes.lock().unwrap().clone();
        assert_eq!(rejected[0].0, 1);
        assert_eq!(rejected[0].1, failed_precondition("conflict"));
        assert!(harness.syncer.acknowledged.lock().unwrap().is_empty());
    }
}
