use std::collections::BTreeSet;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::credentials::User;
use crate::firestore::core::types::{BatchId, OnlineState, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the sync engine. Every method is
/// called from a task on the async queue, never while the remote store
/// holds its own state lock.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot received on the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected the target. The remote store has already
    /// stopped listening to it.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The batch failed permanently and was removed from the write pipeline.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the views of `target_id` currently hold as synced. Must not block
    /// on the async queue.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First queued batch with an id greater than `after_batch_id`.
    fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    /// Version of the last remote event applied locally. Watch snapshots
    /// older than this are ignored.
    fn last_remote_snapshot_version(&self) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>>;

    /// Persists the write stream token received with the handshake.
    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Switches to `user` while the streams are stopped.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        let _ = online_state;
        box_remote_store_future(async { Ok(()) })
    }
}
