use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::firestore::core::credentials::Token;
use crate::firestore::core::query::Query;
use crate::firestore::core::types::TargetId;
use crate::firestore::error::{
    already_exists, deadline_exceeded, failed_precondition, not_found, unavailable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::model::{
    DocumentKey, MutableDocument, Mutation, MutationKind, MutationResult, Precondition,
    SnapshotVersion,
};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::firestore::value::{FirestoreValue, MapValue};
use crate::platform::runtime;

use super::{
    CommitResponse, Datastore, ListenRequest, StreamConnection, WatchConnection, WriteConnection,
    WriteRequest, WriteResponse,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// In-process backend. Keeps its own document store, answers lookups and
/// commits against it, and exposes the watch and write streams to the
/// embedding code so they can be scripted.
///
/// Target add/remove requests are acknowledged automatically. Writes are
/// committed as soon as they arrive unless automatic acknowledgement is
/// turned off with [`InMemoryDatastore::set_auto_ack_writes`].
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    inner: Arc<BackendInner>,
}

#[derive(Default)]
struct BackendInner {
    state: StdMutex<BackendState>,
}

struct BackendState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Seconds of the latest commit.
    version: i64,
    watch: Option<async_channel::Sender<FirestoreResult<WatchChange>>>,
    write: Option<async_channel::Sender<FirestoreResult<WriteResponse>>>,
    listen_requests: VecDeque<ListenRequest>,
    active_targets: BTreeSet<TargetId>,
    auto_ack_writes: bool,
    pending_writes: VecDeque<Vec<Mutation>>,
    next_stream_token: u64,
    watch_stream_opens: usize,
    write_stream_opens: usize,
    reject_stream_opens: Option<FirestoreError>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            documents: BTreeMap::new(),
            version: 0,
            watch: None,
            write: None,
            listen_requests: VecDeque::new(),
            active_targets: BTreeSet::new(),
            auto_ack_writes: true,
            pending_writes: VecDeque::new(),
            next_stream_token: 0,
            watch_stream_opens: 0,
            write_stream_opens: 0,
            reject_stream_opens: None,
        }
    }
}

impl BackendState {
    fn next_stream_token(&mut self) -> Vec<u8> {
        self.next_stream_token += 1;
        format!("token-{}", self.next_stream_token).into_bytes()
    }

    fn current_version(&self) -> SnapshotVersion {
        SnapshotVersion::from_seconds(self.version)
    }

    fn push_watch(&self, change: WatchChange) -> FirestoreResult<()> {
        let sender = self
            .watch
            .as_ref()
            .ok_or_else(|| failed_precondition("No watch stream is open"))?;
        sender
            .try_send(Ok(change))
            .map_err(|_| failed_precondition("The watch stream is closed"))
    }

    fn push_write(&self, response: FirestoreResult<WriteResponse>) -> FirestoreResult<()> {
        let sender = self
            .write
            .as_ref()
            .ok_or_else(|| failed_precondition("No write stream is open"))?;
        sender
            .try_send(response)
            .map_err(|_| failed_precondition("The write stream is closed"))
    }

    /// Applies `mutations` atomically. Transform results are computed with
    /// the commit time as the server timestamp.
    fn commit(&mut self, mutations: &[Mutation]) -> FirestoreResult<CommitResponse> {
        let commit_version = SnapshotVersion::from_seconds(self.version + 1);
        let mut documents = self.documents.clone();
        let mut mutation_results = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let key = mutation.key().clone();
            let mut document = documents
                .get(&key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            check_precondition(mutation, &document)?;
            mutation.apply_to_local_view(&mut document, None, commit_version.timestamp());
            let transform_results = mutation
                .field_transforms()
                .iter()
                .map(|transform| {
                    document
                        .field(transform.field_path())
                        .cloned()
                        .unwrap_or_else(FirestoreValue::null)
                })
                .collect();
            match mutation.kind() {
                MutationKind::Verify => {}
                MutationKind::Delete => {
                    documents.remove(&key);
                }
                MutationKind::Set { .. } | MutationKind::Patch { .. } => {
                    let stored =
                        MutableDocument::new_found_document(key.clone(), commit_version, document.data().clone());
                    documents.insert(key, stored);
                }
            }
            mutation_results.push(MutationResult::new(commit_version, transform_results));
        }
        self.version += 1;
        self.documents = documents;
        Ok(CommitResponse {
            commit_version,
            mutation_results,
        })
    }

    fn handle_listen_request(&mut self, request: ListenRequest) {
        let ack = match &request {
            ListenRequest::AddTarget(target_data) => {
                self.active_targets.insert(target_data.target_id);
                WatchTargetChange::new(TargetChangeState::Add, vec![target_data.target_id])
            }
            ListenRequest::RemoveTarget(target_id) => {
                self.active_targets.remove(target_id);
                WatchTargetChange::new(TargetChangeState::Remove, vec![*target_id])
            }
        };
        self.listen_requests.push_back(request);
        if let Err(err) = self.push_watch(WatchChange::TargetChange(ack)) {
            log::debug!("Dropping target acknowledgement: {err}");
        }
    }

    fn handle_write_request(&mut self, request: WriteRequest) {
        let response = match request {
            WriteRequest::Handshake => Ok(WriteResponse {
                stream_token: self.next_stream_token(),
                commit_version: self.current_version(),
                mutation_results: Vec::new(),
            }),
            WriteRequest::Mutations { mutations, .. } => {
                if !self.auto_ack_writes {
                    self.pending_writes.push_back(mutations);
                    return;
                }
                self.commit_write(&mutations)
            }
        };
        if let Err(err) = self.push_write(response) {
            log::debug!("Dropping write response: {err}");
        }
    }

    fn commit_write(&mut self, mutations: &[Mutation]) -> FirestoreResult<WriteResponse> {
        let response = self.commit(mutations)?;
        Ok(WriteResponse {
            stream_token: self.next_stream_token(),
            commit_version: response.commit_version,
            mutation_results: response.mutation_results,
        })
    }
}

fn check_precondition(mutation: &Mutation, document: &MutableDocument) -> FirestoreResult<()> {
    let precondition = mutation.precondition();
    if precondition.is_valid_for(document) {
        return Ok(());
    }
    let key = mutation.key();
    Err(match precondition {
        Precondition::Exists(true) => not_found(format!("No document to update: {key}")),
        Precondition::Exists(false) => already_exists(format!("Document already exists: {key}")),
        _ => failed_precondition(format!("Update time of {key} does not match")),
    })
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        lock_backend(&self.inner)
    }

    /// Writes `data` directly into the backend store, bypassing any client.
    pub fn seed_document(&self, key: DocumentKey, data: MapValue) -> SnapshotVersion {
        let mut state = self.lock();
        state.version += 1;
        let version = state.current_version();
        state
            .documents
            .insert(key.clone(), MutableDocument::new_found_document(key, version, data));
        version
    }

    /// Deletes the document directly in the backend store.
    pub fn remove_document(&self, key: &DocumentKey) -> SnapshotVersion {
        let mut state = self.lock();
        state.version += 1;
        state.documents.remove(key);
        state.current_version()
    }

    pub fn document(&self, key: &DocumentKey) -> Option<MutableDocument> {
        self.lock().documents.get(key).cloned()
    }

    pub fn current_version(&self) -> SnapshotVersion {
        self.lock().current_version()
    }

    /// Targets the client is listening to on the open watch stream.
    pub fn active_targets(&self) -> BTreeSet<TargetId> {
        self.lock().active_targets.clone()
    }

    pub fn watch_stream_open_count(&self) -> usize {
        self.lock().watch_stream_opens
    }

    pub fn write_stream_open_count(&self) -> usize {
        self.lock().write_stream_opens
    }

    /// Makes every later stream open fail with `error`; `None` lets them
    /// succeed again.
    pub fn reject_stream_opens(&self, error: Option<FirestoreError>) {
        self.lock().reject_stream_opens = error;
    }

    /// Waits for the next listen request the client sends.
    pub async fn next_listen_request(&self) -> FirestoreResult<ListenRequest> {
        self.wait_until(|state| state.listen_requests.pop_front())
            .await
    }

    /// Drops the listen requests received so far.
    pub fn clear_listen_requests(&self) {
        self.lock().listen_requests.clear();
    }

    /// Waits until the client is listening to `target_id`.
    pub async fn wait_for_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.wait_until(|state| state.active_targets.contains(&target_id).then_some(()))
            .await
    }

    pub fn send_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        self.lock().push_watch(change)
    }

    pub fn send_watch_changes(&self, changes: impl IntoIterator<Item = WatchChange>) -> FirestoreResult<()> {
        let state = self.lock();
        for change in changes {
            state.push_watch(change)?;
        }
        Ok(())
    }

    /// Sends every stored document matching `query` for `target_id`, marks
    /// the target current and closes the snapshot at the current version.
    pub fn send_query_snapshot(&self, target_id: TargetId, query: &Query) -> FirestoreResult<SnapshotVersion> {
        let state = self.lock();
        let version = state.current_version();
        for document in state.documents.values().filter(|document| query.matches(document)) {
            state.push_watch(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: document.clone(),
            }))?;
        }
        state.push_watch(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                .with_resume_token(resume_token_for(version)),
        ))?;
        state.push_watch(WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)))?;
        Ok(version)
    }

    /// Sends the stored version of `key` (or its deletion) to `target_id` and
    /// closes a snapshot at the current version.
    pub fn send_document_update(&self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<SnapshotVersion> {
        let state = self.lock();
        let version = state.current_version();
        let change = match state.documents.get(key) {
            Some(document) => WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: document.clone(),
            }),
            None => WatchChange::DocumentDelete(DocumentDelete {
                key: key.clone(),
                read_time: version,
                removed_target_ids: vec![target_id],
            }),
        };
        state.push_watch(change)?;
        state.push_watch(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, vec![target_id])
                .with_resume_token(resume_token_for(version)),
        ))?;
        state.push_watch(WatchChange::TargetChange(WatchTargetChange::global_snapshot(version)))?;
        Ok(version)
    }

    /// Closes the watch stream with `error`.
    pub fn fail_watch_stream(&self, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.lock();
        state.push_watch_error(error)
    }

    pub fn set_auto_ack_writes(&self, enabled: bool) {
        self.lock().auto_ack_writes = enabled;
    }

    pub fn pending_write_count(&self) -> usize {
        self.lock().pending_writes.len()
    }

    /// Waits until at least `count` writes are held back.
    pub async fn wait_for_pending_writes(&self, count: usize) -> FirestoreResult<()> {
        self.wait_until(|state| (state.pending_writes.len() >= count).then_some(()))
            .await
    }

    /// Commits the oldest held-back write and acknowledges it. A failing
    /// commit closes the write stream with the commit error.
    pub fn ack_next_write(&self) -> FirestoreResult<SnapshotVersion> {
        let mut state = self.lock();
        let mutations = state
            .pending_writes
            .pop_front()
            .ok_or_else(|| failed_precondition("No pending write to acknowledge"))?;
        let response = state.commit_write(&mutations);
        let version = response
            .as_ref()
            .map(|response| response.commit_version)
            .map_err(Clone::clone);
        state.push_write(response)?;
        version
    }

    /// Drops the oldest held-back write and closes the write stream with
    /// `error`.
    pub fn reject_next_write(&self, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.lock();
        state
            .pending_writes
            .pop_front()
            .ok_or_else(|| failed_precondition("No pending write to reject"))?;
        state.push_write(Err(error))
    }

    /// Closes the write stream with `error`. Held-back writes are dropped;
    /// the client sends them again on the next stream.
    pub fn fail_write_stream(&self, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.lock();
        state.pending_writes.clear();
        state.push_write(Err(error))
    }

    async fn wait_until<T>(&self, mut check: impl FnMut(&mut BackendState) -> Option<T>) -> FirestoreResult<T> {
        let deadline = std::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            {
                let mut state = self.lock();
                if let Some(value) = check(&mut state) {
                    return Ok(value);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(deadline_exceeded("Timed out waiting for the client"));
            }
            runtime::sleep(POLL_INTERVAL).await;
        }
    }
}

impl BackendState {
    fn push_watch_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        let sender = self
            .watch
            .take()
            .ok_or_else(|| failed_precondition("No watch stream is open"))?;
        self.active_targets.clear();
        sender
            .try_send(Err(error))
            .map_err(|_| failed_precondition("The watch stream is closed"))
    }
}

fn lock_backend(inner: &BackendInner) -> MutexGuard<'_, BackendState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn resume_token_for(version: SnapshotVersion) -> Vec<u8> {
    format!("resume-{}", version.to_micros()).into_bytes()
}

type RequestHandler<Req> = Box<dyn Fn(&BackendInner, Req) + Send + Sync>;

/// Client end of a scripted stream.
struct ScriptedConnection<Req, Resp> {
    backend: Weak<BackendInner>,
    on_request: RequestHandler<Req>,
    responses: async_channel::Receiver<FirestoreResult<Resp>>,
}

#[async_trait]
impl<Req, Resp> StreamConnection<Req, Resp> for ScriptedConnection<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn send(&self, request: Req) -> FirestoreResult<()> {
        if self.responses.is_closed() {
            return Err(unavailable("Stream is closed"));
        }
        let backend = self
            .backend
            .upgrade()
            .ok_or_else(|| unavailable("Backend is gone"))?;
        (self.on_request)(&backend, request);
        Ok(())
    }

    async fn next(&self) -> Option<FirestoreResult<Resp>> {
        match self.responses.recv().await {
            Ok(Err(err)) => {
                self.responses.close();
                Some(Err(err))
            }
            Ok(message) => Some(message),
            Err(_) => None,
        }
    }

    async fn close(&self) {
        self.responses.close();
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn open_watch_stream(&self, _token: Option<Token>) -> FirestoreResult<WatchConnection> {
        let (sender, receiver) = async_channel::unbounded();
        {
            let mut state = self.lock();
            if let Some(error) = state.reject_stream_opens.clone() {
                return Err(error);
            }
            if let Some(previous) = state.watch.replace(sender) {
                previous.close();
            }
            state.active_targets.clear();
            state.watch_stream_opens += 1;
        }
        Ok(Arc::new(ScriptedConnection {
            backend: Arc::downgrade(&self.inner),
            on_request: Box::new(|backend: &BackendInner, request: ListenRequest| {
                lock_backend(backend).handle_listen_request(request)
            }),
            responses: receiver,
        }))
    }

    async fn open_write_stream(&self, _token: Option<Token>) -> FirestoreResult<WriteConnection> {
        let (sender, receiver) = async_channel::unbounded();
        {
            let mut state = self.lock();
            if let Some(error) = state.reject_stream_opens.clone() {
                return Err(error);
            }
            if let Some(previous) = state.write.replace(sender) {
                previous.close();
            }
            state.pending_writes.clear();
            state.write_stream_opens += 1;
        }
        Ok(Arc::new(ScriptedConnection {
            backend: Arc::downgrade(&self.inner),
            on_request: Box::new(|backend: &BackendInner, request: WriteRequest| {
                lock_backend(backend).handle_write_request(request)
            }),
            responses: receiver,
        }))
    }

    async fn lookup(&self, _token: Option<Token>, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MutableDocument>> {
        let state = self.lock();
        let version = state.current_version();
        Ok(keys
            .into_iter()
            .map(|key| {
                state
                    .documents
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| MutableDocument::new_no_document(key, version))
            })
            .collect())
    }

    async fn commit(&self, _token: Option<Token>, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse> {
        self.lock().commit(&mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{FieldMask, FieldPath, FieldTransform, TransformOperation};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    #[tokio::test]
    async fn commit_checks_preconditions_atomically() {
        let datastore = InMemoryDatastore::new();
        let response = datastore
            .commit(None, vec![Mutation::set(key("rooms/a"), data("x", 1))])
            .await
            .unwrap();
        assert_eq!(response.commit_version, SnapshotVersion::from_seconds(1));

        let err = datastore
            .commit(
                None,
                vec![
                    Mutation::set(key("rooms/b"), data("x", 1)),
                    Mutation::patch(key("rooms/missing"), data("x", 2), FieldMask::new([FieldPath::from_dot_separated("x").unwrap()])),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::NotFound);
        assert!(datastore.document(&key("rooms/b")).is_none());

        let looked_up = datastore
            .lookup(None, vec![key("rooms/a"), key("rooms/b")])
            .await
            .unwrap();
        assert!(looked_up[0].is_found_document());
        assert!(looked_up[1].is_no_document());
    }

    #[tokio::test]
    async fn commit_returns_transform_results() {
        let datastore = InMemoryDatastore::new();
        datastore.seed_document(key("rooms/a"), data("count", 2));
        let path = FieldPath::from_dot_separated("count").unwrap();
        let mutation = Mutation::patch(key("rooms/a"), MapValue::empty(), FieldMask::empty()).with_transforms(vec![
            FieldTransform::new(path.clone(), TransformOperation::NumericIncrement(FirestoreValue::from_integer(3))),
        ]);
        let response = datastore.commit(None, vec![mutation]).await.unwrap();
        assert_eq!(
            response.mutation_results[0].transform_results,
            vec![FirestoreValue::from_integer(5)]
        );
        let stored = datastore.document(&key("rooms/a")).unwrap();
        assert_eq!(stored.field(&path), Some(&FirestoreValue::from_integer(5)));
    }

    #[tokio::test]
    async fn watch_stream_acknowledges_targets() {
        let datastore = InMemoryDatastore::new();
        let connection = datastore.open_watch_stream(None).await.unwrap();
        let query = Query::collection("rooms").unwrap();
        let target_data = crate::firestore::core::target::TargetData::new(
            query.to_target(),
            2,
            crate::firestore::core::types::TargetPurpose::Listen,
            1,
        );
        connection.send(ListenRequest::AddTarget(target_data)).await.unwrap();
        assert!(matches!(
            datastore.next_listen_request().await.unwrap(),
            ListenRequest::AddTarget(_)
        ));
        assert_eq!(datastore.active_targets(), BTreeSet::from([2]));

        let ack = connection.next().await.unwrap().unwrap();
        assert!(matches!(
            ack,
            WatchChange::TargetChange(change) if change.state == TargetChangeState::Add
        ));

        datastore.fail_watch_stream(unavailable("down")).unwrap();
        assert!(connection.next().await.unwrap().is_err());
        assert!(connection.next().await.is_none());
    }

    #[tokio::test]
    async fn held_back_writes_are_acknowledged_in_order() {
        let datastore = InMemoryDatastore::new();
        datastore.set_auto_ack_writes(false);
        let connection = datastore.open_write_stream(None).await.unwrap();
        connection.send(WriteRequest::Handshake).await.unwrap();
        let handshake = connection.next().await.unwrap().unwrap();
        assert!(handshake.mutation_results.is_empty());
        assert!(!handshake.stream_token.is_empty());

        connection
            .send(WriteRequest::Mutations {
                stream_token: handshake.stream_token,
                mutations: vec![Mutation::set(key("rooms/a"), data("x", 1))],
            })
            .await
            .unwrap();
        datastore.wait_for_pending_writes(1).await.unwrap();
        let version = datastore.ack_next_write().unwrap();
        let response = connection.next().await.unwrap().unwrap();
        assert_eq!(response.commit_version, version);
        assert_eq!(response.mutation_results.len(), 1);
    }
}
