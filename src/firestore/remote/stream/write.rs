use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::core::credentials::CredentialsProviderArc;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::{DatastoreArc, WriteRequest, WriteResponse};

use super::persistent::{PersistentStream, StreamConfig, StreamHandler, StreamOpener, StreamState};

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;

    /// The backend answered the handshake; mutations may be sent now.
    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    /// Token of the last response; sent with the next request so the backend
    /// can discard acknowledged writes. Empty before the first handshake.
    last_stream_token: Vec<u8>,
}

type SharedWriteState = Arc<StdMutex<WriteStreamState>>;

fn lock(state: &SharedWriteState) -> MutexGuard<'_, WriteStreamState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Stream sending mutation batches. The first response on every connection
/// completes the handshake; each later response acknowledges one batch.
pub struct WriteStream {
    stream: PersistentStream<WriteRequest, WriteResponse>,
    state: SharedWriteState,
}

struct WriteStreamHandler {
    state: SharedWriteState,
    delegate: Arc<dyn WriteStreamDelegate>,
}

#[async_trait]
impl StreamHandler<WriteResponse> for WriteStreamHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        lock(&self.state).handshake_complete = false;
        self.delegate.on_write_stream_open().await
    }

    async fn on_message(&self, response: WriteResponse) -> FirestoreResult<()> {
        let handshake = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token;
            let handshake = !state.handshake_complete;
            state.handshake_complete = true;
            handshake
        };
        if handshake {
            self.delegate.on_handshake_complete().await
        } else {
            self.delegate
                .on_mutation_result(response.commit_version, response.mutation_results)
                .await
        }
    }

    /// The handshake flag is kept so the delegate can tell whether the
    /// failure hit a batch or the handshake.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.delegate.on_write_stream_close(error).await
    }
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        config: StreamConfig,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        delegate: Arc<dyn WriteStreamDelegate>,
    ) -> Self {
        let state: SharedWriteState = Arc::default();
        let opener: StreamOpener<WriteRequest, WriteResponse> = Arc::new(move |token| {
            let datastore = Arc::clone(&datastore);
            async move { datastore.open_write_stream(token).await }.boxed()
        });
        let handler = Arc::new(WriteStreamHandler {
            state: Arc::clone(&state),
            delegate,
        });
        Self {
            stream: PersistentStream::new(queue, config, credentials, opener, handler),
            state,
        }
    }

    pub fn start(&self) {
        lock(&self.state).handshake_complete = false;
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub async fn shutdown(&self) {
        self.stream.shutdown().await;
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock(&self.state).last_stream_token = token;
    }

    pub async fn write_handshake(&self) {
        self.stream.send(WriteRequest::Handshake).await;
    }

    /// Sends one batch. Only valid after the handshake completed.
    pub async fn write_mutations(&self, mutations: Vec<Mutation>) {
        let stream_token = self.last_stream_token();
        self.stream
            .send(WriteRequest::Mutations {
                stream_token,
                mutations,
            })
            .await;
    }
}
