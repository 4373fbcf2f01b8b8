use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::credentials::Token;
use crate::firestore::core::target::TargetData;
use crate::firestore::core::types::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::watch_change::WatchChange;

pub mod in_memory;

pub use in_memory::InMemoryDatastore;

/// Request sent on the watch stream.
#[derive(Clone, Debug)]
pub enum ListenRequest {
    /// Starts listening to a target, resuming from its resume token or
    /// snapshot version when one is set.
    AddTarget(TargetData),
    RemoveTarget(TargetId),
}

/// Request sent on the write stream.
#[derive(Clone, Debug)]
pub enum WriteRequest {
    /// First message of every write stream. Answered with an empty response
    /// carrying the stream token.
    Handshake,
    Mutations {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    /// One result per mutation of the acknowledged batch, in order.
    pub mutation_results: Vec<MutationResult>,
}

/// Outcome of a non-streaming commit.
#[derive(Clone, Debug)]
pub struct CommitResponse {
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// One bidirectional stream. `next` yields `None` once the stream is closed.
#[async_trait]
pub trait StreamConnection<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn send(&self, request: Req) -> FirestoreResult<()>;

    async fn next(&self) -> Option<FirestoreResult<Resp>>;

    async fn close(&self);
}

pub type WatchConnection = Arc<dyn StreamConnection<ListenRequest, WatchChange>>;
pub type WriteConnection = Arc<dyn StreamConnection<WriteRequest, WriteResponse>>;

/// Transport to the backend. Encoding and connection management live
/// behind this trait.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn open_watch_stream(&self, token: Option<Token>) -> FirestoreResult<WatchConnection>;

    async fn open_write_stream(&self, token: Option<Token>) -> FirestoreResult<WriteConnection>;

    /// Reads the current server version of `keys`. Missing documents are
    /// returned as no-documents.
    async fn lookup(&self, token: Option<Token>, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MutableDocument>>;

    /// Commits `mutations` atomically.
    async fn commit(&self, token: Option<Token>, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse>;
}

pub type DatastoreArc = Arc<dyn Datastore>;
