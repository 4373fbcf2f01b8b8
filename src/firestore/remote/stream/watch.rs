use std::sync::Arc;

use futures::FutureExt;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::core::credentials::CredentialsProviderArc;
use crate::firestore::core::target::TargetData;
use crate::firestore::core::types::TargetId;
use crate::firestore::remote::datastore::{DatastoreArc, ListenRequest};
use crate::firestore::remote::watch_change::WatchChange;

use super::persistent::{PersistentStream, StreamConfig, StreamHandler, StreamOpener, StreamState};

/// Stream of target changes for the targets added with [`WatchStream::watch`].
pub struct WatchStream {
    stream: PersistentStream<ListenRequest, WatchChange>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        config: StreamConfig,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        handler: Arc<dyn StreamHandler<WatchChange>>,
    ) -> Self {
        let opener: StreamOpener<ListenRequest, WatchChange> = Arc::new(move |token| {
            let datastore = Arc::clone(&datastore);
            async move { datastore.open_watch_stream(token).await }.boxed()
        });
        Self {
            stream: PersistentStream::new(queue, config, credentials, opener, handler),
        }
    }

    pub fn start(&self) {
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

    /// Starts listening to `target_data`, resuming from its resume token.
    pub async fn watch(&self, target_data: TargetData) {
        log::debug!("watch: adding target {}", target_data.target_id);
        self.stream.send(ListenRequest::AddTarget(target_data)).await;
    }

    pub async fn unwatch(&self, target_id: TargetId) {
        log::debug!("watch: removing target {target_id}");
        self.stream.send(ListenRequest::RemoveTarget(target_id)).await;
    }
}
