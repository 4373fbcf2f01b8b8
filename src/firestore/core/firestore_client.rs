//! Wires persistence, the local and remote stores, the sync engine and the
//! event manager together, and exposes them to the API layer.
//!
//! Every call is funnelled through the client's [`AsyncQueue`]. Results that
//! depend on the backend (write acknowledgements, server reads) are awaited
//! outside the queue so the queue keeps processing the events that produce
//! them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::OnceCell;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::credentials::{CredentialsProviderArc, User};
use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener, QueryObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::{DatabaseInfo, FirestoreSettings};
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::transaction::Transaction;
use crate::firestore::core::transaction_runner::TransactionRunner;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{failed_precondition, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::persistence::LEASE_REFRESH_INTERVAL;
use crate::firestore::local::{
    open_persistence, BundleMetadata, LocalStore, LruResults, NamedQuery, PersistenceArc, CACHE_SIZE_UNLIMITED,
};
use crate::firestore::model::{DocumentKey, FieldIndex, IndexSegment, MutableDocument, Mutation, SnapshotVersion};
use crate::firestore::remote::datastore::DatastoreArc;
use crate::firestore::remote::{RemoteStore, RemoteSyncer};
use crate::firestore::util::log::LOGGER;

/// Where a one-shot read is served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// The backend when reachable, the cache otherwise.
    #[default]
    Default,
    /// The backend only. Fails with `unavailable` when offline.
    Server,
    /// The cache only.
    Cache,
}

/// Result of a one-shot document read.
#[derive(Clone, Debug)]
pub struct DocumentRead {
    pub document: MutableDocument,
    pub from_cache: bool,
}

struct Components {
    persistence: PersistenceArc,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
}

type RepeatingOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

pub struct FirestoreClient {
    database_info: DatabaseInfo,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    datastore: DatastoreArc,
    credentials: CredentialsProviderArc,
    components: Arc<OnceCell<Components>>,
    timers: Arc<StdMutex<Vec<Arc<StdMutex<Option<DelayedOperation>>>>>>,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Builds and starts the client. Resolves once the local store is
    /// usable; the network comes up in the background.
    pub async fn new(
        database_info: DatabaseInfo,
        settings: FirestoreSettings,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
    ) -> FirestoreResult<Arc<Self>> {
        let client = Arc::new(Self {
            database_info,
            settings,
            queue: AsyncQueue::new(),
            datastore,
            credentials,
            components: Arc::new(OnceCell::new()),
            timers: Arc::new(StdMutex::new(Vec::new())),
            terminated: AtomicBool::new(false),
        });

        let initial_user = client.subscribe_to_credentials().await?;
        let initializer = Arc::clone(&client);
        client
            .queue
            .enqueue(move || async move { initializer.initialize(initial_user).await })
            .await?;
        Ok(client)
    }

    /// Registers the credential listener and returns the user it reports
    /// first. Later changes restart the streams under the new user.
    async fn subscribe_to_credentials(&self) -> FirestoreResult<User> {
        let (sender, receiver) = oneshot::channel();
        let first = StdMutex::new(Some(sender));
        let queue = self.queue.clone();
        let components = Arc::clone(&self.components);
        self.credentials.set_change_listener(Arc::new(move |user: User| {
            let initial = lock(&first).take();
            if let Some(sender) = initial {
                let _ = sender.send(user);
                return;
            }
            let components = Arc::clone(&components);
            queue.enqueue_and_forget(move || async move {
                let Some(components) = components.get() else {
                    return Ok(());
                };
                LOGGER.debug(format!("Credential changed. Current user: {user}"));
                components.remote_store.handle_credential_change(user).await
            });
        }));
        receiver
            .await
            .map_err(|_| internal_error("The credentials provider never reported a user"))
    }

    async fn initialize(&self, user: User) -> FirestoreResult<()> {
        LOGGER.debug(format!(
            "Initializing client for projects/{}/databases/{} with {user}",
            self.database_info.database_id.project_id(),
            self.database_info.database_id.database()
        ));
        let persistence = open_persistence(&self.settings).await;
        let local_store = Arc::new(LocalStore::new(
            persistence.clone(),
            self.settings.index_auto_creation(),
            user.clone(),
        ));
        local_store.start().await?;

        let remote_store = RemoteStore::new(
            self.queue.clone(),
            self.database_info.database_id.clone(),
            Arc::clone(&self.datastore),
            Arc::clone(&self.credentials),
            &self.settings,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            user,
            self.settings.max_concurrent_limbo_resolutions(),
        );
        let syncer: Arc<dyn RemoteSyncer> = sync_engine.clone();
        remote_store.set_syncer(Arc::downgrade(&syncer))?;

        let event_manager = EventManager::new(Arc::clone(&sync_engine));
        let sink: Arc<dyn SyncEngineListener> = event_manager.clone();
        let sink: Weak<dyn SyncEngineListener> = Arc::downgrade(&sink);
        sync_engine.set_listener(sink)?;

        self.components
            .set(Components {
                persistence: persistence.clone(),
                local_store: Arc::clone(&local_store),
                remote_store: remote_store.clone(),
                sync_engine,
                event_manager,
            })
            .map_err(|_| internal_error("The client is already initialized"))?;

        remote_store.start().await?;

        let queue = self.queue.clone();
        let primary_remote = remote_store.clone();
        persistence.set_primary_state_listener(Arc::new(move |is_primary| {
            let remote_store = primary_remote.clone();
            queue.enqueue_and_forget(move || async move { remote_store.apply_primary_state(is_primary).await });
        }));

        self.schedule_background_tasks(&persistence, &local_store);
        Ok(())
    }

    fn schedule_background_tasks(&self, persistence: &PersistenceArc, local_store: &Arc<LocalStore>) {
        if !persistence.is_durable() {
            return;
        }

        let lease_persistence = Arc::clone(persistence);
        self.schedule_repeating(
            TimerId::ClientMetadataRefresh,
            LEASE_REFRESH_INTERVAL,
            LEASE_REFRESH_INTERVAL,
            Arc::new(move || {
                let persistence = Arc::clone(&lease_persistence);
                async move {
                    persistence.refresh_primary_lease().await?;
                    Ok(())
                }
                .boxed()
            }),
        );

        if self.settings.cache_size_bytes() == CACHE_SIZE_UNLIMITED {
            LOGGER.debug("Cache size is unlimited; garbage collection is disabled");
            return;
        }
        let gc_store = Arc::clone(local_store);
        self.schedule_repeating(
            TimerId::LruGarbageCollection,
            self.settings.gc_initial_delay(),
            self.settings.gc_interval(),
            Arc::new(move || {
                let local_store = Arc::clone(&gc_store);
                async move {
                    let results: LruResults = local_store.collect_garbage().await?;
                    if results.did_run {
                        LOGGER.debug(format!(
                            "Garbage collection removed {} targets and {} documents",
                            results.targets_removed, results.documents_removed
                        ));
                    }
                    Ok(())
                }
                .boxed()
            }),
        );
    }

    /// Runs `op` after `initial_delay` and then every `interval` until the
    /// client terminates.
    fn schedule_repeating(&self, timer_id: TimerId, initial_delay: Duration, interval: Duration, op: RepeatingOp) {
        let slot = Arc::new(StdMutex::new(None));
        lock(&self.timers).push(Arc::clone(&slot));
        schedule_next(self.queue.clone(), timer_id, initial_delay, interval, op, slot);
    }

    fn components(&self) -> FirestoreResult<&Components> {
        self.components
            .get()
            .ok_or_else(|| failed_precondition("The client is not initialized"))
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst) || self.queue.is_shutting_down()
    }

    pub fn database_info(&self) -> &DatabaseInfo {
        &self.database_info
    }

    /// The queue all engine work runs on. Tests use it to drain work and to
    /// fast-forward timers.
    pub fn async_queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn sync_engine(&self) -> FirestoreResult<Arc<SyncEngine>> {
        Ok(Arc::clone(&self.components()?.sync_engine))
    }

    /// Runs `op` on the queue against the initialized components.
    async fn run_on_queue<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce(ComponentHandles) -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.verify_not_terminated()?;
        let handles = ComponentHandles::from(self.components()?);
        self.queue.enqueue(move || op(handles)).await
    }

    /// Starts listening to `query`. The observer is called on the queue and
    /// must not block.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: QueryObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let listener = QueryListener::new(query, options, observer);
        let registered = Arc::clone(&listener);
        self.run_on_queue(move |handles| async move { handles.event_manager.listen(registered).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::downgrade(&self.components()?.event_manager),
            listener,
            removed: AtomicBool::new(false),
        })
    }

    /// Queues `mutations` as one batch and resolves once the backend
    /// acknowledged or rejected it. The local view reflects the write as soon
    /// as it is queued.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.run_on_queue(move |handles| async move { handles.sync_engine.write(mutations, sender).await })
            .await?;
        receiver
            .await
            .map_err(|_| failed_precondition("The client was terminated before the write completed."))?
    }

    /// Resolves once every write queued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.run_on_queue(move |handles| async move {
            handles.sync_engine.register_pending_writes_callback(sender).await
        })
        .await?;
        receiver
            .await
            .map_err(|_| failed_precondition("The client was terminated while waiting for pending writes."))?
    }

    /// Reads `key` from the local cache.
    pub async fn get_document_from_local_cache(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let key = key.clone();
        self.run_on_queue(move |handles| async move {
            let document = handles.local_store.read_document(&key).await?;
            if document.is_found_document() || document.is_no_document() {
                Ok(document)
            } else {
                Err(unavailable(
                    "Failed to get document from cache. (However, this document may exist on the server. Run again without setting 'source' in the GetOptions to attempt to retrieve the document from the server.)",
                ))
            }
        })
        .await
    }

    /// Reads `key` from `source`. A missing document is returned as a
    /// no-document.
    pub async fn get_document(&self, key: &DocumentKey, source: Source) -> FirestoreResult<DocumentRead> {
        if source == Source::Cache {
            let document = self.get_document_from_local_cache(key).await?;
            return Ok(DocumentRead {
                document,
                from_cache: true,
            });
        }

        let target_key = key.clone();
        let snapshot = self
            .first_snapshot(Query::for_document(key), move |snapshot| {
                let document = snapshot.documents.get(&target_key).cloned();
                match document {
                    None if snapshot.from_cache => Err(unavailable("Failed to get document because the client is offline.")),
                    Some(_) if snapshot.from_cache && source == Source::Server => Err(unavailable(
                        "Failed to get document from server. (However, this document does exist in the local cache. Run again without setting source to 'server' to retrieve the cached document.)",
                    )),
                    _ => Ok(()),
                }
            })
            .await?;
        let document = snapshot
            .documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
        Ok(DocumentRead {
            document,
            from_cache: snapshot.from_cache,
        })
    }

    /// Runs `query` against the local cache without listening to it.
    pub async fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let query = query.clone();
        self.run_on_queue(move |handles| async move {
            let result = handles.local_store.execute_query(&query, true).await?;
            let mut view = View::new(query, result.remote_keys);
            let doc_changes = view.compute_doc_changes(&result.documents, None)?;
            view.apply_changes(doc_changes, false, None, false)
                .snapshot
                .ok_or_else(|| internal_error("A new view must raise a snapshot"))
        })
        .await
    }

    pub async fn get_documents(&self, query: &Query, source: Source) -> FirestoreResult<ViewSnapshot> {
        match source {
            Source::Cache => self.get_documents_from_local_cache(query).await,
            Source::Server => {
                self.first_snapshot(query.clone(), |snapshot| {
                    if snapshot.from_cache {
                        Err(unavailable(
                            "Failed to get documents from server. (However, these documents may exist in the local cache. Run again without setting source to 'server' to retrieve the cached documents.)",
                        ))
                    } else {
                        Ok(())
                    }
                })
                .await
            }
            Source::Default => self.first_snapshot(query.clone(), |_| Ok(())).await,
        }
    }

    /// Listens to `query` until it raises a snapshot the backend has
    /// answered for, or the client is offline, then stops listening.
    async fn first_snapshot<V>(&self, query: Query, validate: V) -> FirestoreResult<ViewSnapshot>
    where
        V: Fn(&ViewSnapshot) -> FirestoreResult<()> + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel::<FirestoreResult<ViewSnapshot>>();
        let sender = Arc::new(StdMutex::new(Some(sender)));
        let observer: QueryObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            let result = result.and_then(|snapshot| validate(&snapshot).map(|()| snapshot));
            if let Some(sender) = lock(&sender).take() {
                let _ = sender.send(result);
            }
        });
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let registration = self.listen(query, options, observer).await?;
        let result = receiver
            .await
            .map_err(|_| failed_precondition("The client was terminated before the read completed."));
        registration.remove();
        result?
    }

    /// Runs `update_fn` in a transaction, retrying up to `max_attempts`
    /// times on contention.
    pub async fn run_transaction<F, Fut, T>(&self, max_attempts: usize, update_fn: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        self.verify_not_terminated()?;
        TransactionRunner::new(
            self.queue.clone(),
            Arc::clone(&self.datastore),
            Arc::clone(&self.credentials),
            max_attempts,
            update_fn,
        )
        .run()
        .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.run_on_queue(|handles| async move { handles.remote_store.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.run_on_queue(|handles| async move { handles.remote_store.disable_network().await })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.run_on_queue(move |handles| async move {
            handles.local_store.set_index_auto_creation_enabled(enabled).await;
            Ok(())
        })
        .await
    }

    pub async fn add_field_index(
        &self,
        collection_group: impl Into<String>,
        segments: Vec<IndexSegment>,
    ) -> FirestoreResult<FieldIndex> {
        let collection_group = collection_group.into();
        self.run_on_queue(move |handles| async move {
            handles
                .local_store
                .add_field_index(&collection_group, segments)
                .await
        })
        .await
    }

    /// Records a loaded bundle and the queries it names. Returns `false`
    /// without saving anything when a bundle with the same id and an equal or
    /// newer create time was recorded before.
    pub async fn save_bundle(&self, metadata: BundleMetadata, named_queries: Vec<NamedQuery>) -> FirestoreResult<bool> {
        self.run_on_queue(move |handles| async move {
            if handles.local_store.has_newer_bundle(&metadata).await? {
                return Ok(false);
            }
            for named_query in named_queries {
                handles.local_store.save_named_query(named_query).await?;
            }
            handles.local_store.save_bundle(metadata).await?;
            Ok(true)
        })
        .await
    }

    pub async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        let name = name.to_string();
        self.run_on_queue(move |handles| async move { handles.local_store.get_named_query(&name).await })
            .await
    }

    /// Runs a garbage collection pass now instead of waiting for the timer.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.run_on_queue(|handles| async move { handles.local_store.collect_garbage().await })
            .await
    }

    /// Shuts the client down. Pending writes not yet acknowledged stay in
    /// durable persistence and are sent by the next client.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for slot in lock(&self.timers).drain(..) {
            if let Some(timer) = lock(&slot).take() {
                timer.cancel();
            }
        }
        self.credentials.remove_change_listener();
        let handles = self.components.get().map(ComponentHandles::from);
        self.queue
            .enqueue_and_initiate_shutdown(move || async move {
                if let Some(handles) = handles {
                    handles.remote_store.shutdown().await?;
                    handles.persistence.shutdown().await?;
                }
                Ok(())
            })
            .await
    }
}

/// Owned copies of the component handles, movable into queue tasks.
#[derive(Clone)]
struct ComponentHandles {
    persistence: PersistenceArc,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
}

impl From<&Components> for ComponentHandles {
    fn from(components: &Components) -> Self {
        Self {
            persistence: Arc::clone(&components.persistence),
            local_store: Arc::clone(&components.local_store),
            remote_store: components.remote_store.clone(),
            sync_engine: Arc::clone(&components.sync_engine),
            event_manager: Arc::clone(&components.event_manager),
        }
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    listener: Arc<QueryListener>,
    removed: AtomicBool,
}

impl ListenerRegistration {
    /// Stops the listener. No events are delivered after this returns.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.mute();
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        let listener = Arc::clone(&self.listener);
        self.queue
            .enqueue_and_forget(move || async move { event_manager.unlisten(&listener).await });
    }
}

fn schedule_next(
    queue: AsyncQueue,
    timer_id: TimerId,
    delay: Duration,
    interval: Duration,
    op: RepeatingOp,
    slot: Arc<StdMutex<Option<DelayedOperation>>>,
) {
    let next_queue = queue.clone();
    let next_slot = Arc::clone(&slot);
    let operation = queue.enqueue_after_delay(timer_id, delay, move || async move {
        if let Err(err) = op().await {
            LOGGER.warn(format!("{timer_id:?} task failed: {err}"));
        }
        schedule_next(next_queue, timer_id, interval, interval, op, next_slot);
        Ok(())
    });
    *lock(&slot) = Some(operation);
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::firestore::core::credentials::EmptyCredentialsProvider;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue};

    async fn client(datastore: &InMemoryDatastore) -> Arc<FirestoreClient> {
        FirestoreClient::new(
            DatabaseInfo::new(DatabaseId::default("project"), "test"),
            FirestoreSettings::default(),
            Arc::new(datastore.clone()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        MapValue::new(BTreeMap::from([("x".to_string(), FirestoreValue::from(value))]))
    }

    #[tokio::test]
    async fn write_resolves_on_acknowledgement() {
        let datastore = InMemoryDatastore::new();
        let client = client(&datastore).await;

        client.write(vec![Mutation::set(key("rooms/a"), data(1))]).await.unwrap();
        assert_eq!(datastore.document(&key("rooms/a")).unwrap().data(), &data(1));
        client.wait_for_pending_writes().await.unwrap();
    }

    #[tokio::test]
    async fn cache_reads_see_local_writes() {
        let datastore = InMemoryDatastore::new();
        datastore.set_auto_ack_writes(false);
        let client = client(&datastore).await;

        let write_client = Arc::clone(&client);
        let pending = tokio::spawn(async move { write_client.write(vec![Mutation::set(key("rooms/a"), data(1))]).await });
        datastore.wait_for_pending_writes(1).await.unwrap();

        let read = client.get_document(&key("rooms/a"), Source::Cache).await.unwrap();
        assert!(read.from_cache);
        assert!(read.document.is_found_document());
        assert!(read.document.has_local_mutations());

        let snapshot = client
            .get_documents(&Query::collection("rooms").unwrap(), Source::Cache)
            .await
            .unwrap();
        assert_eq!(snapshot.documents.len(), 1);
        assert!(snapshot.has_pending_writes());

        datastore.ack_next_write().unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_reads_fail_while_offline() {
        let datastore = InMemoryDatastore::new();
        let client = client(&datastore).await;
        client.disable_network().await.unwrap();

        let err = client
            .get_document(&key("rooms/a"), Source::Server)
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn terminated_client_rejects_calls() {
        let datastore = InMemoryDatastore::new();
        let client = client(&datastore).await;
        client.terminate().await.unwrap();

        let err = client.write(vec![Mutation::delete(key("rooms/a"))]).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        client.terminate().await.unwrap();
    }
}
