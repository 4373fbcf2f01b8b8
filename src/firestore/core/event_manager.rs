//! Fans view snapshots out to the listeners of each query.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{DocumentViewChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::util::log::LOGGER;

/// Where a listener reads its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Local results first, then updates from the backend.
    #[default]
    Default,
    /// Local results only. The query is never sent to the backend.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots whose only change is metadata such as
    /// `from_cache` or pending writes.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the backend has answered, unless
    /// the client is offline.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

pub type QueryObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Default)]
struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: Option<OnlineState>,
}

/// One registered listener. Filters the snapshots of its query according to
/// its options before handing them to the observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: QueryObserver,
    muted: AtomicBool,
    state: StdMutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: QueryObserver) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            observer,
            muted: AtomicBool::new(false),
            state: StdMutex::new(QueryListenerState::default()),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn options(&self) -> ListenOptions {
        self.options
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Stops delivering events. Called when the listener is removed.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    fn lock_state(&self) -> MutexGuard<'_, QueryListenerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn deliver(&self, result: FirestoreResult<ViewSnapshot>) {
        if !self.muted.load(Ordering::SeqCst) {
            (self.observer)(result);
        }
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let mut filtered = snapshot;
            filtered
                .changes
                .retain(|change| change.change_type != DocumentViewChangeType::Metadata);
            filtered.exclude_metadata_changes = true;
            filtered
        };

        let event = {
            let mut state = self.lock_state();
            let online_state = state.online_state.unwrap_or(OnlineState::Unknown);
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(state.snapshot.as_ref(), &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };

        match event {
            Some(event) => {
                self.deliver(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        self.deliver(Err(error));
        self.mute();
    }

    /// Returns whether the change released a held back initial event.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = self.lock_state();
            state.online_state = Some(online_state);
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                self.deliver(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth raising when nothing better
        // is coming.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, previous: Option<&ViewSnapshot>, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    let mut event = ViewSnapshot::from_initial_documents(
        &snapshot.query,
        snapshot.documents.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    );
    event.exclude_metadata_changes = snapshot.exclude_metadata_changes;
    event
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

impl QueryListenersInfo {
    fn listens_to_remote_store(&self) -> bool {
        self.listeners.iter().any(|listener| listener.listens_to_remote_store())
    }
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: Option<OnlineState>,
}

/// Registers listeners with the sync engine, one sync engine query per
/// distinct query, and routes its snapshots back to them.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: StdMutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            sync_engine,
            state: StdMutex::new(EventManagerState::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, EventManagerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds `listener`. Errors from the sync engine are reported to the
    /// listener and not returned.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let (first_listen, needs_remote) = {
            let state = self.lock_state();
            match state.queries.get(&canonical_id) {
                None => (true, false),
                Some(info) => (
                    false,
                    listener.listens_to_remote_store() && !info.listens_to_remote_store(),
                ),
            }
        };

        let view_snapshot = if first_listen {
            match self
                .sync_engine
                .listen(listener.query().clone(), listener.listens_to_remote_store())
                .await
            {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    LOGGER.warn(format!(
                        "Initialization of query '{}' failed: {err}",
                        listener.query().canonical_id()
                    ));
                    listener.on_error(err);
                    return Ok(());
                }
            }
        } else {
            if needs_remote {
                self.sync_engine.listen_to_remote_store(listener.query()).await?;
            }
            None
        };

        let (snapshot, online_state) = {
            let mut state = self.lock_state();
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if view_snapshot.is_some() {
                info.view_snapshot = view_snapshot;
            }
            info.listeners.push(listener.clone());
            (info.view_snapshot.clone(), online_state)
        };

        if let Some(online_state) = online_state {
            listener.apply_online_state_change(online_state);
        }
        if let Some(snapshot) = snapshot {
            listener.on_view_snapshot(snapshot);
        }
        Ok(())
    }

    /// Removes `listener`. The query is released once its last listener is
    /// gone.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        listener.mute();
        let canonical_id = listener.query().canonical_id();
        let (last_listen, lost_remote) = {
            let mut state = self.lock_state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let had_remote = info.listens_to_remote_store();
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            let last_listen = info.listeners.is_empty();
            let lost_remote = had_remote && !info.listens_to_remote_store();
            if last_listen {
                state.queries.remove(&canonical_id);
            }
            (last_listen, lost_remote)
        };

        if last_listen {
            self.sync_engine
                .unlisten(listener.query(), listener.listens_to_remote_store())
                .await
        } else if lost_remote {
            self.sync_engine.unlisten_from_remote_store(listener.query()).await
        } else {
            Ok(())
        }
    }

    fn listeners_for(&self, canonical_id: &str) -> Vec<Arc<QueryListener>> {
        self.lock_state()
            .queries
            .get(canonical_id)
            .map(|info| info.listeners.clone())
            .unwrap_or_default()
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let canonical_id = snapshot.query.canonical_id();
            let listeners = {
                let mut state = self.lock_state();
                match state.queries.get_mut(&canonical_id) {
                    Some(info) => {
                        info.view_snapshot = Some(snapshot.clone());
                        info.listeners.clone()
                    }
                    None => continue,
                }
            };
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let canonical_id = query.canonical_id();
        let listeners = self.listeners_for(&canonical_id);
        self.lock_state().queries.remove(&canonical_id);
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.lock_state();
            state.online_state = Some(online_state);
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}
