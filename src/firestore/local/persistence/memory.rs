use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{
    Persistence, PersistenceState, PersistenceTransaction, PrimaryStateListener, TransactionMode,
};
use crate::firestore::local::reference_delegate::{
    EagerReferenceDelegate, LruParams, LruReferenceDelegate, ReferenceDelegate,
};

/// Volatile persistence. Everything is lost when the instance is dropped.
pub struct MemoryPersistence {
    state: Arc<Mutex<PersistenceState>>,
    delegate: Arc<dyn ReferenceDelegate>,
    started: AtomicBool,
}

impl MemoryPersistence {
    /// Memory persistence that drops documents as soon as nothing references
    /// them.
    pub fn with_eager_gc() -> Self {
        Self::with_delegate(Arc::new(EagerReferenceDelegate::new()))
    }

    /// Memory persistence that keeps unreferenced documents until the cache
    /// grows past `params`.
    pub fn with_lru_gc(params: LruParams) -> Self {
        Self::with_delegate(Arc::new(LruReferenceDelegate::new(params)))
    }

    fn with_delegate(delegate: Arc<dyn ReferenceDelegate>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PersistenceState::default())),
            delegate,
            started: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::with_eager_gc()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn is_durable(&self) -> bool {
        false
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_primary(&self) -> bool {
        true
    }

    fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        listener(true);
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.delegate.clone()
    }

    async fn start(&self) -> FirestoreResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_primary_lease(&self) -> FirestoreResult<bool> {
        Ok(true)
    }

    async fn begin(
        &self,
        label: &str,
        mode: TransactionMode,
    ) -> FirestoreResult<PersistenceTransaction> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Cannot run transaction '{label}' on persistence that is not started"
            )));
        }
        let guard = self.state.lock_arc().await;
        Ok(PersistenceTransaction::new(
            label,
            mode,
            guard,
            self.delegate.clone(),
        ))
    }

    async fn commit(&self, transaction: PersistenceTransaction) -> FirestoreResult<()> {
        if !transaction.mode().is_write() {
            return Ok(());
        }
        let generation = transaction.working_state().generation;
        transaction.apply(generation);
        Ok(())
    }
}
