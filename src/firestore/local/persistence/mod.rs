//! Transactional storage shared by every local cache.
//!
//! All caches read and write one [`PersistenceState`]. A transaction holds the
//! state lock for its whole lifetime and works on a copy-on-write snapshot of
//! the tables: committing swaps the snapshot in, dropping the transaction
//! discards it. Durable backends write everything a commit touched as one
//! journal entry before the swap, so a failed write leaves both disk and
//! memory unchanged.

mod file;
mod memory;

use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use async_lock::MutexGuardArc;
use async_trait::async_trait;

use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::bundle_cache::BundleTable;
use crate::firestore::local::document_overlay_cache::OverlayTable;
use crate::firestore::local::index_manager::IndexTable;
use crate::firestore::local::mutation_queue::MutationTable;
use crate::firestore::local::reference_delegate::ReferenceDelegate;
use crate::firestore::local::remote_document_cache::DocumentTable;
use crate::firestore::local::target_cache::TargetTable;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::util::log::LOGGER;

use file::WriteLock;

pub use file::{FilePersistence, LEASE_REFRESH_INTERVAL, LEASE_TIMEOUT};
pub use memory::MemoryPersistence;

/// Version of the on-disk layout written by [`FilePersistence`].
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Fails with a primary-lease-lost error unless this instance holds the
    /// primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

/// Called with the new primary state whenever it changes.
pub type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub(crate) struct PersistenceState {
    pub(crate) documents: Arc<DocumentTable>,
    pub(crate) mutations: Arc<MutationTable>,
    pub(crate) overlays: Arc<OverlayTable>,
    pub(crate) targets: Arc<TargetTable>,
    pub(crate) bundles: Arc<BundleTable>,
    pub(crate) indexes: Arc<IndexTable>,
    /// Bumped by every durable commit so other instances can detect writes.
    pub(crate) generation: u64,
}

/// Tables a transaction replaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DirtyTables {
    pub(crate) documents: bool,
    pub(crate) mutations: bool,
    pub(crate) overlays: bool,
    pub(crate) targets: bool,
    pub(crate) bundles: bool,
    pub(crate) indexes: bool,
}

impl DirtyTables {
    pub(crate) fn any(&self) -> bool {
        self.documents
            || self.mutations
            || self.overlays
            || self.targets
            || self.bundles
            || self.indexes
    }
}

pub struct PersistenceTransaction {
    label: String,
    mode: TransactionMode,
    guard: MutexGuardArc<PersistenceState>,
    working: PersistenceState,
    delegate: Arc<dyn ReferenceDelegate>,
    sequence_number: Option<ListenSequenceNumber>,
    /// Documents whose references changed in this transaction.
    touched_documents: BTreeSet<DocumentKey>,
    /// Cached documents written or removed in this transaction.
    changed_documents: BTreeSet<DocumentKey>,
    /// Held by durable write transactions until they commit or roll back.
    write_lock: Option<WriteLock>,
}

impl PersistenceTransaction {
    pub(crate) fn new(
        label: &str,
        mode: TransactionMode,
        guard: MutexGuardArc<PersistenceState>,
        delegate: Arc<dyn ReferenceDelegate>,
    ) -> Self {
        let working = (*guard).clone();
        Self {
            label: label.to_string(),
            mode,
            guard,
            working,
            delegate,
            sequence_number: None,
            touched_documents: BTreeSet::new(),
            changed_documents: BTreeSet::new(),
            write_lock: None,
        }
    }

    pub(crate) fn with_write_lock(mut self, lock: WriteLock) -> Self {
        self.write_lock = Some(lock);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Sequence number stamped on everything this transaction references.
    /// Allocated on first use.
    pub fn current_sequence_number(&mut self) -> ListenSequenceNumber {
        if let Some(sequence_number) = self.sequence_number {
            return sequence_number;
        }
        let next = self.working.targets.highest_listen_sequence_number + 1;
        self.targets_mut().highest_listen_sequence_number = next;
        self.sequence_number = Some(next);
        next
    }

    pub(crate) fn documents(&self) -> &DocumentTable {
        &self.working.documents
    }

    pub(crate) fn put_document(&mut self, document: MutableDocument) {
        self.changed_documents.insert(document.key().clone());
        Arc::make_mut(&mut self.working.documents)
            .entries
            .insert(document.key().clone(), document);
    }

    pub(crate) fn remove_document(&mut self, key: &DocumentKey) {
        if self.working.documents.entries.contains_key(key) {
            self.changed_documents.insert(key.clone());
            Arc::make_mut(&mut self.working.documents).entries.remove(key);
        }
    }

    pub(crate) fn changed_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.changed_documents
    }

    pub(crate) fn mutations(&self) -> &MutationTable {
        &self.working.mutations
    }

    pub(crate) fn mutations_mut(&mut self) -> &mut MutationTable {
        Arc::make_mut(&mut self.working.mutations)
    }

    pub(crate) fn overlays(&self) -> &OverlayTable {
        &self.working.overlays
    }

    pub(crate) fn overlays_mut(&mut self) -> &mut OverlayTable {
        Arc::make_mut(&mut self.working.overlays)
    }

    pub(crate) fn targets(&self) -> &TargetTable {
        &self.working.targets
    }

    pub(crate) fn targets_mut(&mut self) -> &mut TargetTable {
        Arc::make_mut(&mut self.working.targets)
    }

    pub(crate) fn bundles(&self) -> &BundleTable {
        &self.working.bundles
    }

    pub(crate) fn bundles_mut(&mut self) -> &mut BundleTable {
        Arc::make_mut(&mut self.working.bundles)
    }

    pub(crate) fn indexes(&self) -> &IndexTable {
        &self.working.indexes
    }

    pub(crate) fn indexes_mut(&mut self) -> &mut IndexTable {
        Arc::make_mut(&mut self.working.indexes)
    }

    pub(crate) fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.delegate.clone()
    }

    pub(crate) fn add_reference(&mut self, target_id: TargetId, key: &DocumentKey) {
        let delegate = self.delegate.clone();
        delegate.add_reference(self, target_id, key);
    }

    pub(crate) fn remove_reference(&mut self, target_id: TargetId, key: &DocumentKey) {
        let delegate = self.delegate.clone();
        delegate.remove_reference(self, target_id, key);
    }

    pub(crate) fn mark_potentially_orphaned(&mut self, key: &DocumentKey) {
        let delegate = self.delegate.clone();
        delegate.mark_potentially_orphaned(self, key);
    }

    pub(crate) fn touch_document(&mut self, key: &DocumentKey) {
        self.touched_documents.insert(key.clone());
    }

    pub(crate) fn take_touched_documents(&mut self) -> BTreeSet<DocumentKey> {
        std::mem::take(&mut self.touched_documents)
    }

    pub(crate) fn dirty_tables(&self) -> DirtyTables {
        let committed = &*self.guard;
        DirtyTables {
            documents: !Arc::ptr_eq(&committed.documents, &self.working.documents),
            mutations: !Arc::ptr_eq(&committed.mutations, &self.working.mutations),
            overlays: !Arc::ptr_eq(&committed.overlays, &self.working.overlays),
            targets: !Arc::ptr_eq(&committed.targets, &self.working.targets),
            bundles: !Arc::ptr_eq(&committed.bundles, &self.working.bundles),
            indexes: !Arc::ptr_eq(&committed.indexes, &self.working.indexes),
        }
    }

    pub(crate) fn working_state(&self) -> &PersistenceState {
        &self.working
    }

    /// Publishes the working tables.
    pub(crate) fn apply(mut self, generation: u64) {
        self.working.generation = generation;
        *self.guard = self.working;
    }
}

impl Debug for PersistenceTransaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceTransaction")
            .field("label", &self.label)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Storage backend behind the local caches. Volatile and durable
/// implementations are interchangeable.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    fn is_durable(&self) -> bool;

    fn is_started(&self) -> bool;

    /// Whether this instance owns the primary lease and may run the network
    /// streams. Volatile storage is always primary.
    fn is_primary(&self) -> bool;

    fn set_primary_state_listener(&self, listener: PrimaryStateListener);

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate>;

    async fn start(&self) -> FirestoreResult<()>;

    async fn shutdown(&self) -> FirestoreResult<()>;

    /// Renews the primary lease, or tries to take it over. Returns the new
    /// primary state.
    async fn refresh_primary_lease(&self) -> FirestoreResult<bool>;

    async fn begin(
        &self,
        label: &str,
        mode: TransactionMode,
    ) -> FirestoreResult<PersistenceTransaction>;

    async fn commit(&self, transaction: PersistenceTransaction) -> FirestoreResult<()>;
}

pub type PersistenceArc = Arc<dyn Persistence>;

/// Runs `body` in a transaction. The transaction commits when `body` returns
/// `Ok` and is rolled back otherwise.
pub async fn run_transaction<T, F>(
    persistence: &dyn Persistence,
    label: &str,
    mode: TransactionMode,
    body: F,
) -> FirestoreResult<T>
where
    F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T> + Send,
    T: Send,
{
    let mut transaction = persistence.begin(label, mode).await?;
    let value = match body(&mut transaction) {
        Ok(value) => value,
        Err(err) => {
            LOGGER.debug(format!("Transaction '{label}' failed: {err}"));
            return Err(err);
        }
    };
    if mode.is_write() {
        let delegate = transaction.reference_delegate();
        delegate.on_transaction_committed(&mut transaction)?;
    }
    persistence.commit(transaction).await?;
    Ok(value)
}
