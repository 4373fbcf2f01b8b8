use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_lock::Mutex;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{
    aborted, data_loss, failed_precondition, internal_error, primary_lease_lost, unavailable,
    FirestoreResult,
};
use crate::firestore::local::bundle_cache::BundleTable;
use crate::firestore::local::document_overlay_cache::OverlayTable;
use crate::firestore::local::index_manager::IndexTable;
use crate::firestore::local::mutation_queue::MutationTable;
use crate::firestore::local::persistence::{
    Persistence, PersistenceState, PersistenceTransaction, PrimaryStateListener,
    TransactionMode, SCHEMA_VERSION,
};
use crate::firestore::local::reference_delegate::{
    LruParams, LruReferenceDelegate, ReferenceDelegate,
};
use crate::firestore::local::remote_document_cache::DocumentTable;
use crate::firestore::local::target_cache::TargetTable;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::util::log::LOGGER;
use crate::platform::runtime;

/// Age after which another instance may take over the primary lease.
pub const LEASE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the owner renews its lease.
pub const LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// Journal entries written since the last snapshot before the committing
/// instance folds them into a new snapshot.
const COMPACTION_THRESHOLD: u64 = 64;
/// A write lock older than this belongs to an instance that died mid-commit.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

const METADATA_FILE: &str = "metadata.json";
const OWNER_FILE: &str = "owner.json";
const LOCK_FILE: &str = "write.lock";
const SNAPSHOT_FILE: &str = "snapshot.json";
const JOURNAL_DIR: &str = "journal";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MetadataRecord {
    schema_version: u32,
    /// Generation folded into `snapshot.json`. Journal entries up to it may
    /// already be deleted.
    snapshot_generation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct OwnerRecord {
    owner_id: String,
    heartbeat_millis: i64,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    generation: u64,
    documents: &'a DocumentTable,
    mutations: &'a MutationTable,
    overlays: &'a OverlayTable,
    targets: &'a TargetTable,
    bundles: &'a BundleTable,
    indexes: &'a IndexTable,
}

#[derive(Deserialize)]
struct SnapshotRecord {
    generation: u64,
    documents: DocumentTable,
    mutations: MutationTable,
    overlays: OverlayTable,
    targets: TargetTable,
    bundles: BundleTable,
    indexes: IndexTable,
}

impl From<SnapshotRecord> for PersistenceState {
    fn from(record: SnapshotRecord) -> Self {
        PersistenceState {
            documents: Arc::new(record.documents),
            mutations: Arc::new(record.mutations),
            overlays: Arc::new(record.overlays),
            targets: Arc::new(record.targets),
            bundles: Arc::new(record.bundles),
            indexes: Arc::new(record.indexes),
            generation: record.generation,
        }
    }
}

/// One commit. Cached documents are stored per key, `None` marking a
/// removal; the smaller tables are stored whole when the commit replaced
/// them.
#[derive(Serialize)]
struct JournalEntryRef<'a> {
    generation: u64,
    documents: Vec<(&'a DocumentKey, Option<&'a MutableDocument>)>,
    mutations: Option<&'a MutationTable>,
    overlays: Option<&'a OverlayTable>,
    targets: Option<&'a TargetTable>,
    bundles: Option<&'a BundleTable>,
    indexes: Option<&'a IndexTable>,
}

#[derive(Deserialize)]
struct JournalEntry {
    generation: u64,
    documents: Vec<(DocumentKey, Option<MutableDocument>)>,
    mutations: Option<MutationTable>,
    overlays: Option<OverlayTable>,
    targets: Option<TargetTable>,
    bundles: Option<BundleTable>,
    indexes: Option<IndexTable>,
}

impl JournalEntry {
    fn apply_to(self, state: &mut PersistenceState) {
        if !self.documents.is_empty() {
            let table = Arc::make_mut(&mut state.documents);
            for (key, document) in self.documents {
                match document {
                    Some(document) => {
                        table.entries.insert(key, document);
                    }
                    None => {
                        table.entries.remove(&key);
                    }
                }
            }
        }
        if let Some(mutations) = self.mutations {
            state.mutations = Arc::new(mutations);
        }
        if let Some(overlays) = self.overlays {
            state.overlays = Arc::new(overlays);
        }
        if let Some(targets) = self.targets {
            state.targets = Arc::new(targets);
        }
        if let Some(bundles) = self.bundles {
            state.bundles = Arc::new(bundles);
        }
        if let Some(indexes) = self.indexes {
            state.indexes = Arc::new(indexes);
        }
        state.generation = self.generation;
    }
}

/// Exclusive lock on the storage directory. A write transaction holds it from
/// `begin` until it commits or rolls back, so instances sharing a directory
/// commit one after another. Released on drop.
pub(crate) struct WriteLock {
    path: PathBuf,
    token: String,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(holder) if holder == self.token => {
                if let Err(err) = fs::remove_file(&self.path) {
                    LOGGER.warn(format!("Failed to release storage write lock: {err}"));
                }
            }
            _ => {}
        }
    }
}

/// Durable persistence in a directory: a snapshot of every table plus a
/// journal with one file per commit.
///
/// Several instances may open the same directory. Only the holder of the
/// lease in `owner.json` is primary; the others keep serving reads and local
/// writes. Write transactions serialize on `write.lock` and replay the
/// journal entries other instances wrote before they start.
pub struct FilePersistence {
    directory: PathBuf,
    owner_id: String,
    force_ownership: AtomicBool,
    state: Arc<Mutex<PersistenceState>>,
    delegate: Arc<dyn ReferenceDelegate>,
    started: AtomicBool,
    primary: AtomicBool,
    snapshot_generation: AtomicU64,
    listener: StdMutex<Option<PrimaryStateListener>>,
}

impl FilePersistence {
    pub fn new(directory: impl Into<PathBuf>, force_ownership: bool, lru_params: LruParams) -> Self {
        Self {
            directory: directory.into(),
            owner_id: format!("{:016x}", rand::random::<u64>()),
            force_ownership: AtomicBool::new(force_ownership),
            state: Arc::new(Mutex::new(PersistenceState::default())),
            delegate: Arc::new(LruReferenceDelegate::new(lru_params)),
            started: AtomicBool::new(false),
            primary: AtomicBool::new(false),
            snapshot_generation: AtomicU64::new(0),
            listener: StdMutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }

    async fn acquire_write_lock(&self) -> FirestoreResult<WriteLock> {
        let deadline = Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            let path = self.path(LOCK_FILE);
            let token = format!("{}:{:016x}", self.owner_id, rand::random::<u64>());
            if let Some(lock) = blocking(move || try_lock(&path, token)).await? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(unavailable(format!(
                    "Timed out waiting for the write lock on {}",
                    self.directory.display()
                )));
            }
            runtime::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Folds everything up to `generation` into a new snapshot. Failures only
    /// leave the journal longer.
    async fn compact(&self, state: PersistenceState, generation: u64) {
        let directory = self.directory.clone();
        match blocking(move || write_snapshot(&directory, &state, generation)).await {
            Ok(()) => {
                LOGGER.debug(format!("Compacted storage journal at generation {generation}"));
                self.snapshot_generation.store(generation, Ordering::SeqCst);
            }
            Err(err) => LOGGER.warn(format!("Failed to compact storage journal: {err}")),
        }
    }

    async fn lease_is_ours(&self) -> FirestoreResult<bool> {
        let path = self.path(OWNER_FILE);
        let owner_id = self.owner_id.clone();
        blocking(move || Ok(lease_available(&path, &owner_id, now_millis()))).await
    }

    async fn try_acquire_lease(&self) -> FirestoreResult<bool> {
        let _lock = self.acquire_write_lock().await?;
        let force = self.force_ownership.swap(false, Ordering::SeqCst);
        let path = self.path(OWNER_FILE);
        let owner_id = self.owner_id.clone();
        let acquired = blocking(move || {
            let now = now_millis();
            let acquired = force || lease_available(&path, &owner_id, now);
            if acquired {
                write_record(
                    &path,
                    &OwnerRecord {
                        owner_id,
                        heartbeat_millis: now,
                    },
                )?;
            }
            Ok(acquired)
        })
        .await?;
        self.set_primary(acquired);
        Ok(acquired)
    }

    async fn release_lease(&self) {
        let path = self.path(OWNER_FILE);
        let owner_id = self.owner_id.clone();
        let released = blocking(move || {
            match read_owner(&path) {
                Some(owner) if owner.owner_id == owner_id => fs::remove_file(&path)
                    .map_err(|err| unavailable(format!("failed to remove lease file: {err}"))),
                _ => Ok(()),
            }
        })
        .await;
        if let Err(err) = released {
            LOGGER.warn(format!("Failed to release primary lease: {err}"));
        }
        self.set_primary(false);
    }

    fn set_primary(&self, primary: bool) {
        let previous = self.primary.swap(primary, Ordering::SeqCst);
        if previous == primary {
            return;
        }
        LOGGER.debug(format!(
            "Instance {} is {} primary",
            self.owner_id,
            if primary { "now" } else { "no longer" }
        ));
        let listener = match self.listener.lock() {
            Ok(listener) => listener.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(listener) = listener {
            listener(primary);
        }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    fn is_durable(&self) -> bool {
        true
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        {
            let mut slot = match self.listener.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(listener.clone());
        }
        listener(self.is_primary());
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.delegate.clone()
    }

    async fn start(&self) -> FirestoreResult<()> {
        let journal = self.path(JOURNAL_DIR);
        blocking(move || {
            fs::create_dir_all(&journal).map_err(|err| {
                unavailable(format!(
                    "failed to create persistence directory {}: {err}",
                    journal.display()
                ))
            })
        })
        .await?;

        let lock = self.acquire_write_lock().await?;
        let directory = self.directory.clone();
        let (state, snapshot_generation) = blocking(move || load(&directory)).await?;
        drop(lock);

        LOGGER.debug(format!(
            "Opened {} at generation {}",
            self.directory.display(),
            state.generation
        ));
        *self.state.lock().await = state;
        self.snapshot_generation
            .store(snapshot_generation, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        self.try_acquire_lease().await?;
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.release_lease().await;
        Ok(())
    }

    async fn refresh_primary_lease(&self) -> FirestoreResult<bool> {
        if !self.is_started() {
            return Ok(false);
        }
        self.try_acquire_lease().await
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
        if mode == TransactionMode::ReadWritePrimary
            && !(self.is_primary() && self.lease_is_ours().await?)
        {
            self.set_primary(false);
            return Err(primary_lease_lost());
        }

        let mut guard = self.state.lock_arc().await;
        let write_lock = if mode.is_write() {
            Some(self.acquire_write_lock().await?)
        } else {
            None
        };

        let directory = self.directory.clone();
        let current = (*guard).clone();
        let (refreshed, snapshot_generation) =
            blocking(move || catch_up(&directory, current)).await?;
        if refreshed.generation != guard.generation {
            LOGGER.debug(format!(
                "Caught up with persisted state at generation {} (had {})",
                refreshed.generation, guard.generation
            ));
        }
        *guard = refreshed;
        self.snapshot_generation
            .fetch_max(snapshot_generation, Ordering::SeqCst);

        let transaction = PersistenceTransaction::new(label, mode, guard, self.delegate.clone());
        Ok(match write_lock {
            Some(lock) => transaction.with_write_lock(lock),
            None => transaction,
        })
    }

    async fn commit(&self, transaction: PersistenceTransaction) -> FirestoreResult<()> {
        if !transaction.mode().is_write() || !transaction.dirty_tables().any() {
            return Ok(());
        }
        let generation = transaction.working_state().generation + 1;
        let bytes = encode_journal_entry(&transaction, generation)?;
        let path = journal_path(&self.directory, generation);
        blocking(move || write_journal_entry(&path, &bytes))
            .await
            .map_err(|err| err.with_context(format!("commit of '{}'", transaction.label())))?;

        if generation - self.snapshot_generation.load(Ordering::SeqCst) >= COMPACTION_THRESHOLD {
            self.compact(transaction.working_state().clone(), generation)
                .await;
        }
        transaction.apply(generation);
        Ok(())
    }
}

async fn blocking<T, F>(work: F) -> FirestoreResult<T>
where
    F: FnOnce() -> FirestoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    runtime::run_blocking(work)
        .await
        .map_err(|err| internal_error(format!("storage task failed: {err}")))?
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn journal_path(directory: &Path, generation: u64) -> PathBuf {
    directory
        .join(JOURNAL_DIR)
        .join(format!("{generation:020}.json"))
}

fn try_lock(path: &Path, token: String) -> FirestoreResult<Option<WriteLock>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            if let Err(err) = file.write_all(token.as_bytes()) {
                let _ = fs::remove_file(path);
                return Err(unavailable(format!("failed to write lock file: {err}")));
            }
            Ok(Some(WriteLock {
                path: path.to_path_buf(),
                token,
            }))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let stale = fs::metadata(path)
                .and_then(|metadata| metadata.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map_or(false, |age| age > LOCK_STALE_AFTER);
            if stale {
                LOGGER.warn(format!("Breaking stale write lock {}", path.display()));
                let _ = fs::remove_file(path);
            }
            Ok(None)
        }
        Err(err) => Err(unavailable(format!(
            "failed to create lock file {}: {err}",
            path.display()
        ))),
    }
}

fn read_owner(path: &Path) -> Option<OwnerRecord> {
    match read_record::<OwnerRecord>(path) {
        Ok(owner) => owner,
        Err(err) => {
            LOGGER.warn(format!("Ignoring unreadable lease file: {err}"));
            None
        }
    }
}

fn lease_available(path: &Path, owner_id: &str, now_millis: i64) -> bool {
    match read_owner(path) {
        Some(owner) if owner.owner_id == owner_id => true,
        Some(owner) => now_millis - owner.heartbeat_millis > LEASE_TIMEOUT.as_millis() as i64,
        None => true,
    }
}

/// Reads the persisted state, creating the metadata of a new directory.
fn load(directory: &Path) -> FirestoreResult<(PersistenceState, u64)> {
    let metadata_path = directory.join(METADATA_FILE);
    match read_record::<MetadataRecord>(&metadata_path)? {
        Some(metadata) if metadata.schema_version > SCHEMA_VERSION => {
            return Err(failed_precondition(format!(
                "persisted data uses schema version {} but this client supports up to {}",
                metadata.schema_version, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
        None => write_record(
            &metadata_path,
            &MetadataRecord {
                schema_version: SCHEMA_VERSION,
                snapshot_generation: 0,
            },
        )?,
    }
    catch_up(directory, PersistenceState::default())
}

/// Replays the journal entries written after `state`. Reloads the snapshot
/// when compaction already deleted the next entry. Returns the new state and
/// the snapshot generation recorded on disk.
fn catch_up(directory: &Path, mut state: PersistenceState) -> FirestoreResult<(PersistenceState, u64)> {
    loop {
        let next = state.generation + 1;
        if let Some(entry) = read_record::<JournalEntry>(&journal_path(directory, next))? {
            if entry.generation != next {
                return Err(data_loss(format!(
                    "journal entry {next} records generation {}",
                    entry.generation
                )));
            }
            entry.apply_to(&mut state);
            continue;
        }
        let snapshot_generation = read_record::<MetadataRecord>(&directory.join(METADATA_FILE))?
            .map_or(0, |metadata| metadata.snapshot_generation);
        if snapshot_generation <= state.generation {
            return Ok((state, snapshot_generation));
        }
        let snapshot = read_record::<SnapshotRecord>(&directory.join(SNAPSHOT_FILE))?
            .ok_or_else(|| data_loss("storage snapshot is missing"))?;
        if snapshot.generation <= state.generation {
            return Err(data_loss(format!(
                "storage snapshot at generation {} is older than the metadata claims ({snapshot_generation})",
                snapshot.generation
            )));
        }
        state = snapshot.into();
    }
}

fn encode_journal_entry(transaction: &PersistenceTransaction, generation: u64) -> FirestoreResult<Vec<u8>> {
    let dirty = transaction.dirty_tables();
    let state = transaction.working_state();
    let entry = JournalEntryRef {
        generation,
        documents: transaction
            .changed_documents()
            .iter()
            .map(|key| (key, state.documents.entries.get(key)))
            .collect(),
        mutations: dirty.mutations.then(|| &*state.mutations),
        overlays: dirty.overlays.then(|| &*state.overlays),
        targets: dirty.targets.then(|| &*state.targets),
        bundles: dirty.bundles.then(|| &*state.bundles),
        indexes: dirty.indexes.then(|| &*state.indexes),
    };
    serde_json::to_vec(&entry)
        .map_err(|err| internal_error(format!("failed to encode journal entry: {err}")))
}

/// Publishes one journal entry. The rename is the commit point.
fn write_journal_entry(path: &Path, bytes: &[u8]) -> FirestoreResult<()> {
    if path.exists() {
        return Err(aborted(format!(
            "{} was already committed by another instance",
            path.display()
        )));
    }
    write_atomically(path, bytes)
}

fn write_snapshot(directory: &Path, state: &PersistenceState, generation: u64) -> FirestoreResult<()> {
    let snapshot = SnapshotRef {
        generation,
        documents: &state.documents,
        mutations: &state.mutations,
        overlays: &state.overlays,
        targets: &state.targets,
        bundles: &state.bundles,
        indexes: &state.indexes,
    };
    let bytes = serde_json::to_vec(&snapshot)
        .map_err(|err| internal_error(format!("failed to encode storage snapshot: {err}")))?;
    write_atomically(&directory.join(SNAPSHOT_FILE), &bytes)?;
    write_record(
        &directory.join(METADATA_FILE),
        &MetadataRecord {
            schema_version: SCHEMA_VERSION,
            snapshot_generation: generation,
        },
    )?;

    let entries = fs::read_dir(directory.join(JOURNAL_DIR))
        .map_err(|err| unavailable(format!("failed to list storage journal: {err}")))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let folded = name
            .to_str()
            .and_then(|name| name.strip_suffix(".json"))
            .and_then(|stem| stem.parse::<u64>().ok())
            .map_or(false, |entry_generation| entry_generation <= generation);
        if folded {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> FirestoreResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(unavailable(format!(
                "failed to read storage file {}: {err}",
                path.display()
            )))
        }
    };
    let record = serde_json::from_slice(&bytes).map_err(|err| {
        data_loss(format!("failed to parse storage file {}: {err}", path.display()))
    })?;
    Ok(Some(record))
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> FirestoreResult<()> {
    let bytes = serde_json::to_vec(record)
        .map_err(|err| internal_error(format!("failed to encode storage record: {err}")))?;
    write_atomically(path, &bytes)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> FirestoreResult<()> {
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, bytes).map_err(|err| {
        unavailable(format!("failed to write storage file {}: {err}", path.display()))
    })?;
    fs::rename(&staging, path).map_err(|err| {
        unavailable(format!("failed to replace storage file {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use crate::firestore::core::credentials::User;
    use crate::firestore::core::types::BatchId;
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::run_transaction;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::local::target_cache::TargetCache;
    use crate::firestore::model::{Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str) -> Mutation {
        Mutation::set(key(path), MapValue::empty())
    }

    async fn open(directory: &Path) -> FilePersistence {
        let persistence = FilePersistence::new(directory, false, LruParams::default());
        persistence.start().await.unwrap();
        persistence
    }

    async fn write_version(persistence: &FilePersistence, seconds: i64) {
        run_transaction(persistence, "write", TransactionMode::ReadWrite, |txn| {
            TargetCache.set_last_remote_snapshot_version(txn, SnapshotVersion::from_seconds(seconds));
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn read_version(persistence: &FilePersistence) -> SnapshotVersion {
        run_transaction(persistence, "read", TransactionMode::ReadOnly, |txn| {
            Ok(TargetCache.last_remote_snapshot_version(txn))
        })
        .await
        .unwrap()
    }

    async fn queued_batches(persistence: &FilePersistence) -> Vec<Vec<DocumentKey>> {
        let queue = MutationQueue::new(&User::unauthenticated());
        run_transaction(persistence, "read batches", TransactionMode::ReadOnly, |txn| {
            Ok(queue
                .get_all_mutation_batches(txn)
                .iter()
                .map(|batch| batch.keys().into_iter().collect())
                .collect())
        })
        .await
        .unwrap()
    }

    async fn add_batch(persistence: &FilePersistence, path: &str) -> BatchId {
        let queue = MutationQueue::new(&User::unauthenticated());
        run_transaction(persistence, "add batch", TransactionMode::ReadWrite, |txn| {
            queue.start(txn);
            let batch = queue.add_mutation_batch(txn, Timestamp::now(), Vec::new(), vec![set(path)])?;
            Ok(batch.batch_id())
        })
        .await
        .unwrap()
    }

    fn journal_len(directory: &Path) -> usize {
        fs::read_dir(directory.join(JOURNAL_DIR))
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".json"))
            .count()
    }

    #[tokio::test]
    async fn commits_survive_restart() {
        let dir = tempdir().unwrap();
        let first = open(dir.path()).await;
        assert!(first.is_primary());
        run_transaction(&first, "write", TransactionMode::ReadWritePrimary, |txn| {
            TargetCache.set_last_remote_snapshot_version(txn, SnapshotVersion::from_seconds(42));
            Ok(())
        })
        .await
        .unwrap();
        first.shutdown().await.unwrap();

        let second = open(dir.path()).await;
        assert_eq!(read_version(&second).await, SnapshotVersion::from_seconds(42));
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_instance_is_secondary_and_sees_commits() {
        let dir = tempdir().unwrap();
        let primary = open(dir.path()).await;
        let secondary = open(dir.path()).await;

        assert!(primary.is_primary());
        assert!(!secondary.is_primary());

        let err = secondary
            .begin("primary only", TransactionMode::ReadWritePrimary)
            .await
            .unwrap_err();
        assert!(crate::firestore::error::is_primary_lease_lost(&err));

        write_version(&primary, 3).await;
        assert_eq!(read_version(&secondary).await, SnapshotVersion::from_seconds(3));

        primary.shutdown().await.unwrap();
        assert!(secondary.refresh_primary_lease().await.unwrap());
        secondary.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_instances_keep_every_batch() {
        let dir = tempdir().unwrap();
        let first = open(dir.path()).await;
        let second = open(dir.path()).await;

        let (a, b) = tokio::join!(add_batch(&first, "rooms/a"), add_batch(&second, "rooms/b"));
        assert_ne!(a, b);
        let mut ids = vec![a, b];
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
        let reopened = open(dir.path()).await;
        let mut batches = queued_batches(&reopened).await;
        batches.sort();
        assert_eq!(batches, vec![vec![key("rooms/a")], vec![key("rooms/b")]]);
    }

    #[tokio::test]
    async fn failed_commit_leaves_disk_and_memory_unchanged() {
        let dir = tempdir().unwrap();
        let persistence = open(dir.path()).await;

        // A directory in place of the staging file makes the journal write fail.
        let staging = journal_path(dir.path(), 1).with_extension("json.tmp");
        fs::create_dir_all(&staging).unwrap();

        let user = User::unauthenticated();
        let queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let result = run_transaction(&persistence, "local write", TransactionMode::ReadWrite, |txn| {
            queue.start(txn);
            let batch = queue.add_mutation_batch(txn, Timestamp::now(), Vec::new(), vec![set("rooms/a")])?;
            overlays.save_overlays(txn, batch.batch_id(), &BTreeMap::from([(key("rooms/a"), set("rooms/a"))]));
            Ok(())
        })
        .await;
        assert!(result.is_err());
        assert!(queued_batches(&persistence).await.is_empty());

        persistence.shutdown().await.unwrap();
        fs::remove_dir_all(&staging).unwrap();
        let reopened = open(dir.path()).await;
        assert!(queued_batches(&reopened).await.is_empty());
        let overlay = run_transaction(&reopened, "read overlay", TransactionMode::ReadOnly, |txn| {
            Ok(overlays.get_overlay(txn, &key("rooms/a")))
        })
        .await
        .unwrap();
        assert!(overlay.is_none());
    }

    #[tokio::test]
    async fn commit_records_only_changed_documents() {
        let dir = tempdir().unwrap();
        let persistence = open(dir.path()).await;
        let version = SnapshotVersion::from_seconds(1);
        run_transaction(&persistence, "seed", TransactionMode::ReadWrite, |txn| {
            for path in ["rooms/a", "rooms/b", "rooms/c"] {
                let document = MutableDocument::new_found_document(key(path), version, MapValue::empty());
                RemoteDocumentCache.add_entry(txn, &document, version)?;
            }
            Ok(())
        })
        .await
        .unwrap();
        run_transaction(&persistence, "remove", TransactionMode::ReadWrite, |txn| {
            RemoteDocumentCache.remove_entry(txn, &key("rooms/b"));
            Ok(())
        })
        .await
        .unwrap();

        let entry: serde_json::Value =
            serde_json::from_slice(&fs::read(journal_path(dir.path(), 2)).unwrap()).unwrap();
        let documents = entry["documents"].as_array().unwrap();
        assert_eq!(documents.len(), 1);
        assert!(documents[0][1].is_null());

        persistence.shutdown().await.unwrap();
        let reopened = open(dir.path()).await;
        let keys = run_transaction(&reopened, "read", TransactionMode::ReadOnly, |txn| {
            Ok(txn.documents().entries.keys().cloned().collect::<Vec<_>>())
        })
        .await
        .unwrap();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/c")]);
    }

    #[tokio::test]
    async fn journal_is_folded_into_a_snapshot() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path()).await;
        let reader = open(dir.path()).await;
        assert_eq!(read_version(&reader).await, SnapshotVersion::min());

        for seconds in 1..=(COMPACTION_THRESHOLD as i64 + 2) {
            write_version(&writer, seconds).await;
        }
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        assert!(journal_len(dir.path()) < 4);

        // The reader's next entry is gone; it restarts from the snapshot.
        let latest = SnapshotVersion::from_seconds(COMPACTION_THRESHOLD as i64 + 2);
        assert_eq!(read_version(&reader).await, latest);

        writer.shutdown().await.unwrap();
        reader.shutdown().await.unwrap();
        assert_eq!(read_version(&open(dir.path()).await).await, latest);
    }

    #[tokio::test]
    async fn corrupted_journal_entry_fails_start() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(JOURNAL_DIR)).unwrap();
        fs::write(
            dir.path().join(METADATA_FILE),
            br#"{"schema_version":1,"snapshot_generation":0}"#,
        )
        .unwrap();
        fs::write(journal_path(dir.path(), 1), b"{not json").unwrap();

        let persistence = FilePersistence::new(dir.path(), false, LruParams::default());
        let err = persistence.start().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(METADATA_FILE),
            br#"{"schema_version":99,"snapshot_generation":0}"#,
        )
        .unwrap();
        let persistence = FilePersistence::new(dir.path(), false, LruParams::default());
        let err = persistence.start().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }
}
