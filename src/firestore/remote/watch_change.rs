use crate::firestore::core::types::TargetId;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilterPayload;

/// One message received on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Consistent snapshot version carried by a global no-change message.
    /// Every other message reports the minimum version.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change)
                if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
            {
                change.read_time
            }
            _ => SnapshotVersion::min(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means every target currently being listened to.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    /// Set when the backend rejected the targets.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Global consistency point: no target changes, just a read time.
    pub fn global_snapshot(read_time: SnapshotVersion) -> Self {
        Self::new(TargetChangeState::NoChange, Vec::new()).with_read_time(read_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document that now matches `updated_target_ids` and no longer matches
/// `removed_target_ids`.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: MutableDocument,
}

/// The document was deleted at `read_time`.
#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document left the targets without the backend saying why.
#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilter {
    pub count: usize,
    /// Bloom filter over the names of the documents the backend counted.
    pub unchanged_names: Option<BloomFilterPayload>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

/// Document-level view of the three document messages.
pub(crate) struct DocumentWatchChange {
    pub(crate) updated_target_ids: Vec<TargetId>,
    pub(crate) removed_target_ids: Vec<TargetId>,
    pub(crate) key: DocumentKey,
    pub(crate) new_document: Option<MutableDocument>,
}

impl From<DocumentChange> for DocumentWatchChange {
    fn from(change: DocumentChange) -> Self {
        Self {
            updated_target_ids: change.updated_target_ids,
            removed_target_ids: change.removed_target_ids,
            key: change.document.key().clone(),
            new_document: Some(change.document),
        }
    }
}

impl From<DocumentDelete> for DocumentWatchChange {
    fn from(delete: DocumentDelete) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: delete.removed_target_ids,
            new_document: Some(MutableDocument::new_no_document(
                delete.key.clone(),
                delete.read_time,
            )),
            key: delete.key,
        }
    }
}

impl From<DocumentRemove> for DocumentWatchChange {
    fn from(remove: DocumentRemove) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: remove.removed_target_ids,
            key: remove.key,
            new_document: None,
        }
    }
}
