use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentViewChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: DocumentViewChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: DocumentViewChangeType, document: MutableDocument) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Collapses the changes of one view computation into at most one change per
/// document.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        use DocumentViewChangeType::{Added, Metadata, Modified, Removed};

        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };

        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "Unsupported combination of changes for {key}: {new_type:?} after {old_type:?}"
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Whether a view reflects a state the backend marked current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// What a listener sees after a view changed.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub changes: Vec<DocumentViewChange>,
    /// Documents of the view that have local writes not yet acknowledged.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub exclude_metadata_changes: bool,
    /// Whether the view was built from previously synced results.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that adds every document of `documents`.
    pub fn from_initial_documents(
        query: &Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(DocumentViewChangeType::Added, document.clone()))
            .collect();
        Self {
            query: query.clone(),
            old_documents: DocumentSet::new(query),
            documents,
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            exclude_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;
    use DocumentViewChangeType::*;

    fn change(change_type: DocumentViewChangeType, version: i64) -> DocumentViewChange {
        DocumentViewChange::new(
            change_type,
            MutableDocument::new_found_document(
                DocumentKey::from_string("rooms/eros").unwrap(),
                SnapshotVersion::from_seconds(version),
                MapValue::empty(),
            ),
        )
    }

    fn merge(first: DocumentViewChange, second: DocumentViewChange) -> Vec<DocumentViewChange> {
        let mut set = DocumentChangeSet::new();
        set.track(first).unwrap();
        set.track(second).unwrap();
        set.changes()
    }

    #[test]
    fn merges_changes_per_document() {
        assert!(merge(change(Added, 1), change(Removed, 1)).is_empty());
        assert_eq!(merge(change(Added, 1), change(Modified, 2)), vec![change(Added, 2)]);
        assert_eq!(merge(change(Removed, 1), change(Added, 2)), vec![change(Modified, 2)]);
        assert_eq!(merge(change(Modified, 1), change(Removed, 2)), vec![change(Removed, 1)]);
        assert_eq!(merge(change(Metadata, 1), change(Modified, 2)), vec![change(Modified, 2)]);
        assert_eq!(merge(change(Modified, 1), change(Metadata, 2)), vec![change(Modified, 2)]);
    }

    #[test]
    fn adding_twice_is_rejected() {
        let mut set = DocumentChangeSet::new();
        set.track(change(Added, 1)).unwrap();
        assert!(set.track(change(Added, 2)).is_err());
    }
}
