use std::collections::BTreeMap;

use crate::firestore::core::{DocumentViewChangeType, ViewSnapshot};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

use super::database::Firestore;
use super::query::Query;
use super::reference::DocumentReference;

/// Whether a snapshot came from the cache and whether it carries local
/// writes the backend has not acknowledged yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    firestore: Firestore,
    key: DocumentKey,
    data: Option<MapValue>,
    version: SnapshotVersion,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(
        firestore: Firestore,
        key: DocumentKey,
        data: Option<MapValue>,
        version: SnapshotVersion,
        metadata: SnapshotMetadata,
    ) -> Self {
        Self {
            firestore,
            key,
            data,
            version,
            metadata,
        }
    }

    /// Snapshot of `document`. No-documents and unknown documents do not
    /// exist.
    pub(crate) fn from_document(firestore: Firestore, document: &MutableDocument, from_cache: bool) -> Self {
        let data = document
            .is_found_document()
            .then(|| document.data().clone());
        Self::new(
            firestore,
            document.key().clone(),
            data,
            document.version(),
            SnapshotMetadata::new(from_cache, document.has_local_mutations()),
        )
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        self.data.as_ref().map(MapValue::fields)
    }

    /// Value at `path`, or `None` when the document or the field is missing.
    pub fn get(&self, path: &str) -> Option<&FirestoreValue> {
        let path = FieldPath::from_dot_separated(path).ok()?;
        self.data.as_ref()?.field(&path)
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Version of the document this snapshot was built from: the backend
    /// update time, or the commit version of an acknowledged write. Minimum
    /// for documents only known locally or not known at all.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn reference(&self) -> DocumentReference {
        DocumentReference::from_key(self.firestore.clone(), self.key.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// One change between two query snapshots. Indexes refer to the previous
/// and the new result set; `None` where the document is absent.
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub document: DocumentSnapshot,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    snapshot: ViewSnapshot,
}

impl QuerySnapshot {
    pub(crate) fn new(query: Query, snapshot: ViewSnapshot) -> Self {
        Self { query, snapshot }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::new(self.snapshot.from_cache, self.snapshot.has_pending_writes())
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    /// Documents in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot
            .documents
            .iter()
            .map(|document| self.document_snapshot(document))
            .collect()
    }

    /// Changes since the previous snapshot. Metadata-only changes are
    /// included only when `include_metadata_changes` is set.
    pub fn document_changes(&self, include_metadata_changes: bool) -> Vec<DocumentChange> {
        self.snapshot
            .changes
            .iter()
            .filter(|change| include_metadata_changes || change.change_type != DocumentViewChangeType::Metadata)
            .map(|change| {
                let key = change.document.key();
                let change_type = match change.change_type {
                    DocumentViewChangeType::Added => DocumentChangeType::Added,
                    DocumentViewChangeType::Removed => DocumentChangeType::Removed,
                    DocumentViewChangeType::Modified | DocumentViewChangeType::Metadata => {
                        DocumentChangeType::Modified
                    }
                };
                DocumentChange {
                    change_type,
                    document: self.document_snapshot(&change.document),
                    old_index: self.snapshot.old_documents.index_of(key),
                    new_index: self.snapshot.documents.index_of(key),
                }
            })
            .collect()
    }

    fn document_snapshot(&self, document: &MutableDocument) -> DocumentSnapshot {
        DocumentSnapshot::new(
            self.query.firestore().clone(),
            document.key().clone(),
            document.is_found_document().then(|| document.data().clone()),
            document.version(),
            SnapshotMetadata::new(
                self.snapshot.from_cache,
                self.snapshot.mutated_keys.contains(document.key()),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_flags() {
        let meta = SnapshotMetadata::new(true, false);
        assert!(meta.from_cache());
        assert!(!meta.has_pending_writes());
    }
}
