use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::core::types::BatchId;
use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion, BATCH_ID_UNKNOWN};

/// Position in the remote document cache and mutation queue that a reader has
/// fully processed. Orders by read time, then key, then batch id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn new(
        read_time: SnapshotVersion,
        document_key: Option<DocumentKey>,
        largest_batch_id: BatchId,
    ) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), None, BATCH_ID_UNKNOWN)
    }

    /// Offset just before every document read after `read_time`.
    pub fn from_read_time(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        Self::new(read_time, None, largest_batch_id)
    }

    /// True when a document read at `read_time` under `key` sorts after this
    /// offset.
    pub fn precedes(&self, read_time: SnapshotVersion, key: &DocumentKey) -> bool {
        match read_time.cmp(&self.read_time) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match &self.document_key {
                None => false,
                Some(offset_key) => key > offset_key,
            },
        }
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

/// Client-side field index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(index_id: i32, collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub fn field_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.segments.iter().map(|segment| &segment.field_path)
    }

    pub fn covers_field(&self, path: &FieldPath) -> bool {
        self.field_paths().any(|field| field == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let a = DocumentKey::from_string("c/a").unwrap();
        let b = DocumentKey::from_string("c/b").unwrap();
        let offset = IndexOffset::new(SnapshotVersion::from_seconds(1), Some(a.clone()), -1);
        assert!(offset.precedes(SnapshotVersion::from_seconds(1), &b));
        assert!(!offset.precedes(SnapshotVersion::from_seconds(1), &a));
        assert!(offset.precedes(SnapshotVersion::from_seconds(2), &a));
        assert!(IndexOffset::none() < offset);
    }
}
