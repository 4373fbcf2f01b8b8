use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{Bound, FieldFilter, OrderBy};
use crate::firestore::core::types::{ListenSequenceNumber, TargetId, TargetPurpose};
use crate::firestore::model::{DocumentKey, ResourcePath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Normalized query descriptor. Two targets are equal iff their canonical ids
/// are equal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    canonical_id: String,
}

impl Target {
    pub(crate) fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        let mut canonical_id = path.canonical_string();
        if let Some(group) = &collection_group {
            canonical_id.push_str("|cg:");
            canonical_id.push_str(group);
        }
        canonical_id.push_str("|f:");
        for filter in &filters {
            canonical_id.push_str(&filter.canonical_id());
        }
        canonical_id.push_str("|ob:");
        for order in &order_by {
            canonical_id.push_str(&order.canonical_id());
        }
        if let Some(limit) = limit {
            canonical_id.push_str("|l:");
            canonical_id.push_str(&limit.to_string());
        }
        if let Some(bound) = &start_at {
            canonical_id.push_str("|lb:");
            canonical_id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &end_at {
            canonical_id.push_str("|ub:");
            canonical_id.push_str(&bound.canonical_id());
        }

        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
            canonical_id,
        }
    }

    /// Single-document lookup target used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(
            key.path().clone(),
            None,
            Vec::new(),
            Vec::new(),
            None,
            None,
            None,
        )
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn document_key(&self) -> Option<DocumentKey> {
        if !self.is_document_target() {
            return None;
        }
        DocumentKey::from_path(self.path.clone()).ok()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id == other.canonical_id
    }
}

impl Eq for Target {}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id)
    }
}

/// Durable bookmark of a listened target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "crate::firestore::util::serde_base64")]
    pub resume_token: Vec<u8>,
    /// Documents the server reported for the target at `resume_token`, sent
    /// with the listen request so existence filters can be checked.
    pub expected_count: Option<u32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: Option<u32>) -> Self {
        self.expected_count = expected_count;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

/// Stable textual form of a value used in canonical ids.
pub(crate) fn canonify_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => {
            if d.is_nan() {
                "NaN".to_string()
            } else {
                format!("{d:?}")
            }
        }
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let values: Vec<String> = array.values().iter().map(canonify_value).collect();
            format!("[{}]", values.join(","))
        }
        ValueKind::Map(map) => {
            let entries: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonify_value(value)))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        ValueKind::Sentinel(sentinel) => format!("{sentinel:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Direction, FilterOperator, Query};

    #[test]
    fn canonical_id_distinguishes_filters() {
        let base = Query::collection("rooms").unwrap();
        let a = base
            .clone()
            .filter("size", FilterOperator::Equal, 1i64)
            .unwrap()
            .to_target();
        let b = base
            .filter("size", FilterOperator::Equal, 2i64)
            .unwrap()
            .to_target();
        assert_ne!(a, b);
        assert!(a.canonical_id().starts_with("rooms|f:size==1|ob:"));
    }

    #[test]
    fn document_targets() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target = Target::for_document(&key);
        assert!(target.is_document_target());
        assert_eq!(target.document_key(), Some(key));
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("size", Direction::Ascending)
            .unwrap();
        assert!(!query.to_target().is_document_target());
    }
}
