use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// Set of field paths touched by a write. A path covers all of its children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union(mut self, other: &FieldMask) -> Self {
        self.fields.extend(other.fields.iter().cloned());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    NumericIncrement(FirestoreValue),
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Value the backend applies an increment to when the queued batch is
    /// replayed. Other operations carry no base value.
    pub fn extract_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match &self.operation {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: &FirestoreValue,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            _ => transform_result.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    /// Checks the precondition against the given (local or remote) view.
    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the masked fields; masked fields absent from `data` are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Checks the precondition on commit without writing.
    Verify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Outcome of one acknowledged mutation, matched positionally to its batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None)
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self::new(
            key,
            MutationKind::Patch { data, mask },
            Precondition::Exists(true),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None)
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition)
    }

    pub fn new(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Mask of fields this mutation writes, `None` when it replaces the whole
    /// document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.clone()),
            MutationKind::Verify => Some(FieldMask::empty()),
            _ => None,
        }
    }

    /// Base mutation capturing the pre-write values of increment transforms.
    pub fn extract_base_mutation(&self, document: &MutableDocument) -> Option<Mutation> {
        let mut base = MapValue::empty();
        let mut mask = FieldMask::empty();
        for transform in &self.field_transforms {
            let previous = document.field(transform.field_path());
            if let Some(value) = transform.extract_base_value(previous) {
                base.set(transform.field_path(), value);
                mask.insert(transform.field_path().clone());
            }
        }
        if mask.is_empty() {
            return None;
        }
        Some(
            Mutation::patch(self.key.clone(), base, mask).with_precondition(Precondition::Exists(true)),
        )
    }

    /// Applies the acknowledged mutation to the remote copy of the document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        self.verify_key(document)?;
        match &self.kind {
            MutationKind::Set { value } => {
                let mut data = value.clone();
                self.apply_server_transforms(&mut data, document, &result.transform_results)?;
                document.convert_to_found_document(result.version, data);
                document.set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let mut new_data = document.data().clone();
                self.apply_patch(&mut new_data, data, mask);
                self.apply_server_transforms(&mut new_data, document, &result.transform_results)?;
                document.convert_to_found_document(result.version, new_data);
                document.set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document.convert_to_no_document(result.version);
                document.set_has_committed_mutations();
            }
            MutationKind::Verify => {
                return Err(internal_error(
                    "Verify mutations are never applied to the remote document cache",
                ));
            }
        }
        Ok(())
    }

    /// Applies the mutation to the local view. Returns the accumulated mask of
    /// changed fields, or `None` when the whole document changed.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if document.key() != &self.key || !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let mut data = value.clone();
                self.apply_local_transforms(&mut data, document, local_write_time);
                let version = document.version();
                document.convert_to_found_document(version, data);
                document.set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let mut new_data = document.data().clone();
                self.apply_patch(&mut new_data, data, mask);
                self.apply_local_transforms(&mut new_data, document, local_write_time);
                let version = document.version();
                document.convert_to_found_document(version, new_data);
                document.set_has_local_mutations();
                let previous = previous_mask?;
                let mut merged = previous.union(mask);
                for transform in &self.field_transforms {
                    merged.insert(transform.field_path().clone());
                }
                Some(merged)
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version);
                document.set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    fn verify_key(&self, document: &MutableDocument) -> FirestoreResult<()> {
        if document.key() != &self.key {
            return Err(internal_error(format!(
                "Can only apply a mutation for {} to a document with the same key, got {}",
                self.key,
                document.key()
            )));
        }
        Ok(())
    }

    fn apply_patch(&self, target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
        for path in mask.fields() {
            match data.field(path) {
                Some(value) => target.set(path, value.clone()),
                None => target.delete(path),
            }
        }
    }

    fn apply_local_transforms(
        &self,
        data: &mut MapValue,
        previous: &MutableDocument,
        local_write_time: Timestamp,
    ) {
        for transform in &self.field_transforms {
            let value =
                transform.apply_to_local_view(previous.field(transform.field_path()), local_write_time);
            data.set(transform.field_path(), value);
        }
    }

    fn apply_server_transforms(
        &self,
        data: &mut MapValue,
        previous: &MutableDocument,
        results: &[FirestoreValue],
    ) -> FirestoreResult<()> {
        if results.len() != self.field_transforms.len() {
            return Err(internal_error(format!(
                "Server transform count ({}) should match field transform count ({})",
                results.len(),
                self.field_transforms.len()
            )));
        }
        for (transform, result) in self.field_transforms.iter().zip(results) {
            let value =
                transform.apply_to_remote_document(previous.field(transform.field_path()), result);
            data.set(transform.field_path(), value);
        }
        Ok(())
    }
}

/// Collapses the local changes of `document` into one mutation. `mask` is the
/// set of fields changed by pending writes, `None` when the whole document was
/// replaced or deleted.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut patch_mask = FieldMask::empty();
    for field in mask.fields() {
        if patch_mask.fields().contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.field(&path);
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        patch_mask.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch, patch_mask)
            .with_precondition(Precondition::None),
    )
}

fn coerce_array(value: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    match value.map(FirestoreValue::kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerce_array(existing);
    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = coerce_array(existing)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn found(entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        MutableDocument::new_found_document(key(), SnapshotVersion::from_seconds(1), map(entries))
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = found(&[("a", FirestoreValue::from_integer(1))]);
        let mutation = Mutation::set(key(), map(&[("b", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.field(&path("a")).is_none());
        assert_eq!(doc.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = MutableDocument::new_no_document(key(), SnapshotVersion::from_seconds(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("x", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("x")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut doc = found(&[
            ("a", FirestoreValue::from_integer(1)),
            ("b", FirestoreValue::from_integer(2)),
        ]);
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::new([path("a")]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::new([path("a")])));
        assert!(doc.field(&path("a")).is_none());
        assert!(doc.field(&path("b")).is_some());
    }

    #[test]
    fn increments_locally_and_captures_base_value() {
        let mut doc = found(&[("count", FirestoreValue::from_integer(5))]);
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty()).with_transforms(
            vec![FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
            )],
        );
        let base = mutation.extract_base_mutation(&doc).unwrap();
        assert_eq!(
            base.kind(),
            &MutationKind::Patch {
                data: map(&[("count", FirestoreValue::from_integer(5))]),
                mask: FieldMask::new([path("count")]),
            }
        );
        mutation.apply_to_local_view(&mut doc, None, Timestamp::now());
        assert_eq!(doc.field(&path("count")), Some(&FirestoreValue::from_integer(7)));
    }

    #[test]
    fn remote_application_uses_server_results() {
        let mut doc = found(&[("tags", FirestoreValue::from_array(vec![]))]);
        let committed = Timestamp::new(100, 0);
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty()).with_transforms(
            vec![
                FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
                FieldTransform::new(
                    path("tags"),
                    TransformOperation::ArrayUnion(vec![FirestoreValue::from_string("x")]),
                ),
            ],
        );
        let result = MutationResult::new(
            SnapshotVersion::from_seconds(3),
            vec![FirestoreValue::from_timestamp(committed), FirestoreValue::null()],
        );
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(3));
        assert_eq!(doc.field(&path("at")), Some(&FirestoreValue::from_timestamp(committed)));
        assert_eq!(
            doc.field(&path("tags")),
            Some(&FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]))
        );
    }

    #[test]
    fn failed_patch_precondition_yields_unknown_document() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::patch(
            key(),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("x")]),
        );
        let result = MutationResult::new(SnapshotVersion::from_seconds(4), Vec::new());
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.is_unknown_document());
    }

    #[test]
    fn overlay_for_patched_fields_is_a_patch() {
        let mut doc = found(&[("a", FirestoreValue::from_integer(1))]);
        let mutation = Mutation::patch(
            key(),
            map(&[("b.c", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b.c")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        let overlay = calculate_overlay_mutation(&doc, Some(&mask)).unwrap();
        assert_eq!(overlay.precondition(), Precondition::None);
        assert_eq!(
            overlay.kind(),
            &MutationKind::Patch {
                data: map(&[("b.c", FirestoreValue::from_integer(2))]),
                mask: FieldMask::new([path("b.c")]),
            }
        );
    }

    #[test]
    fn overlay_for_deleted_document_is_a_delete() {
        let mut doc = found(&[("a", FirestoreValue::from_integer(1))]);
        Mutation::delete(key()).apply_to_local_view(&mut doc, None, Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }
}
