use std::collections::{BTreeMap, HashSet};

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, IntoFieldPath, Mutation, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Options that turn a `set` into a merge.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merges every field present in the data into the existing document.
    pub merge: bool,
    /// Merges only these fields. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    /// Merges only the given field paths. Duplicates are dropped.
    pub fn merge_fields<I, P>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: IntoFieldPath,
    {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for field in fields {
            let field = field.into_field_path()?;
            if seen.insert(field.canonical_string()) {
                unique.push(field);
            }
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

/// User data of a `set`, with sentinels lifted out into transforms.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSetData {
    pub data: MapValue,
    /// Present for merges: the fields the write touches.
    pub field_mask: Option<FieldMask>,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedSetData {
    pub fn into_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        let mutation = match self.field_mask {
            Some(mask) => Mutation::patch(key, self.data, mask),
            None => Mutation::set(key, self.data),
        };
        mutation
            .with_precondition(precondition)
            .with_transforms(self.field_transforms)
    }
}

/// User data of an `update`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedUpdateData {
    pub data: MapValue,
    pub field_mask: FieldMask,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedUpdateData {
    pub fn into_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        Mutation::patch(key, self.data, self.field_mask)
            .with_precondition(precondition)
            .with_transforms(self.field_transforms)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Set,
    MergeSet,
    Update,
}

struct ParseContext {
    mode: ParseMode,
    method: &'static str,
    field_mask: Vec<FieldPath>,
    field_transforms: Vec<FieldTransform>,
}

impl ParseContext {
    fn new(mode: ParseMode, method: &'static str) -> Self {
        Self {
            mode,
            method,
            field_mask: Vec::new(),
            field_transforms: Vec::new(),
        }
    }

    fn contains(&self, path: &FieldPath) -> bool {
        self.field_mask.iter().any(|field| field.is_prefix_of(path))
            || self
                .field_transforms
                .iter()
                .any(|transform| transform.field_path().is_prefix_of(path))
    }

    fn error(&self, path: Option<&FieldPath>, reason: impl AsRef<str>) -> FirestoreError {
        let location = match path {
            Some(path) if !path.is_empty() => format!(" (found in field {path})"),
            _ => String::new(),
        };
        invalid_argument(format!(
            "Function {}() called with invalid data. {}{location}",
            self.method,
            reason.as_ref()
        ))
    }
}

/// Parses the data of a `set`. Without merge options the document is
/// replaced and `delete_field` is rejected.
pub fn parse_set_data(
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
    method: &'static str,
) -> FirestoreResult<ParsedSetData> {
    let mode = if options.is_merge() {
        ParseMode::MergeSet
    } else {
        ParseMode::Set
    };
    let mut context = ParseContext::new(mode, method);
    let parsed = parse_object(data, &[], &mut context)?;

    let (field_mask, field_transforms) = if let Some(merge_fields) = &options.merge_fields {
        for field in merge_fields {
            if !context.contains(field) {
                return Err(context.error(
                    None,
                    format!("Field '{field}' is specified in your field mask but missing from your input data."),
                ));
            }
        }
        let mask = FieldMask::new(merge_fields.iter().cloned());
        let transforms = context
            .field_transforms
            .into_iter()
            .filter(|transform| mask.covers(transform.field_path()))
            .collect();
        (Some(mask), transforms)
    } else if options.merge {
        (
            Some(FieldMask::new(context.field_mask)),
            context.field_transforms,
        )
    } else {
        (None, context.field_transforms)
    };

    Ok(ParsedSetData {
        data: parsed,
        field_mask,
        field_transforms,
    })
}

/// Parses the data of an `update`. Keys are dot-separated field paths; each
/// named field is replaced as a whole.
pub fn parse_update_data<I, P>(entries: I, method: &'static str) -> FirestoreResult<ParsedUpdateData>
where
    I: IntoIterator<Item = (P, FirestoreValue)>,
    P: IntoFieldPath,
{
    let mut context = ParseContext::new(ParseMode::Update, method);
    let mut mask = FieldMask::empty();
    let mut data = MapValue::empty();
    let mut seen = 0usize;

    for (path, value) in entries {
        seen += 1;
        let path = path.into_field_path()?;
        if path.is_document_id() {
            return Err(context.error(Some(&path), "The document id cannot be updated."));
        }
        if matches!(value.kind(), ValueKind::Sentinel(SentinelValue::Delete)) {
            mask.insert(path);
            continue;
        }
        if let Some(parsed) = parse_value(value, &path, &mut context)? {
            data.set(&path, parsed);
            mask.insert(path);
        }
    }
    if seen == 0 {
        return Err(context.error(None, "At least one field must be updated."));
    }

    Ok(ParsedUpdateData {
        data,
        field_mask: mask,
        field_transforms: context.field_transforms,
    })
}

fn parse_object(
    data: BTreeMap<String, FirestoreValue>,
    parent: &[String],
    context: &mut ParseContext,
) -> FirestoreResult<MapValue> {
    if data.is_empty() && !parent.is_empty() {
        context.field_mask.push(FieldPath::new(parent.to_vec())?);
    }
    let mut fields = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent.to_vec();
        segments.push(key.clone());
        let path = FieldPath::new(segments)?;
        if let Some(parsed) = parse_value(value, &path, context)? {
            fields.insert(key, parsed);
        }
    }
    Ok(MapValue::new(fields))
}

/// Returns `None` for sentinels, which are recorded on the context instead.
fn parse_value(
    value: FirestoreValue,
    path: &FieldPath,
    context: &mut ParseContext,
) -> FirestoreResult<Option<FirestoreValue>> {
    match value.into_kind() {
        ValueKind::Sentinel(sentinel) => {
            parse_sentinel(sentinel, path, context)?;
            Ok(None)
        }
        ValueKind::Map(map) => {
            let parsed = parse_object(map.into_fields(), path.segments(), context)?;
            Ok(Some(FirestoreValue::from_map_value(parsed)))
        }
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel(element, path, context)?;
            }
            context.field_mask.push(path.clone());
            Ok(Some(FirestoreValue::from_array(array.values().to_vec())))
        }
        other => {
            context.field_mask.push(path.clone());
            Ok(Some(FirestoreValue::from_kind(other)))
        }
    }
}

fn parse_sentinel(sentinel: SentinelValue, path: &FieldPath, context: &mut ParseContext) -> FirestoreResult<()> {
    let operation = match sentinel {
        SentinelValue::Delete => {
            return match context.mode {
                ParseMode::MergeSet => {
                    context.field_mask.push(path.clone());
                    Ok(())
                }
                ParseMode::Update => Err(context.error(
                    Some(path),
                    "delete_field() can only appear at the top level of your update data",
                )),
                ParseMode::Set => Err(context.error(
                    Some(path),
                    "delete_field() cannot be used with set() unless you pass merge options",
                )),
            };
        }
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in &elements {
                assert_no_sentinel(element, path, context)?;
            }
            TransformOperation::ArrayUnion(elements)
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in &elements {
                assert_no_sentinel(element, path, context)?;
            }
            TransformOperation::ArrayRemove(elements)
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(context.error(Some(path), "numeric_increment() requires a numeric operand"));
            }
            TransformOperation::NumericIncrement(*operand)
        }
    };
    context
        .field_transforms
        .push(FieldTransform::new(path.clone(), operation));
    Ok(())
}

fn assert_no_sentinel(value: &FirestoreValue, path: &FieldPath, context: &ParseContext) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(context.error(
            Some(path),
            "Sentinel values cannot be used inside arrays",
        )),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, path, context)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, path, context)),
        _ => Ok(()),
    }
}
