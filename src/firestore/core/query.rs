use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::{canonify_value, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, type_order, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let needs_array = matches!(
            operator,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid Query. A non-empty array is required for '{}' filters.",
                operator.as_str()
            )));
        }
        if value.is_nan() && !matches!(operator, FilterOperator::Equal | FilterOperator::NotEqual) {
            return Err(invalid_argument(
                "Invalid query. NaN is only supported by '==' and '!=' comparisons.",
            ));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.operator.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let Some(other) = document_field_value(document, &self.field) else {
            return false;
        };
        self.matches_value(&other)
    }

    pub(crate) fn matches_value(&self, other: &FirestoreValue) -> bool {
        match self.operator {
            FilterOperator::NotEqual => {
                !other.is_null() && self.matches_comparison(compare_values(other, &self.value))
            }
            FilterOperator::ArrayContains => other
                .as_array()
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => {
                    needles.values().iter().any(|needle| array.contains(needle))
                }
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .map(|values| values.contains(other))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                let Some(values) = self.value.as_array() else {
                    return false;
                };
                if values.contains(&FirestoreValue::null()) {
                    return false;
                }
                !other.is_null() && !values.contains(other)
            }
            _ => {
                type_order(&self.value) == type_order(other)
                    && self.matches_comparison(compare_values(other, &self.value))
            }
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonify_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub(crate) fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    pub(crate) fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), suffix)
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let l = left.field(&self.field).unwrap_or(&null);
            let r = right.field(&self.field).unwrap_or(&null);
            compare_values(l, r)
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position. `inclusive` controls whether a document exactly at the
/// position is part of the result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(canonify_value).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        let mut ordering = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            ordering = if order.field.is_document_id() {
                match component.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(document.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                compare_values(component, document.field(&order.field).unwrap_or(&null))
            };
            if order.direction == Direction::Descending {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                break;
            }
        }
        ordering
    }

    /// Whether `document` is at or after a start bound.
    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether `document` is at or before an end bound.
    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// User-facing query. Converted to a [`Target`] for caching and listening.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection or single document at `path`.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection reference. Collection references must have an odd number of segments, but {} has {}",
                path.canonical_string(),
                path.len()
            )));
        }
        Ok(Self::new(path))
    }

    pub fn collection_group(collection_id: &str) -> FirestoreResult<Self> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection ID '{collection_id}' passed to function collectionGroup()."
            )));
        }
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.to_string());
        Ok(query)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filter(
        self,
        field: impl crate::firestore::model::IntoFieldPath,
        operator: FilterOperator,
        value: impl Into<FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let filter = FieldFilter::new(field.into_field_path()?, operator, value.into())?;
        Ok(self.with_filter(filter))
    }

    pub fn order_by(
        mut self,
        field: impl crate::firestore::model::IntoFieldPath,
        direction: Direction,
    ) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "Invalid query. You must not call startAt() or endAt() before calling orderBy().",
            ));
        }
        self.explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection in key
    /// order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_document_id()))
    }

    /// Collection id used to group documents for indexing and statistics.
    pub fn collection_group_key(&self) -> String {
        match &self.collection_group {
            Some(id) => id.clone(),
            None => {
                if DocumentKey::is_document_key(&self.path) {
                    self.path.without_last().last_segment().unwrap_or_default().to_string()
                } else {
                    self.path.last_segment().unwrap_or_default().to_string()
                }
            }
        }
    }

    /// Collection query at `path` with the same constraints as this
    /// collection group query.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// Explicit order-by clauses followed by implicit ones for inequality
    /// fields and the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let last_direction = self
            .explicit_order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        let mut inequality_fields: Vec<&FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.is_inequality())
            .map(FieldFilter::field)
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();

        for field in inequality_fields {
            if field.is_document_id() || result.iter().any(|order| &order.field == field) {
                continue;
            }
            result.push(OrderBy::new(field.clone(), last_direction));
        }

        if !result.iter().any(|order| order.field.is_document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_document_id() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Result ordering of this query.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let mut saw_key = false;
        for order in self.normalized_order_by() {
            saw_key |= order.field.is_document_id();
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        if saw_key {
            Ordering::Equal
        } else {
            left.key().cmp(right.key())
        }
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

/// Value of `field` in `document`, resolving the document key pseudo-field.
pub(crate) fn document_field_value(
    document: &MutableDocument,
    field: &FieldPath,
) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

/// Equality on the user-visible content of two documents.
pub(crate) fn documents_equal(left: &MutableDocument, right: &MutableDocument) -> bool {
    left.key() == right.key()
        && left.document_type() == right.document_type()
        && left.version() == right.version()
        && values_equal(
            &FirestoreValue::from_map_value(left.data().clone()),
            &FirestoreValue::from_map_value(right.data().clone()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            data,
        )
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = Query::collection("rooms").unwrap();
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/1", &[])));
    }

    #[test]
    fn collection_group_matches_nested_documents() {
        let query = Query::collection_group("messages").unwrap();
        assert!(query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn filters_compare_across_numeric_types() {
        let query = Query::collection("rooms")
            .unwrap()
            .filter("size", FilterOperator::GreaterThan, 1.5)
            .unwrap();
        assert!(query.matches(&doc("rooms/a", &[("size", FirestoreValue::from_integer(2))])));
        assert!(!query.matches(&doc("rooms/b", &[("size", FirestoreValue::from_string("big"))])));
        assert!(!query.matches(&doc("rooms/c", &[])));
    }

    #[test]
    fn not_in_excludes_missing_and_null() {
        let query = Query::collection("rooms")
            .unwrap()
            .filter(
                "tag",
                FilterOperator::NotIn,
                FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]),
            )
            .unwrap();
        assert!(query.matches(&doc("rooms/a", &[("tag", FirestoreValue::from_string("y"))])));
        assert!(!query.matches(&doc("rooms/b", &[("tag", FirestoreValue::null())])));
        assert!(!query.matches(&doc("rooms/c", &[("tag", FirestoreValue::from_string("x"))])));
    }

    #[test]
    fn normalizes_order_by_with_inequalities_and_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .filter("size", FilterOperator::GreaterThan, 1i64)
            .unwrap();
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field.canonical_string(), "size");
        assert!(order_by[1].field.is_document_id());
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("size", Direction::Ascending)
            .unwrap()
            .limit_to_last(2);
        let target = query.to_target();
        assert!(target.order_by().iter().all(|o| o.direction == Direction::Descending));
        assert_ne!(
            query.canonical_id(),
            query.clone().limit_to_first(2).canonical_id()
        );
    }

    #[test]
    fn bounds_restrict_results() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("size", Direction::Ascending)
            .unwrap()
            .start_at(Bound::new(vec![FirestoreValue::from_integer(2)], true))
            .end_at(Bound::new(vec![FirestoreValue::from_integer(4)], false));
        assert!(query.matches(&doc("rooms/a", &[("size", FirestoreValue::from_integer(2))])));
        assert!(!query.matches(&doc("rooms/b", &[("size", FirestoreValue::from_integer(4))])));
        assert!(!query.matches(&doc("rooms/c", &[("size", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn sorts_by_field_then_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("size", Direction::Descending)
            .unwrap();
        let a = doc("rooms/a", &[("size", FirestoreValue::from_integer(1))]);
        let b = doc("rooms/b", &[("size", FirestoreValue::from_integer(3))]);
        assert_eq!(query.compare_documents(&b, &a), Ordering::Less);
    }
}
