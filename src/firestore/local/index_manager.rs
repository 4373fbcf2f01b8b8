use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{Direction, FieldFilter, FilterOperator};
use crate::firestore::core::target::Target;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument, ResourcePath,
};
use crate::firestore::util::log::LOGGER;
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct IndexTable {
    pub(crate) field_indexes: BTreeMap<i32, FieldIndex>,
    pub(crate) next_index_id: i32,
    pub(crate) entries: BTreeMap<i32, IndexEntries>,
    /// Collection id to the parent paths of every collection with that id.
    pub(crate) collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
}

/// Segment values of every indexed document, in segment order. `None` marks
/// a document without that field.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct IndexEntries {
    #[serde(with = "crate::firestore::util::serde_entries")]
    pub(crate) values: BTreeMap<DocumentKey, Vec<Option<FirestoreValue>>>,
}

/// How well the available indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    /// An index covers some of the target's filters; results must be
    /// filtered again.
    Partial,
    /// An index covers every filter and ordering of the target.
    Full,
}

/// Client-side field indexes and the collection parent index, both kept
/// current on every remote document cache write.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    /// Records that documents exist in `collection_path` so collection group
    /// queries can find its parent.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction,
        collection_path: &ResourcePath,
    ) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        let parent = collection_path.without_last();
        let known = txn
            .indexes()
            .collection_parents
            .get(collection_id)
            .map(|parents| parents.contains(&parent))
            .unwrap_or(false);
        if !known {
            txn.indexes_mut()
                .collection_parents
                .entry(collection_id.to_string())
                .or_default()
                .insert(parent);
        }
    }

    /// Parent paths of all collections named `collection_id`.
    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> Vec<ResourcePath> {
        txn.indexes()
            .collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Creates an index over `segments` and backfills it from the document
    /// cache.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction,
        collection_group: &str,
        segments: Vec<IndexSegment>,
    ) -> FieldIndex {
        let table = txn.indexes_mut();
        table.next_index_id += 1;
        let index = FieldIndex::new(table.next_index_id, collection_group, segments);
        table.field_indexes.insert(index.index_id, index.clone());

        let entries: BTreeMap<DocumentKey, Vec<Option<FirestoreValue>>> = txn
            .documents()
            .entries
            .values()
            .filter(|document| document.is_found_document())
            .filter(|document| document.key().has_collection_id(collection_group))
            .map(|document| (document.key().clone(), index_values(&index, document)))
            .collect();
        LOGGER.debug(format!(
            "Created index {} on '{}' with {} entries",
            index.index_id,
            collection_group,
            entries.len()
        ));
        txn.indexes_mut()
            .entries
            .insert(index.index_id, IndexEntries { values: entries });
        index
    }

    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction, index_id: i32) {
        let table = txn.indexes_mut();
        table.field_indexes.remove(&index_id);
        table.entries.remove(&index_id);
    }

    /// Every index, or only those on `collection_group`.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction,
        collection_group: Option<&str>,
    ) -> Vec<FieldIndex> {
        txn.indexes()
            .field_indexes
            .values()
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .cloned()
            .collect()
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction, target: &Target) -> IndexType {
        match self.best_index(txn, target) {
            None => IndexType::None,
            Some((index, covered)) => {
                let indexable = indexable_filters(target).count();
                let orders_covered = target
                    .order_by()
                    .iter()
                    .filter(|order| !order.field.is_document_id())
                    .all(|order| index.covers_field(&order.field));
                if covered == indexable && indexable == target.filters().len() && orders_covered {
                    IndexType::Full
                } else {
                    IndexType::Partial
                }
            }
        }
    }

    /// Creates an index serving every filter and ordering of `target`,
    /// unless one already does.
    pub fn create_target_indexes(
        &self,
        txn: &mut PersistenceTransaction,
        target: &Target,
    ) -> Option<FieldIndex> {
        if self.get_index_type(txn, target) == IndexType::Full {
            return None;
        }
        let mut segments: Vec<IndexSegment> = Vec::new();
        for filter in indexable_filters(target) {
            let kind = segment_kind(filter);
            if !segments
                .iter()
                .any(|segment| &segment.field_path == filter.field() && segment.kind == kind)
            {
                segments.push(IndexSegment {
                    field_path: filter.field().clone(),
                    kind,
                });
            }
        }
        for order in target.order_by() {
            if order.field.is_document_id()
                || segments.iter().any(|segment| segment.field_path == order.field)
            {
                continue;
            }
            segments.push(IndexSegment {
                field_path: order.field.clone(),
                kind: match order.direction {
                    Direction::Ascending => IndexKind::Ascending,
                    Direction::Descending => IndexKind::Descending,
                },
            });
        }
        if segments.is_empty() {
            return None;
        }
        let group = target_collection_group(target)?;
        Some(self.add_field_index(txn, &group, segments))
    }

    /// Keys of cached documents that satisfy every filter `target`'s best
    /// index covers, or `None` when no index applies.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> Option<BTreeSet<DocumentKey>> {
        let (index, _) = self.best_index(txn, target)?;
        let entries = txn.indexes().entries.get(&index.index_id)?;
        let checks: Vec<(usize, &FieldFilter)> = indexable_filters(target)
            .filter_map(|filter| {
                index
                    .segments
                    .iter()
                    .position(|segment| {
                        &segment.field_path == filter.field() && segment.kind == segment_kind(filter)
                    })
                    .map(|position| (position, filter))
            })
            .collect();

        let keys = entries
            .values
            .iter()
            .filter(|(_, values)| {
                checks.iter().all(|(position, filter)| {
                    values
                        .get(*position)
                        .and_then(Option::as_ref)
                        .map_or(false, |value| filter.matches_value(value))
                })
            })
            .map(|(key, _)| key.clone())
            .collect();
        Some(keys)
    }

    pub(crate) fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction,
        document: &MutableDocument,
    ) {
        let indexes = self.get_field_indexes(txn, Some(document.key().collection_group()));
        if indexes.is_empty() {
            return;
        }
        let table = txn.indexes_mut();
        for index in indexes {
            let entries = table.entries.entry(index.index_id).or_default();
            if document.is_found_document() {
                entries
                    .values
                    .insert(document.key().clone(), index_values(&index, document));
            } else {
                entries.values.remove(document.key());
            }
        }
    }

    pub(crate) fn remove_index_entries(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        let indexed = txn
            .indexes()
            .entries
            .values()
            .any(|entries| entries.values.contains_key(key));
        if indexed {
            for entries in txn.indexes_mut().entries.values_mut() {
                entries.values.remove(key);
            }
        }
    }

    /// Index on the target's collection group covering the most filters,
    /// with the number of filters it covers.
    fn best_index(&self, txn: &PersistenceTransaction, target: &Target) -> Option<(FieldIndex, usize)> {
        let group = target_collection_group(target)?;
        self.get_field_indexes(txn, Some(&group))
            .into_iter()
            .map(|index| {
                let covered = indexable_filters(target)
                    .filter(|filter| {
                        index.segments.iter().any(|segment| {
                            &segment.field_path == filter.field()
                                && segment.kind == segment_kind(filter)
                        })
                    })
                    .count();
                (index, covered)
            })
            .filter(|(_, covered)| *covered > 0)
            .max_by_key(|(index, covered)| (*covered, -index.index_id))
    }
}

fn target_collection_group(target: &Target) -> Option<String> {
    if target.is_document_target() {
        return None;
    }
    match target.collection_group() {
        Some(group) => Some(group.to_string()),
        None => target.path().last_segment().map(str::to_string),
    }
}

fn indexable_filters(target: &Target) -> impl Iterator<Item = &FieldFilter> {
    target
        .filters()
        .iter()
        .filter(|filter| !filter.field().is_document_id())
}

fn segment_kind(filter: &FieldFilter) -> IndexKind {
    match filter.operator() {
        FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => IndexKind::Contains,
        _ => IndexKind::Ascending,
    }
}

fn index_values(index: &FieldIndex, document: &MutableDocument) -> Vec<Option<FirestoreValue>> {
    index
        .field_paths()
        .map(|path: &FieldPath| document.field(path).cloned())
        .collect()
}
