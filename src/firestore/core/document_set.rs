use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents of a view, ordered by the view's query and indexed by key.
#[derive(Clone)]
pub struct DocumentSet {
    query: Arc<Query>,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    /// Empty set ordered the way `query` orders its results.
    pub fn new(query: &Query) -> Self {
        Self {
            query: Arc::new(query.clone()),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.sorted
            .binary_search_by(|existing| self.compare(existing, document))
            .ok()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MutableDocument> + ExactSizeIterator {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let position = self
            .sorted
            .partition_point(|existing| self.compare(existing, &document) == Ordering::Less);
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        if let Some(position) = self.index_of(key) {
            self.sorted.remove(position);
        }
        self.by_key.remove(key);
    }

    /// Orders documents by the query and breaks ties by key.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.query
            .compare_documents(left, right)
            .then_with(|| left.key().cmp(right.key()))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Direction;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, order: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("order").unwrap(),
            FirestoreValue::from_integer(order),
        );
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            data,
        )
    }

    #[test]
    fn keeps_query_order_and_replaces_by_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("order").unwrap(), Direction::Descending)
            .unwrap();
        let mut set = DocumentSet::new(&query);
        set.add(doc("rooms/a", 1));
        set.add(doc("rooms/b", 3));
        set.add(doc("rooms/c", 2));

        let keys: Vec<String> = set.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.add(doc("rooms/a", 5));
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/a");
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));

        set.delete(&DocumentKey::from_string("rooms/b").unwrap());
        assert!(!set.contains(&DocumentKey::from_string("rooms/b").unwrap()));
        assert_eq!(set.last().unwrap().key().to_string(), "rooms/c");
    }
}
