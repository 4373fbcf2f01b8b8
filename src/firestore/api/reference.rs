use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::firestore::core::{ListenOptions, ListenerRegistration, Query as CoreQuery, QueryObserver, Source, ViewSnapshot};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, IntoFieldPath, Mutation, Precondition, ResourcePath, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::operations::{parse_set_data, parse_update_data, SetOptions};
use super::query::Query;
use super::snapshot::{DocumentSnapshot, SnapshotMetadata};

const AUTO_ID_LENGTH: usize = 20;

#[derive(Clone, Debug)]
pub struct CollectionReference {
    firestore: Firestore,
    path: ResourcePath,
}

impl CollectionReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(
                "Collection references must point to a collection (odd number of segments)",
            ));
        }
        Ok(Self { firestore, path })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The full resource path of the collection (e.g. `rooms/eros/messages`).
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// The document containing this collection, `None` for root collections.
    pub fn parent(&self) -> Option<DocumentReference> {
        if self.path.len() < 2 {
            return None;
        }
        DocumentReference::new(self.firestore.clone(), self.path.without_last()).ok()
    }

    /// Reference to `document_id`, or to a new auto-generated id when `None`.
    pub fn doc(&self, document_id: Option<&str>) -> FirestoreResult<DocumentReference> {
        let id = document_id.map_or_else(generate_auto_id, str::to_string);
        if id.is_empty() || id.contains('/') {
            return Err(invalid_argument("Document ID must be non-empty and cannot contain '/'."));
        }
        DocumentReference::new(self.firestore.clone(), self.path.child([id]))
    }

    /// Writes `data` to a new document with an auto-generated id.
    pub async fn add_doc(&self, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<DocumentReference> {
        let reference = self.doc(None)?;
        reference.set(data, SetOptions::default()).await?;
        Ok(reference)
    }

    /// Query over every document of this collection.
    pub fn query(&self) -> Query {
        Query::from_core(self.firestore.clone(), CoreQuery::new(self.path.clone()))
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionReference({})", self.path.canonical_string())
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReference {
    firestore: Firestore,
    key: DocumentKey,
}

impl DocumentReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        let key = DocumentKey::from_path(path)?;
        Ok(Self { firestore, key })
    }

    pub(crate) fn from_key(firestore: Firestore, key: DocumentKey) -> Self {
        Self { firestore, key }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn path(&self) -> &ResourcePath {
        self.key.path()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            firestore: self.firestore.clone(),
            path: self.key.collection_path(),
        }
    }

    /// Subcollection at `path` below this document.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let sub_path = ResourcePath::from_string(path)?;
        let segments: Vec<String> = (0..sub_path.len())
            .filter_map(|index| sub_path.segment(index).map(str::to_string))
            .collect();
        CollectionReference::new(self.firestore.clone(), self.key.path().child(segments))
    }

    /// Reads the document from `source`.
    pub async fn get(&self, source: Source) -> FirestoreResult<DocumentSnapshot> {
        let read = self.firestore.client().get_document(&self.key, source).await?;
        Ok(DocumentSnapshot::from_document(
            self.firestore.clone(),
            &read.document,
            read.from_cache,
        ))
    }

    /// Writes `data`, replacing the document unless `options` ask for a
    /// merge. Resolves once the backend acknowledged the write.
    pub async fn set(&self, data: BTreeMap<String, FirestoreValue>, options: SetOptions) -> FirestoreResult<()> {
        let parsed = parse_set_data(data, &options, "DocumentReference.set")?;
        self.write(parsed.into_mutation(self.key.clone(), Precondition::None))
            .await
    }

    /// Updates the named fields. Fails if the document does not exist.
    pub async fn update<I, P>(&self, entries: I) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = (P, FirestoreValue)>,
        P: IntoFieldPath,
    {
        let parsed = parse_update_data(entries, "DocumentReference.update")?;
        self.write(parsed.into_mutation(self.key.clone(), Precondition::Exists(true)))
            .await
    }

    pub async fn delete(&self) -> FirestoreResult<()> {
        self.write(Mutation::delete(self.key.clone())).await
    }

    async fn write(&self, mutation: Mutation) -> FirestoreResult<()> {
        self.firestore.client().write(vec![mutation]).await
    }

    /// Listens to the document. `observer` runs on the client's queue and
    /// must not block.
    pub async fn on_snapshot<O>(&self, options: ListenOptions, observer: O) -> FirestoreResult<ListenerRegistration>
    where
        O: Fn(FirestoreResult<DocumentSnapshot>) + Send + Sync + 'static,
    {
        let firestore = self.firestore.clone();
        let key = self.key.clone();
        let observer: QueryObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            observer(result.map(|snapshot| document_from_view(&firestore, &key, &snapshot)));
        });
        self.firestore
            .client()
            .listen(CoreQuery::for_document(&self.key), options, observer)
            .await
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentReference({})", self.key.path().canonical_string())
    }
}

fn document_from_view(firestore: &Firestore, key: &DocumentKey, snapshot: &ViewSnapshot) -> DocumentSnapshot {
    match snapshot.documents.get(key) {
        Some(document) => DocumentSnapshot::new(
            firestore.clone(),
            key.clone(),
            Some(document.data().clone()),
            document.version(),
            SnapshotMetadata::new(snapshot.from_cache, snapshot.mutated_keys.contains(key)),
        ),
        None => DocumentSnapshot::new(
            firestore.clone(),
            key.clone(),
            None,
            SnapshotVersion::min(),
            SnapshotMetadata::new(snapshot.from_cache, false),
        ),
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{EmptyCredentialsProvider, FirestoreSettings};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::InMemoryDatastore;

    async fn firestore(datastore: &InMemoryDatastore) -> Firestore {
        Firestore::new(
            DatabaseId::default("test-project"),
            FirestoreSettings::default(),
            Arc::new(datastore.clone()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn collection_and_document_paths() {
        let firestore = firestore(&InMemoryDatastore::new()).await;
        let collection = firestore.collection("cities").unwrap();
        assert_eq!(collection.id(), "cities");
        assert!(collection.parent().is_none());
        let document = collection.doc(Some("sf")).unwrap();
        assert_eq!(document.id(), "sf");
        assert_eq!(document.parent().id(), "cities");
        let landmarks = document.collection("landmarks").unwrap();
        assert_eq!(landmarks.parent().unwrap().id(), "sf");
        assert!(collection.doc(Some("a/b")).is_err());
    }

    #[tokio::test]
    async fn auto_ids_are_generated() {
        let firestore = firestore(&InMemoryDatastore::new()).await;
        let document = firestore.collection("cities").unwrap().doc(None).unwrap();
        assert_eq!(document.id().len(), AUTO_ID_LENGTH);
    }

    #[tokio::test]
    async fn set_update_and_delete_reach_the_backend() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let document = firestore.doc("cities/sf").unwrap();

        document
            .set(
                BTreeMap::from([("population".to_string(), FirestoreValue::from(800_i64))]),
                SetOptions::default(),
            )
            .await
            .unwrap();
        document
            .update(vec![("population", FirestoreValue::numeric_increment(FirestoreValue::from(1_i64)))])
            .await
            .unwrap();
        let stored = datastore.document(document.key()).unwrap();
        assert_eq!(stored.data().fields().get("population"), Some(&FirestoreValue::from(801_i64)));

        document.delete().await.unwrap();
        assert!(datastore.document(document.key()).is_none());
    }

    #[tokio::test]
    async fn add_doc_creates_a_new_document() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let reference = firestore
            .collection("messages")
            .unwrap()
            .add_doc(BTreeMap::from([("text".to_string(), FirestoreValue::from("hi"))]))
            .await
            .unwrap();
        assert!(datastore.document(reference.key()).is_some());
    }
}
