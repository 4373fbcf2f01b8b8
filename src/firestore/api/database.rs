use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

use crate::firestore::core::{
    CredentialsProviderArc, DatabaseInfo, FirestoreClient, FirestoreSettings, DEFAULT_MAX_ATTEMPTS,
};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{BundleMetadata, NamedQuery};
use crate::firestore::model::{DatabaseId, ResourcePath};
use crate::firestore::remote::datastore::DatastoreArc;

use super::query::Query;
use super::reference::{CollectionReference, DocumentReference};
use super::transaction::Transaction;
use super::write_batch::WriteBatch;

/// Handle to one database. Cheap to clone; all clones share one client.
#[derive(Clone)]
pub struct Firestore {
    inner: Arc<FirestoreInner>,
}

struct FirestoreInner {
    database_id: DatabaseId,
    client: Arc<FirestoreClient>,
}

impl Debug for Firestore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firestore")
            .field("database_id", &self.inner.database_id)
            .finish()
    }
}

impl Firestore {
    /// Starts a client for `database_id` that reaches the backend through
    /// `datastore`.
    pub async fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
    ) -> FirestoreResult<Self> {
        let persistence_key = format!("{}/{}", database_id.project_id(), database_id.database());
        let client = FirestoreClient::new(
            DatabaseInfo::new(database_id.clone(), persistence_key),
            settings,
            datastore,
            credentials,
        )
        .await?;
        Ok(Self {
            inner: Arc::new(FirestoreInner { database_id, client }),
        })
    }

    /// The fully qualified database identifier (project + database name).
    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn project_id(&self) -> &str {
        self.inner.database_id.project_id()
    }

    pub(crate) fn client(&self) -> &Arc<FirestoreClient> {
        &self.inner.client
    }

    /// Whether both handles share one client.
    pub(crate) fn same_instance(&self, other: &Firestore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a `CollectionReference` pointing at `path`, e.g.
    /// `"users/alovelace/repos"`.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let resource = ResourcePath::from_string(path)?;
        CollectionReference::new(self.clone(), resource)
    }

    /// Creates a `DocumentReference` pointing at `path`. The path must have
    /// an even number of segments.
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        let resource = ResourcePath::from_string(path)?;
        DocumentReference::new(self.clone(), resource)
    }

    /// Query over every collection named `collection_id`, wherever it is
    /// nested.
    pub fn collection_group(&self, collection_id: &str) -> FirestoreResult<Query> {
        Query::collection_group(self.clone(), collection_id)
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    /// Runs `update_fn` atomically. It is called again, with a fresh
    /// transaction, when a document it read changed before the commit.
    pub async fn run_transaction<F, Fut, T>(&self, mut update_fn: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        let firestore = self.clone();
        self.inner
            .client
            .run_transaction(DEFAULT_MAX_ATTEMPTS, move |transaction| {
                update_fn(Transaction::new(firestore.clone(), transaction))
            })
            .await
    }

    /// Resolves once every write issued so far is acknowledged by the
    /// backend or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.inner.client.wait_for_pending_writes().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.client.enable_network().await
    }

    /// Stops talking to the backend. Listeners get cached results and
    /// writes stay queued until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.client.disable_network().await
    }

    /// Lets the query engine create indexes for queries that scan many
    /// documents.
    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.inner.client.set_index_auto_creation_enabled(enabled).await
    }

    /// Records a loaded bundle and the queries it names. Returns `false` when
    /// the same bundle, or a newer one, was recorded before.
    pub async fn save_bundle(&self, metadata: BundleMetadata, named_queries: Vec<NamedQuery>) -> FirestoreResult<bool> {
        self.inner.client.save_bundle(metadata, named_queries).await
    }

    /// Query saved under `name` by a recorded bundle.
    pub async fn named_query(&self, name: &str) -> FirestoreResult<Option<Query>> {
        let named_query = self.inner.client.get_named_query(name).await?;
        Ok(named_query.map(|named_query| Query::from_core(self.clone(), named_query.query)))
    }

    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.inner.client.terminate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{EmptyCredentialsProvider, Query as CoreQuery};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::remote::datastore::InMemoryDatastore;

    #[tokio::test]
    async fn references_resolve_paths() {
        let firestore = Firestore::new(
            DatabaseId::default("project"),
            FirestoreSettings::default(),
            Arc::new(InMemoryDatastore::new()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .unwrap();
        assert_eq!(firestore.project_id(), "project");
        assert_eq!(firestore.collection("rooms").unwrap().id(), "rooms");
        assert_eq!(firestore.doc("rooms/eros").unwrap().id(), "eros");
        assert!(firestore.doc("rooms").is_err());
        firestore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn bundle_named_queries_are_recorded_once() {
        let firestore = Firestore::new(
            DatabaseId::default("project"),
            FirestoreSettings::default(),
            Arc::new(InMemoryDatastore::new()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .unwrap();
        let rooms = CoreQuery::collection("rooms").unwrap();
        let bundle = |seconds| BundleMetadata {
            id: "daily".to_string(),
            version: 1,
            create_time: SnapshotVersion::from_seconds(seconds),
        };
        let named = |query: &CoreQuery| NamedQuery {
            name: "latest-rooms".to_string(),
            query: query.clone(),
            read_time: SnapshotVersion::from_seconds(10),
        };

        assert!(firestore.named_query("latest-rooms").await.unwrap().is_none());
        assert!(firestore.save_bundle(bundle(10), vec![named(&rooms)]).await.unwrap());
        let saved = firestore.named_query("latest-rooms").await.unwrap().unwrap();
        assert_eq!(saved.core_query(), &rooms);

        // An older copy of the bundle does not overwrite the recorded queries.
        let users = CoreQuery::collection("users").unwrap();
        assert!(!firestore.save_bundle(bundle(5), vec![named(&users)]).await.unwrap());
        let kept = firestore.named_query("latest-rooms").await.unwrap().unwrap();
        assert_eq!(kept.core_query(), &rooms);
        firestore.terminate().await.unwrap();
    }
}
