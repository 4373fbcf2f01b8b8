use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::firestore::api::operations::{ParsedSetData, ParsedUpdateData};
use crate::firestore::core::credentials::CredentialsProviderArc;
use crate::firestore::error::{aborted, failed_precondition, internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, Precondition, SnapshotVersion};
use crate::firestore::remote::datastore::DatastoreArc;

/// One attempt of a read-write transaction. Reads go straight to the
/// backend; writes are buffered and committed atomically together with a
/// verification of every document read but not written.
///
/// Cloning yields another handle to the same attempt.
#[derive(Clone)]
pub struct Transaction {
    datastore: DatastoreArc,
    credentials: CredentialsProviderArc,
    state: Arc<StdMutex<TransactionState>>,
}

#[derive(Default)]
struct TransactionState {
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    /// First write error, surfaced again on commit.
    last_error: Option<FirestoreError>,
    committed: bool,
}

impl Transaction {
    pub fn new(datastore: DatastoreArc, credentials: CredentialsProviderArc) -> Self {
        Self {
            datastore,
            credentials,
            state: Arc::new(StdMutex::new(TransactionState::default())),
        }
    }

    /// Reads `keys` from the backend. Missing documents come back as
    /// no-documents.
    pub async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MutableDocument>> {
        {
            let mut state = self.lock();
            state.ensure_commit_not_called()?;
            if !state.mutations.is_empty() {
                let err = invalid_argument("Firestore transactions require all reads to be executed before all writes.");
                state.last_error = Some(err.clone());
                return Err(err);
            }
        }

        let token = self.credentials.get_token(false).await?;
        let documents = self.datastore.lookup(token, keys).await?;

        let mut state = self.lock();
        for document in &documents {
            state.record_version(document)?;
        }
        Ok(documents)
    }

    pub async fn get(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.lookup(vec![key.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| internal_error(format!("Lookup of {key} returned no document")))
    }

    /// Writes `data`. A document read earlier in this attempt must still be at
    /// the version that was read.
    pub fn set(&self, key: DocumentKey, data: ParsedSetData) -> FirestoreResult<()> {
        let mut state = self.lock();
        let precondition = state.precondition(&key);
        state.write(data.into_mutation(key, precondition))
    }

    /// Updates an existing document. Fails if this attempt read the document
    /// and found it missing.
    pub fn update(&self, key: DocumentKey, data: ParsedUpdateData) -> FirestoreResult<()> {
        let mut state = self.lock();
        match state.precondition_for_update(&key) {
            Ok(precondition) => state.write(data.into_mutation(key, precondition)),
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn delete(&self, key: DocumentKey) -> FirestoreResult<()> {
        let mut state = self.lock();
        let precondition = state.precondition(&key);
        state.write(Mutation::delete(key).with_precondition(precondition))
    }

    /// Commits the buffered writes. Documents that were read but not written
    /// are verified to be unchanged.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.lock();
            state.ensure_commit_not_called()?;
            if let Some(err) = state.last_error.clone() {
                return Err(err);
            }
            let unwritten: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !state.written_docs.contains(*key))
                .cloned()
                .collect();
            for key in unwritten {
                let precondition = state.precondition(&key);
                state.mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            std::mem::take(&mut state.mutations)
        };

        let token = self.credentials.get_token(false).await?;
        self.datastore.commit(token, mutations).await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TransactionState {
    fn ensure_commit_not_called(&self) -> FirestoreResult<()> {
        if self.committed {
            return Err(failed_precondition("A transaction object cannot be used after its update callback has been invoked."));
        }
        Ok(())
    }

    fn record_version(&mut self, document: &MutableDocument) -> FirestoreResult<()> {
        let version = if document.is_found_document() {
            document.version()
        } else if document.is_no_document() {
            SnapshotVersion::min()
        } else {
            return Err(internal_error(format!(
                "Document in a transaction was a {:?}",
                document.document_type()
            )));
        };

        match self.read_versions.get(document.key()) {
            Some(existing) if *existing != version => {
                Err(aborted("Document version changed between two reads."))
            }
            Some(_) => Ok(()),
            None => {
                self.read_versions.insert(document.key().clone(), version);
                Ok(())
            }
        }
    }

    fn precondition(&self, key: &DocumentKey) -> Precondition {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    Precondition::Exists(false)
                } else {
                    Precondition::UpdateTime(*version)
                }
            }
            _ => Precondition::None,
        }
    }

    fn precondition_for_update(&self, key: &DocumentKey) -> FirestoreResult<Precondition> {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    // The backend would report failed-precondition, which
                    // retries. A missing document is a user error.
                    return Err(invalid_argument("Can't update a document that doesn't exist."));
                }
                Ok(Precondition::UpdateTime(*version))
            }
            _ => Ok(Precondition::Exists(true)),
        }
    }

    fn write(&mut self, mutation: Mutation) -> FirestoreResult<()> {
        self.ensure_commit_not_called()?;
        self.written_docs.insert(mutation.key().clone());
        self.mutations.push(mutation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    use crate::firestore::api::operations::{parse_set_data, parse_update_data, SetOptions};
    use crate::firestore::core::credentials::EmptyCredentialsProvider;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set_data(value: i64) -> ParsedSetData {
        parse_set_data(
            Map::from([("x".to_string(), FirestoreValue::from(value))]),
            &SetOptions::default(),
            "Transaction.set",
        )
        .unwrap()
    }

    fn setup() -> (Arc<InMemoryDatastore>, Transaction) {
        let datastore = Arc::new(InMemoryDatastore::new());
        let transaction = Transaction::new(datastore.clone(), Arc::new(EmptyCredentialsProvider));
        (datastore, transaction)
    }

    #[tokio::test]
    async fn reads_must_precede_writes() {
        let (_, transaction) = setup();
        transaction.set(key("rooms/a"), set_data(1)).unwrap();
        let err = transaction.get(&key("rooms/a")).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(transaction.commit().await.unwrap_err().code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn write_after_read_commits_with_read_version() {
        let (datastore, transaction) = setup();
        datastore.seed_document(key("rooms/a"), MapValue::empty());

        let document = transaction.get(&key("rooms/a")).await.unwrap();
        assert!(document.is_found_document());
        transaction.set(key("rooms/a"), set_data(2)).unwrap();
        transaction.commit().await.unwrap();

        let stored = datastore.document(&key("rooms/a")).unwrap();
        assert_eq!(stored.data().fields().get("x"), Some(&FirestoreValue::from(2_i64)));
    }

    #[tokio::test]
    async fn concurrent_change_fails_commit() {
        let (datastore, transaction) = setup();
        datastore.seed_document(key("rooms/a"), MapValue::empty());

        transaction.get(&key("rooms/a")).await.unwrap();
        datastore.seed_document(key("rooms/a"), MapValue::empty());
        transaction.set(key("rooms/a"), set_data(2)).unwrap();

        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn read_only_documents_are_verified() {
        let (datastore, transaction) = setup();
        transaction.get(&key("rooms/missing")).await.unwrap();
        datastore.seed_document(key("rooms/missing"), MapValue::empty());

        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn updating_a_document_read_as_missing_is_rejected() {
        let (_, transaction) = setup();
        transaction.get(&key("rooms/missing")).await.unwrap();
        let update = parse_update_data(vec![("x", FirestoreValue::from(1_i64))], "Transaction.update").unwrap();
        let err = transaction.update(key("rooms/missing"), update).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn transaction_cannot_be_reused_after_commit() {
        let (_, transaction) = setup();
        transaction.commit().await.unwrap();
        assert!(transaction.delete(key("rooms/a")).is_err());
    }
}
