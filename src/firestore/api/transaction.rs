use std::collections::BTreeMap;

use crate::firestore::core::Transaction as CoreTransaction;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::IntoFieldPath;
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::operations::{parse_set_data, parse_update_data, SetOptions};
use super::reference::DocumentReference;
use super::snapshot::DocumentSnapshot;

/// Handle passed to the closure of `Firestore::run_transaction`. Every read
/// must happen before the first write.
#[derive(Clone)]
pub struct Transaction {
    firestore: Firestore,
    transaction: CoreTransaction,
}

impl Transaction {
    pub(crate) fn new(firestore: Firestore, transaction: CoreTransaction) -> Self {
        Self {
            firestore,
            transaction,
        }
    }

    /// Reads the document from the backend, bypassing the local cache.
    pub async fn get(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.ensure_same_instance(reference)?;
        let document = self.transaction.get(reference.key()).await?;
        Ok(DocumentSnapshot::from_document(self.firestore.clone(), &document, false))
    }

    pub fn set(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: SetOptions,
    ) -> FirestoreResult<&Self> {
        self.ensure_same_instance(reference)?;
        let parsed = parse_set_data(data, &options, "Transaction.set")?;
        self.transaction.set(reference.key().clone(), parsed)?;
        Ok(self)
    }

    pub fn update<I, P>(&self, reference: &DocumentReference, entries: I) -> FirestoreResult<&Self>
    where
        I: IntoIterator<Item = (P, FirestoreValue)>,
        P: IntoFieldPath,
    {
        self.ensure_same_instance(reference)?;
        let parsed = parse_update_data(entries, "Transaction.update")?;
        self.transaction.update(reference.key().clone(), parsed)?;
        Ok(self)
    }

    pub fn delete(&self, reference: &DocumentReference) -> FirestoreResult<&Self> {
        self.ensure_same_instance(reference)?;
        self.transaction.delete(reference.key().clone())?;
        Ok(self)
    }

    fn ensure_same_instance(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        if self.firestore.same_instance(reference.firestore()) {
            Ok(())
        } else {
            Err(invalid_argument(
                "Provided document reference is from a different Firestore instance.",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::firestore::core::{EmptyCredentialsProvider, FirestoreSettings};
    use crate::firestore::error::{FirestoreError, FirestoreErrorCode};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::value::{MapValue, ValueKind};

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

    fn count(value: i64) -> BTreeMap<String, FirestoreValue> {
        BTreeMap::from([("count".to_string(), FirestoreValue::from(value))])
    }

    #[tokio::test]
    async fn transaction_increments_a_counter() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let counter = firestore.doc("counters/visits").unwrap();
        datastore.seed_document(counter.key().clone(), MapValue::new(count(41)));

        let reference = counter.clone();
        let result = firestore
            .run_transaction(move |transaction| {
                let reference = reference.clone();
                async move {
                    let snapshot = transaction.get(&reference).await?;
                    let current = match snapshot.get("count").map(FirestoreValue::kind) {
                        Some(ValueKind::Integer(value)) => *value,
                        _ => 0,
                    };
                    transaction.set(&reference, count(current + 1), SetOptions::default())?;
                    Ok::<_, FirestoreError>(current + 1)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        let stored = datastore.document(counter.key()).unwrap();
        assert_eq!(stored.data().fields().get("count"), Some(&FirestoreValue::from(42_i64)));
    }

    #[tokio::test]
    async fn errors_from_the_closure_are_not_retried() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let attempts = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&attempts);
        let err = firestore
            .run_transaction(move |_transaction| {
                counted.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(invalid_argument("bad input")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
