use std::collections::BTreeMap;

use crate::firestore::api::database::Firestore;
use crate::firestore::api::operations::{parse_set_data, parse_update_data, SetOptions};
use crate::firestore::error::{invalid_argument, resource_exhausted, FirestoreResult};
use crate::firestore::model::{IntoFieldPath, Mutation, Precondition};
use crate::firestore::value::FirestoreValue;

use super::reference::DocumentReference;

const MAX_BATCH_WRITES: usize = 500;

/// Collects writes and commits them as one atomic batch. The batch lands in
/// the local view as soon as it is committed, before the backend answers.
pub struct WriteBatch {
    firestore: Firestore,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub(crate) fn new(firestore: Firestore) -> Self {
        Self {
            firestore,
            mutations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn set(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: SetOptions,
    ) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        let parsed = parse_set_data(data, &options, "WriteBatch.set")?;
        self.mutations
            .push(parsed.into_mutation(reference.key().clone(), Precondition::None));
        Ok(self)
    }

    pub fn update<I, P>(&mut self, reference: &DocumentReference, entries: I) -> FirestoreResult<&mut Self>
    where
        I: IntoIterator<Item = (P, FirestoreValue)>,
        P: IntoFieldPath,
    {
        self.ensure_can_add(reference)?;
        let parsed = parse_update_data(entries, "WriteBatch.update")?;
        self.mutations
            .push(parsed.into_mutation(reference.key().clone(), Precondition::Exists(true)));
        Ok(self)
    }

    pub fn delete(&mut self, reference: &DocumentReference) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        self.mutations.push(Mutation::delete(reference.key().clone()));
        Ok(self)
    }

    /// Queues every write as one batch and resolves once the backend
    /// acknowledged or rejected it. An empty batch resolves immediately.
    pub async fn commit(self) -> FirestoreResult<()> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        self.firestore.client().write(self.mutations).await
    }

    fn ensure_can_add(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        if !self.firestore.same_instance(reference.firestore()) {
            return Err(invalid_argument(
                "Provided document reference is from a different Firestore instance.",
            ));
        }
        if self.mutations.len() >= MAX_BATCH_WRITES {
            return Err(resource_exhausted(
                "WriteBatch cannot contain more than 500 operations",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::firestore::core::{EmptyCredentialsProvider, FirestoreSettings};
    use crate::firestore::error::FirestoreErrorCode;
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

    fn fields(value: i64) -> BTreeMap<String, FirestoreValue> {
        BTreeMap::from([("count".to_string(), FirestoreValue::from(value))])
    }

    #[tokio::test]
    async fn batch_commits_all_writes() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let a = firestore.doc("counters/a").unwrap();
        let b = firestore.doc("counters/b").unwrap();

        let mut batch = firestore.batch();
        batch
            .set(&a, fields(1), SetOptions::default())
            .unwrap()
            .set(&b, fields(2), SetOptions::default())
            .unwrap()
            .update(&a, vec![("count", FirestoreValue::from(3_i64))])
            .unwrap();
        assert_eq!(batch.len(), 3);
        batch.commit().await.unwrap();

        let stored = datastore.document(a.key()).unwrap();
        assert_eq!(stored.data().fields().get("count"), Some(&FirestoreValue::from(3_i64)));
        assert!(datastore.document(b.key()).is_some());
    }

    #[tokio::test]
    async fn failed_precondition_rejects_the_whole_batch() {
        let datastore = InMemoryDatastore::new();
        let firestore = firestore(&datastore).await;
        let created = firestore.doc("counters/created").unwrap();
        let missing = firestore.doc("counters/missing").unwrap();

        let mut batch = firestore.batch();
        batch.set(&created, fields(1), SetOptions::default()).unwrap();
        batch
            .update(&missing, vec![("count", FirestoreValue::from(2_i64))])
            .unwrap();
        let err = batch.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::NotFound);
        assert!(datastore.document(created.key()).is_none());
    }

    #[tokio::test]
    async fn references_from_another_instance_are_rejected() {
        let datastore = InMemoryDatastore::new();
        let first = firestore(&datastore).await;
        let second = firestore(&datastore).await;
        let foreign = second.doc("counters/a").unwrap();

        let mut batch = first.batch();
        let err = batch.delete(&foreign).err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn batch_size_is_capped() {
        let firestore = firestore(&InMemoryDatastore::new()).await;
        let reference = firestore.doc("counters/a").unwrap();
        let mut batch = firestore.batch();
        for _ in 0..MAX_BATCH_WRITES {
            batch.delete(&reference).unwrap();
        }
        let err = batch.delete(&reference).err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::ResourceExhausted);
    }
}
