use std::future::Future;

use futures::channel::oneshot;

use crate::firestore::core::async_queue::{AsyncQueue, TimerId};
use crate::firestore::core::credentials::CredentialsProviderArc;
use crate::firestore::core::transaction::Transaction;
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::remote::datastore::DatastoreArc;
use crate::firestore::remote::rpc_error::is_retryable_transaction_error;
use crate::firestore::util::log::LOGGER;

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Runs an update function in a fresh [`Transaction`] until it commits,
/// retrying with backoff on contention.
pub struct TransactionRunner<F> {
    datastore: DatastoreArc,
    credentials: CredentialsProviderArc,
    update_fn: F,
    attempts_remaining: usize,
    backoff: ExponentialBackoff,
}

impl<F, Fut, T> TransactionRunner<F>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    pub fn new(
        queue: AsyncQueue,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        max_attempts: usize,
        update_fn: F,
    ) -> Self {
        Self {
            datastore,
            credentials,
            update_fn,
            attempts_remaining: max_attempts.max(1),
            backoff: ExponentialBackoff::new(queue, TimerId::TransactionRetry),
        }
    }

    pub async fn run(mut self) -> FirestoreResult<T> {
        loop {
            self.attempts_remaining -= 1;
            self.wait_for_backoff().await?;

            let transaction = Transaction::new(self.datastore.clone(), self.credentials.clone());
            let result = match (self.update_fn)(transaction.clone()).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if self.attempts_remaining > 0 && is_retryable_transaction_error(&err) => {
                    LOGGER.debug(format!(
                        "Retrying transaction after {err} ({} attempts left)",
                        self.attempts_remaining
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves once the backoff timer for the next attempt fires on the
    /// queue.
    async fn wait_for_backoff(&mut self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.backoff.backoff_and_run(move || async move {
            let _ = sender.send(());
            Ok(())
        });
        receiver
            .await
            .map_err(|_| failed_precondition("The client has already been terminated."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::firestore::api::operations::{parse_set_data, SetOptions};
    use crate::firestore::core::credentials::EmptyCredentialsProvider;
    use crate::firestore::error::{aborted, invalid_argument, FirestoreErrorCode};
    use crate::firestore::model::DocumentKey;
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn fast_queue() -> AsyncQueue {
        let queue = AsyncQueue::new();
        queue.skip_delays_for_timer_id(TimerId::TransactionRetry);
        queue
    }

    #[tokio::test]
    async fn retries_when_the_read_document_changes() {
        let queue = fast_queue();
        let datastore = Arc::new(InMemoryDatastore::new());
        datastore.seed_document(key(), MapValue::empty());
        let attempts = Arc::new(AtomicUsize::new(0));

        let backend = datastore.clone();
        let counter = attempts.clone();
        let runner = TransactionRunner::new(
            queue,
            datastore.clone(),
            Arc::new(EmptyCredentialsProvider),
            DEFAULT_MAX_ATTEMPTS,
            move |transaction: Transaction| {
                let backend = backend.clone();
                let counter = counter.clone();
                async move {
                    transaction.get(&key()).await?;
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        backend.seed_document(key(), MapValue::empty());
                    }
                    let data = parse_set_data(
                        BTreeMap::from([("x".to_string(), FirestoreValue::from(1_i64))]),
                        &SetOptions::default(),
                        "Transaction.set",
                    )?;
                    transaction.set(key(), data)?;
                    Ok("done")
                }
            },
        );

        assert_eq!(runner.run().await.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(datastore.document(&key()).unwrap().data().fields().contains_key("x"));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let runner = TransactionRunner::new(
            fast_queue(),
            Arc::new(InMemoryDatastore::new()),
            Arc::new(EmptyCredentialsProvider),
            DEFAULT_MAX_ATTEMPTS,
            move |_transaction: Transaction| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(invalid_argument("bad input")) }
            },
        );

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let runner = TransactionRunner::new(
            fast_queue(),
            Arc::new(InMemoryDatastore::new()),
            Arc::new(EmptyCredentialsProvider),
            DEFAULT_MAX_ATTEMPTS,
            move |_transaction: Transaction| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(aborted("contention")) }
            },
        );

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(attempts.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
    }
}
