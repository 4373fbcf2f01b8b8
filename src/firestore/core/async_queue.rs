//! Single logical thread of control for the engine.
//!
//! Every state change runs as a task on an [`AsyncQueue`]. Tasks run one at a
//! time in enqueue order; stream callbacks and timers never touch engine state
//! directly, they enqueue a task instead. A task must never await another task
//! enqueued on the same queue: the worker is busy running it.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::util::log::LOGGER;
use crate::platform::runtime;

/// Identifies the kind of a delayed task so tests can fast-forward it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Sentinel matching every timer in [`AsyncQueue::run_all_delayed_operations_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    TransactionRetry,
    AsyncQueueRetry,
}

type QueueTask = BoxFuture<'static, ()>;
type RetryableOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<QueueTask>,
    state: StdMutex<QueueState>,
    next_op_id: AtomicU64,
    retry_backoff: StdMutex<Option<ExponentialBackoff>>,
}

#[derive(Default)]
struct QueueState {
    delayed: Vec<DelayedOperation>,
    retryable: VecDeque<RetryableOp>,
    timer_ids_to_skip: HashSet<TimerId>,
    is_shutting_down: bool,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueueTask>();
        let inner = Arc::new(AsyncQueueInner {
            sender,
            state: StdMutex::new(QueueState::default()),
            next_op_id: AtomicU64::new(0),
            retry_backoff: StdMutex::new(None),
        });
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
        });
        Self { inner }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().is_shutting_down
    }

    /// Runs `op` on the queue and returns its result. Fails with
    /// `failed-precondition` once the queue is shutting down.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.enqueue_even_while_restricted(op).await
    }

    /// Like [`AsyncQueue::enqueue`] but also accepted during shutdown.
    pub async fn enqueue_even_while_restricted<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = async move {
            let result = op().await;
            let _ = tx.send(result);
        }
        .boxed();
        self.push(task)?;
        rx.await
            .map_err(|_| failed_precondition("The client has already been terminated."))?
    }

    /// Fire-and-forget variant used by callbacks and timers. Failures are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        self.enqueue_task_and_forget(op);
    }

    fn enqueue_task_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let task = async move {
            if let Err(err) = op().await {
                LOGGER.error(format!("Async queue task failed: {err}"));
            }
        }
        .boxed();
        let _ = self.push(task);
    }

    /// Runs `op` and then rejects every later enqueue.
    pub async fn enqueue_and_initiate_shutdown<F, Fut>(&self, op: F) -> FirestoreResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        {
            let mut state = self.lock_state();
            if state.is_shutting_down {
                return Ok(());
            }
            state.is_shutting_down = true;
        }
        if let Ok(mut backoff) = self.inner.retry_backoff.lock() {
            if let Some(backoff) = backoff.as_mut() {
                backoff.cancel();
            }
            *backoff = None;
        }
        self.enqueue_even_while_restricted(op).await
    }

    /// Queues an operation that is retried with backoff while it fails with a
    /// transient storage error. Retries never jump ahead of newer tasks.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync + 'static,
    {
        let start = {
            let mut state = self.lock_state();
            if state.is_shutting_down {
                return;
            }
            state.retryable.push_back(Arc::new(op));
            state.retryable.len() == 1
        };
        if start {
            let queue = self.clone();
            self.enqueue_task_and_forget(move || async move {
                queue.retry_next_op().await;
                Ok(())
            });
        }
    }

    fn retry_next_op(&self) -> BoxFuture<'static, ()> {
        let queue = self.clone();
        async move {
            let Some(op) = queue.lock_state().retryable.front().cloned() else {
                return;
            };
            match op().await {
                Ok(()) => {
                    let has_more = {
                        let mut state = queue.lock_state();
                        state.retryable.pop_front();
                        !state.retryable.is_empty()
                    };
                    queue.with_retry_backoff(|backoff| backoff.reset());
                    if has_more {
                        queue.schedule_retry();
                    }
                }
                Err(err) if is_retryable_storage_error(&err) => {
                    LOGGER.debug(format!("Operation failed with retryable error: {err}"));
                    queue.schedule_retry();
                }
                Err(err) => {
                    LOGGER.error(format!("Retryable operation failed permanently: {err}"));
                    queue.lock_state().retryable.pop_front();
                    queue.schedule_retry();
                }
            }
        }
        .boxed()
    }

    fn schedule_retry(&self) {
        if self.lock_state().retryable.is_empty() {
            return;
        }
        let queue = self.clone();
        self.with_retry_backoff(move |backoff| {
            backoff.backoff_and_run(move || async move {
                queue.retry_next_op().await;
                Ok(())
            })
        });
    }

    fn with_retry_backoff<R>(&self, f: impl FnOnce(&mut ExponentialBackoff) -> R) -> R {
        let mut guard = match self.inner.retry_backoff.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let backoff = guard
            .get_or_insert_with(|| ExponentialBackoff::new(self.clone(), TimerId::AsyncQueueRetry));
        f(backoff)
    }

    /// Schedules `op` to be enqueued after `delay`. Delays registered through
    /// [`AsyncQueue::skip_delays_for_timer_id`] are dropped.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let delay = if self.lock_state().timer_ids_to_skip.contains(&timer_id) {
            Duration::ZERO
        } else {
            delay
        };
        let id = self.inner.next_op_id.fetch_add(1, Ordering::SeqCst);
        let boxed: DelayedOp = Box::new(move || op().boxed());
        let operation = DelayedOperation {
            inner: Arc::new(DelayedOperationInner {
                id,
                timer_id,
                target_time: Instant::now() + delay,
                op: StdMutex::new(Some(boxed)),
                queue: Arc::downgrade(&self.inner),
            }),
        };
        self.lock_state().delayed.push(operation.clone());

        let timer = operation.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            timer.fire();
        });
        operation
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.lock_state()
            .delayed
            .iter()
            .any(|operation| operation.inner.timer_id == timer_id)
    }

    /// Future delayed operations with `timer_id` run without delay.
    pub fn skip_delays_for_timer_id(&self, timer_id: TimerId) {
        self.lock_state().timer_ids_to_skip.insert(timer_id);
    }

    /// Fires delayed operations in target-time order up to and including the
    /// first one with `last_timer_id`, then waits for the queue to drain.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        self.drain().await?;
        let mut delayed = self.lock_state().delayed.clone();
        delayed.sort_by_key(|operation| (operation.inner.target_time, operation.inner.id));
        for operation in delayed {
            operation.skip_delay();
            if last_timer_id != TimerId::All && operation.inner.timer_id == last_timer_id {
                break;
            }
        }
        self.drain().await
    }

    /// Resolves once every task enqueued before the call has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(|| async { Ok(()) }).await
    }

    fn push(&self, task: QueueTask) -> FirestoreResult<()> {
        self.inner
            .sender
            .try_send(task)
            .map_err(|_| failed_precondition("The async queue is closed."))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        lock_queue_state(&self.inner)
    }
}

fn lock_queue_state(inner: &AsyncQueueInner) -> std::sync::MutexGuard<'_, QueueState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn is_retryable_storage_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Unavailable | FirestoreErrorCode::Aborted
    )
}

type DelayedOp = Box<dyn FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send>;

/// Handle to a task scheduled with [`AsyncQueue::enqueue_after_delay`]. The
/// task runs at most once.
#[derive(Clone)]
pub struct DelayedOperation {
    inner: Arc<DelayedOperationInner>,
}

struct DelayedOperationInner {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    op: StdMutex<Option<DelayedOp>>,
    queue: Weak<AsyncQueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.inner.timer_id
    }

    /// Drops the task if it has not run yet.
    pub fn cancel(&self) {
        let _ = self.take_op();
    }

    /// Enqueues the task now instead of at its target time.
    pub fn skip_delay(&self) {
        self.fire();
    }

    fn fire(&self) {
        let Some(op) = self.take_op() else {
            return;
        };
        if let Some(inner) = self.inner.queue.upgrade() {
            let queue = AsyncQueue { inner };
            queue.enqueue_and_forget(op);
        }
    }

    fn take_op(&self) -> Option<DelayedOp> {
        let op = match self.inner.op.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(queue) = self.inner.queue.upgrade() {
            lock_queue_state(&queue)
                .delayed
                .retain(|operation| operation.inner.id != self.inner.id);
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn runs_tasks_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(move || async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        let result = queue.enqueue(|| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_operations_can_be_fast_forwarded() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (timer, label) in [
            (TimerId::ListenStreamIdle, "idle"),
            (TimerId::OnlineStateTimeout, "online"),
        ] {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(timer, Duration::from_secs(60), move || async move {
                log.lock().unwrap().push(label);
                Ok(())
            });
        }
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        queue
            .run_all_delayed_operations_until(TimerId::ListenStreamIdle)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["idle"]);

        queue.run_all_delayed_operations_until(TimerId::All).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["idle", "online"]);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn cancelled_operations_never_run() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let operation = queue.enqueue_after_delay(
            TimerId::WriteStreamIdle,
            Duration::from_secs(60),
            move || async move {
                *flag.lock().unwrap() = true;
                Ok(())
            },
        );
        operation.cancel();
        queue.run_all_delayed_operations_until(TimerId::All).await.unwrap();
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn rejects_tasks_after_shutdown() {
        let queue = AsyncQueue::new();
        queue
            .enqueue_and_initiate_shutdown(|| async { Ok(()) })
            .await
            .unwrap();
        let err = queue.enqueue(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn retryable_operations_retry_until_success() {
        let queue = AsyncQueue::new();
        queue.skip_delays_for_timer_id(TimerId::AsyncQueueRetry);
        let attempts = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            async move {
                let mut attempts = counter.lock().unwrap();
                *attempts += 1;
                if *attempts < 3 {
                    Err(crate::firestore::error::unavailable("disk busy"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        for _ in 0..10 {
            queue.run_all_delayed_operations_until(TimerId::All).await.unwrap();
            if *attempts.lock().unwrap() >= 3 {
                break;
            }
        }
        assert_eq!(*attempts.lock().unwrap(), 3);
    }
}
