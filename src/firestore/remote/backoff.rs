use std::time::{Duration, Instant};

use futures::Future;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::util::log::LOGGER;
use crate::util::backoff::{jittered_delay, BackoffConfig};

/// Delays retries of an operation with exponentially growing, jittered
/// delays. The delayed operation runs on the queue under `timer_id`.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    config: BackoffConfig,
    current_base: Duration,
    last_attempt: Instant,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId) -> Self {
        Self::with_config(queue, timer_id, BackoffConfig::default())
    }

    pub fn with_config(queue: AsyncQueue, timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            queue,
            timer_id,
            config,
            current_base: Duration::ZERO,
            last_attempt: Instant::now(),
            timer: None,
        }
    }

    /// Next attempt runs immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Next attempt waits the maximum delay, used after the backend reports
    /// resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Schedules `op` after the current backoff delay, minus the time already
    /// spent since the previous attempt, and grows the delay.
    pub fn backoff_and_run<F, Fut>(&mut self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        self.cancel();

        let desired = jittered_delay(self.current_base, &self.config);
        let elapsed = self.last_attempt.elapsed();
        let remaining = desired.saturating_sub(elapsed);
        if !remaining.is_zero() {
            LOGGER.debug(format!(
                "Backing off for {} ms (base delay: {} ms, delay with jitter: {} ms, last attempt: {} ms ago)",
                remaining.as_millis(),
                self.current_base.as_millis(),
                desired.as_millis(),
                elapsed.as_millis()
            ));
        }

        self.last_attempt = Instant::now() + remaining;
        self.timer = Some(self.queue.enqueue_after_delay(self.timer_id, remaining, op));
        self.current_base = self.config.next_base(self.current_base);
    }

    /// Runs a pending attempt now.
    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn delays_grow_and_reset() {
        let queue = AsyncQueue::new();
        let mut backoff = ExponentialBackoff::new(queue.clone(), TimerId::ListenStreamConnectionBackoff);
        let runs = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            backoff.backoff_and_run(move || async move {
                *runs.lock().unwrap() += 1;
                Ok(())
            });
            queue
                .run_all_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
                .await
                .unwrap();
        }
        assert_eq!(*runs.lock().unwrap(), 3);
        assert_eq!(backoff.current_base(), Duration::from_millis(2_250));

        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::ZERO);
    }

    #[tokio::test]
    async fn cancel_drops_pending_attempt() {
        let queue = AsyncQueue::new();
        let mut backoff = ExponentialBackoff::new(queue.clone(), TimerId::WriteStreamConnectionBackoff);
        backoff.reset_to_max();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        backoff.backoff_and_run(move || async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamConnectionBackoff));
        backoff.cancel();
        queue.run_all_delayed_operations_until(TimerId::All).await.unwrap();
        assert!(!*ran.lock().unwrap());
    }
}
