use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::util::log::LOGGER;

/// Failed watch stream attempts before the client reports itself offline.
const MAX_WATCH_STREAM_FAILURES: usize = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

/// Derives the client's online state from the health of the watch stream.
///
/// The state starts `Unknown`. The first watch response makes it `Online`.
/// It turns `Offline` after one failed connection attempt, or when a
/// connection attempt gets no response within the online state timeout.
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    timeout: Duration,
    on_change: OnlineStateHandler,
    state: StdMutex<TrackerState>,
}

struct TrackerState {
    online_state: OnlineState,
    watch_stream_failures: usize,
    online_state_timer: Option<DelayedOperation>,
    /// Cleared once the client was online, so the warning shows at most once
    /// and never after a successful connection.
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, on_change: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                timeout,
                on_change,
                state: StdMutex::new(TrackerState {
                    online_state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    online_state_timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        lock(&self.inner).online_state
    }

    /// Called on every watch stream connection attempt.
    pub fn handle_watch_stream_start(&self) {
        let mut state = lock(&self.inner);
        if state.watch_stream_failures != 0 {
            return;
        }
        let changed = set_state(&mut state, OnlineState::Unknown);
        if state.online_state_timer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let timeout = self.inner.timeout;
            state.online_state_timer = Some(self.inner.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                timeout,
                move || async move {
                    handle_timeout(weak, timeout);
                    Ok(())
                },
            ));
        }
        drop(state);
        self.broadcast(changed);
    }

    /// Called when the watch stream closed with an error.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let mut state = lock(&self.inner);
        let changed = if state.online_state == OnlineState::Online {
            // Reconnecting after a working connection is not a failure yet.
            set_state(&mut state, OnlineState::Unknown)
        } else {
            state.watch_stream_failures += 1;
            if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                clear_timer(&mut state);
                let reason = match error {
                    Some(error) => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                    None => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times."),
                };
                warn_offline(&mut state, &reason);
                set_state(&mut state, OnlineState::Offline)
            } else {
                None
            }
        };
        drop(state);
        self.broadcast(changed);
    }

    /// Sets the state explicitly, e.g. `Online` on a watch response or
    /// `Offline` when the network is disabled.
    pub fn set(&self, online_state: OnlineState) {
        let mut state = lock(&self.inner);
        clear_timer(&mut state);
        state.watch_stream_failures = 0;
        if online_state == OnlineState::Online {
            state.should_warn_client_is_offline = false;
        }
        let changed = set_state(&mut state, online_state);
        drop(state);
        self.broadcast(changed);
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(online_state) = changed {
            (self.inner.on_change)(online_state);
        }
    }
}

fn handle_timeout(weak: Weak<TrackerInner>, timeout: Duration) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let changed = {
        let mut state = lock(&inner);
        state.online_state_timer = None;
        if state.online_state != OnlineState::Unknown {
            return;
        }
        warn_offline(
            &mut state,
            &format!("Backend didn't respond within {} seconds.", timeout.as_secs()),
        );
        set_state(&mut state, OnlineState::Offline)
    };
    if let Some(online_state) = changed {
        (inner.on_change)(online_state);
    }
}

fn lock(inner: &TrackerInner) -> MutexGuard<'_, TrackerState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_state(state: &mut TrackerState, online_state: OnlineState) -> Option<OnlineState> {
    if state.online_state == online_state {
        return None;
    }
    state.online_state = online_state;
    Some(online_state)
}

fn clear_timer(state: &mut TrackerState) {
    if let Some(timer) = state.online_state_timer.take() {
        timer.cancel();
    }
}

fn warn_offline(state: &mut TrackerState, reason: &str) {
    let message = format!(
        "Could not reach the backend. {reason}\nThe client will operate in offline mode until it is able to connect."
    );
    if state.should_warn_client_is_offline {
        LOGGER.warn(message);
        state.should_warn_client_is_offline = false;
    } else {
        LOGGER.debug(message);
    }
}
