use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::credentials::{CredentialsProviderArc, Token};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::remote::datastore::StreamConnection;
use crate::platform::runtime;
use crate::util::backoff::BackoffConfig;

pub type StreamOpener<Req, Resp> = Arc<
    dyn Fn(Option<Token>) -> BoxFuture<'static, FirestoreResult<Arc<dyn StreamConnection<Req, Resp>>>>
        + Send
        + Sync,
>;

/// Receives the events of a [`PersistentStream`]. Every callback runs as a
/// task on the async queue.
#[async_trait]
pub trait StreamHandler<Resp>: Send + Sync + 'static
where
    Resp: Send + 'static,
{
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: Resp) -> FirestoreResult<()>;

    /// The stream closed on its own: after an error, when the backend ended
    /// it, or after the idle timeout. Not called for [`PersistentStream::stop`].
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped. `start` opens it right away.
    Initial,
    /// Waiting for credentials and the connection.
    Starting,
    Open,
    /// Closed after an error. `start` waits for the backoff first.
    Error,
    /// Waiting for the backoff delay before `Starting`.
    Backoff,
    /// Shut down for good.
    Closed,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub label: &'static str,
    pub idle_timer_id: TimerId,
    pub backoff_timer_id: TimerId,
    pub idle_timeout: Duration,
    pub backoff: BackoffConfig,
}

/// A stream that reconnects with exponential backoff and closes itself after
/// an idle period.
///
/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Starting -> ...
///    ^__________________stop()__________________|
/// ```
///
/// Connections are opened and read on detached tasks; their results are
/// delivered through the async queue and dropped once the stream has moved
/// on to a newer connection.
pub struct PersistentStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    inner: Arc<StreamInner<Req, Resp>>,
}

impl<Req, Resp> Clone for PersistentStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StreamInner<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    queue: AsyncQueue,
    label: &'static str,
    idle_timer_id: TimerId,
    idle_timeout: Duration,
    credentials: CredentialsProviderArc,
    opener: StreamOpener<Req, Resp>,
    handler: Arc<dyn StreamHandler<Resp>>,
    shared: StdMutex<StreamShared<Req, Resp>>,
}

struct StreamShared<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    state: StreamState,
    /// Bumped on every close; callbacks of older connections are ignored.
    close_count: u64,
    connection: Option<Arc<dyn StreamConnection<Req, Resp>>>,
    idle_timer: Option<DelayedOperation>,
    backoff: ExponentialBackoff,
}

impl<Req, Resp> PersistentStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        queue: AsyncQueue,
        config: StreamConfig,
        credentials: CredentialsProviderArc,
        opener: StreamOpener<Req, Resp>,
        handler: Arc<dyn StreamHandler<Resp>>,
    ) -> Self {
        let backoff = ExponentialBackoff::with_config(queue.clone(), config.backoff_timer_id, config.backoff);
        Self {
            inner: Arc::new(StreamInner {
                queue,
                label: config.label,
                idle_timer_id: config.idle_timer_id,
                idle_timeout: config.idle_timeout,
                credentials,
                opener,
                handler,
                shared: StdMutex::new(StreamShared {
                    state: StreamState::Initial,
                    close_count: 0,
                    connection: None,
                    idle_timer: None,
                    backoff,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamShared<Req, Resp>> {
        match self.inner.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Started streams are opening, open or waiting for their backoff.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    pub fn start(&self) {
        let generation = {
            let mut shared = self.lock();
            match shared.state {
                StreamState::Error => {
                    self.perform_backoff(&mut shared);
                    return;
                }
                StreamState::Initial => {}
                _ => return,
            }
            shared.state = StreamState::Starting;
            shared.close_count
        };
        self.open_connection(generation);
    }

    /// Closes the stream without notifying the handler.
    pub async fn stop(&self) {
        if self.is_started() {
            let connection = self.close_internal(StreamState::Initial, None);
            close_connection(connection).await;
        }
    }

    /// Stops the stream for good.
    pub async fn shutdown(&self) {
        let connection = self.close_internal(StreamState::Closed, None);
        close_connection(connection).await;
    }

    /// After an error, lets the next `start` skip the backoff.
    pub fn inhibit_backoff(&self) {
        let mut shared = self.lock();
        if matches!(shared.state, StreamState::Error | StreamState::Initial) {
            shared.state = StreamState::Initial;
            shared.backoff.reset();
        }
    }

    /// Schedules an idle close unless one is pending. Any send cancels it.
    pub fn mark_idle(&self) {
        let mut shared = self.lock();
        if shared.state != StreamState::Open || shared.idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        shared.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.idle_timer_id,
            self.inner.idle_timeout,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    PersistentStream { inner }.handle_idle_close().await?;
                }
                Ok(())
            },
        ));
    }

    pub async fn send(&self, request: Req) {
        let connection = {
            let mut shared = self.lock();
            if let Some(timer) = shared.idle_timer.take() {
                timer.cancel();
            }
            shared.connection.clone()
        };
        let Some(connection) = connection else {
            log::debug!("{} stream is not open, dropping request", self.inner.label);
            return;
        };
        // A failed send also ends the read side, which closes the stream.
        if let Err(err) = connection.send(request).await {
            log::debug!("{} stream send failed: {err}", self.inner.label);
        }
    }

    fn perform_backoff(&self, shared: &mut StreamShared<Req, Resp>) {
        shared.state = StreamState::Backoff;
        let weak = Arc::downgrade(&self.inner);
        shared.backoff.backoff_and_run(move || async move {
            if let Some(inner) = weak.upgrade() {
                PersistentStream { inner }.start_after_backoff();
            }
            Ok(())
        });
    }

    fn start_after_backoff(&self) {
        let generation = {
            let mut shared = self.lock();
            if shared.state != StreamState::Backoff {
                return;
            }
            shared.state = StreamState::Starting;
            shared.close_count
        };
        self.open_connection(generation);
    }

    fn open_connection(&self, generation: u64) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            let result = match stream.inner.credentials.get_token(false).await {
                Ok(token) => (stream.inner.opener)(token).await,
                Err(err) => Err(err),
            };
            let queue = stream.inner.queue.clone();
            queue.enqueue_and_forget(move || async move {
                stream.on_connection_result(generation, result).await
            });
        });
    }

    async fn on_connection_result(
        &self,
        generation: u64,
        result: FirestoreResult<Arc<dyn StreamConnection<Req, Resp>>>,
    ) -> FirestoreResult<()> {
        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                let current = {
                    let shared = self.lock();
                    shared.close_count == generation && shared.state == StreamState::Starting
                };
                if current {
                    log::debug!("{} stream failed to open: {err}", self.inner.label);
                    return self.close_with(StreamState::Error, Some(err)).await;
                }
                return Ok(());
            }
        };

        let accepted = {
            let mut shared = self.lock();
            if shared.close_count == generation && shared.state == StreamState::Starting {
                shared.state = StreamState::Open;
                shared.connection = Some(Arc::clone(&connection));
                true
            } else {
                false
            }
        };
        if !accepted {
            connection.close().await;
            return Ok(());
        }

        log::debug!("{} stream opened", self.inner.label);
        self.spawn_reader(generation, connection);
        self.inner.handler.on_open().await
    }

    fn spawn_reader(&self, generation: u64, connection: Arc<dyn StreamConnection<Req, Resp>>) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                match connection.next().await {
                    Some(Ok(message)) => {
                        let target = stream.clone();
                        stream.inner.queue.enqueue_and_forget(move || async move {
                            target.on_message_received(generation, message).await
                        });
                    }
                    Some(Err(err)) => {
                        let target = stream.clone();
                        stream.inner.queue.enqueue_and_forget(move || async move {
                            target.on_connection_closed(generation, Some(err)).await
                        });
                        break;
                    }
                    None => {
                        let target = stream.clone();
                        stream.inner.queue.enqueue_and_forget(move || async move {
                            target.on_connection_closed(generation, None).await
                        });
                        break;
                    }
                }
            }
        });
    }

    async fn on_message_received(&self, generation: u64, message: Resp) -> FirestoreResult<()> {
        {
            let mut shared = self.lock();
            if shared.close_count != generation || shared.state != StreamState::Open {
                return Ok(());
            }
            shared.backoff.reset();
        }
        self.inner.handler.on_message(message).await
    }

    async fn on_connection_closed(&self, generation: u64, error: Option<FirestoreError>) -> FirestoreResult<()> {
        {
            let shared = self.lock();
            if shared.close_count != generation || shared.state != StreamState::Open {
                return Ok(());
            }
        }
        match &error {
            Some(err) => log::debug!("{} stream closed with error: {err}", self.inner.label),
            None => log::debug!("{} stream closed by the backend", self.inner.label),
        }
        self.close_with(StreamState::Error, error).await
    }

    async fn handle_idle_close(&self) -> FirestoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        log::debug!("{} stream closing after idle timeout", self.inner.label);
        self.close_with(StreamState::Initial, None).await
    }

    async fn close_with(&self, final_state: StreamState, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let connection = self.close_internal(final_state, error.as_ref());
        close_connection(connection).await;
        self.inner.handler.on_close(error).await
    }

    fn close_internal(
        &self,
        final_state: StreamState,
        error: Option<&FirestoreError>,
    ) -> Option<Arc<dyn StreamConnection<Req, Resp>>> {
        let mut shared = self.lock();
        if let Some(timer) = shared.idle_timer.take() {
            timer.cancel();
        }
        shared.backoff.cancel();
        shared.close_count += 1;

        if final_state != StreamState::Error {
            shared.backoff.reset();
        } else if let Some(error) = error {
            match error.code {
                FirestoreErrorCode::ResourceExhausted => {
                    log::warn!(
                        "{} stream: backend reported resource exhaustion, backing off for the maximum delay",
                        self.inner.label
                    );
                    shared.backoff.reset_to_max();
                }
                FirestoreErrorCode::Unauthenticated => {
                    self.inner.credentials.invalidate_token();
                }
                _ => {}
            }
        }

        if shared.state != StreamState::Closed {
            shared.state = final_state;
        }
        shared.connection.take()
    }
}

async fn close_connection<Req, Resp>(connection: Option<Arc<dyn StreamConnection<Req, Resp>>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    if let Some(connection) = connection {
        connection.close().await;
    }
}
