use std::future::Future;
use std::io;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .ok()
});

/// Spawns `future` on the current tokio runtime, or on a shared background
/// runtime when called outside of one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Runs `work` on the blocking thread pool of the current runtime, or of
/// the shared background runtime when called outside of one.
pub async fn run_blocking<F, T>(work: F) -> io::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => match BACKGROUND_RUNTIME.as_ref() {
            Some(runtime) => runtime.handle().clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "no runtime available for blocking work",
                ))
            }
        },
    };
    handle
        .spawn_blocking(work)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

/// Waits for `duration`. Zero durations return immediately.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Gives other tasks a chance to run.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocking_work_runs_off_the_async_worker() {
        let caller = std::thread::current().id();
        let worker = run_blocking(|| std::thread::current().id()).await.unwrap();
        assert_ne!(caller, worker);
    }

    #[tokio::test]
    async fn panicking_work_becomes_an_error() {
        let err = run_blocking(|| -> u32 { panic!("boom") }).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
