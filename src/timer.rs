use std::{io, time::Duration};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

/// One-shot timers for queue and execution timeouts, on a small runtime of
/// its own so the pool works without an ambient tokio runtime.
pub(crate) struct Timer {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Timer {
    pub fn new(thread_name: &str) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{thread_name}-timer"))
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Runs `fire` after `delay` unless the returned token is cancelled
    /// first. `fire` runs on the blocking pool, never on the timer thread.
    pub fn schedule<F>(&self, delay: Duration, fire: F) -> CancellationToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !cancelled.is_cancelled() {
                        tokio::task::spawn_blocking(fire);
                    }
                }
                _ = cancelled.cancelled() => {}
            }
        });
        token
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
