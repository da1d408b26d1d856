//! Callback dispatch with thread affinity.
//!
//! Every callback registered on a promise carries an [`Affinity`]. UI-affine
//! callbacks are marshalled through the host's [`UiThread`] port when they
//! are fired from another thread; background callbacks fired *from* the UI
//! thread are moved onto a single background executor so a slow callback
//! never blocks the UI thread.

use super::pool::PoolManager;
use crossbeam::channel::{unbounded, Sender};
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Run on whatever thread settles the promise, or on the background
    /// executor if that thread is the UI thread.
    #[default]
    Background,
    /// Run on the UI thread.
    Ui,
}

/// Port to the host's UI thread (main loop, event dispatch thread...).
pub trait UiThread: Send + Sync {
    fn is_current_thread(&self) -> bool;

    /// Queue `job` for execution on the UI thread.
    fn post(&self, job: Job);
}

struct BackgroundExecutor {
    sender: Sender<Job>,
}

impl BackgroundExecutor {
    fn spawn(name: String) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        thread::Builder::new().name(name).spawn(move || {
            tracing::trace!("callback executor starting");
            for job in receiver {
                run_isolated(job);
            }
            tracing::trace!("callback executor exiting");
        })?;
        Ok(Self { sender })
    }
}

struct DispatcherInner {
    ui: Option<Arc<dyn UiThread>>,
    background: Option<BackgroundExecutor>,
    pool: Weak<PoolManager>,
}

/// Routes callbacks according to their affinity. Shared by every promise
/// created by the same pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// A dispatcher without a UI thread: every callback runs inline on the
    /// thread that fires it.
    pub fn inline() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                ui: None,
                background: None,
                pool: Weak::new(),
            }),
        }
    }

    pub(crate) fn for_pool(
        ui: Option<Arc<dyn UiThread>>,
        thread_name: &str,
        pool: Weak<PoolManager>,
    ) -> std::io::Result<Self> {
        let background = match ui {
            Some(_) => Some(BackgroundExecutor::spawn(format!("{thread_name}-callbacks"))?),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(DispatcherInner { ui, background, pool }),
        })
    }

    pub(crate) fn pool(&self) -> Option<Arc<PoolManager>> {
        self.inner.pool.upgrade()
    }

    pub fn is_ui_thread(&self) -> bool {
        self.inner
            .ui
            .as_ref()
            .is_some_and(|ui| ui.is_current_thread())
    }

    pub fn dispatch(&self, affinity: Affinity, job: Job) {
        match (&self.inner.ui, affinity) {
            (None, _) => run_isolated(job),
            (Some(ui), Affinity::Ui) if !ui.is_current_thread() => {
                ui.post(Box::new(move || run_isolated(job)));
            }
            (Some(ui), Affinity::Background) if ui.is_current_thread() => {
                self.run_in_background(job);
            }
            _ => run_isolated(job),
        }
    }

    pub(crate) fn run_in_background(&self, job: Job) {
        match &self.inner.background {
            Some(executor) => {
                if let Err(rejected) = executor.sender.send(job) {
                    run_isolated(rejected.into_inner());
                }
            }
            None => run_isolated(job),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ui", &self.inner.ui.is_some())
            .field("pool", &(self.inner.pool.strong_count() > 0))
            .finish()
    }
}

/// Runs a callback, logging instead of propagating a panic so sibling
/// callbacks still fire.
pub(crate) fn run_isolated(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        let error = super::errors::TaskError::from_panic(payload);
        tracing::error!(%error, "callback panicked");
    }
}
