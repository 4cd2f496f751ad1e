//! Serialized delivery context for monitor callbacks

use crate::error::{Error, MonitorError, Result};
use once_cell::sync::OnceCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ContextInner {
    name: String,
    jobs: mpsc::Sender<Job>,
    thread: ThreadId,
}

/// A single thread that runs posted jobs one at a time, in posting order.
///
/// Clones share the same thread. The thread exits once every clone is
/// dropped and the queue is drained.
#[derive(Clone)]
pub struct DeliveryContext {
    inner: Arc<ContextInner>,
}

static MAIN_CONTEXT: OnceCell<DeliveryContext> = OnceCell::new();

impl DeliveryContext {
    /// Spawn a new context backed by a dedicated thread
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Delivery job panicked");
                    }
                }
            })
            .map_err(|e| Error::Monitor(MonitorError::DeliveryContext(e.to_string())))?;

        debug!("Spawned delivery context: {}", name);

        Ok(Self {
            inner: Arc::new(ContextInner {
                name,
                thread: handle.thread().id(),
                jobs: tx,
            }),
        })
    }

    /// The process-wide default context
    pub fn main() -> Result<Self> {
        MAIN_CONTEXT
            .get_or_try_init(|| Self::spawn("scopewatch-main"))
            .cloned()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the caller is running on this context's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Queue `job`; returns false if the context thread is gone
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.jobs.send(Box::new(job)).is_ok()
    }

    /// Block until every job posted before this call has run.
    ///
    /// Returns immediately when called from the context itself, since waiting
    /// there would never finish.
    pub fn sync(&self) {
        if self.is_current() {
            debug!("sync() called on {}; not waiting", self.inner.name);
            return;
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        if self.post(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.recv();
        }
    }
}

/// Two contexts are equal when they share one thread
impl PartialEq for DeliveryContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeliveryContext {}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("name", &self.inner.name)
            .finish()
    }
}
