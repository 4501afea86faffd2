use std::{future::Future, sync::Arc, thread};

use snafu::ResultExt;
use tokio::{
    runtime::{Builder, Handle},
    sync::oneshot,
    task::JoinHandle,
};

use super::error::{BuildRuntimeSnafu, NoRuntimeSnafu, SchedulerError, SpawnWorkerSnafu};

/// Executor for refill jobs.
///
/// Every limiter started on the same scheduler shares its worker: a slow refill in one
/// limiter delays the refills of the others. Whoever composes the limiters owns the
/// scheduler; a dedicated worker shuts down once the last clone is dropped, cancelling
/// every refill job still running on it.
#[derive(Clone, Debug)]
pub struct RefillScheduler {
    handle: Handle,
    worker: Option<Arc<Worker>>,
}

#[derive(Debug)]
struct Worker {
    name: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        debug!(message = "Refill worker shutting down.", worker = %self.name);
    }
}

impl RefillScheduler {
    /// Starts a single-threaded runtime on its own OS thread.
    pub fn dedicated(name: impl Into<String>) -> Result<Self, SchedulerError> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context(BuildRuntimeSnafu)?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Either an explicit shutdown or the sender being dropped ends the worker.
                runtime.block_on(async move {
                    let _ = stopped.await;
                });
            })
            .context(SpawnWorkerSnafu { name: name.clone() })?;

        debug!(message = "Refill worker started.", worker = %name);
        Ok(Self {
            handle,
            worker: Some(Arc::new(Worker {
                name,
                shutdown: Some(shutdown),
            })),
        })
    }

    /// Runs refill jobs on an existing runtime. Its lifetime is owned by the caller.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            worker: None,
        }
    }

    /// Runs refill jobs on the runtime the caller is executing on.
    pub fn current() -> Result<Self, SchedulerError> {
        Handle::try_current()
            .map(Self::from_handle)
            .context(NoRuntimeSnafu)
    }

    /// Whether this scheduler owns its worker thread.
    pub fn is_dedicated(&self) -> bool {
        self.worker.is_some()
    }

    pub(crate) fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(job)
    }
}
