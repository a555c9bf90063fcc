use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;

/// A unit of work handed off the reactor thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool that runs request handlers off the reactor thread.
///
/// Tasks run on the blocking threads of a dedicated tokio runtime. A
/// semaphore caps how many tasks may be queued or running at once, so
/// submission never waits: a saturated pool hands the task straight back.
pub struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    handle: tokio::runtime::Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(threads: usize, max_pending: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("nbhttp-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            permits: Arc::new(Semaphore::new(max_pending.max(1))),
        })
    }

    /// Schedules `task` if a slot is free, otherwise returns it to the caller.
    pub fn try_submit(&self, task: Task) -> Result<(), Task> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(task),
        };

        self.handle.spawn_blocking(move || {
            let _permit = permit;
            task();
        });
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuses new work and waits up to `deadline` for running tasks.
    ///
    /// Tasks still running after the deadline are abandoned, not interrupted.
    /// Must not be called from inside a tokio runtime.
    pub fn shutdown(&self, deadline: Duration) {
        self.permits.close();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(deadline);
        }
    }
}
