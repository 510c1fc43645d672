//! Prepared models and concurrent request execution.
//!
//! Every accepted `execute` runs on its own worker thread. Dropping the
//! `PreparedModel` joins every worker before the executor (and with it the
//! model's GPU resources) is released.

use crate::callback::ExecutionCallback;
use crate::error::Result;
use crate::executor::Executor;
use crate::manager::ExecutorManager;
use nngpu_core::{ErrorStatus, Model, Request, validate_request};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A model that has been validated and set up on the backend.
pub struct PreparedModel {
    executor: Arc<Executor>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_request: AtomicUsize,
}

impl PreparedModel {
    /// Create and initialize an executor for `model`.
    ///
    /// The model must already have passed `validate_model`.
    #[tracing::instrument(skip_all, fields(operations = model.operations.len()))]
    pub fn prepare(manager: &ExecutorManager, model: Model) -> Result<Self> {
        let mut executor = manager.create_executor(Arc::new(model))?;
        executor.init_per_model(manager.registry())?;
        Ok(Self {
            executor: Arc::new(executor),
            workers: Mutex::new(Vec::new()),
            next_request: AtomicUsize::new(0),
        })
    }

    pub fn model(&self) -> &Model {
        self.executor.model()
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate `request` and run it on a new worker thread.
    ///
    /// Returns the status of the launch. `callback` is notified with the
    /// final status: immediately with `InvalidArgument` when validation
    /// fails, otherwise once the worker finishes.
    #[tracing::instrument(skip_all)]
    pub fn execute(&self, request: Request, callback: Arc<dyn ExecutionCallback>) -> ErrorStatus {
        if let Err(e) = validate_request(&request, self.executor.model()) {
            warn!(error = %e, "rejected request");
            callback.notify(ErrorStatus::InvalidArgument);
            return ErrorStatus::InvalidArgument;
        }

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let executor = Arc::clone(&self.executor);
        let worker_callback = Arc::clone(&callback);
        let spawned = thread::Builder::new()
            .name(format!("nngpu-exec-{id}"))
            .spawn(move || {
                let status = match executor.run(&request) {
                    Ok(dispatches) => {
                        debug!(request = id, dispatches, "request finished");
                        ErrorStatus::Success
                    }
                    Err(e) => {
                        warn!(request = id, error = %e, "request failed");
                        ErrorStatus::GeneralFailure
                    }
                };
                worker_callback.notify(status);
            });

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers();
                reap_finished(&mut workers);
                workers.push(handle);
                ErrorStatus::Success
            }
            Err(e) => {
                warn!(request = id, error = %e, "failed to spawn execution thread");
                callback.notify(ErrorStatus::GeneralFailure);
                ErrorStatus::GeneralFailure
            }
        }
    }

    /// Number of requests still running.
    pub fn in_flight(&self) -> usize {
        self.workers()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) =
        workers.drain(..).partition(|handle| handle.is_finished());
    for handle in finished {
        if handle.join().is_err() {
            warn!("execution thread panicked");
        }
    }
    *workers = running;
}

impl Drop for PreparedModel {
    fn drop(&mut self) {
        let workers = std::mem::take(self.workers.get_mut().unwrap_or_else(|p| p.into_inner()));
        let draining = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                warn!("execution thread panicked");
            }
        }
        info!(draining, "released prepared model");
    }
}
