//! Completion callbacks for asynchronous preparation and execution.

use crate::prepared::PreparedModel;
use nngpu_core::ErrorStatus;
use std::sync::{Arc, Condvar, Mutex};

/// Receives the outcome of one execution.
pub trait ExecutionCallback: Send + Sync {
    fn notify(&self, status: ErrorStatus);
}

/// Receives the outcome of model preparation.
pub trait PreparedModelCallback: Send + Sync {
    fn notify(&self, status: ErrorStatus, prepared: Option<Arc<PreparedModel>>);
}

/// A value that is set once and waited for.
struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn set(&self, value: T) {
        let mut guard = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(value);
        }
        self.ready.notify_all();
    }

    fn get(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn wait(&self) -> T {
        let mut guard = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Execution callback that blocks `wait` until notified.
///
/// Only the first notification is kept.
pub struct ExecutionNotifier {
    slot: Slot<ErrorStatus>,
}

impl ExecutionNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slot: Slot::new() })
    }

    /// Block until the execution finishes and return its status.
    pub fn wait(&self) -> ErrorStatus {
        self.slot.wait()
    }

    /// Status if already notified.
    pub fn status(&self) -> Option<ErrorStatus> {
        self.slot.get()
    }
}

impl ExecutionCallback for ExecutionNotifier {
    fn notify(&self, status: ErrorStatus) {
        self.slot.set(status);
    }
}

/// Preparation callback that blocks `wait` until notified.
pub struct PreparedNotifier {
    slot: Slot<(ErrorStatus, Option<Arc<PreparedModel>>)>,
}

impl PreparedNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slot: Slot::new() })
    }

    /// Block until preparation finishes and return its status.
    pub fn wait(&self) -> ErrorStatus {
        self.slot.wait().0
    }

    /// The prepared model, once preparation has succeeded.
    pub fn prepared_model(&self) -> Option<Arc<PreparedModel>> {
        self.slot.get().and_then(|(_, prepared)| prepared)
    }
}

impl PreparedModelCallback for PreparedNotifier {
    fn notify(&self, status: ErrorStatus, prepared: Option<Arc<PreparedModel>>) {
        self.slot.set((status, prepared));
    }
}
