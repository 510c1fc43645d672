//! Driver configuration.

use nngpu_core::{ExecutorKind, FileSource, TableSource, TuningCache, TuningSource};
use std::path::PathBuf;
use std::sync::Arc;

/// Settings chosen once when the driver starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Backend every executor of this process uses.
    pub executor: ExecutorKind,
    /// Optional tuning table loaded ahead of the built-in one.
    pub tuning_file: Option<PathBuf>,
}

impl DriverConfig {
    pub fn new(executor: ExecutorKind) -> Self {
        Self {
            executor,
            tuning_file: None,
        }
    }

    pub fn with_tuning_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tuning_file = Some(path.into());
        self
    }

    /// Tuning cache for this configuration.
    ///
    /// Without a tuning file this is the shared process-wide cache. With one,
    /// a dedicated cache is built whose file entries shadow the built-in
    /// table.
    pub fn tuning_cache(&self) -> Arc<TuningCache> {
        match &self.tuning_file {
            None => TuningCache::global(),
            Some(path) => {
                let sources: Vec<Box<dyn TuningSource>> = vec![
                    Box::new(FileSource::new(path)),
                    Box::new(TableSource::builtin()),
                ];
                Arc::new(TuningCache::new(sources))
            }
        }
    }
}
