//! Shared state of a running backup task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tvs_api_types::TapeError;

/// Cooperative cancellation token.
///
/// The engine and the archive writer poll this at stable points;
/// worst-case latency from request to observable `Cancelled` is one
/// chunk write.
#[derive(Default)]
pub struct TaskControl {
    abort: AtomicBool,
}

impl TaskControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn check_abort(&self) -> Result<(), TapeError> {
        if self.abort_requested() {
            return Err(TapeError::Cancelled);
        }
        Ok(())
    }
}

/// Externally observable progress counters.
///
/// Updated by the archive writer on every destination write; read by
/// the progress persister and by status consumers.
#[derive(Default)]
pub struct TaskProgress {
    bytes_written: AtomicU64,
    files_written: AtomicU64,
}

impl TaskProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bytes(&self, count: u64) {
        self.bytes_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_file(&self) {
        self.files_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn files_written(&self) -> u64 {
        self.files_written.load(Ordering::Relaxed)
    }
}
