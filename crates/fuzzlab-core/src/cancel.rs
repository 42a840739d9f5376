use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, one-way cancellation flag. Cloning yields a handle to the same flag.
///
/// `force` escalates a cancellation: process trees that are being torn down
/// skip the rest of their grace period and are killed outright.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn force(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.forced.store(true, Ordering::SeqCst);
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }
}
