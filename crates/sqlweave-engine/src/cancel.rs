//! Run cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that stops one run at the next opportunity.
///
/// Once raised, no new level starts and models still waiting for a worker
/// are skipped; models already executing finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());

        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
