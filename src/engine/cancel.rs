//! Cooperative cancellation.
//!
//! The run engine checks the flag between steps only. A step already issued
//! always runs to its barrier and is recorded.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation request for the active run.
///
/// Clones share state, so a handle can be given to drivers, UI tasks or test
/// closures and triggered synchronously from any of them.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl CancelFlag {
    /// Untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins.
    pub fn trigger(&self, reason: impl Into<String>) {
        let mut slot = self.reason.write();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given by the first trigger.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Clear the request before a new run.
    pub fn reset(&self) {
        *self.reason.write() = None;
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_and_reset() {
        let flag = CancelFlag::new();
        assert!(!flag.is_triggered());

        let handle = flag.clone();
        handle.trigger("operator");
        handle.trigger("second");

        assert!(flag.is_triggered());
        assert_eq!(flag.reason(), Some("operator".to_string()));

        flag.reset();
        assert!(!handle.is_triggered());
        assert_eq!(handle.reason(), None);
    }
}
