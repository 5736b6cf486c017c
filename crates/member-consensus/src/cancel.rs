//! Cooperative cancellation for validation workers.

use std::sync::atomic::{AtomicBool, Ordering};

/// A cooperative cancellation flag shared between the validation coordinator
/// and a worker. Workers poll it between transactions, at each signature
/// check, and on coin lookups; a set flag makes the worker return cleanly
/// without mutating shared state.
#[derive(Debug, Default)]
pub struct CancelToken {
    canceled: AtomicBool,
}

impl CancelToken {
    /// Create a token in the non-canceled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        token.cancel();
        assert!(token.is_canceled());
    }
}
