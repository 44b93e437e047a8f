//! One-shot cancellation flag shared between the event loop and a worker.
//!
//! The event loop holds an [`AbortHandle`] and the worker polls the paired
//! [`AbortToken`] before every iteration. Raising the flag is idempotent and
//! never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Requesting side of an abort channel.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

/// Polling side of an abort channel.
#[derive(Debug, Clone)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
}

/// Create a connected handle/token pair.
pub fn abort_pair() -> (AbortHandle, AbortToken) {
    let flag = Arc::new(AtomicBool::new(false));
    (
        AbortHandle {
            flag: Arc::clone(&flag),
        },
        AbortToken { flag },
    )
}

impl AbortHandle {
    /// Request cancellation. Returns `true` if this call raised the flag.
    pub fn abort(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    /// Whether cancellation has been requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl AbortToken {
    /// Whether cancellation has been requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_visible_to_token() {
        let (handle, token) = abort_pair();
        assert!(!token.is_aborted());
        assert!(handle.abort());
        assert!(token.is_aborted());
        assert!(handle.is_aborted());
    }

    #[test]
    fn repeated_abort_is_idempotent() {
        let (handle, token) = abort_pair();
        assert!(handle.abort());
        assert!(!handle.abort());
        assert!(token.is_aborted());
    }

    #[test]
    fn token_is_visible_across_threads() {
        let (handle, token) = abort_pair();
        let worker = std::thread::spawn(move || {
            while !token.is_aborted() {
                std::thread::yield_now();
            }
            true
        });
        handle.abort();
        assert!(worker.join().unwrap_or(false));
    }
}
