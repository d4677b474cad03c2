//! Non-blocking mutual exclusion for periodic passes (queue drain, reconciliation)

use std::sync::atomic::{AtomicBool, Ordering};

/// Flag that at most one holder can own at a time
#[derive(Debug, Default)]
pub struct ExclusiveFlag {
    busy: AtomicBool,
}

impl ExclusiveFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when another pass already holds the flag
    pub fn try_acquire(&self) -> Option<ExclusiveGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExclusiveGuard { flag: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the flag on drop
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    flag: &'a ExclusiveFlag,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let flag = ExclusiveFlag::new();
        let guard = flag.try_acquire();
        assert!(guard.is_some());
        assert!(flag.try_acquire().is_none());
        drop(guard);
        assert!(!flag.is_held());
        assert!(flag.try_acquire().is_some());
    }
}
