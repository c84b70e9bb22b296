//! Payload Memory Budget
//!
//! One budget bounds the payload bytes buffered across every log of a
//! writer. Appends acquire at entry and the bytes go back when a batch
//! finishes, when blocked appends are dropped, or when the encoder
//! consumes payloads in destroy mode.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

struct BudgetInner {
    limit: i64,
    used: AtomicI64,
}

impl MemoryBudget {
    /// `limit < 0` means unbounded.
    pub fn new(limit: i64) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                used: AtomicI64::new(0),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(-1)
    }

    /// Reserve `bytes`; refuses when the budget would be exceeded.
    pub fn acquire(&self, bytes: usize) -> bool {
        let bytes = bytes as i64;
        if self.inner.limit < 0 {
            self.inner.used.fetch_add(bytes, Ordering::AcqRel);
            return true;
        }
        let mut current = self.inner.used.load(Ordering::Acquire);
        loop {
            if current + bytes > self.inner.limit {
                return false;
            }
            match self.inner.used.compare_exchange(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let prev = self.inner.used.fetch_sub(bytes as i64, Ordering::AcqRel);
        debug_assert!(prev >= bytes as i64, "memory budget released below zero");
    }

    pub fn used(&self) -> i64 {
        self.inner.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let budget = MemoryBudget::new(100);
        assert!(budget.acquire(60));
        assert!(!budget.acquire(50));
        assert!(budget.acquire(40));
        budget.release(100);
        assert_eq!(budget.used(), 0);
        assert!(budget.acquire(100));
    }

    #[test]
    fn test_unbounded_never_refuses() {
        let budget = MemoryBudget::unbounded();
        assert!(budget.acquire(usize::MAX / 4));
    }
}
