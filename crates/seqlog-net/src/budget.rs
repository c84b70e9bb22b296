//! Resource Budgets
//!
//! Counted budgets for scarce resources, handed out as tokens that pay
//! the budget back on drop. Used for the per-worker connection count:
//! the acceptor acquires a token before constructing a connection and
//! the token rides inside the connection until it is reclaimed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct ResourceBudget {
    inner: Arc<BudgetInner>,
}

struct BudgetInner {
    limit: usize,
    used: AtomicUsize,
}

impl ResourceBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Take one unit, or `None` when the budget is exhausted.
    pub fn acquire(&self) -> Option<BudgetToken> {
        let mut current = self.inner.used.load(Ordering::Acquire);
        loop {
            if current >= self.inner.limit {
                return None;
            }
            match self.inner.used.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BudgetToken {
                        inner: self.inner.clone(),
                    })
                }
                Err(seen) => current = seen,
            }
        }
    }

    pub fn available(&self) -> usize {
        self.inner
            .limit
            .saturating_sub(self.inner.used.load(Ordering::Acquire))
    }
}

/// One unit of budget; returned on drop.
pub struct BudgetToken {
    inner: Arc<BudgetInner>,
}

impl Drop for BudgetToken {
    fn drop(&mut self) {
        self.inner.used.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for BudgetToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BudgetToken")
    }
}
