//! Client Id Allocation
//!
//! Inbound sessions get worker-local `ClientId`s from this allocator.
//! Ids are handed out as scoped handles: the handle travels with the
//! connection that owns the session and releases the id back to the
//! free list on every exit path, including panics unwinding the
//! connection away.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use seqlog_core::ClientId;

#[derive(Default)]
struct AllocatorState {
    next: i32,
    free: VecDeque<i32>,
    outstanding: usize,
}

/// Issues and recycles `ClientId`s for one worker.
#[derive(Clone, Default)]
pub struct ClientIdAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> ClientIdHandle {
        let mut state = self.state.lock().expect("allocator poisoned");
        let raw = state.free.pop_front().unwrap_or_else(|| {
            state.next += 1;
            state.next
        });
        state.outstanding += 1;
        ClientIdHandle {
            id: ClientId(raw),
            allocator: self.state.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().expect("allocator poisoned").outstanding
    }
}

/// Scoped ownership of one `ClientId`. Dropping releases the id.
pub struct ClientIdHandle {
    id: ClientId,
    allocator: Arc<Mutex<AllocatorState>>,
}

impl ClientIdHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for ClientIdHandle {
    fn drop(&mut self) {
        let mut state = self.allocator.lock().expect("allocator poisoned");
        state.free.push_back(self.id.0);
        state.outstanding -= 1;
    }
}

impl std::fmt::Debug for ClientIdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientIdHandle({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_while_held() {
        let allocator = ClientIdAllocator::new();
        let a = allocator.issue();
        let b = allocator.issue();
        assert_ne!(a.id(), b.id());
        assert_eq!(allocator.outstanding(), 2);
    }

    #[test]
    fn test_released_ids_are_reused() {
        let allocator = ClientIdAllocator::new();
        let first = allocator.issue().id();
        // Handle dropped immediately; the id goes back to the free list.
        assert_eq!(allocator.outstanding(), 0);
        let again = allocator.issue();
        assert_eq!(again.id(), first);
    }
}
