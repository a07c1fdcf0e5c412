use crate::node::NodeId;
use std::sync::{Arc, Mutex, PoisonError};

/// Hands out node ids from one shared counter.
///
/// Clones share the counter, so ids stay unique and increasing no matter
/// which clone allocates.
#[derive(Debug, Clone, Default)]
pub struct NodeIdAllocator {
    next: Arc<Mutex<u64>>,
}

impl NodeIdAllocator {
    /// Start at id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a saved counter.
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: Arc::new(Mutex::new(next)),
        }
    }

    /// Take the next id.
    pub fn allocate(&self) -> NodeId {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = NodeId::new(*next);
        *next += 1;
        id
    }

    /// The id the next call to [`allocate`](Self::allocate) returns.
    pub fn peek(&self) -> u64 {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
