//! Bounded pool of routing-table indices.
//!
//! The pool is a stack: the most recently released index is the next one
//! claimed. Under churn this keeps the set of indices that have ever been
//! live small, which bounds the number of route tables kept warm.

use crate::error::ManagerError;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("table index pool exhausted ({in_use} indices in use)")]
    Exhausted { in_use: usize },
}

impl From<AllocError> for ManagerError {
    fn from(err: AllocError) -> Self {
        ManagerError::fatal(err.to_string())
    }
}

/// LIFO allocator over a fixed set of indices.
///
/// ```
/// use dpa_manager_common::IndexAllocator;
///
/// let mut alloc = IndexAllocator::from_indices([1, 2, 3]);
/// assert_eq!(alloc.claim().unwrap(), 3);
/// alloc.release(3);
/// assert_eq!(alloc.claim().unwrap(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct IndexAllocator {
    /// Free indices; the top of the stack is the last element.
    stack: Vec<u32>,
    /// Every index this allocator manages, free or not.
    pool: BTreeSet<u32>,
}

impl IndexAllocator {
    /// Builds a pool, pushing indices in iteration order so the last one
    /// yielded is claimed first. Duplicates are ignored.
    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        let mut alloc = IndexAllocator::default();
        for idx in indices {
            if alloc.pool.insert(idx) {
                alloc.stack.push(idx);
            }
        }
        alloc
    }

    /// Pops the top free index.
    ///
    /// # Errors
    ///
    /// [`AllocError::Exhausted`] when no index is free. Callers treat this as
    /// fatal misconfiguration.
    pub fn claim(&mut self) -> Result<u32, AllocError> {
        match self.stack.pop() {
            Some(idx) => {
                debug!(index = idx, free = self.stack.len(), "Claimed table index");
                Ok(idx)
            }
            None => Err(AllocError::Exhausted {
                in_use: self.in_use(),
            }),
        }
    }

    /// Pushes `idx` back on top of the stack.
    ///
    /// Releasing an index that is already free, or that this pool does not
    /// manage, is ignored. Returns true if the index was pushed.
    pub fn release(&mut self, idx: u32) -> bool {
        if !self.pool.contains(&idx) {
            warn!(index = idx, "Ignoring release of index outside the pool");
            return false;
        }
        if self.stack.contains(&idx) {
            warn!(index = idx, "Ignoring release of index that is already free");
            return false;
        }
        self.stack.push(idx);
        debug!(index = idx, free = self.stack.len(), "Released table index");
        true
    }

    /// Withdraws indices from the pool entirely, keeping the relative order
    /// of the remaining free indices.
    pub fn remove_indices(&mut self, indices: &BTreeSet<u32>) {
        self.stack.retain(|idx| !indices.contains(idx));
        self.pool.retain(|idx| !indices.contains(idx));
    }

    /// Number of free indices.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_free(&self, idx: u32) -> bool {
        self.stack.contains(&idx)
    }

    /// Number of managed indices currently claimed.
    pub fn in_use(&self) -> usize {
        self.pool.len() - self.stack.len()
    }

    /// The index the next `claim` would return.
    pub fn peek(&self) -> Option<u32> {
        self.stack.last().copied()
    }

    /// Every index this allocator manages.
    pub fn managed(&self) -> &BTreeSet<u32> {
        &self.pool
    }
}
