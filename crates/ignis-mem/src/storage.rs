//! # Internal Allocation Storage
//!
//! Allocations a receiver no longer references but the GPU may still read.
//! Temporary allocations are freed once their task count retires; reusable
//! ones are handed back out instead of being freed.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ignis_core::{ByteSize, ContextId, TaskCount};

use crate::allocation::{AllocationRef, AllocationType};
use crate::manager::MemoryManager;

/// Which list an allocation is parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    /// Freed when retired
    Temporary,
    /// Kept for reuse when retired
    Reusable,
}

/// Per-receiver lists of parked allocations
pub struct InternalAllocationStorage {
    memory_manager: Arc<dyn MemoryManager>,
    context: ContextId,
    temporary: Vec<AllocationRef>,
    reusable: Vec<AllocationRef>,
}

impl InternalAllocationStorage {
    /// Create storage for the receiver running on `context`
    pub fn new(memory_manager: Arc<dyn MemoryManager>, context: ContextId) -> Self {
        Self {
            memory_manager,
            context,
            temporary: Vec::new(),
            reusable: Vec::new(),
        }
    }

    fn list(&self, usage: AllocationUsage) -> &Vec<AllocationRef> {
        match usage {
            AllocationUsage::Temporary => &self.temporary,
            AllocationUsage::Reusable => &self.reusable,
        }
    }

    fn list_mut(&mut self, usage: AllocationUsage) -> &mut Vec<AllocationRef> {
        match usage {
            AllocationUsage::Temporary => &mut self.temporary,
            AllocationUsage::Reusable => &mut self.reusable,
        }
    }

    /// Park an allocation, stamping it with the submission that last uses it
    pub fn store(&mut self, allocation: AllocationRef, usage: AllocationUsage, task_count: TaskCount) {
        allocation.update_task_count(task_count, self.context);
        log::trace!(
            "parked {} at {} as {:?} until task {}",
            allocation.allocation_type(),
            allocation.gpu_addr(),
            usage,
            task_count
        );
        self.list_mut(usage).push(allocation);
    }

    /// Free every allocation on `usage` whose task count is ≤ `completed`
    ///
    /// Returns the number of allocations released.
    pub fn clean(&mut self, completed: TaskCount, usage: AllocationUsage) -> usize {
        let context = self.context;
        let list = core::mem::take(self.list_mut(usage));
        let (retired, pending): (Vec<_>, Vec<_>) = list
            .into_iter()
            .partition(|a| a.is_retired(context, completed));

        *self.list_mut(usage) = pending;

        let released = retired.len();
        for allocation in retired {
            self.memory_manager.free(allocation);
        }

        if released > 0 {
            log::debug!(
                "context {}: released {} {:?} allocations (completed task {})",
                context,
                released,
                usage,
                completed
            );
        }

        released
    }

    /// Take a retired reusable allocation of the given type and size
    pub fn obtain_reusable(
        &mut self,
        size: ByteSize,
        allocation_type: AllocationType,
        completed: TaskCount,
    ) -> Option<AllocationRef> {
        let context = self.context;
        let index = self.reusable.iter().position(|a| {
            a.allocation_type() == allocation_type
                && a.size() >= size
                && a.is_retired(context, completed)
        })?;
        Some(self.reusable.swap_remove(index))
    }

    /// Number of parked allocations on a list
    pub fn len(&self, usage: AllocationUsage) -> usize {
        self.list(usage).len()
    }

    /// Check if a list is empty
    pub fn is_empty(&self, usage: AllocationUsage) -> bool {
        self.list(usage).is_empty()
    }

    /// Parked allocations on a list
    pub fn allocations(&self, usage: AllocationUsage) -> &[AllocationRef] {
        self.list(usage)
    }

    /// Free everything regardless of task count
    pub fn release_all(&mut self) {
        for allocation in self.temporary.drain(..).chain(self.reusable.drain(..)) {
            self.memory_manager.free(allocation);
        }
    }
}

impl core::fmt::Debug for InternalAllocationStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InternalAllocationStorage")
            .field("context", &self.context)
            .field("temporary", &self.temporary.len())
            .field("reusable", &self.reusable.len())
            .finish()
    }
}
