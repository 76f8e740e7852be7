//! # Residency Set
//!
//! What must be GPU-visible for the next submission of one receiver.
//!
//! An allocation is in exactly one of three states: untracked, resident or
//! eviction-pending. The resident list is consumed by every submission and
//! rebuilt for the next one.

use alloc::vec::Vec;

use hashbrown::HashMap;
use ignis_core::ContextId;

use crate::allocation::{AllocationHandle, AllocationRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResidencyState {
    Resident,
    EvictionPending,
}

/// Per-receiver residency bookkeeping
#[derive(Debug)]
pub struct ResidencySet {
    context: ContextId,
    states: HashMap<AllocationHandle, ResidencyState>,
    resident: Vec<AllocationRef>,
    eviction: Vec<AllocationRef>,
}

impl ResidencySet {
    /// Create an empty set for `context`
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            states: HashMap::new(),
            resident: Vec::new(),
            eviction: Vec::new(),
        }
    }

    /// Add an allocation to the next submission
    ///
    /// Returns `true` if the allocation has never been submitted on this
    /// context before.
    pub fn make_resident(&mut self, allocation: &AllocationRef) -> bool {
        let handle = allocation.handle();
        let new_resource = !allocation.is_resident(self.context);

        match self.states.get(&handle) {
            Some(ResidencyState::Resident) => return false,
            Some(ResidencyState::EvictionPending) => {
                self.eviction.retain(|a| a.handle() != handle);
            }
            None => {}
        }

        self.states.insert(handle, ResidencyState::Resident);
        self.resident.push(allocation.clone());

        new_resource
    }

    /// Move an allocation to the eviction list
    ///
    /// Only allocations resident in this set or on this context are moved.
    pub fn make_non_resident(&mut self, allocation: &AllocationRef) {
        let handle = allocation.handle();

        match self.states.get(&handle) {
            Some(ResidencyState::EvictionPending) => return,
            Some(ResidencyState::Resident) => {
                self.resident.retain(|a| a.handle() != handle);
            }
            None if allocation.is_resident(self.context) => {}
            None => return,
        }

        self.states.insert(handle, ResidencyState::EvictionPending);
        self.eviction.push(allocation.clone());
    }

    /// Allocations of the next submission, in insertion order
    pub fn resident(&self) -> &[AllocationRef] {
        &self.resident
    }

    /// Allocations waiting for eviction, in insertion order
    pub fn eviction(&self) -> &[AllocationRef] {
        &self.eviction
    }

    /// Check if an allocation is on the resident list
    pub fn is_resident(&self, handle: AllocationHandle) -> bool {
        self.states.get(&handle) == Some(&ResidencyState::Resident)
    }

    /// Check if an allocation is waiting for eviction
    pub fn is_eviction_pending(&self, handle: AllocationHandle) -> bool {
        self.states.get(&handle) == Some(&ResidencyState::EvictionPending)
    }

    /// Drop the resident list after it was submitted
    pub fn clear_resident(&mut self) {
        for allocation in self.resident.drain(..) {
            self.states.remove(&allocation.handle());
        }
    }

    /// Take the eviction list, leaving the allocations untracked
    pub fn take_eviction(&mut self) -> Vec<AllocationRef> {
        let eviction = core::mem::take(&mut self.eviction);
        for allocation in &eviction {
            self.states.remove(&allocation.handle());
            allocation.release_residency(self.context);
        }
        eviction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationType, GraphicsAllocation, MemoryPool, StorageInfo};
    use alloc::sync::Arc;
    use ignis_core::{ByteSize, GpuAddr, Handle};

    fn allocation(raw: u64) -> AllocationRef {
        Arc::new(GraphicsAllocation::new(
            Handle::from_raw(raw),
            AllocationType::Buffer,
            GpuAddr::new(0x1000 * raw),
            ByteSize::from_kib(4),
            MemoryPool::System4KbPages,
            StorageInfo::default(),
        ))
    }

    #[test]
    fn test_make_resident_is_idempotent() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        assert!(set.make_resident(&a));
        assert!(!set.make_resident(&a));
        assert_eq!(set.resident().len(), 1);
        assert!(set.is_resident(a.handle()));
    }

    #[test]
    fn test_new_resource_detection() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        a.update_residency_task_count(1, 0);
        assert!(!set.make_resident(&a));

        let b = allocation(2);
        b.update_residency_task_count(1, 5);
        assert!(set.make_resident(&b));
    }

    #[test]
    fn test_make_non_resident_moves_to_eviction() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        set.make_resident(&a);
        set.make_non_resident(&a);

        assert!(set.resident().is_empty());
        assert_eq!(set.eviction().len(), 1);
        assert!(set.is_eviction_pending(a.handle()));
        assert!(!set.is_resident(a.handle()));

        set.make_non_resident(&a);
        assert_eq!(set.eviction().len(), 1);
    }

    #[test]
    fn test_untracked_allocation_is_ignored() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        set.make_non_resident(&a);
        assert!(set.eviction().is_empty());
    }

    #[test]
    fn test_previously_submitted_allocation_is_evictable() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        a.update_residency_task_count(3, 0);
        set.make_non_resident(&a);
        assert_eq!(set.eviction().len(), 1);

        let evicted = set.take_eviction();
        assert_eq!(evicted.len(), 1);
        assert!(!a.is_resident(0));
        assert!(set.eviction().is_empty());
    }

    #[test]
    fn test_resident_again_cancels_eviction() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        set.make_resident(&a);
        set.make_non_resident(&a);
        set.make_resident(&a);
        assert!(set.eviction().is_empty());
        assert_eq!(set.resident().len(), 1);
    }

    #[test]
    fn test_eviction_keeps_insertion_order() {
        let mut set = ResidencySet::new(0);
        let allocations: Vec<_> = (1..=3).map(allocation).collect();
        for a in &allocations {
            set.make_resident(a);
        }
        for a in allocations.iter().rev() {
            set.make_non_resident(a);
        }
        let order: Vec<u64> = set.take_eviction().iter().map(|a| a.handle().raw()).collect();
        assert_eq!(order, alloc::vec![3, 2, 1]);
    }

    #[test]
    fn test_clear_resident() {
        let mut set = ResidencySet::new(0);
        let a = allocation(1);
        set.make_resident(&a);
        set.clear_resident();
        assert!(set.resident().is_empty());
        assert!(!set.is_resident(a.handle()));
    }
}
