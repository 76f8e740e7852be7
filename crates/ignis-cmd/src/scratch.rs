//! # Scratch-Space Controller
//!
//! Per-thread scratch and private-scratch memory for compute dispatches,
//! published to the hardware through RENDER_SURFACE_STATE descriptors in a
//! fixed ring of surface-state slots.
//!
//! ```text
//!  surface-state heap (two descriptors per slot with private scratch)
//! ┌────────┬────────┬────────┬────────┬────────┬────────┬─────
//! │ slot 0 │ slot 0 │ slot 1 │ slot 1 │ slot 2 │ slot 2 │ ...
//! │ unused │ unused │scratch │private │scratch │private │
//! └────────┴────────┴────────┴────────┴────────┴────────┴─────
//!                    ▲
//!                    └── CFE_STATE scratch space buffer = patch address
//! ```
//!
//! Growing an allocation moves the cursor to the next slot so that command
//! buffers still in flight keep reading the descriptor they were built with.
//! Slot 0 is never programmed; a patch address of 0 means "no scratch".
//! The cursor wraps back to slot 1 and only ever reuses a slot whose last
//! user has retired.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use ignis_core::{
    ByteSize, DebugSettings, Error, GpuAddr, HardwareInfo, OsContext, Result, TaskCount,
};
use ignis_mem::{
    AllocationProperties, AllocationRef, AllocationType, AllocationUsage,
    InternalAllocationStorage, MemoryManager,
};

use crate::stream::IndirectHeap;
use crate::surface_state::{SurfaceStateDescriptor, SurfaceStateHeap, RENDER_SURFACE_STATE_SIZE};

/// Per-thread sizes are rounded up to this boundary
pub const SCRATCH_SIZE_ALIGNMENT: u32 = 64;

/// Slot ring size without private scratch
pub const SCRATCH_SLOT_COUNT: u32 = 16;

bitflags::bitflags! {
    /// Hardware state invalidated by a scratch change
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateDirty: u8 {
        /// STATE_BASE_ADDRESS must be re-emitted
        const STATE_BASE_ADDRESS = 1 << 0;
        /// CFE_STATE must be re-emitted
        const CFE_STATE = 1 << 1;
    }
}

fn align_size(size: u32) -> u32 {
    size.div_ceil(SCRATCH_SIZE_ALIGNMENT) * SCRATCH_SIZE_ALIGNMENT
}

// =============================================================================
// REQUEST
// =============================================================================

/// Scratch requirements of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchRequest {
    /// Explicit slot, 0 lets the controller choose
    pub slot: u32,
    /// Per-thread scratch in bytes
    pub per_thread_scratch_size: u32,
    /// Per-thread private scratch in bytes
    pub per_thread_private_scratch_size: u32,
    /// Task count of the dispatch that will use the scratch
    pub task_count: TaskCount,
    /// Latest task count known to have completed
    pub completed_task_count: TaskCount,
}

impl ScratchRequest {
    /// Request for the dispatch with `task_count`
    pub fn new(task_count: TaskCount) -> Self {
        Self {
            task_count,
            ..Default::default()
        }
    }

    /// Ask for an explicit slot
    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = slot;
        self
    }

    /// Per-thread scratch size
    pub fn with_scratch_size(mut self, size: u32) -> Self {
        self.per_thread_scratch_size = size;
        self
    }

    /// Per-thread private scratch size
    pub fn with_private_scratch_size(mut self, size: u32) -> Self {
        self.per_thread_private_scratch_size = size;
        self
    }

    /// Latest completed task count, used to decide slot reuse
    pub fn with_completed(mut self, completed: TaskCount) -> Self {
        self.completed_task_count = completed;
        self
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Scratch controller statistics
#[derive(Debug, Clone, Default)]
pub struct ScratchStats {
    /// Scratch and private allocations created
    pub allocations: u64,
    /// Descriptors written into a heap
    pub descriptor_writes: u64,
    /// Times the slot cursor moved
    pub slot_changes: u64,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Owner of the scratch allocations of one receiver
pub struct ScratchSpaceController {
    memory_manager: Arc<dyn MemoryManager>,
    compute_units: u32,
    surface_state_size: usize,
    two_slots: bool,
    slot_count: u32,
    slot_id: u32,
    slot_task_counts: Vec<Option<TaskCount>>,
    surface_state_heap: Option<GpuAddr>,
    scratch_allocation: Option<AllocationRef>,
    private_allocation: Option<AllocationRef>,
    per_thread_scratch_size: u32,
    per_thread_private_scratch_size: u32,
    scratch_size_bytes: u64,
    private_scratch_size_bytes: u64,
    stats: ScratchStats,
}

impl ScratchSpaceController {
    /// Create a controller for the given hardware
    pub fn new(
        hw: &HardwareInfo,
        settings: &DebugSettings,
        memory_manager: Arc<dyn MemoryManager>,
    ) -> Result<Self> {
        let surface_state_size = hw.surface_state_size as usize;
        if surface_state_size < RENDER_SURFACE_STATE_SIZE || hw.compute_units_used_for_scratch == 0 {
            return Err(Error::InvalidParameter);
        }

        let two_slots = settings.private_scratch_enabled(hw);
        let slot_count = if two_slots {
            SCRATCH_SLOT_COUNT * 2
        } else {
            SCRATCH_SLOT_COUNT
        };

        log::debug!(
            "scratch controller: {} slots, {} compute units, private scratch {}",
            slot_count,
            hw.compute_units_used_for_scratch,
            if two_slots { "on" } else { "off" }
        );

        Ok(Self {
            memory_manager,
            compute_units: hw.compute_units_used_for_scratch,
            surface_state_size,
            two_slots,
            slot_count,
            slot_id: 0,
            slot_task_counts: vec![None; slot_count as usize],
            surface_state_heap: None,
            scratch_allocation: None,
            private_allocation: None,
            per_thread_scratch_size: 0,
            per_thread_private_scratch_size: 0,
            scratch_size_bytes: 0,
            private_scratch_size_bytes: 0,
            stats: ScratchStats::default(),
        })
    }

    /// Make sure scratch for `request` is allocated and described in `heap`
    ///
    /// On error nothing changes: no slot moves, no allocation is replaced
    /// and no descriptor is written.
    pub fn set_required_scratch_space(
        &mut self,
        heap: &mut SurfaceStateHeap<'_>,
        request: &ScratchRequest,
        os_context: &OsContext,
        storage: &mut InternalAllocationStorage,
    ) -> Result<StateDirty> {
        if request.slot >= self.slot_count {
            return Err(Error::InvalidParameter);
        }

        let scratch_size = align_size(request.per_thread_scratch_size);
        let private_size = if self.two_slots {
            align_size(request.per_thread_private_scratch_size)
        } else {
            0
        };

        let grow_scratch = scratch_size > self.per_thread_scratch_size;
        let grow_private = private_size > self.per_thread_private_scratch_size;
        let surface_dirty = grow_scratch || grow_private;

        let next_slot = if request.slot != 0 {
            request.slot
        } else if surface_dirty {
            self.advance(self.slot_id)
        } else {
            self.slot_id
        };
        let slot_changed = next_slot != self.slot_id;

        if (slot_changed || surface_dirty) && !self.is_slot_retired(next_slot, request.completed_task_count) {
            log::warn!(
                "scratch slot {} still in use by task {:?}",
                next_slot,
                self.slot_task_counts[next_slot as usize]
            );
            return Err(Error::CapacityExceeded);
        }

        let heap_changed = self.surface_state_heap != Some(heap.base());
        let has_allocation =
            surface_dirty || self.scratch_allocation.is_some() || self.private_allocation.is_some();
        let program = surface_dirty || slot_changed || (heap_changed && has_allocation);

        if program && self.slot_end(next_slot) > heap.len() {
            return Err(Error::BufferOverflow);
        }

        let new_scratch = if grow_scratch {
            Some(self.allocate(AllocationType::Scratch, scratch_size, os_context)?)
        } else {
            None
        };
        let new_private = if grow_private {
            match self.allocate(AllocationType::PrivateSurface, private_size, os_context) {
                Ok(allocation) => Some(allocation),
                Err(e) => {
                    if let Some(allocation) = new_scratch {
                        self.memory_manager.free(allocation);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Commit
        if let Some(allocation) = new_scratch {
            self.scratch_size_bytes = allocation.size().as_bytes();
            self.per_thread_scratch_size = scratch_size;
            if let Some(old) = self.scratch_allocation.replace(allocation) {
                storage.store(old, AllocationUsage::Temporary, request.task_count);
            }
        }
        if let Some(allocation) = new_private {
            self.private_scratch_size_bytes = allocation.size().as_bytes();
            self.per_thread_private_scratch_size = private_size;
            if let Some(old) = self.private_allocation.replace(allocation) {
                storage.store(old, AllocationUsage::Temporary, request.task_count);
            }
        }

        if slot_changed {
            log::trace!("scratch slot {} -> {}", self.slot_id, next_slot);
            self.slot_id = next_slot;
            self.stats.slot_changes += 1;
        }
        self.surface_state_heap = Some(heap.base());

        let mut dirty = StateDirty::empty();
        if surface_dirty || slot_changed {
            dirty |= StateDirty::CFE_STATE;
        }

        if program {
            self.program_surface_state(heap, self.slot_id)?;
        }

        // Every user of the active slot holds it, not only the one that programmed it
        if self.scratch_allocation.is_some() || self.private_allocation.is_some() {
            let last_user = &mut self.slot_task_counts[self.slot_id as usize];
            *last_user = Some(last_user.map_or(request.task_count, |t| t.max(request.task_count)));
        }

        Ok(dirty)
    }

    /// Apply one request across several surface-state heaps
    ///
    /// Sizes and slot are resolved against the first heap; every other heap
    /// receives a copy of the resulting descriptors.
    pub fn program_heaps(
        &mut self,
        heaps: &mut [SurfaceStateHeap<'_>],
        request: &ScratchRequest,
        os_context: &OsContext,
        storage: &mut InternalAllocationStorage,
    ) -> Result<StateDirty> {
        let (first, rest) = heaps.split_first_mut().ok_or(Error::InvalidParameter)?;
        let dirty = self.set_required_scratch_space(first, request, os_context, storage)?;

        for heap in rest {
            self.program_surface_state(heap, self.slot_id)?;
        }

        Ok(dirty)
    }

    /// Reserve the slot ring at the start of an empty surface-state heap
    pub fn reserve_heap(&self, heap: &mut IndirectHeap) -> Result<()> {
        if heap.used() == 0 {
            heap.allocate(self.reserved_heap_size(), self.surface_state_size)?;
        }
        Ok(())
    }

    /// Bytes of surface-state heap the slot ring may touch
    pub fn reserved_heap_size(&self) -> usize {
        self.slot_count as usize * self.descriptors_per_slot() * self.surface_state_size
    }

    /// Byte offset of a slot's scratch descriptor
    pub fn offset_to_surface_state(&self, slot: u32) -> usize {
        slot as usize * self.surface_state_size * self.descriptors_per_slot()
    }

    /// Heap offset of the active scratch descriptor, 0 without scratch
    pub fn scratch_patch_address(&self) -> u64 {
        if self.scratch_allocation.is_some() || self.private_allocation.is_some() {
            self.offset_to_surface_state(self.slot_id) as u64
        } else {
            0
        }
    }

    /// General state base to program; scratch is addressed through surface state
    pub fn calculate_new_gsh(&self) -> u64 {
        0
    }

    /// Give up both allocations, parking them until `task_count` retires
    pub fn release_allocations(&mut self, storage: &mut InternalAllocationStorage, task_count: TaskCount) {
        for allocation in [self.scratch_allocation.take(), self.private_allocation.take()]
            .into_iter()
            .flatten()
        {
            storage.store(allocation, AllocationUsage::Temporary, task_count);
        }
        self.per_thread_scratch_size = 0;
        self.per_thread_private_scratch_size = 0;
        self.scratch_size_bytes = 0;
        self.private_scratch_size_bytes = 0;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current slot
    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    /// Slots in the ring
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Check if each slot carries a private-scratch descriptor
    pub fn private_scratch_enabled(&self) -> bool {
        self.two_slots
    }

    /// Scratch allocation
    pub fn scratch_allocation(&self) -> Option<&AllocationRef> {
        self.scratch_allocation.as_ref()
    }

    /// Private-scratch allocation
    pub fn private_scratch_allocation(&self) -> Option<&AllocationRef> {
        self.private_allocation.as_ref()
    }

    /// Aligned per-thread scratch size
    pub fn per_thread_scratch_size(&self) -> u32 {
        self.per_thread_scratch_size
    }

    /// Aligned per-thread private-scratch size
    pub fn per_thread_private_scratch_size(&self) -> u32 {
        self.per_thread_private_scratch_size
    }

    /// Size of the scratch allocation
    pub fn scratch_size_bytes(&self) -> u64 {
        self.scratch_size_bytes
    }

    /// Size of the private-scratch allocation
    pub fn private_scratch_size_bytes(&self) -> u64 {
        self.private_scratch_size_bytes
    }

    /// Base of the heap last programmed
    pub fn surface_state_heap(&self) -> Option<GpuAddr> {
        self.surface_state_heap
    }

    /// Hardware threads scratch is sized for
    pub fn compute_units(&self) -> u32 {
        self.compute_units
    }

    /// Statistics
    pub fn stats(&self) -> &ScratchStats {
        &self.stats
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn descriptors_per_slot(&self) -> usize {
        if self.two_slots {
            2
        } else {
            1
        }
    }

    fn slot_end(&self, slot: u32) -> usize {
        self.offset_to_surface_state(slot) + self.descriptors_per_slot() * self.surface_state_size
    }

    fn advance(&self, slot: u32) -> u32 {
        let next = slot + 1;
        if next >= self.slot_count {
            1
        } else {
            next
        }
    }

    fn is_slot_retired(&self, slot: u32, completed: TaskCount) -> bool {
        self.slot_task_counts[slot as usize].map_or(true, |t| t <= completed)
    }

    fn allocate(
        &mut self,
        allocation_type: AllocationType,
        per_thread_size: u32,
        os_context: &OsContext,
    ) -> Result<AllocationRef> {
        let size = ByteSize::from_bytes(per_thread_size as u64 * self.compute_units as u64);
        let props = AllocationProperties::new(size, allocation_type, os_context.device_bitfield())
            .with_multi_storage(os_context.num_supported_devices() > 1);

        let allocation = self.memory_manager.allocate(&props).map_err(|e| {
            log::warn!("{} allocation of {:?} failed: {}", allocation_type, size, e);
            e
        })?;

        log::debug!(
            "{} grown to {} per thread ({:?} at {})",
            allocation_type,
            per_thread_size,
            allocation.size(),
            allocation.gpu_addr()
        );
        self.stats.allocations += 1;
        Ok(allocation)
    }

    fn descriptor(&self, allocation: Option<&AllocationRef>, per_thread_size: u32) -> SurfaceStateDescriptor {
        match allocation {
            Some(allocation) => SurfaceStateDescriptor::scratch(
                allocation.gpu_addr(),
                self.compute_units - 1,
                per_thread_size,
            ),
            None => SurfaceStateDescriptor::null(),
        }
    }

    fn program_surface_state(&mut self, heap: &mut SurfaceStateHeap<'_>, slot: u32) -> Result<()> {
        let offset = self.offset_to_surface_state(slot);

        let scratch = self.descriptor(self.scratch_allocation.as_ref(), self.per_thread_scratch_size);
        heap.write(offset, &scratch)?;
        self.stats.descriptor_writes += 1;

        if self.two_slots {
            let private = self.descriptor(
                self.private_allocation.as_ref(),
                self.per_thread_private_scratch_size,
            );
            heap.write(offset + self.surface_state_size, &private)?;
            self.stats.descriptor_writes += 1;
        }

        Ok(())
    }
}

impl core::fmt::Debug for ScratchSpaceController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScratchSpaceController")
            .field("slot_id", &self.slot_id)
            .field("slot_count", &self.slot_count)
            .field("per_thread_scratch_size", &self.per_thread_scratch_size)
            .field("per_thread_private_scratch_size", &self.per_thread_private_scratch_size)
            .field("surface_state_heap", &self.surface_state_heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface_state::SurfaceType;
    use ignis_core::{DeviceBitfield, EngineType, PreemptionMode};
    use ignis_mem::manager::PAGE_SIZE;
    use ignis_mem::HeapMemoryManager;

    const SURFACE_STATE: usize = 64;

    struct Fixture {
        mm: Arc<HeapMemoryManager>,
        storage: InternalAllocationStorage,
        context: OsContext,
        controller: ScratchSpaceController,
    }

    fn fixture(cmdline: &str) -> Fixture {
        fixture_on(&HardwareInfo::xe_hp(), cmdline)
    }

    fn fixture_on(hw: &HardwareInfo, cmdline: &str) -> Fixture {
        let mm = HeapMemoryManager::shared();
        let settings = DebugSettings::from_cmdline(cmdline);
        let controller = ScratchSpaceController::new(hw, &settings, mm.clone()).unwrap();
        Fixture {
            storage: InternalAllocationStorage::new(mm.clone(), 0),
            mm,
            context: OsContext::compute(0),
            controller,
        }
    }

    impl Fixture {
        fn request(&mut self, heap: &mut SurfaceStateHeap<'_>, request: ScratchRequest) -> Result<StateDirty> {
            self.controller
                .set_required_scratch_space(heap, &request, &self.context, &mut self.storage)
        }
    }

    #[test]
    fn test_slot_count_follows_private_scratch() {
        assert_eq!(fixture("EnablePrivateScratchSlot1=0").controller.slot_count(), 16);
        assert_eq!(fixture("EnablePrivateScratchSlot1=1").controller.slot_count(), 32);
        assert_eq!(fixture_on(&HardwareInfo::gen12lp(), "").controller.slot_count(), 16);
    }

    #[test]
    fn test_offset_without_private_scratch() {
        let f = fixture("EnablePrivateScratchSlot1=0");
        assert_eq!(f.controller.offset_to_surface_state(1), SURFACE_STATE);
        assert_eq!(fixture("").controller.offset_to_surface_state(1), 2 * SURFACE_STATE);
    }

    #[test]
    fn test_no_scratch_patch_address_is_zero() {
        let f = fixture("");
        assert_eq!(f.controller.scratch_patch_address(), 0);
        assert!(f.controller.scratch_allocation().is_none());
    }

    #[test]
    fn test_first_allocation() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let dirty = f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(0x400)).unwrap();
        assert!(dirty.contains(StateDirty::CFE_STATE));
        assert!(!dirty.contains(StateDirty::STATE_BASE_ADDRESS));
        assert_eq!(f.controller.slot_id(), 1);
        assert_ne!(f.controller.scratch_patch_address(), 0);

        let allocation = f.controller.scratch_allocation().unwrap();
        assert_eq!(allocation.size().as_bytes(), 0x400 * 1024);
        assert_eq!(allocation.allocation_type(), AllocationType::Scratch);

        let descriptor = heap.read(f.controller.offset_to_surface_state(1)).unwrap();
        assert_eq!(descriptor.surface_type, SurfaceType::Scratch);
        assert_eq!(descriptor.base_address, allocation.gpu_addr());
        assert_eq!(descriptor.length(), 1023);
        assert_eq!(descriptor.pitch, 0x400);
        assert_eq!(f.controller.calculate_new_gsh(), 0);
    }

    #[test]
    fn test_size_is_aligned_to_64() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);
        f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(1)).unwrap();
        assert_eq!(f.controller.per_thread_scratch_size(), 64);
    }

    #[test]
    fn test_misaligned_private_size_is_aligned() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 256];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let misaligned = PAGE_SIZE as u32 + 1;
        f.request(&mut heap, ScratchRequest::new(0).with_private_scratch_size(misaligned))
            .unwrap();

        let units = f.controller.compute_units() as u64;
        let expected = align_size(misaligned) as u64 * units;
        assert_ne!(f.controller.private_scratch_size_bytes(), misaligned as u64 * units);
        assert_eq!(f.controller.private_scratch_size_bytes(), expected);
        assert_eq!(
            f.controller.private_scratch_allocation().unwrap().size().as_bytes(),
            expected
        );
    }

    #[test]
    fn test_same_size_is_not_dirty() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 256];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let request = ScratchRequest::new(0).with_private_scratch_size(PAGE_SIZE as u32);
        assert!(f.request(&mut heap, request).unwrap().contains(StateDirty::CFE_STATE));
        let gpu_va = f.controller.private_scratch_allocation().unwrap().gpu_addr();

        assert!(f.request(&mut heap, request).unwrap().is_empty());
        assert_eq!(f.controller.private_scratch_allocation().unwrap().gpu_addr(), gpu_va);
        assert_eq!(heap.read(3 * SURFACE_STATE).unwrap().base_address, gpu_va);
        assert_eq!(f.mm.live_allocations(), 1);
    }

    #[test]
    fn test_bigger_private_scratch_replaces_allocation() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 6 * SURFACE_STATE];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let size = PAGE_SIZE as u32;
        f.request(&mut heap, ScratchRequest::new(0).with_private_scratch_size(size))
            .unwrap();
        let gpu_va = f.controller.private_scratch_allocation().unwrap().gpu_addr();
        assert_eq!(heap.read(3 * SURFACE_STATE).unwrap().base_address, gpu_va);

        let dirty = f
            .request(&mut heap, ScratchRequest::new(0).with_private_scratch_size(size * 2))
            .unwrap();
        assert!(dirty.contains(StateDirty::CFE_STATE));
        let new_va = f.controller.private_scratch_allocation().unwrap().gpu_addr();
        assert_ne!(new_va, gpu_va);
        assert_eq!(heap.read(5 * SURFACE_STATE).unwrap().base_address, new_va);

        // old allocation is parked, not freed
        assert_eq!(f.storage.len(AllocationUsage::Temporary), 1);
        assert_eq!(f.mm.live_allocations(), 2);
    }

    #[test]
    fn test_only_private_scratch_patch_address() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 6 * SURFACE_STATE];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        f.request(&mut heap, ScratchRequest::new(0).with_private_scratch_size(PAGE_SIZE as u32))
            .unwrap();
        assert!(f.controller.scratch_allocation().is_none());
        assert!(f.controller.private_scratch_allocation().is_some());
        assert_eq!(f.controller.scratch_patch_address(), 2 * SURFACE_STATE as u64);
    }

    #[test]
    fn test_scratch_without_private_writes_null_private_descriptor() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 4 * SURFACE_STATE];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(PAGE_SIZE as u32))
            .unwrap();
        assert!(f.controller.private_scratch_allocation().is_none());
        let private = heap.read(3 * SURFACE_STATE).unwrap();
        assert_eq!(private.surface_type, SurfaceType::Null);
        assert!(private.base_address.is_null());
    }

    #[test]
    fn test_disabled_private_scratch_is_never_created() {
        let mut f = fixture("EnablePrivateScratchSlot1=0");
        let mut bytes = vec![0u8; 4 * SURFACE_STATE];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let size = PAGE_SIZE as u32;
        f.request(
            &mut heap,
            ScratchRequest::new(0)
                .with_scratch_size(size)
                .with_private_scratch_size(size),
        )
        .unwrap();
        assert_eq!(f.controller.private_scratch_size_bytes(), 0);
        assert!(f.controller.private_scratch_allocation().is_none());
    }

    #[test]
    fn test_bigger_scratch_advances_slot() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        f.request(&mut heap, ScratchRequest::new(0).with_slot(6)).unwrap();
        assert_eq!(f.controller.slot_id(), 6);

        f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(0x1000)).unwrap();
        assert_eq!(f.controller.slot_id(), 7);
        assert_eq!(f.controller.scratch_patch_address(), 896);
        let gpu_va = f.controller.scratch_allocation().unwrap().gpu_addr();
        assert_eq!(heap.read(896).unwrap().base_address, gpu_va);

        let dirty = f
            .request(&mut heap, ScratchRequest::new(0).with_scratch_size(0x2000))
            .unwrap();
        assert!(dirty.contains(StateDirty::CFE_STATE));
        assert_eq!(f.controller.slot_id(), 8);
        assert_eq!(f.controller.scratch_patch_address(), 8 * 128);
        let new_va = f.controller.scratch_allocation().unwrap().gpu_addr();
        assert_ne!(new_va, gpu_va);
        assert_eq!(heap.read(8 * 128).unwrap().base_address, new_va);
    }

    #[test]
    fn test_explicit_slot() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let dirty = f
            .request(&mut heap, ScratchRequest::new(0).with_slot(1).with_scratch_size(0x1000))
            .unwrap();
        assert!(dirty.contains(StateDirty::CFE_STATE));
        assert_eq!(f.controller.slot_id(), 1);
        assert_eq!(f.controller.scratch_patch_address(), 128);

        // explicit slot change alone dirties CFE
        let dirty = f.request(&mut heap, ScratchRequest::new(0).with_slot(4)).unwrap();
        assert!(dirty.contains(StateDirty::CFE_STATE));
        assert_eq!(f.controller.slot_id(), 4);
        assert_eq!(
            heap.read(4 * 128).unwrap().base_address,
            f.controller.scratch_allocation().unwrap().gpu_addr()
        );

        assert_eq!(
            f.request(&mut heap, ScratchRequest::new(0).with_slot(32)).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_new_heap_without_allocation_is_not_dirty() {
        let mut f = fixture("");
        let mut old = vec![0u8; 0x100];
        let mut new = vec![0u8; 0x100];
        f.request(&mut SurfaceStateHeap::new(GpuAddr::new(0x1000), &mut old), ScratchRequest::new(0))
            .unwrap();

        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut new);
        let dirty = f.request(&mut heap, ScratchRequest::new(0)).unwrap();
        assert!(dirty.is_empty());
        assert_eq!(f.controller.surface_state_heap(), Some(GpuAddr::new(0x2000)));
        assert_eq!(f.controller.stats().descriptor_writes, 0);
    }

    #[test]
    fn test_new_heap_with_allocation_copies_state() {
        let mut f = fixture("");
        let mut old = vec![0u8; 0x1000];
        let mut new = vec![0u8; 0x1000];

        let mut old_heap = SurfaceStateHeap::new(GpuAddr::new(0x1000), &mut old);
        f.request(&mut old_heap, ScratchRequest::new(0).with_scratch_size(0x1000))
            .unwrap();
        assert_eq!(f.controller.slot_id(), 1);
        let gpu_va = f.controller.scratch_allocation().unwrap().gpu_addr();

        let mut new_heap = SurfaceStateHeap::new(GpuAddr::new(0x9000), &mut new);
        let dirty = f
            .request(&mut new_heap, ScratchRequest::new(0).with_scratch_size(0x1000))
            .unwrap();
        assert!(dirty.is_empty());
        assert_eq!(f.controller.slot_id(), 1);
        assert_eq!(f.controller.surface_state_heap(), Some(GpuAddr::new(0x9000)));
        assert_eq!(f.controller.scratch_allocation().unwrap().gpu_addr(), gpu_va);

        let descriptor = new_heap.read(128).unwrap();
        assert_eq!(descriptor.surface_type, SurfaceType::Scratch);
        assert_eq!(descriptor.base_address, gpu_va);
    }

    #[test]
    fn test_multi_tile_placement() {
        let mut f = fixture("");
        f.context = OsContext::new(0, EngineType::Ccs, DeviceBitfield::new(0b11), PreemptionMode::MidThread);
        let mut bytes = vec![0u8; 512];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(0x400)).unwrap();
        let storage = f.controller.scratch_allocation().unwrap().storage_info();
        assert_eq!(storage.memory_banks.raw(), 0b11);
        assert!(storage.multi_storage);
    }

    #[test]
    fn test_program_heaps_resolves_once() {
        let mut f = fixture("");
        let mut a = vec![0u8; 0x1000];
        let mut b = vec![0u8; 0x1000];
        let mut c = vec![0u8; 0x1000];
        let mut heaps = [
            SurfaceStateHeap::new(GpuAddr::new(0x1000), &mut a),
            SurfaceStateHeap::new(GpuAddr::new(0x3000), &mut b),
            SurfaceStateHeap::new(GpuAddr::new(0x5000), &mut c),
        ];

        let request = ScratchRequest::new(1).with_scratch_size(0x100);
        f.controller
            .program_heaps(&mut heaps, &request, &f.context, &mut f.storage)
            .unwrap();

        assert_eq!(f.controller.stats().allocations, 1);
        // two descriptors per slot, three heaps
        assert_eq!(f.controller.stats().descriptor_writes, 6);
        let gpu_va = f.controller.scratch_allocation().unwrap().gpu_addr();
        for heap in &heaps {
            assert_eq!(heap.read(128).unwrap().base_address, gpu_va);
        }

        assert_eq!(
            f.controller
                .program_heaps(&mut [], &request, &f.context, &mut f.storage)
                .unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_sizes_grow_slot_increases() {
        let mut f = fixture("EnablePrivateScratchSlot1=0");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let mut last_slot = f.controller.slot_id();
        let mut last_va = GpuAddr::null();
        for size in [64u32, 128, 1000, 4096, 4097] {
            f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(size)).unwrap();
            let va = f.controller.scratch_allocation().unwrap().gpu_addr();
            assert!(f.controller.slot_id() > last_slot);
            assert_ne!(va, last_va);
            last_slot = f.controller.slot_id();
            last_va = va;
        }
    }

    #[test]
    fn test_wrap_reuses_only_retired_slots() {
        let mut f = fixture("EnablePrivateScratchSlot1=0");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        for task in 1..=15u64 {
            let request = ScratchRequest::new(task).with_scratch_size(task as u32 * 64);
            f.request(&mut heap, request).unwrap();
        }
        assert_eq!(f.controller.slot_id(), 15);

        // slot 1 is still used by task 1
        let request = ScratchRequest::new(16).with_scratch_size(16 * 64);
        assert_eq!(f.request(&mut heap, request).unwrap_err(), Error::CapacityExceeded);
        assert_eq!(f.controller.slot_id(), 15);
        assert_eq!(f.controller.per_thread_scratch_size(), 15 * 64);

        let live = f.mm.live_allocations();
        f.request(&mut heap, request.with_completed(1)).unwrap();
        assert_eq!(f.controller.slot_id(), 1);
        assert_eq!(f.mm.live_allocations(), live + 1);
    }

    #[test]
    fn test_wrap_waits_for_last_user_of_slot() {
        let mut f = fixture("EnablePrivateScratchSlot1=0");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        for task in 1..=20u64 {
            f.request(&mut heap, ScratchRequest::new(task).with_scratch_size(64)).unwrap();
        }
        assert_eq!(f.controller.slot_id(), 1);
        let slot_one = f.controller.offset_to_surface_state(1);
        let descriptor = heap.read(slot_one).unwrap();

        for task in 21..=34u64 {
            let size = (task as u32 - 19) * 64;
            f.request(&mut heap, ScratchRequest::new(task).with_scratch_size(size)).unwrap();
        }
        assert_eq!(f.controller.slot_id(), 15);

        // task 1 programmed slot 1, task 20 still reads it
        let request = ScratchRequest::new(35).with_scratch_size(16 * 64);
        assert_eq!(
            f.request(&mut heap, request.with_completed(1)).unwrap_err(),
            Error::CapacityExceeded
        );
        assert_eq!(f.controller.slot_id(), 15);
        assert_eq!(heap.read(slot_one).unwrap(), descriptor);

        f.request(&mut heap, request.with_completed(20)).unwrap();
        assert_eq!(f.controller.slot_id(), 1);
        assert_ne!(heap.read(slot_one).unwrap(), descriptor);
    }

    struct RejectPrivate(Arc<HeapMemoryManager>);

    impl MemoryManager for RejectPrivate {
        fn allocate(&self, props: &AllocationProperties) -> Result<AllocationRef> {
            if props.allocation_type == AllocationType::PrivateSurface {
                return Err(Error::OutOfMemory);
            }
            self.0.allocate(props)
        }

        fn free(&self, allocation: AllocationRef) {
            self.0.free(allocation)
        }
    }

    #[test]
    fn test_allocation_failure_changes_nothing() {
        let mut f = fixture("EnablePrivateScratchSlot1=1");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        f.mm.fail_next_allocations(1);
        let request = ScratchRequest::new(0).with_scratch_size(64).with_private_scratch_size(64);
        assert_eq!(f.request(&mut heap, request).unwrap_err(), Error::AllocationFailed);
        assert_eq!(f.controller.slot_id(), 0);
        assert!(f.controller.scratch_allocation().is_none());
        assert_eq!(f.mm.live_allocations(), 0);

        f.request(&mut heap, request).unwrap();
        assert_eq!(f.controller.slot_id(), 1);
    }

    #[test]
    fn test_partial_allocation_is_returned() {
        let mm = HeapMemoryManager::shared();
        let reject: Arc<dyn MemoryManager> = Arc::new(RejectPrivate(mm.clone()));
        let mut controller =
            ScratchSpaceController::new(&HardwareInfo::xe_hp(), &DebugSettings::default(), reject.clone())
                .unwrap();
        let mut storage = InternalAllocationStorage::new(reject, 0);
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);

        let request = ScratchRequest::new(0).with_scratch_size(64).with_private_scratch_size(64);
        let err = controller
            .set_required_scratch_space(&mut heap, &request, &OsContext::compute(0), &mut storage)
            .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
        assert!(controller.scratch_allocation().is_none());
        assert_eq!(controller.per_thread_scratch_size(), 0);
        assert_eq!(mm.live_allocations(), 0);
        assert_eq!(mm.stats().frees, 1);
    }

    #[test]
    fn test_heap_too_small() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 128];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);
        assert_eq!(
            f.request(&mut heap, ScratchRequest::new(0).with_scratch_size(64)).unwrap_err(),
            Error::BufferOverflow
        );
        assert!(f.controller.scratch_allocation().is_none());
        assert_eq!(f.mm.live_allocations(), 0);
    }

    #[test]
    fn test_release_allocations() {
        let mut f = fixture("");
        let mut bytes = vec![0u8; 0x1000];
        let mut heap = SurfaceStateHeap::new(GpuAddr::new(0x2000), &mut bytes);
        f.request(&mut heap, ScratchRequest::new(3).with_scratch_size(64).with_private_scratch_size(64))
            .unwrap();

        f.controller.release_allocations(&mut f.storage, 3);
        assert!(f.controller.scratch_allocation().is_none());
        assert_eq!(f.storage.len(AllocationUsage::Temporary), 2);
        assert_eq!(f.storage.clean(2, AllocationUsage::Temporary), 0);
        assert_eq!(f.storage.clean(3, AllocationUsage::Temporary), 2);
        assert_eq!(f.mm.live_allocations(), 0);
    }

    #[test]
    fn test_reserve_heap() {
        use ignis_core::Handle;
        use ignis_mem::{GraphicsAllocation, MemoryPool, StorageInfo};

        let f = fixture("");
        let allocation = Arc::new(GraphicsAllocation::new(
            Handle::from_raw(99),
            AllocationType::InternalHeap,
            GpuAddr::new(0x10_0000),
            ByteSize::from_kib(64),
            MemoryPool::System4KbPages,
            StorageInfo::default(),
        ));
        let mut heap = IndirectHeap::new(crate::stream::HeapType::SurfaceState, allocation);
        f.controller.reserve_heap(&mut heap).unwrap();
        assert_eq!(heap.used(), f.controller.reserved_heap_size());
        f.controller.reserve_heap(&mut heap).unwrap();
        assert_eq!(heap.used(), f.controller.reserved_heap_size());
    }
}
