//! # Memory Manager
//!
//! The allocate/free seam consumed by the submission core, and
//! [`HeapMemoryManager`], a first-fit GPU virtual address allocator with one
//! range per memory pool.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use ignis_core::{ByteSize, DeviceBitfield, Error, GpuAddr, Handle, Result};
use spin::Mutex;

use crate::allocation::{
    AllocationHandle, AllocationRef, AllocationType, GraphicsAllocation, MemoryPool, StorageInfo,
};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Page size of system memory
pub const PAGE_SIZE: u64 = 4096;

/// Page size of device-local memory
pub const PAGE_SIZE_64K: u64 = 64 * 1024;

// =============================================================================
// ALLOCATION PROPERTIES
// =============================================================================

/// Request passed to [`MemoryManager::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProperties {
    /// Requested size
    pub size: ByteSize,
    /// Required alignment (0 = pool default)
    pub alignment: u64,
    /// Allocation type
    pub allocation_type: AllocationType,
    /// Tiles the allocation is for
    pub device_bitfield: DeviceBitfield,
    /// Back the allocation with every tile of `device_bitfield`
    pub multi_storage: bool,
}

impl AllocationProperties {
    /// Single-tile request with default alignment
    pub fn new(size: ByteSize, allocation_type: AllocationType, device_bitfield: DeviceBitfield) -> Self {
        Self {
            size,
            alignment: 0,
            allocation_type,
            device_bitfield,
            multi_storage: false,
        }
    }

    /// Set multi-storage placement
    pub fn with_multi_storage(mut self, multi_storage: bool) -> Self {
        self.multi_storage = multi_storage;
        self
    }

    /// Set alignment
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Pool the allocation type lives in
    pub fn preferred_pool(&self) -> MemoryPool {
        match self.allocation_type {
            AllocationType::Scratch
            | AllocationType::PrivateSurface
            | AllocationType::WorkPartitionSurface
            | AllocationType::PreemptionSurface
            | AllocationType::Buffer => MemoryPool::LocalMemory,
            AllocationType::LinearStream
            | AllocationType::FillPattern
            | AllocationType::CommandBuffer
            | AllocationType::InternalHeap
            | AllocationType::TagBuffer => MemoryPool::System4KbPages,
        }
    }
}

impl StorageInfo {
    /// Placement for a request
    pub fn for_properties(props: &AllocationProperties) -> Self {
        let tiles = props.device_bitfield;
        match props.allocation_type {
            AllocationType::WorkPartitionSurface => Self {
                memory_banks: tiles,
                page_tables_visibility: tiles,
                cloning_of_page_tables: false,
                tile_instanced: true,
                multi_storage: tiles.is_multi_tile(),
            },
            _ => Self {
                memory_banks: tiles,
                page_tables_visibility: tiles,
                cloning_of_page_tables: true,
                tile_instanced: false,
                multi_storage: props.multi_storage && tiles.is_multi_tile(),
            },
        }
    }
}

// =============================================================================
// MEMORY MANAGER TRAIT
// =============================================================================

/// Graphics memory provider
///
/// Shared by every receiver on a device; implementations synchronize
/// internally.
pub trait MemoryManager: Send + Sync {
    /// Allocate graphics memory
    fn allocate(&self, props: &AllocationProperties) -> Result<AllocationRef>;

    /// Release graphics memory
    fn free(&self, allocation: AllocationRef);
}

// =============================================================================
// VA RANGE ALLOCATOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VaRange {
    start: u64,
    end: u64,
}

#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

#[derive(Debug)]
struct VaAllocator {
    blocks: Vec<VaBlock>,
    min_alignment: u64,
}

impl VaAllocator {
    fn new(base: GpuAddr, size: ByteSize, min_alignment: u64) -> Self {
        let range = VaRange {
            start: base.raw(),
            end: base.raw() + size.as_bytes(),
        };
        Self {
            blocks: vec![VaBlock { range, free: true }],
            min_alignment,
        }
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Option<VaRange> {
        let alignment = alignment.max(self.min_alignment);
        let size = (size + alignment - 1) & !(alignment - 1);

        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block = self.blocks[i].range;
            let start = (block.start + alignment - 1) & !(alignment - 1);
            let end = start + size;

            if end <= block.end {
                let range = VaRange { start, end };
                self.split_block(i, range);
                return Some(range);
            }
        }

        None
    }

    fn split_block(&mut self, index: usize, range: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if range.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: range.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, VaBlock { range, free: false });

        if range.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: range.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    fn free(&mut self, range: VaRange) -> bool {
        let Some(index) = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
        else {
            return false;
        };

        self.blocks[index].free = true;

        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }

        true
    }
}

// =============================================================================
// HEAP MEMORY MANAGER
// =============================================================================

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Failed allocations
    pub failures: u64,
    /// Bytes currently allocated
    pub bytes_in_use: u64,
}

#[derive(Debug)]
struct ManagerState {
    system: VaAllocator,
    local: VaAllocator,
    live: HashMap<AllocationHandle, (MemoryPool, VaRange)>,
    next_handle: u64,
    injected_failures: u32,
    stats: ManagerStats,
}

/// First-fit GPU VA allocator with a system and a device-local range
#[derive(Debug)]
pub struct HeapMemoryManager {
    state: Mutex<ManagerState>,
}

impl HeapMemoryManager {
    /// Base of the system memory range
    pub const SYSTEM_BASE: GpuAddr = GpuAddr::new(0x0000_0001_0000_0000);
    /// Base of the device-local range
    pub const LOCAL_BASE: GpuAddr = GpuAddr::new(0x0000_0100_0000_0000);

    /// Create with 1 GiB of system and 4 GiB of local address space
    pub fn new() -> Self {
        Self::with_budget(ByteSize::from_mib(1024), ByteSize::from_mib(4096))
    }

    /// Create with explicit pool sizes
    pub fn with_budget(system: ByteSize, local: ByteSize) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                system: VaAllocator::new(Self::SYSTEM_BASE, system, PAGE_SIZE),
                local: VaAllocator::new(Self::LOCAL_BASE, local, PAGE_SIZE_64K),
                live: HashMap::new(),
                next_handle: 1,
                injected_failures: 0,
                stats: ManagerStats::default(),
            }),
        }
    }

    /// Create shared
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` allocations fail
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().injected_failures = count;
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Check if an allocation is still live
    pub fn is_live(&self, handle: AllocationHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ManagerStats {
        self.state.lock().stats.clone()
    }
}

impl Default for HeapMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for HeapMemoryManager {
    fn allocate(&self, props: &AllocationProperties) -> Result<AllocationRef> {
        if props.size.as_bytes() == 0 {
            return Err(Error::InvalidParameter);
        }

        let mut state = self.state.lock();

        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            state.stats.failures += 1;
            log::warn!("{} allocation of {:?} failed (injected)", props.allocation_type, props.size);
            return Err(Error::AllocationFailed);
        }

        let pool = props.preferred_pool();
        let allocator = match pool {
            MemoryPool::LocalMemory => &mut state.local,
            _ => &mut state.system,
        };

        let Some(range) = allocator.allocate(props.size.as_bytes(), props.alignment) else {
            state.stats.failures += 1;
            log::warn!("out of {:?} address space for {:?}", pool, props.size);
            return Err(Error::OutOfMemory);
        };

        let handle = Handle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.live.insert(handle, (pool, range));
        state.stats.allocations += 1;
        state.stats.bytes_in_use += range.end - range.start;

        let allocation = GraphicsAllocation::new(
            handle,
            props.allocation_type,
            GpuAddr::new(range.start),
            props.size,
            pool,
            StorageInfo::for_properties(props),
        );
        let allocation = if pool == MemoryPool::System4KbPages {
            allocation.with_cpu_addr(range.start)
        } else {
            allocation
        };

        log::trace!(
            "allocated {} {:?} at {} ({:?})",
            props.allocation_type,
            props.size,
            allocation.gpu_addr(),
            pool
        );

        Ok(Arc::new(allocation))
    }

    fn free(&self, allocation: AllocationRef) {
        let mut state = self.state.lock();

        let Some((pool, range)) = state.live.remove(&allocation.handle()) else {
            log::warn!("free of unknown allocation {:?}", allocation.handle());
            return;
        };

        let released = match pool {
            MemoryPool::LocalMemory => state.local.free(range),
            _ => state.system.free(range),
        };
        debug_assert!(released);

        state.stats.frees += 1;
        state.stats.bytes_in_use -= range.end - range.start;

        log::trace!("freed {} at {}", allocation.allocation_type(), allocation.gpu_addr());
    }
}

static_assertions::assert_impl_all!(HeapMemoryManager: Send, Sync);
