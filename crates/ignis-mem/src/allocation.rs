//! # Graphics Allocations
//!
//! A GPU-visible memory region and its per-context usage ledger.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ignis_core::{ByteSize, ContextId, DeviceBitfield, GpuAddr, Handle, TaskCount};
use spin::Mutex;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Allocation handle
pub type AllocationHandle = Handle<GraphicsAllocation>;

/// Shared reference to an allocation
pub type AllocationRef = Arc<GraphicsAllocation>;

// =============================================================================
// ALLOCATION TYPE
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// User buffer
    Buffer,
    /// Command stream written by the CPU
    LinearStream,
    /// Fill pattern for buffer fills
    FillPattern,
    /// Command buffer of a command-stream receiver
    CommandBuffer,
    /// Dynamic-state, indirect-object or surface-state heap
    InternalHeap,
    /// Per-thread scratch space
    Scratch,
    /// Per-thread private scratch space
    PrivateSurface,
    /// Completion tag written by the GPU
    TagBuffer,
    /// Static work partition counters for multi-tile dispatch
    WorkPartitionSurface,
    /// Mid-thread preemption context save area
    PreemptionSurface,
}

impl AllocationType {
    /// Check if the allocation is locked when KM-DAF capture is on
    pub const fn is_km_daf_lockable(self) -> bool {
        matches!(self, Self::LinearStream | Self::FillPattern)
    }
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "BUFFER",
            Self::LinearStream => "LINEAR_STREAM",
            Self::FillPattern => "FILL_PATTERN",
            Self::CommandBuffer => "COMMAND_BUFFER",
            Self::InternalHeap => "INTERNAL_HEAP",
            Self::Scratch => "SCRATCH_SURFACE",
            Self::PrivateSurface => "PRIVATE_SURFACE",
            Self::TagBuffer => "TAG_BUFFER",
            Self::WorkPartitionSurface => "WORK_PARTITION_SURFACE",
            Self::PreemptionSurface => "PREEMPTION",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// MEMORY POOL
// =============================================================================

/// Memory pool backing an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// System memory, 4KB pages
    System4KbPages,
    /// System memory the CPU cannot map
    SystemCpuInaccessible,
    /// Device-local memory
    LocalMemory,
}

impl MemoryPool {
    /// Check if the CPU may map this pool
    pub const fn is_cpu_accessible(self) -> bool {
        !matches!(self, Self::SystemCpuInaccessible)
    }
}

// =============================================================================
// STORAGE INFO
// =============================================================================

/// Placement of an allocation across tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageInfo {
    /// Tiles whose memory backs the allocation
    pub memory_banks: DeviceBitfield,
    /// Tiles whose page tables map the allocation
    pub page_tables_visibility: DeviceBitfield,
    /// Page tables are cloned on every tile
    pub cloning_of_page_tables: bool,
    /// Every tile sees its own instance at the same address
    pub tile_instanced: bool,
    /// Backed by more than one tile
    pub multi_storage: bool,
}

// =============================================================================
// USAGE LEDGER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    context: ContextId,
    task_count: Option<TaskCount>,
    residency_task_count: Option<TaskCount>,
}

// =============================================================================
// GRAPHICS ALLOCATION
// =============================================================================

/// A GPU-visible memory region
pub struct GraphicsAllocation {
    handle: AllocationHandle,
    allocation_type: AllocationType,
    gpu_addr: GpuAddr,
    size: ByteSize,
    pool: MemoryPool,
    storage_info: StorageInfo,
    cpu_addr: Option<u64>,
    usage: Mutex<Vec<UsageEntry>>,
}

impl GraphicsAllocation {
    /// Create a new allocation record
    pub fn new(
        handle: AllocationHandle,
        allocation_type: AllocationType,
        gpu_addr: GpuAddr,
        size: ByteSize,
        pool: MemoryPool,
        storage_info: StorageInfo,
    ) -> Self {
        Self {
            handle,
            allocation_type,
            gpu_addr,
            size,
            pool,
            storage_info,
            cpu_addr: None,
            usage: Mutex::new(Vec::new()),
        }
    }

    /// Attach a CPU mapping
    pub fn with_cpu_addr(mut self, cpu_addr: u64) -> Self {
        self.cpu_addr = Some(cpu_addr);
        self
    }

    /// Unique handle
    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    /// Allocation type
    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    /// GPU virtual address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Memory pool
    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    /// Tile placement
    pub fn storage_info(&self) -> StorageInfo {
        self.storage_info
    }

    /// CPU mapping, if any
    pub fn cpu_addr(&self) -> Option<u64> {
        self.cpu_addr
    }

    fn with_entry<R>(&self, context: ContextId, f: impl FnOnce(&mut UsageEntry) -> R) -> R {
        let mut usage = self.usage.lock();
        let index = match usage.iter().position(|e| e.context == context) {
            Some(index) => index,
            None => {
                usage.push(UsageEntry {
                    context,
                    task_count: None,
                    residency_task_count: None,
                });
                usage.len() - 1
            }
        };
        f(&mut usage[index])
    }

    fn read_entry(&self, context: ContextId) -> Option<UsageEntry> {
        self.usage
            .lock()
            .iter()
            .find(|e| e.context == context)
            .copied()
    }

    /// Task count of the last submission on `context` that used this allocation
    pub fn task_count(&self, context: ContextId) -> Option<TaskCount> {
        self.read_entry(context).and_then(|e| e.task_count)
    }

    /// Record a use by the submission with `task_count`
    pub fn update_task_count(&self, task_count: TaskCount, context: ContextId) {
        self.with_entry(context, |e| e.task_count = Some(task_count));
    }

    /// Check if every use on `context` has completed
    pub fn is_retired(&self, context: ContextId, completed: TaskCount) -> bool {
        self.task_count(context).map_or(true, |t| t <= completed)
    }

    /// Task count of the last submission on `context` that made this resident
    pub fn residency_task_count(&self, context: ContextId) -> Option<TaskCount> {
        self.read_entry(context).and_then(|e| e.residency_task_count)
    }

    /// Record residency for the submission with `task_count`
    pub fn update_residency_task_count(&self, task_count: TaskCount, context: ContextId) {
        self.with_entry(context, |e| e.residency_task_count = Some(task_count));
    }

    /// Check if the allocation was made resident on `context`
    pub fn is_resident(&self, context: ContextId) -> bool {
        self.residency_task_count(context).is_some()
    }

    /// Forget residency on `context` (after eviction)
    pub fn release_residency(&self, context: ContextId) {
        self.with_entry(context, |e| e.residency_task_count = None);
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("handle", &self.handle)
            .field("type", &self.allocation_type)
            .field("gpu_addr", &self.gpu_addr)
            .field("size", &self.size)
            .field("pool", &self.pool)
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsAllocation: Send, Sync);
