//! # Submission Backends
//!
//! The privileged half of submission: make memory resident, hand a finished
//! command buffer to the kernel driver, wait on its fence, evict.
//!
//! [`SubmissionBackend`] is the seam; [`SoftwareBackend`] executes nothing
//! and completes fences in-process.

mod software;

pub use software::{CompletionMode, SoftwareBackend, SubmissionRecord};

use ignis_core::{
    ContextId, DispatchMode, FlushStamp, GpuAddr, HardwareInfo, PreemptionMode, Result, TaskCount,
};
use ignis_mem::AllocationRef;

use crate::dispatch::QueueThrottle;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// What the kernel-driver path prefers and supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Dispatch mode used when the configuration does not pick one
    pub default_dispatch_mode: DispatchMode,
    /// Flushing batched work when a new resource becomes resident is supported
    pub new_resource_implicit_flush: bool,
    /// Flushing batched work when the GPU went idle is supported
    pub gpu_idle_implicit_flush: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            default_dispatch_mode: DispatchMode::Batched,
            new_resource_implicit_flush: true,
            gpu_idle_implicit_flush: true,
        }
    }
}

// =============================================================================
// COMMAND BUFFER HEADER
// =============================================================================

bitflags::bitflags! {
    /// Per-submission flags read by the kernel driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// Coherent memory access
        const REQUIRES_COHERENCY = 1 << 0;
        /// The buffer can be preempted between commands
        const NEEDS_MID_BATCH_PREEMPTION_SUPPORT = 1 << 1;
        /// Submit on the low-priority path
        const LOW_PRIORITY = 1 << 2;
    }
}

/// Subslice counts above this are not expressible in the throttle field
const MAX_REQUESTED_SUBSLICES: u32 = 7;

/// Private data attached to every submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferHeader {
    /// Flags
    pub flags: HeaderFlags,
    /// Subslices requested by the throttle, 0 for the driver default
    pub umd_requested_subslice_count: u32,
    /// EUs per requested subslice
    pub umd_requested_eu_count: u32,
}

impl CommandBufferHeader {
    /// Build the header of one submission
    pub fn new(
        hw: &HardwareInfo,
        requires_coherency: bool,
        low_priority: bool,
        throttle: QueueThrottle,
        preemption_mode: PreemptionMode,
    ) -> Self {
        let mut flags = HeaderFlags::empty();
        flags.set(HeaderFlags::REQUIRES_COHERENCY, requires_coherency);
        flags.set(HeaderFlags::LOW_PRIORITY, low_priority);
        flags.set(
            HeaderFlags::NEEDS_MID_BATCH_PREEMPTION_SUPPORT,
            preemption_mode != PreemptionMode::Disabled,
        );

        let umd_requested_subslice_count = match throttle {
            QueueThrottle::Low => 1,
            QueueThrottle::Medium => 0,
            QueueThrottle::High if hw.subslice_count <= MAX_REQUESTED_SUBSLICES => hw.subslice_count,
            QueueThrottle::High => 0,
        };

        Self {
            flags,
            umd_requested_subslice_count,
            umd_requested_eu_count: hw.eu_per_subslice(),
        }
    }

    /// Check if coherency was requested
    pub fn requires_coherency(&self) -> bool {
        self.flags.contains(HeaderFlags::REQUIRES_COHERENCY)
    }

    /// Check if mid-batch preemption must be supported
    pub fn needs_mid_batch_preemption_support(&self) -> bool {
        self.flags.contains(HeaderFlags::NEEDS_MID_BATCH_PREEMPTION_SUPPORT)
    }
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// One physical submission
#[derive(Debug)]
pub struct Submission<'a> {
    /// Engine context
    pub context: ContextId,
    /// GPU address of the first command
    pub gpu_address: GpuAddr,
    /// Commands as written to the buffer
    pub commands: &'a [u8],
    /// Kernel-driver header
    pub header: CommandBufferHeader,
    /// Task count signalled when the submission completes
    pub task_count: TaskCount,
    /// Allocations the submission reads or writes
    pub residency: &'a [AllocationRef],
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Kernel-driver submission path
pub trait SubmissionBackend: Send {
    /// Static capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Make allocations GPU-visible for the next submission
    fn make_resident(&mut self, allocations: &[AllocationRef]) -> Result<()>;

    /// Submit a command buffer, returning its flush stamp
    fn submit(&mut self, submission: &Submission<'_>) -> Result<FlushStamp>;

    /// Block until the submission with `stamp` completed
    fn wait_for_flush_stamp(&mut self, stamp: FlushStamp) -> Result<()>;

    /// Highest task count known to be complete
    fn completed_task_count(&self) -> TaskCount;

    /// Drop residency of allocations
    fn evict(&mut self, allocations: &[AllocationRef]) -> Result<()>;

    /// Lock an allocation for kernel-mode capture
    fn lock_for_km_daf(&mut self, _allocation: &AllocationRef) -> Result<()> {
        Ok(())
    }
}

/// Hand `submission` to `backend`, residency and capture locks first
pub(crate) fn submit_to<B: SubmissionBackend>(
    backend: &mut B,
    km_daf_enabled: bool,
    submission: &Submission<'_>,
) -> Result<FlushStamp> {
    backend.make_resident(submission.residency)?;

    if km_daf_enabled {
        for allocation in submission
            .residency
            .iter()
            .filter(|a| a.allocation_type().is_km_daf_lockable())
        {
            backend.lock_for_km_daf(allocation)?;
        }
    }

    backend.submit(submission)
}
