//! # IGNIS Command Submission
//!
//! The command-stream receiver of one engine context: it turns logical
//! dispatches into GPU submissions, owns the scratch space kernels spill
//! into, and keeps the task-count ledger that decides when memory may be
//! reused.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    CommandStreamReceiver                        │
//! │                                                                 │
//! │  ┌───────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │ Scratch Space │  │ Compute Mode / │  │ Completion Tracker │  │
//! │  │ Controller    │  │ Preamble state │  │ (task counts,      │  │
//! │  │ (slot ring)   │  │                │  │  flush stamps)     │  │
//! │  └───────┬───────┘  └───────┬────────┘  └─────────▲──────────┘  │
//! │          └─────────┬────────┘                     │             │
//! │          ┌─────────▼─────────┐      ┌─────────────┴──────────┐  │
//! │          │ Command encoder   │─────►│ Submission aggregator  │  │
//! │          │ (LinearStream)    │      │ (batched mode)         │  │
//! │          └───────────────────┘      └─────────────┬──────────┘  │
//! └───────────────────────────────────────────────────┼─────────────┘
//!                                                     │
//!                                        ┌────────────▼───────────┐
//!                                        │   SubmissionBackend    │
//!                                        │ (residency, submit,    │
//!                                        │  fence wait, evict)    │
//!                                        └────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use ignis_cmd::{CommandStreamReceiver, DispatchFlags, HeapType, IndirectHeap, LinearStream, SoftwareBackend};
//! use ignis_core::{ByteSize, DebugSettings, DeviceBitfield, HardwareInfo, OsContext};
//! use ignis_mem::{AllocationProperties, AllocationType, HeapMemoryManager, MemoryManager};
//!
//! let mm = HeapMemoryManager::shared();
//! let alloc = |t| {
//!     mm.allocate(&AllocationProperties::new(ByteSize::from_kib(64), t, DeviceBitfield::new(1)))
//! };
//!
//! let mut csr = CommandStreamReceiver::new(
//!     HardwareInfo::xe_hp(),
//!     DebugSettings::default(),
//!     OsContext::compute(0),
//!     mm.clone(),
//!     SoftwareBackend::new(),
//! )?;
//!
//! let mut task = LinearStream::new(alloc(AllocationType::LinearStream)?);
//! let mut dsh = IndirectHeap::new(HeapType::DynamicState, alloc(AllocationType::InternalHeap)?);
//! let mut ioh = IndirectHeap::new(HeapType::IndirectObject, alloc(AllocationType::InternalHeap)?);
//! let mut ssh = IndirectHeap::new(HeapType::SurfaceState, alloc(AllocationType::InternalHeap)?);
//!
//! let stamp = csr.flush_task(&mut task, 0, &mut dsh, &mut ioh, &mut ssh, &DispatchFlags::default())?;
//! csr.wait_for_task_count(stamp.task_count)?;
//! # Ok::<(), ignis_core::Error>(())
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod aggregator;
pub mod backend;
pub mod commands;
pub mod compute_mode;
pub mod csr;
pub mod dispatch;
pub mod scratch;
pub mod stream;
pub mod surface_state;
pub mod tracker;

// Re-exports
pub use aggregator::{AggregatedBatch, QueuedCommandBuffer, SubmissionAggregator};
pub use backend::{
    BackendCapabilities, CommandBufferHeader, CompletionMode, HeaderFlags, SoftwareBackend,
    Submission, SubmissionBackend, SubmissionRecord,
};
pub use commands::{Command, PipeControlFlags, PostSyncWrite, SemaphoreCompare};
pub use compute_mode::{ComputeModeRequest, ComputeModeState};
pub use csr::{CommandStreamReceiver, CsrState, CsrStats};
pub use dispatch::{
    BatchBuffer, CompletionStamp, DispatchFlags, QueueThrottle, ThreadArbitrationPolicy,
    TimestampDependency,
};
pub use scratch::{ScratchRequest, ScratchSpaceController, ScratchStats, StateDirty};
pub use stream::{HeapType, IndirectHeap, LinearStream};
pub use surface_state::{SurfaceStateDescriptor, SurfaceStateHeap, SurfaceType};
pub use tracker::{CompletionTracker, SubmissionState};
