//! # IGNIS Memory
//!
//! Graphics allocations, the memory-manager seam, deferred reclamation and
//! per-receiver residency tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      IGNIS Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │            MemoryManager (allocate / free)                │  │
//! │  │     HeapMemoryManager: first-fit GPU VA per pool          │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌──────┴──────────┐  ┌────────────────┐   │
//! │  │ GraphicsAlloc.  │  │ Internal Alloc. │  │  Residency     │   │
//! │  │ (per-context    │  │ Storage         │  │  Set           │   │
//! │  │  task counts)   │  │ (temp/reusable) │  │ (resident /    │   │
//! │  │                 │  │                 │  │  eviction)     │   │
//! │  └─────────────────┘  └─────────────────┘  └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Allocations are shared through [`AllocationRef`] (`Arc`); the last use of
//! an allocation on a context is its task count, and nothing is freed before
//! that task count has retired.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod allocation;
pub mod manager;
pub mod residency;
pub mod storage;

// Re-exports
pub use allocation::{
    AllocationHandle, AllocationRef, AllocationType, GraphicsAllocation, MemoryPool, StorageInfo,
};
pub use manager::{AllocationProperties, HeapMemoryManager, ManagerStats, MemoryManager};
pub use residency::ResidencySet;
pub use storage::{AllocationUsage, InternalAllocationStorage};
