//! # IGNIS Core
//!
//! Foundational types, hardware capabilities and configuration shared by the
//! IGNIS compute submission stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ignis-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │  Hardware   │  │   Configuration     │  │
//! │  │ (GpuAddr,   │  │ (HwInfo,    │  │  (DebugSettings,    │  │
//! │  │  TaskCount) │  │  OsContext) │  │   DispatchMode)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                  Error / Result                       │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod context;
pub mod error;
pub mod hw;
pub mod types;

// Re-exports for convenience
pub use config::{DebugSettings, DispatchMode};
pub use context::OsContext;
pub use error::{Error, Result};
pub use hw::{EngineType, HardwareInfo, HwFeatures, PreemptionMode};
pub use types::*;
