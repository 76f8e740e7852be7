//! # Hardware Capabilities
//!
//! The capability table injected into the submission core. One parameterized
//! core serves every generation; differences live in [`HardwareInfo`].

use core::fmt;

// =============================================================================
// ENGINES
// =============================================================================

/// Engine a context submits to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// Render command streamer
    Rcs,
    /// Compute command streamer
    Ccs,
    /// Blitter (copy) command streamer
    Bcs,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rcs => write!(f, "rcs"),
            Self::Ccs => write!(f, "ccs"),
            Self::Bcs => write!(f, "bcs"),
        }
    }
}

// =============================================================================
// PREEMPTION
// =============================================================================

/// Preemption granularity requested for a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PreemptionMode {
    /// No preemption
    Disabled,
    /// Preempt between command buffers
    MidBatch,
    /// Preempt between thread groups
    #[default]
    ThreadGroup,
    /// Preempt mid-thread (requires a context save surface)
    MidThread,
}

impl PreemptionMode {
    /// Masked register value programmed when switching to this mode
    pub const fn register_value(self) -> u32 {
        const MASK: u32 = 0x0006_0000;
        match self {
            Self::MidThread => MASK,
            Self::ThreadGroup => MASK | 0x2,
            Self::MidBatch => MASK | 0x4,
            Self::Disabled => MASK | 0x6,
        }
    }
}

// =============================================================================
// FEATURES
// =============================================================================

bitflags::bitflags! {
    /// Hardware features relevant to command submission
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwFeatures: u32 {
        /// Second (private) scratch descriptor per slot
        const PRIVATE_SCRATCH = 1 << 0;
        /// STATE_COMPUTE_MODE must be tracked and re-emitted
        const STATE_COMPUTE_MODE_TRACKING = 1 << 1;
        /// Thread arbitration policy is part of STATE_COMPUTE_MODE
        const THREAD_ARBITRATION_IN_COMPUTE_MODE = 1 << 2;
        /// Root device may be built from multiple tiles
        const MULTI_TILE = 1 << 3;
        /// Coherency is selectable per submission
        const COHERENCY_CONTROL = 1 << 4;
    }
}

// =============================================================================
// HARDWARE INFO
// =============================================================================

/// Capability table of one device
#[derive(Debug, Clone)]
pub struct HardwareInfo {
    /// Human-readable platform name
    pub platform: &'static str,
    /// Hardware threads that may run concurrently and need scratch
    pub compute_units_used_for_scratch: u32,
    /// Size of one RENDER_SURFACE_STATE descriptor in bytes
    pub surface_state_size: u32,
    /// Execution units on the device
    pub eu_count: u32,
    /// Subslices on the device
    pub subslice_count: u32,
    /// Default preemption mode of the platform
    pub default_preemption_mode: PreemptionMode,
    /// Default GRF count of a kernel
    pub default_grf_count: u32,
    /// Feature flags
    pub features: HwFeatures,
}

impl HardwareInfo {
    /// Xe-HP capability table
    pub fn xe_hp() -> Self {
        Self {
            platform: "xe_hp",
            compute_units_used_for_scratch: 1024,
            surface_state_size: 64,
            eu_count: 512,
            subslice_count: 32,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            default_grf_count: 128,
            features: HwFeatures::PRIVATE_SCRATCH
                | HwFeatures::STATE_COMPUTE_MODE_TRACKING
                | HwFeatures::MULTI_TILE
                | HwFeatures::COHERENCY_CONTROL,
        }
    }

    /// Xe-HPC capability table
    pub fn xe_hpc() -> Self {
        Self {
            platform: "xe_hpc",
            compute_units_used_for_scratch: 2048,
            surface_state_size: 64,
            eu_count: 1024,
            subslice_count: 64,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            default_grf_count: 128,
            features: HwFeatures::PRIVATE_SCRATCH
                | HwFeatures::STATE_COMPUTE_MODE_TRACKING
                | HwFeatures::THREAD_ARBITRATION_IN_COMPUTE_MODE
                | HwFeatures::MULTI_TILE
                | HwFeatures::COHERENCY_CONTROL,
        }
    }

    /// Gen12LP capability table
    pub fn gen12lp() -> Self {
        Self {
            platform: "gen12lp",
            compute_units_used_for_scratch: 672,
            surface_state_size: 64,
            eu_count: 96,
            subslice_count: 6,
            default_preemption_mode: PreemptionMode::MidThread,
            default_grf_count: 128,
            features: HwFeatures::COHERENCY_CONTROL,
        }
    }

    /// Check if private scratch is available
    pub fn private_scratch_supported(&self) -> bool {
        self.features.contains(HwFeatures::PRIVATE_SCRATCH)
    }

    /// EUs per subslice
    pub fn eu_per_subslice(&self) -> u32 {
        if self.subslice_count == 0 {
            0
        } else {
            self.eu_count / self.subslice_count
        }
    }
}

impl Default for HardwareInfo {
    fn default() -> Self {
        Self::xe_hp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let hw = HardwareInfo::xe_hp();
        assert!(hw.private_scratch_supported());
        assert_eq!(hw.surface_state_size, 64);
        assert_eq!(hw.eu_per_subslice(), 16);

        let lp = HardwareInfo::gen12lp();
        assert!(!lp.private_scratch_supported());
        assert_eq!(lp.default_preemption_mode, PreemptionMode::MidThread);
    }

    #[test]
    fn test_eu_per_subslice_without_subslices() {
        let hw = HardwareInfo {
            subslice_count: 0,
            ..HardwareInfo::xe_hp()
        };
        assert_eq!(hw.eu_per_subslice(), 0);
    }
}
