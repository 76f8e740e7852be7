//! STATE_COMPUTE_MODE tracking.

use ignis_core::{HardwareInfo, HwFeatures};

use crate::commands::Command;
use crate::dispatch::{DispatchFlags, ThreadArbitrationPolicy, DEFAULT_GRF_COUNT};

/// Last programmed compute mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeModeState {
    /// Coherency
    pub coherency_required: bool,
    /// GRF count
    pub num_grf: u32,
    /// Arbitration policy
    pub thread_arbitration: Option<ThreadArbitrationPolicy>,
}

impl Default for ComputeModeState {
    fn default() -> Self {
        Self {
            coherency_required: false,
            num_grf: DEFAULT_GRF_COUNT,
            thread_arbitration: None,
        }
    }
}

/// Which compute-mode fields a dispatch changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeModeRequest {
    /// Coherency differs from the programmed state
    pub coherency_changed: bool,
    /// GRF count differs from the programmed state
    pub num_grf_changed: bool,
    /// An arbitration policy is requested and supported
    pub thread_arbitration_programmed: bool,
}

impl ComputeModeRequest {
    /// Compare a dispatch against the programmed state
    pub fn evaluate(hw: &HardwareInfo, programmed: &ComputeModeState, flags: &DispatchFlags) -> Self {
        let tracking = hw.features.contains(HwFeatures::STATE_COMPUTE_MODE_TRACKING);
        let coherency_changed = tracking
            && hw.features.contains(HwFeatures::COHERENCY_CONTROL)
            && programmed.coherency_required != flags.requires_coherency;

        Self {
            coherency_changed,
            num_grf_changed: tracking && programmed.num_grf != flags.num_grf_required,
            thread_arbitration_programmed: flags.thread_arbitration_policy.is_some()
                && hw
                    .features
                    .contains(HwFeatures::THREAD_ARBITRATION_IN_COMPUTE_MODE),
        }
    }

    /// Check if STATE_COMPUTE_MODE must be emitted
    pub fn is_required(&self) -> bool {
        self.coherency_changed || self.num_grf_changed || self.thread_arbitration_programmed
    }

    /// Command for the new state
    pub fn command(&self, flags: &DispatchFlags) -> Command {
        Command::StateComputeMode {
            coherency_required: flags.requires_coherency,
            large_grf: flags.num_grf_required > DEFAULT_GRF_COUNT,
            thread_arbitration: if self.thread_arbitration_programmed {
                flags.thread_arbitration_policy
            } else {
                None
            },
        }
    }

    /// State after the command executed
    pub fn apply(&self, programmed: &mut ComputeModeState, flags: &DispatchFlags) {
        programmed.coherency_required = flags.requires_coherency;
        programmed.num_grf = flags.num_grf_required;
        if self.thread_arbitration_programmed {
            programmed.thread_arbitration = flags.thread_arbitration_policy;
        }
    }
}
