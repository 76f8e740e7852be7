//! # OS Context
//!
//! An engine context as seen by the operating system: the engine, the tiles it
//! spans, its preemption mode and whether direct submission is active.

use crate::hw::{EngineType, PreemptionMode};
use crate::types::{ContextId, DeviceBitfield};

/// Engine context owned by the OS interface
#[derive(Debug, Clone)]
pub struct OsContext {
    id: ContextId,
    engine: EngineType,
    device_bitfield: DeviceBitfield,
    preemption_mode: PreemptionMode,
    low_priority: bool,
    direct_submission_active: bool,
}

impl OsContext {
    /// Create a new context
    pub fn new(
        id: ContextId,
        engine: EngineType,
        device_bitfield: DeviceBitfield,
        preemption_mode: PreemptionMode,
    ) -> Self {
        Self {
            id,
            engine,
            device_bitfield,
            preemption_mode,
            low_priority: false,
            direct_submission_active: false,
        }
    }

    /// Single-tile compute context
    pub fn compute(id: ContextId) -> Self {
        Self::new(
            id,
            EngineType::Ccs,
            DeviceBitfield::new(0b1),
            PreemptionMode::ThreadGroup,
        )
    }

    /// Context id
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Engine
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Tiles covered by this context
    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    /// Number of tiles covered by this context
    pub fn num_supported_devices(&self) -> u32 {
        self.device_bitfield.count()
    }

    /// Preemption mode
    pub fn preemption_mode(&self) -> PreemptionMode {
        self.preemption_mode
    }

    /// Change the preemption mode
    pub fn set_preemption_mode(&mut self, mode: PreemptionMode) {
        self.preemption_mode = mode;
    }

    /// Check if this is a low-priority context
    pub fn is_low_priority(&self) -> bool {
        self.low_priority
    }

    /// Mark the context as low priority
    pub fn set_low_priority(&mut self, low_priority: bool) {
        self.low_priority = low_priority;
    }

    /// Check if direct (ring-buffer) submission is active
    pub fn is_direct_submission_active(&self) -> bool {
        self.direct_submission_active
    }

    /// Activate or deactivate direct submission
    pub fn set_direct_submission_active(&mut self, active: bool) {
        log::debug!(
            "context {} ({}): direct submission {}",
            self.id,
            self.engine,
            if active { "on" } else { "off" }
        );
        self.direct_submission_active = active;
    }
}

static_assertions::assert_impl_all!(OsContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_devices() {
        let ctx = OsContext::new(
            3,
            EngineType::Ccs,
            DeviceBitfield::new(0b1011),
            PreemptionMode::MidThread,
        );
        assert_eq!(ctx.id(), 3);
        assert_eq!(ctx.num_supported_devices(), 3);
        assert_eq!(ctx.preemption_mode(), PreemptionMode::MidThread);
    }

    #[test]
    fn test_direct_submission_flag() {
        let mut ctx = OsContext::compute(0);
        assert!(!ctx.is_direct_submission_active());
        ctx.set_direct_submission_active(true);
        assert!(ctx.is_direct_submission_active());
    }
}
