//! # Configuration
//!
//! Per-instance debug and feature settings. A [`DebugSettings`] value is handed
//! to every command-stream receiver at construction; nothing is global.

use crate::hw::HardwareInfo;

// =============================================================================
// DISPATCH MODE
// =============================================================================

/// How logical dispatches turn into physical submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Submit after every dispatch
    Immediate,
    /// Aggregate dispatches until an explicit or implicit flush
    Batched,
}

impl DispatchMode {
    fn from_setting(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Immediate),
            2 => Some(Self::Batched),
            _ => None,
        }
    }
}

// =============================================================================
// DEBUG SETTINGS
// =============================================================================

/// Default size of the receiver's own command stream
pub const DEFAULT_CSR_COMMAND_STREAM_SIZE: u32 = 64 * 1024;

/// Feature switches for one command-stream receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSettings {
    /// Force private scratch on or off (None = hardware default)
    pub enable_private_scratch_slot1: Option<bool>,
    /// Force a dispatch mode (None = backend default)
    pub csr_dispatch_mode: Option<DispatchMode>,
    /// Force static work partitioning (None = on for multi-tile contexts)
    pub enable_static_partitioning: Option<bool>,
    /// Platform default for new-resource implicit flush
    pub new_resource_implicit_flush: bool,
    /// Platform default for GPU-idle implicit flush
    pub gpu_idle_implicit_flush: bool,
    /// Lock linear streams for KM-DAF capture
    pub km_daf_enabled: bool,
    /// Size of the receiver's command stream in bytes
    pub csr_command_stream_size: u32,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            enable_private_scratch_slot1: None,
            csr_dispatch_mode: None,
            enable_static_partitioning: None,
            new_resource_implicit_flush: true,
            gpu_idle_implicit_flush: true,
            km_daf_enabled: false,
            csr_command_stream_size: DEFAULT_CSR_COMMAND_STREAM_SIZE,
        }
    }
}

impl DebugSettings {
    /// Parse `Key=Value` tokens separated by whitespace
    ///
    /// Unknown keys and malformed values are ignored. Values may be decimal
    /// or `0x`-prefixed hex.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut settings = Self::default();

        for token in cmdline.split_whitespace() {
            let Some((key, value_str)) = token.split_once('=') else {
                continue;
            };
            // -1 keeps the platform default
            if value_str == "-1" {
                continue;
            }
            let Some(value) = parse_value(value_str) else {
                log::warn!("ignoring malformed setting {}", token);
                continue;
            };

            match key {
                "EnablePrivateScratchSlot1" => {
                    settings.enable_private_scratch_slot1 = Some(value != 0);
                }
                "CsrDispatchMode" => {
                    settings.csr_dispatch_mode = DispatchMode::from_setting(value);
                }
                "EnableStaticPartitioning" => {
                    settings.enable_static_partitioning = Some(value != 0);
                }
                "EnableNewResourceImplicitFlush" => {
                    settings.new_resource_implicit_flush = value != 0;
                }
                "EnableGpuIdleImplicitFlush" => {
                    settings.gpu_idle_implicit_flush = value != 0;
                }
                "EnableKmdAubCapture" => {
                    settings.km_daf_enabled = value != 0;
                }
                "CsrCommandStreamSize" => {
                    if value > 0 && value <= u32::MAX as u64 {
                        settings.csr_command_stream_size = value as u32;
                    }
                }
                _ => {}
            }
        }

        settings
    }

    /// Resolve private scratch against the hardware capability
    ///
    /// The override can only disable private scratch on hardware that has it.
    pub fn private_scratch_enabled(&self, hw: &HardwareInfo) -> bool {
        let supported = hw.private_scratch_supported();
        match self.enable_private_scratch_slot1 {
            Some(enabled) => enabled && supported,
            None => supported,
        }
    }

    /// Resolve static partitioning for a context with `tiles` tiles
    pub fn static_partitioning_enabled(&self, tiles: u32) -> bool {
        match self.enable_static_partitioning {
            Some(enabled) => enabled && tiles > 1,
            None => tiles > 1,
        }
    }
}

fn parse_value(value_str: &str) -> Option<u64> {
    if let Some(hex) = value_str
        .strip_prefix("0x")
        .or_else(|| value_str.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value_str.parse().ok()
    }
}
