//! # Dispatch Parameters
//!
//! What a caller hands the receiver with every task, and what it gets back.

use alloc::vec::Vec;

use ignis_core::{FlushStamp, GpuAddr, PreemptionMode, TaskCount};

use crate::stream::LinearStream;

/// GRF count of a regular kernel
pub const DEFAULT_GRF_COUNT: u32 = 128;

/// Submission priority hint passed to the kernel driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueThrottle {
    /// Power-saving, single subslice
    Low,
    /// Driver default
    #[default]
    Medium,
    /// Whole GPU
    High,
}

/// EU thread arbitration policy programmed through STATE_COMPUTE_MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadArbitrationPolicy {
    /// Oldest thread first
    AgeBased,
    /// Round robin
    RoundRobin,
    /// Round robin after dependency
    RoundRobinAfterDependency,
}

/// Wait for a timestamp packet written by another queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampDependency {
    /// Packet address
    pub address: GpuAddr,
    /// Value signalling completion
    pub value: u32,
}

/// Per-task parameters of [`flush_task`](crate::CommandStreamReceiver::flush_task)
#[derive(Debug, Clone)]
pub struct DispatchFlags {
    /// Preemption mode the task runs under
    pub preemption_mode: PreemptionMode,
    /// Kernel needs coherent memory access
    pub requires_coherency: bool,
    /// Submit on the low-priority path
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
    /// Wait for the task before returning
    pub blocking: bool,
    /// Close the task stream with a stalling PIPE_CONTROL
    pub guard_command_buffer_with_pipe_control: bool,
    /// Flush the data cache after the task
    pub dc_flush: bool,
    /// Per-thread scratch in bytes
    pub required_scratch_size: u32,
    /// Per-thread private scratch in bytes
    pub required_private_scratch_size: u32,
    /// GRF count of the kernel
    pub num_grf_required: u32,
    /// Arbitration policy to program, if any
    pub thread_arbitration_policy: Option<ThreadArbitrationPolicy>,
    /// Work of other queues this task waits for
    pub dependencies: Vec<TimestampDependency>,
    /// Submit right away even in batched mode
    pub implicit_flush: bool,
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self {
            preemption_mode: PreemptionMode::default(),
            requires_coherency: false,
            low_priority: false,
            throttle: QueueThrottle::default(),
            blocking: false,
            guard_command_buffer_with_pipe_control: false,
            dc_flush: false,
            required_scratch_size: 0,
            required_private_scratch_size: 0,
            num_grf_required: DEFAULT_GRF_COUNT,
            thread_arbitration_policy: None,
            dependencies: Vec::new(),
            implicit_flush: false,
        }
    }
}

/// Result of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    /// Task count assigned to the dispatch
    pub task_count: TaskCount,
    /// Backend fence, `None` while the dispatch is only batched
    pub flush_stamp: Option<FlushStamp>,
}

/// A finished command buffer handed to [`flush`](crate::CommandStreamReceiver::flush)
#[derive(Debug)]
pub struct BatchBuffer<'a> {
    /// Stream holding the commands
    pub stream: &'a LinearStream,
    /// First byte to execute
    pub start_offset: usize,
    /// One past the last byte to execute
    pub end_offset: usize,
    /// Coherent memory access required
    pub requires_coherency: bool,
    /// Low-priority submission
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
}

impl<'a> BatchBuffer<'a> {
    /// Whole written range of a stream with default hints
    pub fn new(stream: &'a LinearStream) -> Self {
        Self {
            stream,
            start_offset: 0,
            end_offset: stream.used(),
            requires_coherency: false,
            low_priority: false,
            throttle: QueueThrottle::default(),
        }
    }

    /// Override the start offset
    pub fn with_start_offset(mut self, start_offset: usize) -> Self {
        self.start_offset = start_offset;
        self
    }

    /// Override the throttle
    pub fn with_throttle(mut self, throttle: QueueThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Override coherency
    pub fn with_coherency(mut self, requires_coherency: bool) -> Self {
        self.requires_coherency = requires_coherency;
        self
    }

    /// Override the priority class
    pub fn with_low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }
}
