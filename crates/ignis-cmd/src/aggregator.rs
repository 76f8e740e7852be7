//! # Submission Aggregator
//!
//! Queue of dispatches recorded in batched mode, and the logic that merges
//! consecutive compatible dispatches into one physical submission.
//!
//! ```text
//!  receiver command stream
//! ┌───────────────┬─────┬───────────────┬─────┬───────────────┬─────┐
//! │ dispatch 1    │ END │ dispatch 2    │ END │ dispatch 3    │ END │
//! └───────────────┴──┬──┴───────────────┴──┬──┴───────────────┴─────┘
//!                    │ NOOP                │ NOOP
//!                    └─────── chain ───────┘
//! ```
//!
//! Merged dispatches must be contiguous in the same command buffer and share
//! throttle and priority class; everything else starts a new batch.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use hashbrown::HashSet;
use ignis_core::TaskCount;
use ignis_mem::AllocationRef;

use crate::dispatch::QueueThrottle;

/// One recorded dispatch
#[derive(Debug, Clone)]
pub struct QueuedCommandBuffer {
    /// Command buffer holding the dispatch
    pub command_buffer: AllocationRef,
    /// First byte of the dispatch
    pub start_offset: usize,
    /// Offset of the closing batch-buffer end
    pub batch_buffer_end_offset: usize,
    /// One past the last byte of the dispatch
    pub end_offset: usize,
    /// Task count of the dispatch
    pub task_count: TaskCount,
    /// Allocations the dispatch needs resident
    pub surfaces: Vec<AllocationRef>,
    /// Throttle hint
    pub throttle: QueueThrottle,
    /// Low-priority class
    pub low_priority: bool,
    /// Coherent memory access
    pub requires_coherency: bool,
}

/// Several queued dispatches submitted as one
#[derive(Debug, Clone)]
pub struct AggregatedBatch {
    /// Command buffer of every merged dispatch
    pub command_buffer: AllocationRef,
    /// First byte to execute
    pub start_offset: usize,
    /// One past the last byte
    pub end_offset: usize,
    /// Batch-buffer ends to replace with no-ops
    pub chain_points: Vec<usize>,
    /// Union of the residency of the merged dispatches
    pub surfaces: Vec<AllocationRef>,
    /// Task count of the last merged dispatch
    pub task_count: TaskCount,
    /// Any merged dispatch needs coherency
    pub requires_coherency: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
    /// Low-priority class
    pub low_priority: bool,
    /// Number of dispatches merged
    pub count: usize,
}

/// Batched-mode dispatch queue
#[derive(Debug, Default)]
pub struct SubmissionAggregator {
    queue: VecDeque<QueuedCommandBuffer>,
}

impl SubmissionAggregator {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch
    pub fn record(&mut self, command_buffer: QueuedCommandBuffer) {
        log::trace!(
            "recorded task {} [{:#x}..{:#x})",
            command_buffer.task_count,
            command_buffer.start_offset,
            command_buffer.end_offset
        );
        self.queue.push_back(command_buffer);
    }

    /// Queued dispatches
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued dispatches in submission order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommandBuffer> {
        self.queue.iter()
    }

    /// Merge the longest compatible run at the head of the queue
    pub fn peek_batch(&self) -> Option<AggregatedBatch> {
        let head = self.queue.front()?;

        let mut batch = AggregatedBatch {
            command_buffer: head.command_buffer.clone(),
            start_offset: head.start_offset,
            end_offset: head.end_offset,
            chain_points: Vec::new(),
            surfaces: Vec::new(),
            task_count: head.task_count,
            requires_coherency: head.requires_coherency,
            throttle: head.throttle,
            low_priority: head.low_priority,
            count: 1,
        };
        let mut seen = HashSet::new();
        let mut last_end_marker = head.batch_buffer_end_offset;

        for surface in &head.surfaces {
            if seen.insert(surface.handle()) {
                batch.surfaces.push(surface.clone());
            }
        }

        for next in self.queue.iter().skip(1) {
            let compatible = next.command_buffer.handle() == batch.command_buffer.handle()
                && next.start_offset == batch.end_offset
                && next.throttle == batch.throttle
                && next.low_priority == batch.low_priority;
            if !compatible {
                break;
            }

            batch.chain_points.push(last_end_marker);
            last_end_marker = next.batch_buffer_end_offset;
            batch.end_offset = next.end_offset;
            batch.task_count = next.task_count;
            batch.requires_coherency |= next.requires_coherency;
            batch.count += 1;

            for surface in &next.surfaces {
                if seen.insert(surface.handle()) {
                    batch.surfaces.push(surface.clone());
                }
            }
        }

        Some(batch)
    }

    /// Drop `count` dispatches from the head after they were submitted
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.queue.len());
        self.queue.drain(..count);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec;
    use ignis_core::{ByteSize, GpuAddr, Handle};
    use ignis_mem::{AllocationType, GraphicsAllocation, MemoryPool, StorageInfo};

    fn allocation(raw: u64) -> AllocationRef {
        Arc::new(GraphicsAllocation::new(
            Handle::from_raw(raw),
            AllocationType::CommandBuffer,
            GpuAddr::new(0x10_0000 * raw),
            ByteSize::from_kib(64),
            MemoryPool::System4KbPages,
            StorageInfo::default(),
        ))
    }

    fn queued(
        buffer: &AllocationRef,
        start: usize,
        end: usize,
        task_count: TaskCount,
        surfaces: Vec<AllocationRef>,
    ) -> QueuedCommandBuffer {
        QueuedCommandBuffer {
            command_buffer: buffer.clone(),
            start_offset: start,
            batch_buffer_end_offset: end - 4,
            end_offset: end,
            task_count,
            surfaces,
            throttle: QueueThrottle::Medium,
            low_priority: false,
            requires_coherency: false,
        }
    }

    #[test]
    fn test_empty() {
        let aggregator = SubmissionAggregator::new();
        assert!(aggregator.peek_batch().is_none());
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_contiguous_dispatches_are_chained() {
        let buffer = allocation(1);
        let shared = allocation(10);
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(queued(&buffer, 0, 64, 1, vec![shared.clone(), allocation(11)]));
        aggregator.record(queued(&buffer, 64, 128, 2, vec![shared.clone()]));
        let mut third = queued(&buffer, 128, 200, 3, vec![allocation(12)]);
        third.requires_coherency = true;
        aggregator.record(third);

        let batch = aggregator.peek_batch().unwrap();
        assert_eq!(batch.count, 3);
        assert_eq!(batch.start_offset, 0);
        assert_eq!(batch.end_offset, 200);
        assert_eq!(batch.chain_points, vec![60, 124]);
        assert_eq!(batch.task_count, 3);
        assert!(batch.requires_coherency);
        assert_eq!(batch.surfaces.len(), 3);

        aggregator.consume(batch.count);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_throttle_change_splits_batches() {
        let buffer = allocation(1);
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(queued(&buffer, 0, 64, 1, Vec::new()));
        let mut second = queued(&buffer, 64, 128, 2, Vec::new());
        second.throttle = QueueThrottle::High;
        aggregator.record(second);

        let batch = aggregator.peek_batch().unwrap();
        assert_eq!(batch.count, 1);
        assert!(batch.chain_points.is_empty());
        aggregator.consume(1);

        let batch = aggregator.peek_batch().unwrap();
        assert_eq!(batch.throttle, QueueThrottle::High);
        assert_eq!(batch.task_count, 2);
    }

    #[test]
    fn test_gap_or_other_buffer_splits_batches() {
        let buffer = allocation(1);
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(queued(&buffer, 0, 64, 1, Vec::new()));
        aggregator.record(queued(&buffer, 128, 192, 2, Vec::new()));
        aggregator.record(queued(&allocation(2), 192, 256, 3, Vec::new()));

        assert_eq!(aggregator.peek_batch().unwrap().count, 1);
        aggregator.consume(1);
        assert_eq!(aggregator.peek_batch().unwrap().count, 1);
        aggregator.consume(5);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_low_priority_splits_batches() {
        let buffer = allocation(1);
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(queued(&buffer, 0, 64, 1, Vec::new()));
        let mut second = queued(&buffer, 64, 128, 2, Vec::new());
        second.low_priority = true;
        aggregator.record(second);
        assert_eq!(aggregator.peek_batch().unwrap().count, 1);
    }
}
