//! In-process backend.
//!
//! Accepts every submission, keeps a copy of it and completes fences
//! according to its [`CompletionMode`]. Evicted allocations become trim
//! candidates.

use alloc::vec::Vec;

use hashbrown::HashSet;
use ignis_core::{Error, FlushStamp, GpuAddr, Result, TaskCount};
use ignis_mem::{AllocationHandle, AllocationRef};

use super::{BackendCapabilities, CommandBufferHeader, Submission, SubmissionBackend};

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// As soon as it is submitted
    #[default]
    Immediate,
    /// When somebody waits for it
    OnWait,
    /// Only through [`SoftwareBackend::retire_up_to`]
    Manual,
}

/// Copy of an accepted submission
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    /// Flush stamp handed out
    pub stamp: FlushStamp,
    /// Task count signalled on completion
    pub task_count: TaskCount,
    /// Address of the first command
    pub gpu_address: GpuAddr,
    /// Header
    pub header: CommandBufferHeader,
    /// Residency passed with the submission
    pub residency: Vec<AllocationHandle>,
    /// Command bytes
    pub commands: Vec<u8>,
}

/// Backend that runs nothing
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    capabilities: BackendCapabilities,
    mode: CompletionMode,
    submissions: Vec<SubmissionRecord>,
    last_stamp: FlushStamp,
    completed: TaskCount,
    resident: HashSet<AllocationHandle>,
    make_resident_calls: usize,
    trim_candidates: Vec<AllocationHandle>,
    km_daf_locked: Vec<AllocationHandle>,
    waits: Vec<FlushStamp>,
    fail_submits: u32,
    fail_evictions: u32,
}

impl SoftwareBackend {
    /// Backend completing everything on submit
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with the given completion mode
    pub fn with_mode(mode: CompletionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Override the advertised capabilities
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Reject the next `count` submissions
    pub fn fail_next_submits(&mut self, count: u32) {
        self.fail_submits = count;
    }

    /// Reject the next `count` evictions
    pub fn fail_next_evictions(&mut self, count: u32) {
        self.fail_evictions = count;
    }

    /// Complete everything up to `task_count`
    pub fn retire_up_to(&mut self, task_count: TaskCount) {
        self.completed = self.completed.max(task_count);
    }

    /// Complete everything submitted so far
    pub fn retire_all(&mut self) {
        if let Some(last) = self.submissions.iter().map(|s| s.task_count).max() {
            self.retire_up_to(last);
        }
    }

    /// Stamp of the most recent submission, 0 before the first
    pub fn last_submitted_stamp(&self) -> FlushStamp {
        self.last_stamp
    }

    /// Accepted submissions in order
    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    /// Most recent submission
    pub fn last_submission(&self) -> Option<&SubmissionRecord> {
        self.submissions.last()
    }

    /// Number of `make_resident` calls
    pub fn make_resident_calls(&self) -> usize {
        self.make_resident_calls
    }

    /// Check if an allocation is resident
    pub fn is_resident(&self, handle: AllocationHandle) -> bool {
        self.resident.contains(&handle)
    }

    /// Evicted allocations in eviction order
    pub fn trim_candidates(&self) -> &[AllocationHandle] {
        &self.trim_candidates
    }

    /// Allocations locked for kernel-mode capture
    pub fn km_daf_locked(&self) -> &[AllocationHandle] {
        &self.km_daf_locked
    }

    /// Stamps waited on
    pub fn waits(&self) -> &[FlushStamp] {
        &self.waits
    }

    fn record(&self, stamp: FlushStamp) -> Option<&SubmissionRecord> {
        self.submissions.iter().find(|s| s.stamp == stamp)
    }
}

impl SubmissionBackend for SoftwareBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn make_resident(&mut self, allocations: &[AllocationRef]) -> Result<()> {
        self.make_resident_calls += 1;
        for allocation in allocations {
            if self.resident.insert(allocation.handle()) {
                self.trim_candidates.retain(|&h| h != allocation.handle());
            }
        }
        Ok(())
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<FlushStamp> {
        if self.fail_submits > 0 {
            self.fail_submits -= 1;
            log::warn!("context {}: submission rejected", submission.context);
            return Err(Error::SubmissionFailed);
        }

        self.last_stamp += 1;
        let stamp = self.last_stamp;
        self.submissions.push(SubmissionRecord {
            stamp,
            task_count: submission.task_count,
            gpu_address: submission.gpu_address,
            header: submission.header,
            residency: submission.residency.iter().map(|a| a.handle()).collect(),
            commands: submission.commands.to_vec(),
        });

        if self.mode == CompletionMode::Immediate {
            self.retire_up_to(submission.task_count);
        }

        log::trace!(
            "context {}: stamp {} task {} at {} ({} bytes)",
            submission.context,
            stamp,
            submission.task_count,
            submission.gpu_address,
            submission.commands.len()
        );
        Ok(stamp)
    }

    fn wait_for_flush_stamp(&mut self, stamp: FlushStamp) -> Result<()> {
        if stamp == 0 {
            return Ok(());
        }
        self.waits.push(stamp);

        let Some(task_count) = self.record(stamp).map(|s| s.task_count) else {
            return Err(Error::InvalidParameter);
        };
        if task_count <= self.completed {
            return Ok(());
        }

        match self.mode {
            CompletionMode::Manual => Err(Error::FenceTimeout),
            CompletionMode::Immediate | CompletionMode::OnWait => {
                self.retire_up_to(task_count);
                Ok(())
            }
        }
    }

    fn completed_task_count(&self) -> TaskCount {
        self.completed
    }

    fn evict(&mut self, allocations: &[AllocationRef]) -> Result<()> {
        if self.fail_evictions > 0 {
            self.fail_evictions -= 1;
            log::warn!("eviction of {} allocations rejected", allocations.len());
            return Err(Error::InvalidState);
        }
        for allocation in allocations {
            self.resident.remove(&allocation.handle());
            self.trim_candidates.push(allocation.handle());
        }
        log::debug!("{} allocations moved to trim candidates", allocations.len());
        Ok(())
    }

    fn lock_for_km_daf(&mut self, allocation: &AllocationRef) -> Result<()> {
        self.km_daf_locked.push(allocation.handle());
        Ok(())
    }
}

static_assertions::assert_impl_all!(SoftwareBackend: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueueThrottle;
    use alloc::sync::Arc;
    use alloc::vec;
    use ignis_core::{ByteSize, Handle, HardwareInfo, PreemptionMode};
    use ignis_mem::{AllocationType, GraphicsAllocation, MemoryPool, StorageInfo};

    fn allocation(raw: u64) -> AllocationRef {
        Arc::new(GraphicsAllocation::new(
            Handle::from_raw(raw),
            AllocationType::Buffer,
            GpuAddr::new(0x1000 * raw),
            ByteSize::from_kib(4),
            MemoryPool::System4KbPages,
            StorageInfo::default(),
        ))
    }

    fn submit(backend: &mut SoftwareBackend, task_count: TaskCount) -> Result<FlushStamp> {
        let header = CommandBufferHeader::new(
            &HardwareInfo::xe_hp(),
            false,
            false,
            QueueThrottle::Medium,
            PreemptionMode::ThreadGroup,
        );
        backend.submit(&Submission {
            context: 0,
            gpu_address: GpuAddr::new(0x4000),
            commands: &[0; 8],
            header,
            task_count,
            residency: &[],
        })
    }

    #[test]
    fn test_stamps_are_sequential() {
        let mut backend = SoftwareBackend::new();
        assert_eq!(submit(&mut backend, 1).unwrap(), 1);
        assert_eq!(submit(&mut backend, 2).unwrap(), 2);
        assert_eq!(backend.last_submitted_stamp(), 2);
        assert_eq!(backend.completed_task_count(), 2);
    }

    #[test]
    fn test_manual_completion() {
        let mut backend = SoftwareBackend::with_mode(CompletionMode::Manual);
        let stamp = submit(&mut backend, 3).unwrap();
        assert_eq!(backend.completed_task_count(), 0);
        assert_eq!(backend.wait_for_flush_stamp(stamp), Err(Error::FenceTimeout));

        backend.retire_all();
        assert_eq!(backend.wait_for_flush_stamp(stamp), Ok(()));
        assert_eq!(backend.waits(), &[stamp, stamp]);
    }

    #[test]
    fn test_completion_on_wait() {
        let mut backend = SoftwareBackend::with_mode(CompletionMode::OnWait);
        let first = submit(&mut backend, 1).unwrap();
        submit(&mut backend, 2).unwrap();
        backend.wait_for_flush_stamp(first).unwrap();
        assert_eq!(backend.completed_task_count(), 1);
        assert_eq!(backend.wait_for_flush_stamp(99), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_injected_failure() {
        let mut backend = SoftwareBackend::new();
        backend.fail_next_submits(1);
        assert_eq!(submit(&mut backend, 1), Err(Error::SubmissionFailed));
        assert_eq!(backend.last_submitted_stamp(), 0);
        assert_eq!(submit(&mut backend, 1), Ok(1));
    }

    #[test]
    fn test_evict_moves_to_trim_candidates() {
        let mut backend = SoftwareBackend::new();
        let a = allocation(1);
        let b = allocation(2);
        backend.make_resident(&[a.clone(), b.clone()]).unwrap();
        assert!(backend.is_resident(a.handle()));

        backend.evict(&[b.clone(), a.clone()]).unwrap();
        assert!(!backend.is_resident(a.handle()));
        assert_eq!(backend.trim_candidates(), &[b.handle(), a.handle()]);

        backend.make_resident(&[a.clone()]).unwrap();
        assert_eq!(backend.trim_candidates(), &[b.handle()]);
        assert_eq!(backend.make_resident_calls(), 2);
    }

    #[test]
    fn test_rejected_eviction_keeps_residency() {
        let mut backend = SoftwareBackend::new();
        let a = allocation(1);
        backend.make_resident(&[a.clone()]).unwrap();

        backend.fail_next_evictions(1);
        assert_eq!(backend.evict(&[a.clone()]), Err(Error::InvalidState));
        assert!(backend.is_resident(a.handle()));
        assert!(backend.trim_candidates().is_empty());

        backend.evict(&[a.clone()]).unwrap();
        assert_eq!(backend.trim_candidates(), &[a.handle()]);
    }

    #[test]
    fn test_submission_is_recorded() {
        let mut backend = SoftwareBackend::new();
        let a = allocation(7);
        let header = CommandBufferHeader::new(
            &HardwareInfo::gen12lp(),
            true,
            false,
            QueueThrottle::High,
            PreemptionMode::MidThread,
        );
        backend
            .submit(&Submission {
                context: 2,
                gpu_address: GpuAddr::new(0x8000),
                commands: &[1, 2, 3, 4],
                header,
                task_count: 5,
                residency: &[a.clone()],
            })
            .unwrap();

        let record = backend.last_submission().unwrap();
        assert_eq!(record.task_count, 5);
        assert_eq!(record.gpu_address, GpuAddr::new(0x8000));
        assert_eq!(record.residency, vec![a.handle()]);
        assert_eq!(record.commands, vec![1, 2, 3, 4]);
        assert!(record.header.requires_coherency());
    }
}
