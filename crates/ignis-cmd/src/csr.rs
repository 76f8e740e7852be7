//! # Command-Stream Receiver
//!
//! Turns logical dispatches into GPU submissions for one engine context.
//!
//! ```text
//!  flush_task(task stream, heaps, flags)
//!        │
//!        ├─► scratch controller ── dirty state ──┐
//!        │                                       ▼
//!        │               receiver command stream: preamble │ state │ BB_START ─► task stream
//!        │                                                 │ PIPE_CONTROL(tag = task count) │ BB_END
//!        ├─► residency set
//!        │
//!        ├─ immediate ─► backend.submit ─► flush stamp ─► completion tracker
//!        └─ batched ───► aggregator ─► (explicit / implicit flush) ─► backend.submit
//! ```
//!
//! A dispatch either lands completely (queued or submitted) or leaves the
//! receiver's streams as they were. Allocations are never freed before the
//! task count of their last use on this context has retired.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use ignis_core::{
    ByteSize, DebugSettings, DispatchMode, Error, FlushStamp, GpuAddr, HardwareInfo, OsContext,
    PreemptionMode, Result, TaskCount,
};
use ignis_mem::{
    AllocationProperties, AllocationRef, AllocationType, AllocationUsage,
    InternalAllocationStorage, MemoryManager, ResidencySet,
};

use crate::aggregator::{QueuedCommandBuffer, SubmissionAggregator};
use crate::backend::{submit_to, CommandBufferHeader, Submission, SubmissionBackend};
use crate::commands::{
    Command, PipeControlFlags, PostSyncWrite, SemaphoreCompare, MAX_COMMAND_DWORDS,
    PREEMPTION_CONTROL_REGISTER,
};
use crate::compute_mode::{ComputeModeRequest, ComputeModeState};
use crate::dispatch::{BatchBuffer, CompletionStamp, DispatchFlags};
use crate::scratch::{ScratchRequest, ScratchSpaceController, StateDirty};
use crate::stream::{IndirectHeap, LinearStream};
use crate::tracker::{CompletionTracker, SubmissionState};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Size of the tag allocation holding the completed task count
pub const TAG_ALLOCATION_SIZE: u64 = 4096;

/// Size of the mid-thread preemption surface
pub const PREEMPTION_SURFACE_SIZE: u64 = 64 * 1024;

/// Size of the work-partition surface
pub const WORK_PARTITION_SIZE: u64 = 4096;

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle of the receiver's submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrState {
    /// Nothing dispatched yet
    Idle,
    /// Dispatches are queued but not submitted
    BuildingCommandBuffer,
    /// Latest submission in flight under this stamp
    Flushed(FlushStamp),
    /// Everything up to this task count completed
    Retired(TaskCount),
}

/// Receiver statistics
#[derive(Debug, Clone, Default)]
pub struct CsrStats {
    /// Dispatches accepted by `flush_task`
    pub dispatches: u64,
    /// Physical submissions
    pub submissions: u64,
    /// Flushes triggered without an explicit request
    pub implicit_flushes: u64,
    /// Command buffer switches
    pub command_buffer_rotations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapBases {
    dynamic_state: GpuAddr,
    indirect_object: GpuAddr,
    surface_state: GpuAddr,
}

// =============================================================================
// COMMAND STREAM RECEIVER
// =============================================================================

/// Submission front end of one engine context
pub struct CommandStreamReceiver<B: SubmissionBackend> {
    hw: HardwareInfo,
    settings: DebugSettings,
    os_context: OsContext,
    memory_manager: Arc<dyn MemoryManager>,
    backend: B,
    dispatch_mode: DispatchMode,

    command_stream: LinearStream,
    tag_allocation: AllocationRef,
    preemption_allocation: Option<AllocationRef>,
    work_partition_allocation: Option<AllocationRef>,

    scratch: ScratchSpaceController,
    storage: InternalAllocationStorage,
    residency: ResidencySet,
    tracker: CompletionTracker,
    aggregator: SubmissionAggregator,

    preamble_sent: bool,
    programmed_preemption: Option<PreemptionMode>,
    compute_mode: ComputeModeState,
    heap_bases: Option<HeapBases>,
    programmed_scratch_patch: Option<u64>,
    pending_dirty: StateDirty,
    new_resources: bool,

    stats: CsrStats,
}

impl<B: SubmissionBackend> CommandStreamReceiver<B> {
    /// Create a receiver and its owned allocations
    pub fn new(
        hw: HardwareInfo,
        settings: DebugSettings,
        os_context: OsContext,
        memory_manager: Arc<dyn MemoryManager>,
        backend: B,
    ) -> Result<Self> {
        let scratch = ScratchSpaceController::new(&hw, &settings, memory_manager.clone())?;
        let dispatch_mode = settings
            .csr_dispatch_mode
            .unwrap_or(backend.capabilities().default_dispatch_mode);

        let tiles = os_context.device_bitfield();
        let with_preemption = os_context.preemption_mode() == PreemptionMode::MidThread;
        let with_work_partition =
            settings.static_partitioning_enabled(os_context.num_supported_devices());

        let mut requests = vec![
            AllocationProperties::new(
                ByteSize::from_bytes(TAG_ALLOCATION_SIZE),
                AllocationType::TagBuffer,
                tiles,
            ),
            AllocationProperties::new(
                ByteSize::from_bytes(settings.csr_command_stream_size as u64),
                AllocationType::CommandBuffer,
                tiles,
            ),
        ];
        if with_preemption {
            requests.push(AllocationProperties::new(
                ByteSize::from_bytes(PREEMPTION_SURFACE_SIZE),
                AllocationType::PreemptionSurface,
                tiles,
            ));
        }
        if with_work_partition {
            requests.push(AllocationProperties::new(
                ByteSize::from_bytes(WORK_PARTITION_SIZE),
                AllocationType::WorkPartitionSurface,
                tiles,
            ));
        }

        let mut owned = allocate_all(&*memory_manager, &requests)?.into_iter();
        let (Some(tag_allocation), Some(command_buffer)) = (owned.next(), owned.next()) else {
            return Err(Error::AllocationFailed);
        };
        let preemption_allocation = if with_preemption { owned.next() } else { None };
        let work_partition_allocation = if with_work_partition { owned.next() } else { None };

        log::debug!(
            "csr: context {} ({}) on {}, {:?} dispatch, tag at {}",
            os_context.id(),
            os_context.engine(),
            hw.platform,
            dispatch_mode,
            tag_allocation.gpu_addr()
        );

        Ok(Self {
            storage: InternalAllocationStorage::new(memory_manager.clone(), os_context.id()),
            residency: ResidencySet::new(os_context.id()),
            hw,
            settings,
            os_context,
            memory_manager,
            backend,
            dispatch_mode,
            command_stream: LinearStream::new(command_buffer),
            tag_allocation,
            preemption_allocation,
            work_partition_allocation,
            scratch,
            tracker: CompletionTracker::new(),
            aggregator: SubmissionAggregator::new(),
            preamble_sent: false,
            programmed_preemption: None,
            compute_mode: ComputeModeState::default(),
            heap_bases: None,
            programmed_scratch_patch: None,
            pending_dirty: StateDirty::empty(),
            new_resources: false,
            stats: CsrStats::default(),
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch the commands of `task_stream` starting at `task_start_offset`
    ///
    /// The task stream is closed with a batch-buffer end and entered from the
    /// receiver's own command stream after all state the dispatch needs. On
    /// error both streams are left as they were.
    pub fn flush_task(
        &mut self,
        task_stream: &mut LinearStream,
        task_start_offset: usize,
        dsh: &mut IndirectHeap,
        ioh: &mut IndirectHeap,
        ssh: &mut IndirectHeap,
        flags: &DispatchFlags,
    ) -> Result<CompletionStamp> {
        let task_stream_end = task_stream.used();
        let (mut stamp, implicit_flush) =
            match self.dispatch(task_stream, task_start_offset, dsh, ioh, ssh, flags) {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    task_stream.rewind(task_stream_end);
                    return Err(e);
                }
            };

        // The dispatch is queued from here on, a failed flush leaves it for the next one
        if implicit_flush {
            self.stats.implicit_flushes += 1;
            stamp.flush_stamp = self.flush_batched_submissions().map_err(|e| {
                log::warn!("csr: implicit flush failed, task {} stays queued: {}", stamp.task_count, e);
                e
            })?;
        }

        if flags.blocking {
            self.wait_for_task_count(stamp.task_count)?;
        }
        Ok(stamp)
    }

    fn dispatch(
        &mut self,
        task_stream: &mut LinearStream,
        task_start_offset: usize,
        dsh: &mut IndirectHeap,
        ioh: &mut IndirectHeap,
        ssh: &mut IndirectHeap,
        flags: &DispatchFlags,
    ) -> Result<(CompletionStamp, bool)> {
        if task_start_offset > task_stream.used() {
            return Err(Error::InvalidParameter);
        }

        if flags.guard_command_buffer_with_pipe_control {
            Command::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                post_sync: None,
            }
            .write_to(task_stream)?;
        }
        Command::BatchBufferEnd.write_to(task_stream)?;

        let task_count = self.tracker.next_task_count();
        let completed = self.refresh_completed();

        self.scratch.reserve_heap(ssh)?;
        let request = ScratchRequest::new(task_count)
            .with_scratch_size(flags.required_scratch_size)
            .with_private_scratch_size(flags.required_private_scratch_size)
            .with_completed(completed);
        let dirty = {
            let mut heap = ssh.surface_state_heap();
            self.scratch.set_required_scratch_space(
                &mut heap,
                &request,
                &self.os_context,
                &mut self.storage,
            )?
        };
        self.pending_dirty |= dirty;

        let compute_mode = ComputeModeRequest::evaluate(&self.hw, &self.compute_mode, flags);
        let heap_bases = HeapBases {
            dynamic_state: dsh.base_address(),
            indirect_object: ioh.base_address(),
            surface_state: ssh.base_address(),
        };
        let commands = self.dispatch_commands(
            task_stream.gpu_address_at(task_start_offset),
            heap_bases,
            &compute_mode,
            task_count,
            flags,
        );

        let size = commands.iter().map(Command::encoded_len).sum();
        self.ensure_command_space(size)?;

        let start = self.command_stream.used();
        for command in &commands {
            if let Err(e) = command.write_to(&mut self.command_stream) {
                self.command_stream.rewind(start);
                return Err(e);
            }
        }
        let end = self.command_stream.used();

        let mut required: Vec<AllocationRef> = [
            task_stream.allocation(),
            dsh.allocation(),
            ioh.allocation(),
            ssh.allocation(),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        required.extend(self.owned_residency(flags.preemption_mode));
        for allocation in &required {
            self.make_resident_at(allocation, task_count);
        }

        let mut implicit_flush = false;
        let flush_stamp = match self.dispatch_mode {
            DispatchMode::Immediate => {
                let residency = self.residency.resident().to_vec();
                let commands = self.command_stream.bytes_range(start, end)?;
                let submission = Submission {
                    context: self.os_context.id(),
                    gpu_address: self.command_stream.gpu_address_at(start),
                    commands,
                    header: CommandBufferHeader::new(
                        &self.hw,
                        flags.requires_coherency,
                        flags.low_priority,
                        flags.throttle,
                        flags.preemption_mode,
                    ),
                    task_count,
                    residency: &residency,
                };

                match submit_to(&mut self.backend, self.settings.km_daf_enabled, &submission) {
                    Ok(stamp) => {
                        self.commit_dispatch_state(flags, &compute_mode, heap_bases);
                        self.complete_submission(task_count, stamp, &residency);
                        self.residency.clear_resident();
                        Some(stamp)
                    }
                    Err(e) => {
                        log::warn!("csr: task {} rejected: {}", task_count, e);
                        self.command_stream.rewind(start);
                        return Err(e);
                    }
                }
            }
            DispatchMode::Batched => {
                let command_buffer = self
                    .command_stream
                    .allocation()
                    .cloned()
                    .ok_or(Error::InvalidState)?;
                let assigned = self.tracker.assign();
                debug_assert_eq!(assigned, task_count);

                let surfaces = self.residency.resident().to_vec();
                for surface in &surfaces {
                    surface.update_task_count(task_count, self.os_context.id());
                }
                self.residency.clear_resident();

                self.aggregator.record(QueuedCommandBuffer {
                    command_buffer,
                    start_offset: start,
                    batch_buffer_end_offset: end - Command::BatchBufferEnd.encoded_len(),
                    end_offset: end,
                    task_count,
                    surfaces,
                    throttle: flags.throttle,
                    low_priority: flags.low_priority,
                    requires_coherency: flags.requires_coherency,
                });
                self.commit_dispatch_state(flags, &compute_mode, heap_bases);

                implicit_flush = self.implicit_flush_required(flags);
                None
            }
        };
        self.new_resources = false;
        self.stats.dispatches += 1;

        Ok((
            CompletionStamp {
                task_count,
                flush_stamp,
            },
            implicit_flush,
        ))
    }

    fn dispatch_commands(
        &self,
        task_address: GpuAddr,
        heap_bases: HeapBases,
        compute_mode: &ComputeModeRequest,
        task_count: TaskCount,
        flags: &DispatchFlags,
    ) -> Vec<Command> {
        let mut commands = Vec::new();

        if !self.preamble_sent {
            commands.push(Command::PipelineSelect { gpgpu: true });
        }
        if self.programmed_preemption != Some(flags.preemption_mode) {
            commands.push(Command::LoadRegisterImm {
                register: PREEMPTION_CONTROL_REGISTER,
                value: flags.preemption_mode.register_value(),
            });
        }
        if compute_mode.is_required() {
            commands.push(compute_mode.command(flags));
        }

        if self.heap_bases != Some(heap_bases)
            || self.pending_dirty.contains(StateDirty::STATE_BASE_ADDRESS)
        {
            commands.push(Command::PipeControl {
                flags: PipeControlFlags::CS_STALL
                    | PipeControlFlags::DC_FLUSH
                    | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
                post_sync: None,
            });
            commands.push(Command::StateBaseAddress {
                general_state: GpuAddr::new(self.scratch.calculate_new_gsh()),
                surface_state: heap_bases.surface_state,
                dynamic_state: heap_bases.dynamic_state,
                indirect_object: heap_bases.indirect_object,
            });
        }

        let patch = self.scratch.scratch_patch_address();
        if self.programmed_scratch_patch != Some(patch)
            || self.pending_dirty.contains(StateDirty::CFE_STATE)
        {
            commands.push(Command::CfeState {
                scratch_space_buffer: patch as u32,
                maximum_threads: self.scratch.compute_units(),
            });
        }

        for dependency in &flags.dependencies {
            commands.push(Command::SemaphoreWait {
                address: dependency.address,
                data: dependency.value,
                compare: SemaphoreCompare::GreaterThanOrEqual,
            });
        }

        commands.push(Command::BatchBufferStart {
            address: task_address,
            second_level: true,
        });

        let mut pipe_control = PipeControlFlags::CS_STALL;
        if flags.dc_flush {
            pipe_control |= PipeControlFlags::DC_FLUSH;
        }
        commands.push(Command::PipeControl {
            flags: pipe_control,
            post_sync: Some(PostSyncWrite {
                address: self.tag_allocation.gpu_addr(),
                value: task_count,
            }),
        });
        commands.push(Command::BatchBufferEnd);

        commands
    }

    fn commit_dispatch_state(
        &mut self,
        flags: &DispatchFlags,
        compute_mode: &ComputeModeRequest,
        heap_bases: HeapBases,
    ) {
        self.preamble_sent = true;
        self.programmed_preemption = Some(flags.preemption_mode);
        if compute_mode.is_required() {
            compute_mode.apply(&mut self.compute_mode, flags);
        }
        self.heap_bases = Some(heap_bases);
        self.programmed_scratch_patch = Some(self.scratch.scratch_patch_address());
        self.pending_dirty = StateDirty::empty();
    }

    fn owned_residency(&self, preemption_mode: PreemptionMode) -> Vec<AllocationRef> {
        let mut owned = vec![self.tag_allocation.clone()];
        owned.extend(self.command_stream.allocation().cloned());
        owned.extend(self.scratch.scratch_allocation().cloned());
        owned.extend(self.scratch.private_scratch_allocation().cloned());
        if preemption_mode == PreemptionMode::MidThread {
            owned.extend(self.preemption_allocation.clone());
        }
        owned.extend(self.work_partition_allocation.clone());
        owned
    }

    fn implicit_flush_required(&self, flags: &DispatchFlags) -> bool {
        if flags.implicit_flush {
            log::debug!("csr: implicit flush requested");
            return true;
        }
        if self.new_resources && self.check_platform_supports_new_resource_implicit_flush() {
            log::debug!("csr: implicit flush on new resource");
            return true;
        }
        if self.check_platform_supports_gpu_idle_implicit_flush() && self.tracker.is_idle() {
            log::debug!("csr: implicit flush on idle gpu");
            return true;
        }
        false
    }

    /// Make room for `size` bytes in the receiver command stream
    fn ensure_command_space(&mut self, size: usize) -> Result<()> {
        if self.command_stream.available() >= size {
            return Ok(());
        }

        let buffer_size = ByteSize::from_bytes(self.settings.csr_command_stream_size as u64);
        if size > buffer_size.as_usize() {
            return Err(Error::CommandBufferFull);
        }

        self.flush_batched_submissions()?;

        let completed = self.refresh_completed();
        let allocation = match self
            .storage
            .obtain_reusable(buffer_size, AllocationType::CommandBuffer, completed)
        {
            Some(allocation) => allocation,
            None => self.memory_manager.allocate(&AllocationProperties::new(
                buffer_size,
                AllocationType::CommandBuffer,
                self.os_context.device_bitfield(),
            ))?,
        };

        log::debug!(
            "csr: command buffer full, switching to {}",
            allocation.gpu_addr()
        );
        let previous = core::mem::replace(&mut self.command_stream, LinearStream::new(allocation));
        if let Some(old) = previous.allocation() {
            self.storage
                .store(old.clone(), AllocationUsage::Reusable, self.tracker.task_count());
        }
        self.stats.command_buffer_rotations += 1;
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a finished command buffer
    ///
    /// Queued dispatches are submitted first. Everything currently resident
    /// travels with the buffer.
    pub fn flush(&mut self, batch: &BatchBuffer<'_>) -> Result<FlushStamp> {
        self.flush_batched_submissions()?;

        let task_count = self.tracker.next_task_count();
        if let Some(allocation) = batch.stream.allocation() {
            self.make_resident_at(allocation, task_count);
        }
        let residency = self.residency.resident().to_vec();

        let submission = Submission {
            context: self.os_context.id(),
            gpu_address: batch.stream.gpu_address_at(batch.start_offset),
            commands: batch.stream.bytes_range(batch.start_offset, batch.end_offset)?,
            header: CommandBufferHeader::new(
                &self.hw,
                batch.requires_coherency,
                batch.low_priority,
                batch.throttle,
                self.os_context.preemption_mode(),
            ),
            task_count,
            residency: &residency,
        };

        let stamp = submit_to(&mut self.backend, self.settings.km_daf_enabled, &submission)
            .inspect_err(|e| log::warn!("csr: flush of task {} failed: {}", task_count, e))?;
        self.complete_submission(task_count, stamp, &residency);
        self.residency.clear_resident();
        self.new_resources = false;
        Ok(stamp)
    }

    /// Submit every queued dispatch
    ///
    /// Returns the stamp of the last submission, `None` if nothing was queued.
    pub fn flush_batched_submissions(&mut self) -> Result<Option<FlushStamp>> {
        let mut last = None;

        while let Some(batch) = self.aggregator.peek_batch() {
            let current = self.command_stream.allocation().map(|a| a.handle());
            if current != Some(batch.command_buffer.handle()) {
                return Err(Error::InvalidState);
            }

            for &offset in &batch.chain_points {
                patch_command(&mut self.command_stream, offset, Command::Noop)?;
            }

            let result = {
                let submission = Submission {
                    context: self.os_context.id(),
                    gpu_address: self.command_stream.gpu_address_at(batch.start_offset),
                    commands: self
                        .command_stream
                        .bytes_range(batch.start_offset, batch.end_offset)?,
                    header: CommandBufferHeader::new(
                        &self.hw,
                        batch.requires_coherency,
                        batch.low_priority,
                        batch.throttle,
                        self.os_context.preemption_mode(),
                    ),
                    task_count: batch.task_count,
                    residency: &batch.surfaces,
                };
                submit_to(&mut self.backend, self.settings.km_daf_enabled, &submission)
            };

            match result {
                Ok(stamp) => {
                    log::debug!(
                        "csr: {} batched dispatches submitted up to task {}",
                        batch.count,
                        batch.task_count
                    );
                    self.aggregator.consume(batch.count);
                    self.complete_submission(batch.task_count, stamp, &batch.surfaces);
                    last = Some(stamp);
                }
                Err(e) => {
                    for &offset in &batch.chain_points {
                        patch_command(&mut self.command_stream, offset, Command::BatchBufferEnd)?;
                    }
                    log::warn!("csr: batched submission failed: {}", e);
                    return Err(e);
                }
            }
        }

        Ok(last)
    }

    fn complete_submission(
        &mut self,
        task_count: TaskCount,
        stamp: FlushStamp,
        residency: &[AllocationRef],
    ) {
        let context = self.os_context.id();
        for allocation in residency {
            allocation.update_task_count(task_count, context);
            allocation.update_residency_task_count(task_count, context);
        }
        self.tracker.record_flush(task_count, stamp);
        self.stats.submissions += 1;
        log::trace!(
            "csr: task {} submitted with stamp {} ({} resident)",
            task_count,
            stamp,
            residency.len()
        );
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Pull the completed task count from the backend
    pub fn refresh_completed(&mut self) -> TaskCount {
        self.tracker
            .observe_completion(self.backend.completed_task_count());
        self.tracker.completed()
    }

    /// Block until `task_count` completed, submitting queued work first
    pub fn wait_for_task_count(&mut self, task_count: TaskCount) -> Result<()> {
        if task_count > self.tracker.task_count() {
            return Err(Error::InvalidParameter);
        }
        if task_count > self.tracker.latest_flushed() {
            self.flush_batched_submissions()?;
        }

        if task_count <= self.refresh_completed() {
            return Ok(());
        }

        let stamp = self
            .tracker
            .stamp_for(task_count)
            .ok_or(Error::InvalidState)?;
        self.backend.wait_for_flush_stamp(stamp)?;

        if task_count <= self.refresh_completed() {
            Ok(())
        } else {
            Err(Error::FenceTimeout)
        }
    }

    /// Wait for the submission with `stamp`
    pub fn wait_for_flush_stamp(&mut self, stamp: FlushStamp) -> Result<()> {
        self.backend.wait_for_flush_stamp(stamp)?;
        self.refresh_completed();
        Ok(())
    }

    /// Optionally wait, then free every retired allocation of one list
    ///
    /// `None` reaps what already retired without waiting. Returns the number
    /// of allocations freed.
    pub fn wait_for_task_count_and_clean_allocation_list(
        &mut self,
        task_count: Option<TaskCount>,
        usage: AllocationUsage,
    ) -> Result<usize> {
        if let Some(task_count) = task_count {
            self.wait_for_task_count(task_count)?;
        }
        let completed = self.refresh_completed();
        Ok(self.storage.clean(completed, usage))
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Add an allocation to the next submission
    ///
    /// Returns `true` if the allocation was never resident on this context.
    /// Nothing reaches the backend before the next submission.
    pub fn make_resident(&mut self, allocation: &AllocationRef) -> bool {
        let task_count = self.tracker.next_task_count();
        self.make_resident_at(allocation, task_count)
    }

    fn make_resident_at(&mut self, allocation: &AllocationRef, task_count: TaskCount) -> bool {
        let new_resource = self.residency.make_resident(allocation);
        if new_resource {
            log::trace!(
                "csr: new resource {} at {}",
                allocation.allocation_type(),
                allocation.gpu_addr()
            );
            allocation.update_residency_task_count(task_count, self.os_context.id());
            self.new_resources = true;
        }
        new_resource
    }

    /// Schedule an allocation for eviction
    pub fn make_non_resident(&mut self, allocation: &AllocationRef) {
        self.residency.make_non_resident(allocation);
    }

    /// Evict every allocation scheduled for eviction
    pub fn process_eviction(&mut self) -> Result<usize> {
        if self.residency.eviction().is_empty() {
            return Ok(0);
        }
        log::debug!("csr: evicting {} allocations", self.residency.eviction().len());
        // Scheduled entries stay put until the backend accepts them
        self.backend.evict(self.residency.eviction())?;
        Ok(self.residency.take_eviction().len())
    }

    // =========================================================================
    // Allocations
    // =========================================================================

    /// Allocate memory released once the next dispatch retires
    pub fn create_temporary_allocation(
        &mut self,
        props: &AllocationProperties,
    ) -> Result<AllocationRef> {
        let allocation = self.memory_manager.allocate(props)?;
        self.storage.store(
            allocation.clone(),
            AllocationUsage::Temporary,
            self.tracker.next_task_count(),
        );
        Ok(allocation)
    }

    /// Submit everything, wait for idle and free all owned memory
    pub fn shutdown(mut self) -> Result<B> {
        if self.tracker.has_unflushed() {
            self.flush_batched_submissions()?;
        }
        let last = self.tracker.latest_flushed();
        if last > 0 {
            self.wait_for_task_count(last)?;
        }

        self.scratch.release_allocations(&mut self.storage, last);
        self.storage.release_all();

        let command_buffer = self.command_stream.allocation().cloned();
        for allocation in [Some(self.tag_allocation.clone()), command_buffer]
            .into_iter()
            .chain([self.preemption_allocation.take(), self.work_partition_allocation.take()])
            .flatten()
        {
            self.memory_manager.free(allocation);
        }

        log::debug!("csr: context {} shut down after task {}", self.os_context.id(), last);
        Ok(self.backend)
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Check if the context spans more than one tile
    pub fn is_multi_os_context_capable(&self) -> bool {
        self.os_context.num_supported_devices() > 1
    }

    /// Check if a new resident allocation flushes batched work
    pub fn check_platform_supports_new_resource_implicit_flush(&self) -> bool {
        !self.is_multi_os_context_capable()
            && self.settings.new_resource_implicit_flush
            && self.backend.capabilities().new_resource_implicit_flush
    }

    /// Check if an idle GPU flushes batched work
    pub fn check_platform_supports_gpu_idle_implicit_flush(&self) -> bool {
        if self.is_multi_os_context_capable() && !self.os_context.is_direct_submission_active() {
            return false;
        }
        self.settings.gpu_idle_implicit_flush && self.backend.capabilities().gpu_idle_implicit_flush
    }

    /// Switch direct submission on or off
    pub fn set_direct_submission_active(&mut self, active: bool) {
        self.os_context.set_direct_submission_active(active);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Lifecycle state as of the last completion refresh
    pub fn state(&self) -> CsrState {
        if !self.aggregator.is_empty() {
            return CsrState::BuildingCommandBuffer;
        }
        let latest = self.tracker.latest_flushed();
        if latest == 0 {
            return CsrState::Idle;
        }
        match self.tracker.state_of(latest) {
            SubmissionState::Retired => CsrState::Retired(self.tracker.completed()),
            SubmissionState::Flushed(stamp) => CsrState::Flushed(stamp),
            SubmissionState::Pending => CsrState::BuildingCommandBuffer,
        }
    }

    /// Lifetime state of one dispatch as of the last completion refresh
    pub fn submission_state(&self, task_count: TaskCount) -> SubmissionState {
        self.tracker.state_of(task_count)
    }

    /// Last assigned task count
    pub fn task_count(&self) -> TaskCount {
        self.tracker.task_count()
    }

    /// Last task count handed to the backend
    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.tracker.latest_flushed()
    }

    /// Dispatch mode in effect
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Engine context
    pub fn os_context(&self) -> &OsContext {
        &self.os_context
    }

    /// Hardware description
    pub fn hardware_info(&self) -> &HardwareInfo {
        &self.hw
    }

    /// Backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable backend
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Receiver command stream
    pub fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    /// Tag allocation
    pub fn tag_allocation(&self) -> &AllocationRef {
        &self.tag_allocation
    }

    /// Preemption surface, present under mid-thread preemption
    pub fn preemption_allocation(&self) -> Option<&AllocationRef> {
        self.preemption_allocation.as_ref()
    }

    /// Work-partition surface, present with static partitioning
    pub fn work_partition_allocation(&self) -> Option<&AllocationRef> {
        self.work_partition_allocation.as_ref()
    }

    /// Scratch controller
    pub fn scratch_space_controller(&self) -> &ScratchSpaceController {
        &self.scratch
    }

    /// Residency of the next submission
    pub fn residency(&self) -> &ResidencySet {
        &self.residency
    }

    /// Deferred-release lists
    pub fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }

    /// Mutable deferred-release lists
    pub fn internal_allocation_storage_mut(&mut self) -> &mut InternalAllocationStorage {
        &mut self.storage
    }

    /// Queued dispatches
    pub fn aggregator(&self) -> &SubmissionAggregator {
        &self.aggregator
    }

    /// Statistics
    pub fn stats(&self) -> &CsrStats {
        &self.stats
    }
}

impl<B: SubmissionBackend> core::fmt::Debug for CommandStreamReceiver<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context", &self.os_context.id())
            .field("dispatch_mode", &self.dispatch_mode)
            .field("task_count", &self.tracker.task_count())
            .field("completed", &self.tracker.completed())
            .field("queued", &self.aggregator.len())
            .finish()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Allocate everything or nothing
fn allocate_all(
    memory_manager: &dyn MemoryManager,
    requests: &[AllocationProperties],
) -> Result<Vec<AllocationRef>> {
    let mut allocations = Vec::with_capacity(requests.len());
    for props in requests {
        match memory_manager.allocate(props) {
            Ok(allocation) => allocations.push(allocation),
            Err(e) => {
                log::warn!("csr: {} allocation failed: {}", props.allocation_type, e);
                for allocation in allocations {
                    memory_manager.free(allocation);
                }
                return Err(e);
            }
        }
    }
    Ok(allocations)
}

/// Overwrite the command at `offset` with one of the same length
fn patch_command(stream: &mut LinearStream, offset: usize, command: Command) -> Result<()> {
    let mut bytes = ArrayVec::<u8, { MAX_COMMAND_DWORDS * 4 }>::new();
    for dword in command.encode() {
        bytes.extend(dword.to_le_bytes());
    }
    stream.patch(offset, &bytes)
}
