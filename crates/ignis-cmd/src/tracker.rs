//! # Completion Tracker
//!
//! Task-count ledger of one engine context.
//!
//! Task counts are assigned in strictly increasing order. A task is
//! *flushed* once the backend accepted a submission containing it (the
//! submission's flush stamp is remembered) and *retired* once the backend
//! reports a completed task count at or above it.

use alloc::collections::VecDeque;

use ignis_core::{FlushStamp, TaskCount};

/// Where a task is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Assigned but not yet handed to the backend
    Pending,
    /// Submitted under the given flush stamp
    Flushed(FlushStamp),
    /// Completed on the GPU
    Retired,
}

/// Per-context fence bookkeeping
#[derive(Debug, Default)]
pub struct CompletionTracker {
    task_count: TaskCount,
    latest_flushed: TaskCount,
    completed: TaskCount,
    in_flight: VecDeque<(TaskCount, FlushStamp)>,
}

impl CompletionTracker {
    /// Create an idle tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Task count the next dispatch will get
    pub fn next_task_count(&self) -> TaskCount {
        self.task_count + 1
    }

    /// Assign the next task count
    pub fn assign(&mut self) -> TaskCount {
        self.task_count += 1;
        self.task_count
    }

    /// Last assigned task count
    pub fn task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Last task count handed to the backend
    pub fn latest_flushed(&self) -> TaskCount {
        self.latest_flushed
    }

    /// Last task count observed as completed
    pub fn completed(&self) -> TaskCount {
        self.completed
    }

    /// Record a submission covering everything up to `task_count`
    pub fn record_flush(&mut self, task_count: TaskCount, stamp: FlushStamp) {
        debug_assert!(task_count >= self.latest_flushed);
        self.task_count = self.task_count.max(task_count);
        self.latest_flushed = task_count;
        self.in_flight.push_back((task_count, stamp));
        log::trace!("task {} flushed with stamp {}", task_count, stamp);
    }

    /// Take a completion report from the backend
    ///
    /// Reports never move the completed task count backwards.
    pub fn observe_completion(&mut self, completed: TaskCount) {
        if completed <= self.completed {
            return;
        }
        self.completed = completed;
        while let Some(&(task, _)) = self.in_flight.front() {
            if task > completed {
                break;
            }
            self.in_flight.pop_front();
        }
    }

    /// Stamp of the submission that carries `task_count`
    pub fn stamp_for(&self, task_count: TaskCount) -> Option<FlushStamp> {
        self.in_flight
            .iter()
            .find(|&&(task, _)| task >= task_count)
            .map(|&(_, stamp)| stamp)
    }

    /// Check if `task_count` has completed
    pub fn is_completed(&self, task_count: TaskCount) -> bool {
        task_count <= self.completed
    }

    /// Check if every flushed task has completed
    pub fn is_idle(&self) -> bool {
        self.completed >= self.latest_flushed
    }

    /// Check if some assigned task was never flushed
    pub fn has_unflushed(&self) -> bool {
        self.task_count > self.latest_flushed
    }

    /// Lifetime state of a task
    pub fn state_of(&self, task_count: TaskCount) -> SubmissionState {
        if self.is_completed(task_count) {
            SubmissionState::Retired
        } else if task_count <= self.latest_flushed {
            self.stamp_for(task_count)
                .map_or(SubmissionState::Pending, SubmissionState::Flushed)
        } else {
            SubmissionState::Pending
        }
    }
}
