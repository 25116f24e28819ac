// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::monitor::SharedMonitor;
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A unit of cooperative work: a thunk paired with the monitor it runs within. Each job runs to completion before the
/// next one begins.
pub(crate) struct Job {
    monitor: SharedMonitor,
    thunk: Box<dyn FnOnce()>,
}

/// The ready-job queue and the ambient monitor of whatever is currently running.
pub struct Scheduler {
    /// Jobs ready to run, in FIFO order.
    ready: VecDeque<Job>,
    /// The monitor of the currently running job, or the root monitor between jobs.
    current: SharedMonitor,
    /// Completed cycles since the runtime started.
    num_cycles: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Job {
    pub(crate) fn new(monitor: SharedMonitor, thunk: Box<dyn FnOnce()>) -> Self {
        Self { monitor, thunk }
    }

    pub(crate) fn into_parts(self) -> (SharedMonitor, Box<dyn FnOnce()>) {
        (self.monitor, self.thunk)
    }
}

/// Associate Functions for the Scheduler
impl Scheduler {
    pub(crate) fn new(root: SharedMonitor) -> Self {
        Self {
            ready: VecDeque::<Job>::new(),
            current: root,
            num_cycles: 0,
        }
    }

    /// Appends a job to the back of the ready queue.
    pub(crate) fn enqueue(&mut self, job: Job) {
        self.ready.push_back(job);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Job> {
        self.ready.pop_front()
    }

    pub fn has_ready_jobs(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn num_ready_jobs(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn current_monitor(&self) -> SharedMonitor {
        self.current.clone()
    }

    pub(crate) fn set_current_monitor(&mut self, monitor: SharedMonitor) {
        self.current = monitor;
    }

    pub(crate) fn finish_cycle(&mut self) {
        self.num_cycles += 1;
    }

    pub fn num_cycles(&self) -> u64 {
        self.num_cycles
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
