// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        self,
        clock,
        deferred::Deferred,
        SharedRuntime,
    },
    sexp::{
        Sexp,
        ToSexp,
    },
};
use ::std::time::Duration;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process-wide termination state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownState {
    NotShuttingDown,
    ShuttingDown(i32),
}

/// What became of the at-shutdown hooks.
#[derive(Clone, Copy)]
enum HookOutcome {
    Completed,
    TimedOut,
}

/// Coordinates graceful termination: tracks the requested exit status, holds the registered hooks, and records when
/// the hooks have been awaited so the scheduler knows it may exit.
pub struct ShutdownCoordinator {
    state: ShutdownState,
    hooks: Vec<Box<dyn FnOnce() -> Deferred<()>>>,
    outcome: Option<HookOutcome>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for the Shutdown Coordinator
impl ShutdownCoordinator {
    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Applies the status reconciliation rule. Returns whether this call engaged the shutdown. A zero status may be
    /// upgraded to a nonzero one; two different nonzero statuses are a programming error.
    fn request(&mut self, status: i32) -> bool {
        match self.state {
            ShutdownState::NotShuttingDown => {
                trace!("request(): shutting down with status {:?}", status);
                self.state = ShutdownState::ShuttingDown(status);
                true
            },
            ShutdownState::ShuttingDown(old) => {
                if old == 0 && status != 0 {
                    debug!("request(): upgrading shutdown status from 0 to {:?}", status);
                    self.state = ShutdownState::ShuttingDown(status);
                } else if old != 0 && status != 0 && old != status {
                    panic!("conflicting shutdown statuses: {:?} and {:?}", old, status);
                }
                false
            },
        }
    }

    fn take_hooks(&mut self) -> Vec<Box<dyn FnOnce() -> Deferred<()>>> {
        std::mem::take(&mut self.hooks)
    }

    fn record_outcome(&mut self, outcome: HookOutcome) {
        self.outcome = Some(outcome);
    }

    /// The status to exit with, once the hooks have been awaited. A timed-out hook wait always exits with 1.
    pub(crate) fn exit_status(&self) -> Option<i32> {
        match (self.outcome, self.state) {
            (Some(HookOutcome::Completed), ShutdownState::ShuttingDown(status)) => Some(status),
            (Some(HookOutcome::TimedOut), _) => Some(1),
            (_, _) => None,
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Registers `f` to run during graceful termination. Hooks run concurrently and are awaited together; their relative
/// order is unspecified.
pub fn at_shutdown(f: impl FnOnce() -> Deferred<()> + 'static) {
    let mut rt: SharedRuntime = runtime::current();
    match rt.shutdown.state() {
        ShutdownState::NotShuttingDown => rt.shutdown.hooks.push(Box::new(f)),
        ShutdownState::ShuttingDown(_) => {
            // Too late to be awaited; run it for its effects.
            warn!("at_shutdown(): hook registered after shutdown was engaged will not be awaited");
            let _ = f();
        },
    }
}

/// Begins graceful termination with `status`: runs every at-shutdown hook, awaits them all (up to the configured
/// timeout), then exits the process from the scheduler loop. Calling this while a shutdown is in progress only
/// reconciles the status.
pub fn shutdown(status: i32) {
    let mut rt: SharedRuntime = runtime::current();
    if !rt.shutdown.request(status) {
        return;
    }

    let hooks: Vec<Box<dyn FnOnce() -> Deferred<()>>> = rt.shutdown.take_hooks();
    trace!("shutdown(): running {:?} at-shutdown hooks", hooks.len());
    let pending: Vec<Deferred<()>> = hooks.into_iter().map(|hook| hook()).collect();
    let done: Deferred<()> = Deferred::all_unit(pending);
    let timeout: Duration = rt.config.shutdown_timeout;
    clock::with_timeout(timeout, done).upon(move |result| {
        let mut rt: SharedRuntime = runtime::current();
        match result {
            Ok(()) => rt.shutdown.record_outcome(HookOutcome::Completed),
            Err(_) => {
                warn!("shutdown(): at-shutdown hooks did not complete within {:?}", timeout);
                rt.shutdown.record_outcome(HookOutcome::TimedOut);
            },
        }
    });
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self {
            state: ShutdownState::NotShuttingDown,
            hooks: Vec::<Box<dyn FnOnce() -> Deferred<()>>>::new(),
            outcome: None,
        }
    }
}

impl ToSexp for ShutdownState {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::NotShuttingDown => Sexp::atom("Not_shutting_down"),
            Self::ShuttingDown(status) => Sexp::list(vec![Sexp::atom("Shutting_down"), status.to_sexp()]),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        ShutdownCoordinator,
        ShutdownState,
    };
    use crate::runtime::{
        self,
        shutdown,
        SharedObject,
        SharedRuntime,
    };
    use ::anyhow::Result;

    /// Tests that a zero status is upgraded by a later nonzero one.
    #[test]
    fn zero_status_upgrades_to_nonzero() -> Result<()> {
        let mut coordinator: ShutdownCoordinator = ShutdownCoordinator::default();
        crate::ensure_eq!(coordinator.request(0), true);
        crate::ensure_eq!(coordinator.request(2), false);
        crate::ensure_eq!(coordinator.state(), ShutdownState::ShuttingDown(2));
        Ok(())
    }

    /// Tests that repeating the same status is accepted.
    #[test]
    fn repeated_status_is_ignored() -> Result<()> {
        let mut coordinator: ShutdownCoordinator = ShutdownCoordinator::default();
        crate::ensure_eq!(coordinator.request(2), true);
        crate::ensure_eq!(coordinator.request(2), false);
        crate::ensure_eq!(coordinator.state(), ShutdownState::ShuttingDown(2));
        Ok(())
    }

    /// Tests that two different nonzero statuses are rejected.
    #[test]
    #[should_panic(expected = "conflicting shutdown statuses")]
    fn conflicting_nonzero_statuses_panic() {
        let mut coordinator: ShutdownCoordinator = ShutdownCoordinator::default();
        let _ = coordinator.request(2);
        let _ = coordinator.request(3);
    }

    /// Tests that the exit status is withheld until the hooks have been awaited.
    #[test]
    fn exit_waits_for_the_hooks() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let ran: SharedObject<bool> = SharedObject::new(false);
        {
            let mut ran: SharedObject<bool> = ran.clone();
            shutdown::at_shutdown(move || {
                runtime::yield_now().map(move |_| {
                    *ran = true;
                })
            });
        }

        shutdown::shutdown(0);
        shutdown::shutdown(2);

        let mut status: Option<i32> = None;
        for _ in 0..100 {
            status = rt.run_one_cycle();
            if status.is_some() {
                break;
            }
        }
        crate::ensure_eq!(status, Some(2));
        crate::ensure_eq!(*ran.as_ref(), true);
        Ok(())
    }
}
