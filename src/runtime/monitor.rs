// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The dynamically-scoped error-handler tree.
//!
//! Control-flow scoping does not survive a callback registration, so errors raised inside asynchronous computations
//! cannot be routed with ordinary catch blocks. Instead, every job records the monitor that was current when it was
//! created, and a panic unwound at the job boundary walks up from that monitor until some handler absorbs it. The
//! root monitor has no handler: an error that reaches it is logged and takes the process down.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        self,
        deferred::Deferred,
        fail::Fail,
        ivar::SharedIvar,
        scheduler::Job,
        shutdown::{
            self,
            ShutdownState,
        },
        SharedObject,
        SharedRuntime,
    },
    sexp::{
        Sexp,
        ToSexp,
    },
};
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A node in the error-handler tree.
pub struct Monitor {
    /// Debugging name.
    name: String,
    /// Handler lookup continues here when this node has no handler. None for the root and for detached monitors.
    parent: Option<SharedMonitor>,
    /// Absorbs errors delivered to this node. None means "keep walking up".
    handler: Option<Box<dyn FnMut(Fail)>>,
    /// Names of monitors created under this one. Kept for diagnostics only; handles are not retained, so the tree
    /// never forms reference cycles.
    children_names: Vec<String>,
    is_detached: bool,
}

/// Reference to a monitor that is shared across callbacks.
#[derive(Clone)]
pub struct SharedMonitor(SharedObject<Monitor>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Shared Monitors
impl SharedMonitor {
    /// Creates the root of the tree. Called once, when the runtime initializes.
    pub(crate) fn root() -> Self {
        Self(SharedObject::<Monitor>::new(Monitor {
            name: "main".to_string(),
            parent: None,
            handler: None,
            children_names: Vec::<String>::new(),
            is_detached: false,
        }))
    }

    /// Creates a monitor under `parent`, which defaults to the current monitor.
    pub fn create(name: Option<&str>, parent: Option<SharedMonitor>) -> Self {
        let mut parent: SharedMonitor = parent.unwrap_or_else(Self::current);
        let name: String = name.unwrap_or("anonymous").to_string();
        parent.children_names.push(name.clone());
        Self(SharedObject::<Monitor>::new(Monitor {
            name,
            parent: Some(parent),
            handler: None,
            children_names: Vec::<String>::new(),
            is_detached: false,
        }))
    }

    /// The monitor of the currently running job, or the root monitor when no job is running.
    pub fn current() -> Self {
        runtime::current().scheduler.current_monitor()
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Disconnects this monitor from its parent for handler lookup. Errors delivered here that no handler absorbs
    /// are treated as uncaught.
    pub fn detach(&mut self) {
        self.parent = None;
        self.is_detached = true;
    }

    /// Two handles name the same monitor when they share the underlying node.
    pub fn same(a: &Self, b: &Self) -> bool {
        SharedObject::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn set_handler(&mut self, handler: impl FnMut(Fail) + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Routes `error` to the first handler at or above this monitor. An error that reaches the top of the tree is
    /// uncaught: it is logged and the process begins shutting down with a nonzero status.
    pub(crate) fn deliver(&self, error: Fail) {
        let mut monitor: SharedMonitor = self.clone();
        loop {
            if let Some(handler) = monitor.handler.as_mut() {
                handler(error);
                return;
            }
            let parent: Option<SharedMonitor> = monitor.parent.clone();
            match parent {
                Some(parent) => monitor = parent,
                None => {
                    error!(
                        "deliver(): uncaught exception in monitor {:?}: {:?}",
                        monitor.name(),
                        error
                    );
                    // When a shutdown is already under way there is nothing left to escalate to.
                    match runtime::current().shutdown.state() {
                        ShutdownState::NotShuttingDown => shutdown::shutdown(1),
                        ShutdownState::ShuttingDown(_) => (),
                    }
                    return;
                },
            }
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `f` inside a fresh child monitor and returns a deferred that becomes `Ok v` when the deferred `f` returns
/// determines, or `Err e` on the first error routed to that monitor. Errors arriving after the result is determined
/// are routed to the enclosing monitor instead.
pub fn try_with<T, F>(f: F) -> Deferred<Result<T, Fail>>
where
    T: Clone + 'static,
    F: FnOnce() -> Deferred<T> + 'static,
{
    let result: SharedIvar<Result<T, Fail>> = SharedIvar::new();
    let parent: SharedMonitor = SharedMonitor::current();
    let mut monitor: SharedMonitor = SharedMonitor::create(Some("try_with"), Some(parent.clone()));
    {
        let cell: SharedIvar<Result<T, Fail>> = result.clone();
        monitor.set_handler(move |error: Fail| {
            let mut cell: SharedIvar<Result<T, Fail>> = cell.clone();
            if !cell.fill_if_empty(Err(error.clone())) {
                parent.deliver(error);
            }
        });
    }

    let mut rt: SharedRuntime = runtime::current();
    let cell: SharedIvar<Result<T, Fail>> = result.clone();
    rt.scheduler.enqueue(Job::new(
        monitor,
        Box::new(move || {
            f().upon(move |value| {
                let mut cell: SharedIvar<Result<T, Fail>> = cell;
                let _ = cell.fill_if_empty(Ok(value));
            });
        }),
    ));
    result.read()
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ToSexp for SharedMonitor {
    fn to_sexp(&self) -> Sexp {
        Sexp::list(vec![
            Sexp::atom("monitor"),
            Sexp::field("name", Sexp::atom(self.name())),
            Sexp::field("is_detached", self.is_detached.to_sexp()),
            Sexp::field("children", self.children_names.to_sexp()),
        ])
    }
}

impl Deref for SharedMonitor {
    type Target = Monitor;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedMonitor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::runtime::{
        self,
        deferred::Deferred,
        fail::Fail,
        monitor::{
            try_with,
            SharedMonitor,
        },
        SharedRuntime,
    };
    use ::anyhow::Result;

    /// Tests that a computation that completes normally yields Ok.
    #[test]
    fn try_with_passes_through_success() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let d: Deferred<Result<u64, Fail>> = try_with(|| Deferred::from_value(5));
        let result: Result<u64, Fail> = rt.run_until(d)?;
        crate::ensure_eq!(result, Ok(5));
        Ok(())
    }

    /// Tests that a panic inside an asynchronous callback is captured as Err.
    #[test]
    fn try_with_captures_a_panic() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let d: Deferred<Result<(), Fail>> = try_with(|| {
            runtime::yield_now().bind(|_| -> Deferred<()> { panic!("boom") })
        });
        let result: Result<(), Fail> = rt.run_until(d)?;
        match result {
            Err(e) => crate::ensure_eq!(e.cause, "boom".to_string()),
            Ok(()) => anyhow::bail!("expected the panic to be captured"),
        }
        Ok(())
    }

    /// Tests that errors raised after the first are routed to the enclosing monitor.
    #[test]
    fn later_errors_route_to_the_enclosing_monitor() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let outer: Deferred<Result<(), Fail>> = try_with(|| {
            let inner: Deferred<Result<(), Fail>> = try_with(|| {
                runtime::yield_now().upon(|_| panic!("first"));
                runtime::yield_now().upon(|_| panic!("second"));
                Deferred::never()
            });
            inner.map(|result| {
                if let Err(e) = result {
                    assert_eq!(e.cause, "first");
                }
            });
            Deferred::never()
        });
        let result: Result<(), Fail> = rt.run_until(outer)?;
        match result {
            Err(e) => crate::ensure_eq!(e.cause, "second".to_string()),
            Ok(()) => anyhow::bail!("expected the second error to escape the inner monitor"),
        }
        Ok(())
    }

    /// Tests monitor identity and the default parent.
    #[test]
    fn create_defaults_to_the_current_monitor() -> Result<()> {
        let current: SharedMonitor = SharedMonitor::current();
        let child: SharedMonitor = SharedMonitor::create(Some("child"), None);
        crate::ensure_eq!(child.name(), "child".to_string());
        crate::ensure_eq!(SharedMonitor::same(&child, &current), false);
        crate::ensure_eq!(current.children_names.contains(&"child".to_string()), true);
        Ok(())
    }
}
