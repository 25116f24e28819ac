// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod clock;
pub mod config;
pub mod deferred;
pub mod demux;
pub mod fail;
pub mod fd;
pub mod ivar;
pub mod logging;
pub mod monitor;
pub mod scheduler;
pub mod sequence;
pub mod shutdown;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    clock::Clock,
    config::Config,
    deferred::Deferred,
    demux::{
        Demultiplexer,
        Epoll,
        Event,
    },
    fail::Fail,
    fd::SharedFd,
    ivar::SharedIvar,
    monitor::SharedMonitor,
    scheduler::{
        Job,
        Scheduler,
    },
    shutdown::ShutdownCoordinator,
};
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    convert::{
        AsMut,
        AsRef,
    },
    ops::{
        Deref,
        DerefMut,
    },
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The single-threaded runtime: the job scheduler, the clock, the readiness demultiplexer, the table of managed file
/// descriptors, and the shutdown coordinator. There is one of these per thread, reached through [current].
pub struct Runtime {
    /// Ready-job queue and ambient monitor.
    scheduler: Scheduler,
    /// Pending time-triggered fills.
    clock: Clock,
    /// OS readiness demultiplexer.
    demux: SharedBox<dyn Demultiplexer>,
    /// Managed descriptors currently registered with the demultiplexer, keyed by registration token.
    fd_table: Slab<SharedFd>,
    /// Process-wide termination state.
    shutdown: ShutdownCoordinator,
    /// Runtime tunables.
    config: Config,
}

#[derive(Clone)]
pub struct SharedRuntime(SharedObject<Runtime>);

/// The SharedObject wraps an object that will be shared across callbacks.
pub struct SharedObject<T>(Rc<T>);
pub struct SharedBox<T: ?Sized>(SharedObject<Box<T>>);

//======================================================================================================================
// Thread-local Variables
//======================================================================================================================

thread_local! {
    /// The runtime for this thread. Initialization is lazy, on the first call to [current].
    static RUNTIME: RefCell<Option<SharedRuntime>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns a handle to this thread's runtime, creating it on first use.
pub fn current() -> SharedRuntime {
    RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(SharedRuntime::new(Config::from_env()));
        }
        slot.as_ref().expect("runtime was just initialized").clone()
    })
}

/// Returns a unit deferred that becomes determined at the back of the current job queue. Long-running computations
/// call this to give other ready jobs a chance to run.
pub fn yield_now() -> Deferred<()> {
    let mut runtime: SharedRuntime = current();
    let result: SharedIvar<()> = SharedIvar::new();
    let monitor: SharedMonitor = runtime.scheduler.current_monitor();
    let mut cell: SharedIvar<()> = result.clone();
    runtime.scheduler.enqueue(Job::new(monitor, Box::new(move || cell.fill(()))));
    result.read()
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for the Shared Runtime
impl SharedRuntime {
    fn new(config: Config) -> Self {
        logging::initialize();
        let root: SharedMonitor = SharedMonitor::root();
        let demux: Epoll =
            Epoll::new(config.poll_batch_size).expect("could not create the readiness demultiplexer");
        Self(SharedObject::<Runtime>::new(Runtime {
            scheduler: Scheduler::new(root),
            clock: Clock::new(Instant::now()),
            demux: SharedBox::new(Box::new(demux)),
            fd_table: Slab::<SharedFd>::new(),
            shutdown: ShutdownCoordinator::default(),
            config,
        }))
    }

    /// Drives cycles until `d` becomes determined and returns its value. Fails when the runtime is shutting down, or
    /// when the deferred can no longer become determined because no jobs, timers, or watched descriptors remain.
    pub fn run_until<T: Clone + 'static>(&mut self, d: Deferred<T>) -> Result<T, Fail> {
        loop {
            if let Some(value) = d.peek() {
                return Ok(value);
            }
            if let Some(status) = self.shutdown.exit_status() {
                let cause: String = format!("runtime is shutting down (status={:?})", status);
                warn!("run_until(): {}", cause);
                return Err(Fail::new(libc::ECANCELED, &cause));
            }
            if !self.has_work() {
                let cause: &str = "deferred cannot become determined: no jobs, timers, or watched descriptors";
                error!("run_until(): {}", cause);
                return Err(Fail::new(libc::EDEADLK, cause));
            }
            self.run_one_cycle();
        }
    }

    /// Drives cycles forever. The only way out is the shutdown flow, which exits the process.
    pub fn run(&mut self) -> ! {
        loop {
            if let Some(status) = self.run_one_cycle() {
                trace!("run(): exiting with status {:?}", status);
                std::process::exit(status);
            }
            if !self.has_work() {
                // Nothing can make progress again on this thread; sleep on the demultiplexer instead of spinning.
                let mut demux: SharedBox<dyn Demultiplexer> = self.demux.clone();
                let mut events: Vec<Event> = Vec::new();
                let _ = demux.poll(None, &mut events);
            }
        }
    }

    /// One pass of the scheduler: exit check, job drain, readiness poll, timer firing. Returns the exit status once
    /// shutdown has completed.
    pub fn run_one_cycle(&mut self) -> Option<i32> {
        if let Some(status) = self.shutdown.exit_status() {
            return Some(status);
        }

        self.run_all_jobs();
        if let Some(status) = self.shutdown.exit_status() {
            return Some(status);
        }
        self.poll_demux();
        let now: Instant = Instant::now();
        for mut ivar in self.clock.take_due(now) {
            ivar.fill(());
        }
        self.scheduler.finish_cycle();

        self.shutdown.exit_status()
    }

    /// Drains the ready-job queue in FIFO order. Jobs enqueued while draining run in this same cycle. Each job runs
    /// with its monitor installed as current; a panic inside a job is unwound here and delivered to that monitor.
    fn run_all_jobs(&mut self) {
        while let Some(job) = self.scheduler.dequeue() {
            let (monitor, thunk) = job.into_parts();
            let saved: SharedMonitor = self.scheduler.current_monitor();
            self.scheduler.set_current_monitor(monitor.clone());
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(thunk));
            self.scheduler.set_current_monitor(saved);
            if let Err(payload) = result {
                monitor.deliver(Fail::from_panic(payload));
            }
        }
    }

    /// Polls the demultiplexer with a timeout chosen from the clock and delivers the resulting events.
    fn poll_demux(&mut self) {
        let timeout: Option<Duration> = if self.scheduler.has_ready_jobs() {
            // Should not happen after the drain, but never sleep while work is pending.
            Some(Duration::ZERO)
        } else {
            self.clock
                .next_expiry()
                .map(|expiry| expiry.saturating_duration_since(Instant::now()))
        };
        if timeout.is_none() && self.demux.num_watched() == 0 {
            // Nothing watched and nothing timed: polling would sleep forever.
            return;
        }

        let mut events: Vec<Event> = Vec::with_capacity(self.config.poll_batch_size);
        let mut demux: SharedBox<dyn Demultiplexer> = self.demux.clone();
        match demux.poll(timeout, &mut events) {
            Ok(()) => {
                for event in events {
                    let fd: Option<SharedFd> = self.fd_table.get(event.token).cloned();
                    match fd {
                        Some(mut fd) => fd.deliver_readiness(event.dir, event.kind),
                        None => debug!("poll_demux(): event for unregistered token {:?}", event.token),
                    }
                }
            },
            Err(e) if e.errno == libc::EINTR => {
                let fds: Vec<SharedFd> = self.fd_table.iter().map(|(_, fd)| fd.clone()).collect();
                for mut fd in fds {
                    fd.deliver_interrupted();
                }
            },
            Err(e) => {
                let cause: String = format!("fatal demultiplexer error: {:?}", e);
                error!("poll_demux(): {}", cause);
                shutdown::shutdown(1);
            },
        }
    }

    /// True when anything remains that could make progress.
    fn has_work(&self) -> bool {
        self.scheduler.has_ready_jobs() || self.clock.has_pending() || self.demux.num_watched() > 0
    }

    /// The number of completed scheduler cycles.
    pub fn num_cycles(&self) -> u64 {
        self.scheduler.num_cycles()
    }
}

impl<T> SharedObject<T> {
    pub fn new(object: T) -> Self {
        Self(Rc::new(object))
    }

    /// Two handles are the same when they share the underlying object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl<T: ?Sized> SharedBox<T> {
    pub fn new(boxed_object: Box<T>) -> Self {
        Self(SharedObject::<Box<T>>::new(boxed_object))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Dereferences a shared object for use.
impl<T> Deref for SharedObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

/// Dereferences a mutable reference to a shared object for use. This breaks Rust's ownership model because it allows
/// more than one mutable dereference of a shared object at a time. This runtime requires it because many callbacks
/// hold handles to the same cell or descriptor; the runtime also guarantees that only one callback runs at a time, so
/// the static borrow checker cannot see the safety argument and the dynamic one would only add overhead. Shared
/// objects should be used with the understanding that they may be mutated whenever control returns to the scheduler.
impl<T> DerefMut for SharedObject<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

/// Returns a reference to the interior object, which is borrowed for directly accessing the value.
impl<T> AsRef<T> for SharedObject<T> {
    fn as_ref(&self) -> &T {
        self.0.as_ref()
    }
}

/// Returns a mutable reference to the interior object. Same safety argument as [DerefMut].
impl<T> AsMut<T> for SharedObject<T> {
    fn as_mut(&mut self) -> &mut T {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

impl<T> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> Deref for SharedBox<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<T: ?Sized> DerefMut for SharedBox<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut().as_mut()
    }
}

impl<T: ?Sized> Clone for SharedBox<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Deref for SharedRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedRuntime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}
