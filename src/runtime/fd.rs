// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Managed file descriptors.
//!
//! An [SharedFd] wraps a raw OS descriptor with the state machine that coordinates in-flight readiness waits and
//! deferred close. The wrapper owns the descriptor until it is closed or replaced; the OS close happens exactly once,
//! and only after every in-flight wait has been awakened.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        self,
        deferred::Deferred,
        demux::EventKind,
        fail::Fail,
        ivar::SharedIvar,
        monitor::SharedMonitor,
        scheduler::Job,
        SharedObject,
        SharedRuntime,
    },
    sexp::{
        Sexp,
        ToSexp,
    },
};
use ::std::{
    io,
    mem,
    ops::{
        Deref,
        DerefMut,
    },
    os::fd::RawFd,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A readiness direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// What kind of socket a descriptor is, as far as the wrapper needs to know.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketKind {
    Unconnected,
    Bound,
    Passive,
    Active,
}

/// What kind of object a descriptor refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FdKind {
    Character,
    Fifo,
    RegularFile,
    Socket(SocketKind),
}

/// How a readiness wait ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadyToResult {
    /// The descriptor is ready for I/O in the awaited direction.
    Ready,
    /// The OS reports the descriptor is in an error state.
    BadFd,
    /// The descriptor was closed or replaced while the wait was outstanding.
    Closed,
    /// The poll was interrupted; the caller may resubscribe.
    Interrupted,
}

/// Lifecycle states of a managed descriptor.
///
/// Allowed transitions: Open to CloseRequested, Open to Replaced, CloseRequested to Closed. Anything else is a
/// programming error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FdState {
    /// The only state from which new syscalls and readiness subscriptions start.
    Open,
    /// Close was requested; the OS close runs once the in-flight count reaches zero.
    CloseRequested,
    /// Terminal. The OS descriptor has been closed.
    Closed,
    /// The descriptor was handed to another wrapper; this one is inert.
    Replaced,
}

/// A managed file descriptor.
pub struct Fd {
    /// Debugging name.
    name: String,
    raw: RawFd,
    kind: FdKind,
    supports_nonblock: bool,
    /// Whether the O_NONBLOCK flag has been set on the descriptor.
    nonblock_set: bool,
    state: FdState,
    /// Outstanding operations that must finish before the OS close may run.
    in_flight: usize,
    /// Filled once the OS close has happened.
    close_finished: SharedIvar<()>,
    /// Readiness slots: at most one outstanding wait per direction.
    read_ready: Option<SharedIvar<ReadyToResult>>,
    write_ready: Option<SharedIvar<ReadyToResult>>,
    /// Registration token while the descriptor is known to the demultiplexer.
    token: Option<usize>,
    /// Whether the closing job has been enqueued.
    close_scheduled: bool,
}

/// Reference to a managed descriptor that is shared across callbacks.
#[derive(Clone)]
pub struct SharedFd(SharedObject<Fd>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FdKind {
    /// Whether descriptors of this kind accept the O_NONBLOCK flag.
    fn supports_nonblock(&self) -> bool {
        match self {
            // Character devices accept the flag, though drivers vary in how much they honor it.
            FdKind::Character => true,
            FdKind::Fifo => true,
            FdKind::RegularFile => true,
            FdKind::Socket(_) => true,
        }
    }
}

/// Associate Functions for Shared Fds
impl SharedFd {
    /// Wraps `raw` in a managed descriptor. The wrapper owns the descriptor from here on.
    pub fn create(kind: FdKind, raw: RawFd, name: &str) -> Self {
        trace!("create(): name={:?}, raw={:?}, kind={:?}", name, raw, kind);
        let fd: Self = Self(SharedObject::<Fd>::new(Fd {
            name: name.to_string(),
            raw,
            kind,
            supports_nonblock: kind.supports_nonblock(),
            nonblock_set: false,
            state: FdState::Open,
            in_flight: 0,
            close_finished: SharedIvar::<()>::new(),
            read_ready: None,
            write_ready: None,
            token: None,
            close_scheduled: false,
        }));
        fd.check_invariants();
        fd
    }

    /// Probes the kind of a bare descriptor so it can be wrapped.
    pub fn kind_of(raw: RawFd) -> Result<FdKind, Fail> {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(raw, &mut st) } != 0 {
            return Err(Fail::from(io::Error::last_os_error()));
        }
        match st.st_mode & libc::S_IFMT {
            libc::S_IFCHR => Ok(FdKind::Character),
            libc::S_IFIFO => Ok(FdKind::Fifo),
            libc::S_IFREG => Ok(FdKind::RegularFile),
            libc::S_IFSOCK => Ok(FdKind::Socket(probe_socket_kind(raw))),
            mode => {
                let cause: String = format!("unsupported descriptor kind (mode={:#o})", mode);
                error!("kind_of(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    /// The raw descriptor. Meaningful only while the wrapper is open.
    pub fn raw_fd(&self) -> RawFd {
        self.raw
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_open(&self) -> bool {
        self.state == FdState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == FdState::Closed
    }

    /// The deferred that determines once the OS close has happened.
    pub fn close_finished(&self) -> Deferred<()> {
        self.close_finished.read()
    }

    /// Runs `f` on the raw descriptor synchronously. When `nonblocking` is set, the O_NONBLOCK flag is put on the
    /// descriptor first (once; the flag sticks). Fails without calling `f` when the wrapper is not open.
    pub fn with_fd<R>(&mut self, nonblocking: bool, f: impl FnOnce(RawFd) -> R) -> Result<R, Fail> {
        self.check_invariants();
        if self.state != FdState::Open {
            let cause: String = format!("descriptor is already closed (name={:?})", self.name);
            debug!("with_fd(): {}", cause);
            return Err(Fail::new(libc::EBADF, &cause));
        }
        if nonblocking && !self.nonblock_set {
            self.set_nonblock()?;
        }
        Ok(f(self.raw))
    }

    /// Subscribes to readiness in `dir`. At most one wait is outstanding per direction: a second subscription joins
    /// the first. When the wrapper is not open the result is immediately `Closed`.
    pub fn ready_to(&mut self, dir: Direction) -> Deferred<ReadyToResult> {
        self.check_invariants();
        if self.state != FdState::Open {
            return Deferred::from_value(ReadyToResult::Closed);
        }
        if let Some(ivar) = self.slot(dir) {
            return ivar.read();
        }

        // First wait for this fd in either direction registers it with the demultiplexer.
        let token: usize = match self.token {
            Some(token) => token,
            None => {
                let mut rt: SharedRuntime = runtime::current();
                let token: usize = rt.fd_table.insert(self.clone());
                self.token = Some(token);
                token
            },
        };
        {
            let raw: RawFd = self.raw;
            let mut rt: SharedRuntime = runtime::current();
            let mut demux = rt.demux.clone();
            if let Err(e) = demux.register(token, raw, dir) {
                warn!("ready_to(): could not watch descriptor (name={:?}): {:?}", self.name, e);
                self.release_token_if_unused();
                return Deferred::from_value(ReadyToResult::BadFd);
            }
        }

        let ivar: SharedIvar<ReadyToResult> = SharedIvar::new();
        *self.slot_mut(dir) = Some(ivar.clone());
        self.in_flight += 1;
        self.check_invariants();
        ivar.read()
    }

    /// Requests a close. Idempotent: every call returns the same close-finished deferred, and the OS close happens
    /// exactly once, after outstanding waits have been awakened with `Closed`.
    pub fn close(&mut self) -> Deferred<()> {
        self.check_invariants();
        match self.state {
            FdState::Closed | FdState::CloseRequested => return self.close_finished.read(),
            FdState::Replaced => {
                // The descriptor belongs to another wrapper now; there is nothing to close here.
                debug!("close(): descriptor was replaced (name={:?})", self.name);
                return self.close_finished.read();
            },
            FdState::Open => (),
        }

        trace!("close(): name={:?}, raw={:?}", self.name, self.raw);
        self.state = FdState::CloseRequested;
        self.settle_slot(Direction::Read, ReadyToResult::Closed);
        self.settle_slot(Direction::Write, ReadyToResult::Closed);
        self.withdraw_from_demux();
        self.maybe_schedule_close();
        self.check_invariants();
        self.close_finished.read()
    }

    /// Hands the raw descriptor to the caller, leaving this wrapper inert. Outstanding waits are awakened with
    /// `Closed`. Replacing a wrapper that is not open is a programming error.
    pub fn replace(&mut self) -> RawFd {
        self.check_invariants();
        if self.state != FdState::Open {
            panic!("cannot replace a descriptor in state {:?}", self.state);
        }
        trace!("replace(): name={:?}, raw={:?}", self.name, self.raw);
        self.state = FdState::Replaced;
        self.settle_slot(Direction::Read, ReadyToResult::Closed);
        self.settle_slot(Direction::Write, ReadyToResult::Closed);
        self.withdraw_from_demux();
        self.check_invariants();
        self.raw
    }

    /// Delivers a demultiplexer event to the matching readiness slot.
    pub(crate) fn deliver_readiness(&mut self, dir: Direction, kind: EventKind) {
        self.check_invariants();
        let result: ReadyToResult = match kind {
            EventKind::Ready => ReadyToResult::Ready,
            EventKind::BadFd => ReadyToResult::BadFd,
        };
        self.settle_slot(dir, result);
        self.maybe_schedule_close();
        self.check_invariants();
    }

    /// Awakens every occupied readiness slot with `Interrupted`. Called when the poll itself was interrupted.
    pub(crate) fn deliver_interrupted(&mut self) {
        self.check_invariants();
        self.settle_slot(Direction::Read, ReadyToResult::Interrupted);
        self.settle_slot(Direction::Write, ReadyToResult::Interrupted);
        self.maybe_schedule_close();
        self.check_invariants();
    }

    fn slot(&self, dir: Direction) -> Option<SharedIvar<ReadyToResult>> {
        match dir {
            Direction::Read => self.read_ready.clone(),
            Direction::Write => self.write_ready.clone(),
        }
    }

    fn slot_mut(&mut self, dir: Direction) -> &mut Option<SharedIvar<ReadyToResult>> {
        match dir {
            Direction::Read => &mut self.read_ready,
            Direction::Write => &mut self.write_ready,
        }
    }

    /// Fills and clears the readiness slot for `dir`, dropping the in-flight count and the demultiplexer interest
    /// that the subscription carried.
    fn settle_slot(&mut self, dir: Direction, result: ReadyToResult) {
        let ivar: Option<SharedIvar<ReadyToResult>> = self.slot_mut(dir).take();
        if let Some(mut ivar) = ivar {
            if self.in_flight == 0 {
                panic!("in-flight counter underflow (name={:?})", self.name);
            }
            self.in_flight -= 1;
            if let Some(token) = self.token {
                let raw: RawFd = self.raw;
                let mut rt: SharedRuntime = runtime::current();
                let mut demux = rt.demux.clone();
                if let Err(e) = demux.unregister(token, raw, dir) {
                    warn!("settle_slot(): could not unwatch descriptor (name={:?}): {:?}", self.name, e);
                }
            }
            ivar.fill(result);
        }
    }

    /// Removes the descriptor from the demultiplexer and the fd table entirely.
    fn withdraw_from_demux(&mut self) {
        if let Some(token) = self.token.take() {
            let raw: RawFd = self.raw;
            let mut rt: SharedRuntime = runtime::current();
            let mut demux = rt.demux.clone();
            if let Err(e) = demux.unregister_all(token, raw) {
                warn!("withdraw_from_demux(): could not unwatch descriptor (name={:?}): {:?}", self.name, e);
            }
            rt.fd_table.remove(token);
        }
    }

    /// Drops the fd-table entry allocated for a registration that failed before any slot was occupied.
    fn release_token_if_unused(&mut self) {
        if self.read_ready.is_none() && self.write_ready.is_none() {
            if let Some(token) = self.token.take() {
                let mut rt: SharedRuntime = runtime::current();
                rt.fd_table.remove(token);
            }
        }
    }

    /// Enqueues the job that performs the OS close, once a requested close has no in-flight operations left.
    fn maybe_schedule_close(&mut self) {
        if self.state == FdState::CloseRequested && self.in_flight == 0 && !self.close_scheduled {
            self.close_scheduled = true;
            let mut fd: SharedFd = self.clone();
            let mut rt: SharedRuntime = runtime::current();
            let monitor: SharedMonitor = rt.scheduler.current_monitor();
            rt.scheduler
                .enqueue(Job::new(monitor, Box::new(move || fd.finish_close())));
        }
    }

    /// Performs the OS close and fills close_finished. Runs as its own job.
    fn finish_close(&mut self) {
        assert_eq!(self.state, FdState::CloseRequested, "close finishing out of order");
        if unsafe { libc::close(self.raw) } != 0 {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            warn!("finish_close(): close failed (name={:?}, errno={:?})", self.name, errno);
        }
        self.state = FdState::Closed;
        self.close_finished.fill(());
        self.check_invariants();
    }

    fn set_nonblock(&mut self) -> Result<(), Fail> {
        if !self.supports_nonblock {
            let cause: String = format!("descriptor does not support nonblocking mode (name={:?})", self.name);
            error!("set_nonblock(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let flags: libc::c_int = unsafe { libc::fcntl(self.raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(Fail::from(io::Error::last_os_error()));
        }
        if unsafe { libc::fcntl(self.raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
            return Err(Fail::from(io::Error::last_os_error()));
        }
        self.nonblock_set = true;
        Ok(())
    }

    /// Asserts the state-machine invariants. Violations are programming errors.
    fn check_invariants(&self) {
        let slots_empty: bool = self.read_ready.is_none() && self.write_ready.is_none();
        match self.state {
            FdState::Open | FdState::CloseRequested => {
                assert!(
                    self.close_finished.is_empty(),
                    "close_finished determined before the close (name={:?})",
                    self.name
                );
                let num_slots: usize =
                    usize::from(self.read_ready.is_some()) + usize::from(self.write_ready.is_some());
                assert!(
                    self.in_flight >= num_slots,
                    "an occupied readiness slot with no in-flight operation (name={:?})",
                    self.name
                );
            },
            FdState::Closed => {
                assert!(self.in_flight == 0 && slots_empty, "closed with work in flight (name={:?})", self.name);
                assert!(
                    !self.close_finished.is_empty(),
                    "closed without determining close_finished (name={:?})",
                    self.name
                );
            },
            FdState::Replaced => {
                assert!(
                    self.in_flight == 0 && slots_empty,
                    "replaced with work in flight (name={:?})",
                    self.name
                );
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Whether an errno means the operation should be retried once the descriptor is ready.
pub fn should_retry(errno: i32) -> bool {
    errno == libc::EINPROGRESS || errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EALREADY
}

/// Runs a nonblocking syscall against the descriptor, retrying after readiness on EAGAIN-class errors and
/// immediately on EINTR. The returned deferred carries the syscall's result, or EBADF when the descriptor is closed
/// out from under the wait.
pub fn syscall<T, F>(fd: &SharedFd, dir: Direction, f: F) -> Deferred<Result<T, Fail>>
where
    T: Clone + 'static,
    F: FnMut(RawFd) -> Result<T, Fail> + 'static,
{
    let result: SharedIvar<Result<T, Fail>> = SharedIvar::new();
    attempt_syscall(fd.clone(), dir, f, result.clone());
    result.read()
}

/// One attempt of [syscall]; reattempts are chained through readiness subscriptions.
fn attempt_syscall<T, F>(mut fd: SharedFd, dir: Direction, mut f: F, result: SharedIvar<Result<T, Fail>>)
where
    T: Clone + 'static,
    F: FnMut(RawFd) -> Result<T, Fail> + 'static,
{
    let mut result: SharedIvar<Result<T, Fail>> = result;
    loop {
        match fd.with_fd(true, &mut f) {
            Err(e) => {
                result.fill(Err(e));
                return;
            },
            Ok(Ok(value)) => {
                result.fill(Ok(value));
                return;
            },
            Ok(Err(e)) if e.errno == libc::EINTR => continue,
            Ok(Err(e)) if should_retry(e.errno) => {
                fd.clone().ready_to(dir).upon(move |readiness| match readiness {
                    ReadyToResult::Ready | ReadyToResult::Interrupted => attempt_syscall(fd, dir, f, result),
                    ReadyToResult::Closed => {
                        let mut result: SharedIvar<Result<T, Fail>> = result;
                        result.fill(Err(Fail::new(libc::EBADF, "descriptor closed while awaiting readiness")));
                    },
                    ReadyToResult::BadFd => {
                        let mut result: SharedIvar<Result<T, Fail>> = result;
                        result.fill(Err(Fail::new(libc::EBADF, "bad descriptor")));
                    },
                });
                return;
            },
            Ok(Err(e)) => {
                result.fill(Err(e));
                return;
            },
        }
    }
}

/// Distinguishes the socket kinds a bare socket descriptor can be in.
fn probe_socket_kind(raw: RawFd) -> SocketKind {
    let mut accepting: libc::c_int = 0;
    let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc: libc::c_int = unsafe {
        libc::getsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut accepting as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 && accepting != 0 {
        return SocketKind::Passive;
    }

    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getpeername(raw, &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr, &mut addr_len) }
        == 0
    {
        return SocketKind::Active;
    }
    SocketKind::Unconnected
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedFd {
    type Target = Fd;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedFd {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl ToSexp for Direction {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::Read => Sexp::atom("Read"),
            Self::Write => Sexp::atom("Write"),
        }
    }
}

impl ToSexp for SocketKind {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::Unconnected => Sexp::atom("Unconnected"),
            Self::Bound => Sexp::atom("Bound"),
            Self::Passive => Sexp::atom("Passive"),
            Self::Active => Sexp::atom("Active"),
        }
    }
}

impl ToSexp for FdKind {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::Character => Sexp::atom("Char"),
            Self::Fifo => Sexp::atom("Fifo"),
            Self::RegularFile => Sexp::atom("File"),
            Self::Socket(kind) => Sexp::list(vec![Sexp::atom("Socket"), kind.to_sexp()]),
        }
    }
}

impl ToSexp for ReadyToResult {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::Ready => Sexp::atom("Ready"),
            Self::BadFd => Sexp::atom("Bad_fd"),
            Self::Closed => Sexp::atom("Closed"),
            Self::Interrupted => Sexp::atom("Interrupted"),
        }
    }
}

impl ToSexp for FdState {
    fn to_sexp(&self) -> Sexp {
        match self {
            Self::Open => Sexp::atom("Open"),
            Self::CloseRequested => Sexp::atom("Close_requested"),
            Self::Closed => Sexp::atom("Closed"),
            Self::Replaced => Sexp::atom("Replaced"),
        }
    }
}

impl ToSexp for SharedFd {
    fn to_sexp(&self) -> Sexp {
        Sexp::list(vec![
            Sexp::atom("fd"),
            Sexp::field("name", Sexp::atom(self.name())),
            Sexp::field("raw", (self.raw as i64).to_sexp()),
            Sexp::field("kind", self.kind.to_sexp()),
            Sexp::field("state", self.state.to_sexp()),
            Sexp::field("in_flight", self.in_flight.to_sexp()),
            Sexp::field("read_ready", self.read_ready.to_sexp()),
            Sexp::field("write_ready", self.write_ready.to_sexp()),
            Sexp::field("close_finished", self.close_finished.to_sexp()),
        ])
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        syscall,
        Direction,
        FdKind,
        ReadyToResult,
        SharedFd,
        SocketKind,
    };
    use crate::runtime::{
        self,
        deferred::Deferred,
        fail::Fail,
        SharedRuntime,
    };
    use ::anyhow::Result;
    use ::std::os::fd::RawFd;

    fn make_pipe() -> Result<(SharedFd, SharedFd)> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            anyhow::bail!("pipe() failed");
        }
        Ok((
            SharedFd::create(FdKind::Fifo, fds[0], "pipe-reader"),
            SharedFd::create(FdKind::Fifo, fds[1], "pipe-writer"),
        ))
    }

    /// Tests kind probing on a pipe and on a socket pair.
    #[test]
    fn kind_of_recognizes_pipes_and_sockets() -> Result<()> {
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;
        crate::ensure_eq!(SharedFd::kind_of(reader.raw_fd())?, FdKind::Fifo);

        let mut pair: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) } != 0 {
            anyhow::bail!("socketpair() failed");
        }
        crate::ensure_eq!(SharedFd::kind_of(pair[0])?, FdKind::Socket(SocketKind::Active));
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }

        let mut rt: SharedRuntime = runtime::current();
        rt.run_until(Deferred::all_unit(vec![reader.close(), writer.close()]))?;
        Ok(())
    }

    /// Tests synchronous descriptor use through with_fd.
    #[test]
    fn with_fd_runs_the_callback_on_an_open_descriptor() -> Result<()> {
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;
        let written: isize = writer.with_fd(false, |raw: RawFd| unsafe {
            libc::write(raw, b"hi".as_ptr() as *const libc::c_void, 2)
        })?;
        crate::ensure_eq!(written, 2);

        let mut rt: SharedRuntime = runtime::current();
        rt.run_until(Deferred::all_unit(vec![reader.close(), writer.close()]))?;

        // A closed wrapper refuses the callback.
        match writer.with_fd(false, |_| ()) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EBADF),
            Ok(()) => anyhow::bail!("expected with_fd to fail on a closed descriptor"),
        }
        Ok(())
    }

    /// Tests that readiness is delivered once the other end of the pipe writes.
    #[test]
    fn ready_to_read_fires_after_a_write() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let readiness: Deferred<ReadyToResult> = reader.ready_to(Direction::Read);
        crate::ensure_eq!(reader.in_flight(), 1);
        crate::ensure_eq!(readiness.is_determined(), false);

        writer.with_fd(false, |raw: RawFd| unsafe {
            libc::write(raw, b"x".as_ptr() as *const libc::c_void, 1)
        })?;
        let result: ReadyToResult = rt.run_until(readiness)?;
        crate::ensure_eq!(result, ReadyToResult::Ready);
        crate::ensure_eq!(reader.in_flight(), 0);

        rt.run_until(Deferred::all_unit(vec![reader.close(), writer.close()]))?;
        Ok(())
    }

    /// Tests that at most one readiness wait is outstanding per direction.
    #[test]
    fn ready_to_joins_an_outstanding_wait() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let first: Deferred<ReadyToResult> = reader.ready_to(Direction::Read);
        let second: Deferred<ReadyToResult> = reader.ready_to(Direction::Read);
        crate::ensure_eq!(Deferred::same_cell(&first, &second), true);
        crate::ensure_eq!(reader.in_flight(), 1);

        rt.run_until(Deferred::all_unit(vec![reader.close(), writer.close()]))?;
        Ok(())
    }

    /// Tests the race between a readiness wait and a close: the wait resolves to Closed, and close_finished
    /// determines after the OS close.
    #[test]
    fn close_awakens_a_pending_readiness_wait() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let readiness: Deferred<ReadyToResult> = reader.ready_to(Direction::Read);
        let close_finished: Deferred<()> = reader.close();

        let result: ReadyToResult = rt.run_until(readiness)?;
        crate::ensure_eq!(result, ReadyToResult::Closed);
        rt.run_until(close_finished)?;
        crate::ensure_eq!(reader.is_closed(), true);
        crate::ensure_eq!(reader.in_flight(), 0);

        rt.run_until(writer.close())?;
        Ok(())
    }

    /// Tests that close is idempotent: the same deferred comes back and the OS close happens once.
    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let first: Deferred<()> = reader.close();
        let second: Deferred<()> = reader.close();
        crate::ensure_eq!(Deferred::same_cell(&first, &second), true);
        rt.run_until(first)?;
        let third: Deferred<()> = reader.close();
        crate::ensure_eq!(third.is_determined(), true);

        rt.run_until(writer.close())?;
        Ok(())
    }

    /// Tests that replace leaves the wrapper inert and hands back the raw descriptor.
    #[test]
    fn replace_hands_over_the_descriptor() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (mut reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let readiness: Deferred<ReadyToResult> = reader.ready_to(Direction::Read);
        let raw: RawFd = reader.replace();
        let result: ReadyToResult = rt.run_until(readiness)?;
        crate::ensure_eq!(result, ReadyToResult::Closed);
        crate::ensure_eq!(reader.is_open(), false);
        crate::ensure_eq!(reader.close_finished().is_determined(), false);

        // Ownership moved to a new wrapper, which closes it for real.
        let mut replacement: SharedFd = SharedFd::create(FdKind::Fifo, raw, "pipe-reader-replacement");
        rt.run_until(Deferred::all_unit(vec![replacement.close(), writer.close()]))?;
        Ok(())
    }

    /// Tests the EAGAIN-then-retry path of syscall against an initially empty pipe.
    #[test]
    fn syscall_retries_after_readiness() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let read_one: Deferred<Result<u8, Fail>> = syscall(&reader, Direction::Read, |raw: RawFd| {
            let mut byte: u8 = 0;
            match unsafe { libc::read(raw, &mut byte as *mut u8 as *mut libc::c_void, 1) } {
                1 => Ok(byte),
                _ => Err(Fail::from(std::io::Error::last_os_error())),
            }
        });
        crate::ensure_eq!(read_one.is_determined(), false);

        writer.with_fd(false, |raw: RawFd| unsafe {
            libc::write(raw, b"z".as_ptr() as *const libc::c_void, 1)
        })?;
        let value: Result<u8, Fail> = rt.run_until(read_one)?;
        crate::ensure_eq!(value, Ok(b'z'));

        let mut reader: SharedFd = reader;
        rt.run_until(Deferred::all_unit(vec![reader.close(), writer.close()]))?;
        Ok(())
    }

    /// Tests that a syscall waiting on readiness observes a concurrent close.
    #[test]
    fn syscall_observes_a_close() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let (reader, mut writer): (SharedFd, SharedFd) = make_pipe()?;

        let read_one: Deferred<Result<u8, Fail>> = syscall(&reader, Direction::Read, |raw: RawFd| {
            let mut byte: u8 = 0;
            match unsafe { libc::read(raw, &mut byte as *mut u8 as *mut libc::c_void, 1) } {
                1 => Ok(byte),
                _ => Err(Fail::from(std::io::Error::last_os_error())),
            }
        });
        let mut reader: SharedFd = reader;
        let close_finished: Deferred<()> = reader.close();
        match rt.run_until(read_one)? {
            Err(e) => crate::ensure_eq!(e.errno, libc::EBADF),
            Ok(_) => anyhow::bail!("expected the syscall to observe the close"),
        }
        rt.run_until(close_finished)?;
        rt.run_until(writer.close())?;
        Ok(())
    }
}
