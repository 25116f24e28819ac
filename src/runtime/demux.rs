// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The readiness demultiplexer: the platform abstraction the scheduler polls for descriptor events.
//!
//! The scheduler only depends on the [Demultiplexer] contract; [Epoll] is the Linux backend. An interrupted poll
//! surfaces as an EINTR failure, which the scheduler translates into `Interrupted` wakeups on every occupied
//! readiness slot. Any other poll failure is fatal and tears the runtime down.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    fd::Direction,
};
use ::std::{
    collections::HashMap,
    os::fd::RawFd,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// What the demultiplexer observed on a watched descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// The descriptor is ready for I/O in the event's direction.
    Ready,
    /// The OS reports the descriptor itself is in an error state.
    BadFd,
}

/// One readiness event, keyed by the registration token.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: usize,
    pub dir: Direction,
    pub kind: EventKind,
}

/// The contract between the scheduler and the OS readiness facility.
pub trait Demultiplexer {
    /// Starts watching `raw` for readiness in `dir`, reporting events under `token`.
    fn register(&mut self, token: usize, raw: RawFd, dir: Direction) -> Result<(), Fail>;

    /// Stops watching `raw` in `dir`.
    fn unregister(&mut self, token: usize, raw: RawFd, dir: Direction) -> Result<(), Fail>;

    /// Stops watching `raw` in both directions.
    fn unregister_all(&mut self, token: usize, raw: RawFd) -> Result<(), Fail>;

    /// The number of descriptors currently watched in at least one direction.
    fn num_watched(&self) -> usize;

    /// Waits up to `timeout` (forever when None) and appends observed events to `events`, which is cleared first.
    /// An EINTR failure means the wait was interrupted; anything else is fatal.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> Result<(), Fail>;
}

/// The epoll-backed demultiplexer.
pub struct Epoll {
    epoll_fd: RawFd,
    /// Interest mask per registered token. Needed to tell ADD from MOD from DEL.
    interests: HashMap<usize, u32>,
    /// Maximum events drained per poll.
    batch_size: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for the Epoll Demultiplexer
impl Epoll {
    pub fn new(batch_size: usize) -> Result<Self, Fail> {
        let epoll_fd: RawFd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                let cause: String = format!("failed to create epoll instance (errno={:?})", errno);
                error!("new(): {}", cause);
                return Err(Fail::new(errno, &cause));
            },
        };
        Ok(Self {
            epoll_fd,
            interests: HashMap::<usize, u32>::new(),
            batch_size,
        })
    }

    /// Issues an epoll_ctl with the given operation and interest mask.
    fn control(&self, op: libc::c_int, raw: RawFd, token: usize, mask: u32) -> Result<(), Fail> {
        let mut epoll_event: libc::epoll_event = libc::epoll_event {
            events: mask,
            u64: token as u64,
        };
        match unsafe { libc::epoll_ctl(self.epoll_fd, op, raw, &mut epoll_event) } {
            0 => Ok(()),
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                if op == libc::EPOLL_CTL_DEL && (errno == libc::EBADF || errno == libc::ENOENT) {
                    warn!("control(): interest was already removed or never registered (fd={:?})", raw);
                    return Ok(());
                }
                let cause: String = format!("epoll_ctl failed (fd={:?}, op={:?}, errno={:?})", raw, op, errno);
                error!("control(): {}", cause);
                Err(Fail::new(errno, &cause))
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The epoll interest bit for a readiness direction.
fn interest_bit(dir: Direction) -> u32 {
    match dir {
        Direction::Read => libc::EPOLLIN as u32,
        Direction::Write => libc::EPOLLOUT as u32,
    }
}

/// Converts the poll timeout to epoll's millisecond convention: -1 sleeps forever, and a nonzero sub-millisecond
/// timeout rounds up so the poll cannot spin.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis: u128 = timeout.as_millis();
            if millis == 0 && !timeout.is_zero() {
                1
            } else {
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        },
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Demultiplexer for Epoll {
    fn register(&mut self, token: usize, raw: RawFd, dir: Direction) -> Result<(), Fail> {
        let old: u32 = self.interests.get(&token).copied().unwrap_or(0);
        let new: u32 = old | interest_bit(dir);
        if new == old {
            return Ok(());
        }
        let op: libc::c_int = if old == 0 { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.control(op, raw, token, new)?;
        self.interests.insert(token, new);
        Ok(())
    }

    fn unregister(&mut self, token: usize, raw: RawFd, dir: Direction) -> Result<(), Fail> {
        let old: u32 = match self.interests.get(&token).copied() {
            Some(old) => old,
            None => return Ok(()),
        };
        let new: u32 = old & !interest_bit(dir);
        if new == old {
            return Ok(());
        }
        if new == 0 {
            self.control(libc::EPOLL_CTL_DEL, raw, token, 0)?;
            self.interests.remove(&token);
        } else {
            self.control(libc::EPOLL_CTL_MOD, raw, token, new)?;
            self.interests.insert(token, new);
        }
        Ok(())
    }

    fn unregister_all(&mut self, token: usize, raw: RawFd) -> Result<(), Fail> {
        if self.interests.remove(&token).is_some() {
            self.control(libc::EPOLL_CTL_DEL, raw, token, 0)?;
        }
        Ok(())
    }

    fn num_watched(&self) -> usize {
        self.interests.len()
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> Result<(), Fail> {
        events.clear();
        let mut observed: Vec<libc::epoll_event> = Vec::with_capacity(self.batch_size);
        let num_events: usize = match unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                observed.as_mut_ptr(),
                self.batch_size as libc::c_int,
                timeout_millis(timeout),
            )
        } {
            n if n >= 0 => n as usize,
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                if errno == libc::EINTR {
                    return Err(Fail::new(errno, "poll was interrupted"));
                }
                let cause: String = format!("epoll_wait failed (errno={:?})", errno);
                error!("poll(): {}", cause);
                return Err(Fail::new(errno, &cause));
            },
        };
        unsafe {
            observed.set_len(num_events);
        }

        for observed_event in observed {
            let token: usize = observed_event.u64 as usize;
            let interest: u32 = self.interests.get(&token).copied().unwrap_or(0);
            let bits: u32 = observed_event.events;
            if bits & libc::EPOLLERR as u32 != 0 {
                for dir in [Direction::Read, Direction::Write] {
                    if interest & interest_bit(dir) != 0 {
                        events.push(Event {
                            token,
                            dir,
                            kind: EventKind::BadFd,
                        });
                    }
                }
                continue;
            }
            // A hangup makes reads observable (they will return EOF), so it counts as read readiness.
            if bits & (libc::EPOLLIN | libc::EPOLLHUP) as u32 != 0 && interest & libc::EPOLLIN as u32 != 0 {
                events.push(Event {
                    token,
                    dir: Direction::Read,
                    kind: EventKind::Ready,
                });
            }
            if bits & libc::EPOLLOUT as u32 != 0 && interest & libc::EPOLLOUT as u32 != 0 {
                events.push(Event {
                    token,
                    dir: Direction::Write,
                    kind: EventKind::Ready,
                });
            }
        }
        Ok(())
    }
}

/// Releases the epoll instance.
impl Drop for Epoll {
    fn drop(&mut self) {
        match unsafe { libc::close(self.epoll_fd) } {
            0 => (),
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                warn!("drop(): could not close epoll instance (errno={:?})", errno);
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Demultiplexer,
        Epoll,
        Event,
        EventKind,
    };
    use crate::runtime::fd::Direction;
    use ::anyhow::Result;
    use ::std::{
        os::fd::RawFd,
        time::Duration,
    };

    fn make_pipe() -> Result<(RawFd, RawFd)> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            anyhow::bail!("pipe() failed");
        }
        Ok((fds[0], fds[1]))
    }

    fn close_pipe(reader: RawFd, writer: RawFd) {
        unsafe {
            libc::close(reader);
            libc::close(writer);
        }
    }

    /// Tests that a pipe's write end reports write readiness immediately.
    #[test]
    fn write_end_of_a_pipe_is_immediately_writable() -> Result<()> {
        let (reader, writer): (RawFd, RawFd) = make_pipe()?;
        let mut epoll: Epoll = Epoll::new(16)?;
        epoll.register(1, writer, Direction::Write)?;

        let mut events: Vec<Event> = Vec::new();
        epoll.poll(Some(Duration::from_millis(100)), &mut events)?;
        let writable: bool = events
            .iter()
            .any(|e| e.token == 1 && e.dir == Direction::Write && e.kind == EventKind::Ready);
        close_pipe(reader, writer);
        crate::ensure_eq!(writable, true);
        Ok(())
    }

    /// Tests that read readiness arrives only once data is in the pipe.
    #[test]
    fn read_end_becomes_readable_after_a_write() -> Result<()> {
        let (reader, writer): (RawFd, RawFd) = make_pipe()?;
        let mut epoll: Epoll = Epoll::new(16)?;
        epoll.register(7, reader, Direction::Read)?;

        let mut events: Vec<Event> = Vec::new();
        epoll.poll(Some(Duration::ZERO), &mut events)?;
        crate::ensure_eq!(events.iter().any(|e| e.token == 7), false);

        if unsafe { libc::write(writer, b"x".as_ptr() as *const libc::c_void, 1) } != 1 {
            close_pipe(reader, writer);
            anyhow::bail!("write() failed");
        }
        epoll.poll(Some(Duration::from_millis(100)), &mut events)?;
        let readable: bool = events
            .iter()
            .any(|e| e.token == 7 && e.dir == Direction::Read && e.kind == EventKind::Ready);
        close_pipe(reader, writer);
        crate::ensure_eq!(readable, true);
        Ok(())
    }

    /// Tests that unregistering stops event delivery.
    #[test]
    fn unregister_silences_a_descriptor() -> Result<()> {
        let (reader, writer): (RawFd, RawFd) = make_pipe()?;
        let mut epoll: Epoll = Epoll::new(16)?;
        epoll.register(3, writer, Direction::Write)?;
        epoll.unregister(3, writer, Direction::Write)?;

        let mut events: Vec<Event> = Vec::new();
        epoll.poll(Some(Duration::ZERO), &mut events)?;
        close_pipe(reader, writer);
        crate::ensure_eq!(events.is_empty(), true);
        Ok(())
    }

    /// Tests that registering a closed descriptor is reported as a failure.
    #[test]
    fn register_fails_on_a_closed_descriptor() -> Result<()> {
        let (reader, writer): (RawFd, RawFd) = make_pipe()?;
        close_pipe(reader, writer);
        let mut epoll: Epoll = Epoll::new(16)?;
        match epoll.register(5, reader, Direction::Read) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EBADF),
            Ok(()) => anyhow::bail!("expected registration to fail"),
        }
        Ok(())
    }
}
