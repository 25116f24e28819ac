// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        self,
        deferred::Deferred,
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
    mem,
    ops::{
        Deref,
        DerefMut,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A write-once cell. It starts out empty, accumulating subscribers that want its eventual value, and is filled at
/// most once. Filling drains every subscriber into the ready-job queue, tagged with the monitor that was current when
/// the subscription was made; after the fill the cell holds no references to them.
pub struct Ivar<T: Clone> {
    state: IvarState<T>,
}

enum IvarState<T: Clone> {
    Empty(Vec<Subscriber<T>>),
    Full(T),
}

struct Subscriber<T> {
    monitor: SharedMonitor,
    callback: Box<dyn FnOnce(T)>,
}

/// Reference to an ivar that is shared across callbacks.
#[derive(Clone)]
pub struct SharedIvar<T: Clone>(SharedObject<Ivar<T>>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Shared Ivars
impl<T: Clone + 'static> SharedIvar<T> {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self(SharedObject::<Ivar<T>>::new(Ivar {
            state: IvarState::Empty(Vec::<Subscriber<T>>::new()),
        }))
    }

    /// Creates a cell that is already filled with `value`.
    pub fn full(value: T) -> Self {
        Self(SharedObject::<Ivar<T>>::new(Ivar {
            state: IvarState::Full(value),
        }))
    }

    /// Fills the cell with `value` and enqueues every subscriber, in registration order, as a job under the monitor
    /// recorded at subscription time. Filling a cell twice is a programming error.
    pub fn fill(&mut self, value: T) {
        let subscribers: Vec<Subscriber<T>> = match &mut self.state {
            IvarState::Full(_) => panic!("ivar is already filled"),
            IvarState::Empty(subscribers) => mem::take(subscribers),
        };
        self.state = IvarState::Full(value.clone());
        if !subscribers.is_empty() {
            let mut runtime: SharedRuntime = runtime::current();
            for subscriber in subscribers {
                let v: T = value.clone();
                let callback: Box<dyn FnOnce(T)> = subscriber.callback;
                runtime
                    .scheduler
                    .enqueue(Job::new(subscriber.monitor, Box::new(move || callback(v))));
            }
        }
    }

    /// As [fill], except that filling a full cell is a no-op. Returns whether this call filled the cell.
    pub fn fill_if_empty(&mut self, value: T) -> bool {
        match self.state {
            IvarState::Full(_) => false,
            IvarState::Empty(_) => {
                self.fill(value);
                true
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, IvarState::Empty(_))
    }

    /// Returns a copy of the value, if the cell has been filled.
    pub fn peek(&self) -> Option<T> {
        match &self.state {
            IvarState::Empty(_) => None,
            IvarState::Full(value) => Some(value.clone()),
        }
    }

    /// Returns the value of a filled cell. Reading an empty cell is a programming error.
    pub fn value(&self) -> T {
        match self.peek() {
            Some(value) => value,
            None => panic!("ivar is not filled"),
        }
    }

    /// Returns the read side of this cell.
    pub fn read(&self) -> Deferred<T> {
        Deferred::of_ivar(self.clone())
    }

    /// Registers a callback to run, as its own job, once the cell is filled. Callers go through
    /// [Deferred::upon], which also handles the already-filled case.
    pub(crate) fn subscribe(&mut self, monitor: SharedMonitor, callback: Box<dyn FnOnce(T)>) {
        match &mut self.state {
            IvarState::Full(_) => panic!("cannot subscribe to a filled ivar"),
            IvarState::Empty(subscribers) => subscribers.push(Subscriber { monitor, callback }),
        }
    }

    /// The number of registered subscribers. Zero once the cell is filled.
    #[cfg(test)]
    pub(crate) fn num_subscribers(&self) -> usize {
        match &self.state {
            IvarState::Empty(subscribers) => subscribers.len(),
            IvarState::Full(_) => 0,
        }
    }

    /// Two handles are the same cell when they share the underlying state.
    pub fn same_cell(a: &Self, b: &Self) -> bool {
        SharedObject::ptr_eq(&a.0, &b.0)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: Clone + 'static> Default for SharedIvar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deref for SharedIvar<T> {
    type Target = Ivar<T>;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<T: Clone> DerefMut for SharedIvar<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl<T: Clone + ToSexp + 'static> ToSexp for SharedIvar<T> {
    fn to_sexp(&self) -> Sexp {
        match self.peek() {
            None => Sexp::list(vec![Sexp::atom("ivar"), Sexp::atom("Empty")]),
            Some(value) => Sexp::list(vec![
                Sexp::atom("ivar"),
                Sexp::list(vec![Sexp::atom("Full"), value.to_sexp()]),
            ]),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedIvar;
    use ::anyhow::Result;

    /// Tests that a fresh cell is empty and a filled cell holds its value.
    #[test]
    fn fill_determines_the_cell() -> Result<()> {
        let mut iv: SharedIvar<u64> = SharedIvar::new();
        crate::ensure_eq!(iv.is_empty(), true);
        crate::ensure_eq!(iv.peek(), None);

        iv.fill(42);
        crate::ensure_eq!(iv.is_empty(), false);
        crate::ensure_eq!(iv.peek(), Some(42));
        crate::ensure_eq!(iv.value(), 42);
        Ok(())
    }

    /// Tests that a second fill is rejected.
    #[test]
    #[should_panic(expected = "ivar is already filled")]
    fn double_fill_panics() {
        let mut iv: SharedIvar<u64> = SharedIvar::new();
        iv.fill(1);
        iv.fill(2);
    }

    /// Tests that fill_if_empty is a no-op on a full cell.
    #[test]
    fn fill_if_empty_is_idempotent() -> Result<()> {
        let mut iv: SharedIvar<&str> = SharedIvar::new();
        crate::ensure_eq!(iv.fill_if_empty("first"), true);
        crate::ensure_eq!(iv.fill_if_empty("second"), false);
        crate::ensure_eq!(iv.peek(), Some("first"));
        Ok(())
    }

    /// Tests that once determined with a value, every subsequent peek yields that value.
    #[test]
    fn peek_is_stable_after_fill() -> Result<()> {
        let mut iv: SharedIvar<String> = SharedIvar::new();
        iv.fill("done".to_string());
        for _ in 0..4 {
            crate::ensure_eq!(iv.peek(), Some("done".to_string()));
        }
        Ok(())
    }

    /// Tests cell identity across handles.
    #[test]
    fn same_cell_follows_the_handle() -> Result<()> {
        let iv: SharedIvar<u64> = SharedIvar::new();
        let alias: SharedIvar<u64> = iv.clone();
        let other: SharedIvar<u64> = SharedIvar::new();
        crate::ensure_eq!(SharedIvar::same_cell(&iv, &alias), true);
        crate::ensure_eq!(SharedIvar::same_cell(&iv, &other), false);
        Ok(())
    }
}
