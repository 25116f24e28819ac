// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Read handles over write-once cells, and the combinators that compose them.
//!
//! A deferred never runs its callbacks synchronously: even when the value is already there, `upon` pushes the
//! callback through the ready-job queue. Every callback therefore runs in its own job frame, which keeps stack depth
//! bounded and keeps exception routing through the monitor tree uniform.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        self,
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
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The read side of a write-once cell.
#[derive(Clone)]
pub struct Deferred<T: Clone> {
    cell: SharedIvar<T>,
}

/// Adapter that lets a deferred be awaited from future-based code. Wakes go through the job queue, so this only makes
/// progress while the runtime is driving cycles.
pub struct DeferredFuture<T: Clone> {
    deferred: Deferred<T>,
    waker: SharedObject<Option<Waker>>,
    subscribed: bool,
}

/// Accumulator behind [Deferred::all]: values land in their input slot as they arrive.
struct Gather<T> {
    slots: Vec<Option<T>>,
    num_filled: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Deferreds
impl<T: Clone + 'static> Deferred<T> {
    /// A deferred that is already determined with `value`.
    pub fn from_value(value: T) -> Self {
        Self {
            cell: SharedIvar::full(value),
        }
    }

    /// A deferred that never becomes determined.
    pub fn never() -> Self {
        Self {
            cell: SharedIvar::new(),
        }
    }

    pub(crate) fn of_ivar(cell: SharedIvar<T>) -> Self {
        Self { cell }
    }

    pub fn is_determined(&self) -> bool {
        !self.cell.is_empty()
    }

    /// Returns a copy of the value, if determined.
    pub fn peek(&self) -> Option<T> {
        self.cell.peek()
    }

    /// Two deferreds are the same when they share the underlying cell.
    pub fn same_cell(a: &Self, b: &Self) -> bool {
        SharedIvar::same_cell(&a.cell, &b.cell)
    }

    /// Registers `f` to run on the value, as its own job under the current monitor. When the deferred is already
    /// determined the job is enqueued immediately; `f` is never called synchronously.
    pub fn upon(&self, f: impl FnOnce(T) + 'static) {
        let monitor: SharedMonitor = SharedMonitor::current();
        let mut cell: SharedIvar<T> = self.cell.clone();
        match cell.peek() {
            Some(value) => {
                let mut runtime: SharedRuntime = runtime::current();
                runtime
                    .scheduler
                    .enqueue(Job::new(monitor, Box::new(move || f(value))));
            },
            None => cell.subscribe(monitor, Box::new(f)),
        }
    }

    /// Monadic sequencing: once this deferred is determined, `f` produces the next deferred, whose value determines
    /// the result.
    pub fn bind<U: Clone + 'static>(&self, f: impl FnOnce(T) -> Deferred<U> + 'static) -> Deferred<U> {
        let result: SharedIvar<U> = SharedIvar::new();
        let cell: SharedIvar<U> = result.clone();
        self.upon(move |value| {
            f(value).upon(move |u| {
                let mut cell: SharedIvar<U> = cell;
                cell.fill(u);
            });
        });
        result.read()
    }

    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Deferred<U> {
        self.bind(move |value| Deferred::from_value(f(value)))
    }

    /// Determined once every input is, with the values in input order.
    pub fn all(ds: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        if ds.is_empty() {
            return Deferred::from_value(Vec::new());
        }
        let num_inputs: usize = ds.len();
        let result: SharedIvar<Vec<T>> = SharedIvar::new();
        let gathered: SharedObject<Gather<T>> = SharedObject::new(Gather {
            slots: vec![None; num_inputs],
            num_filled: 0,
        });
        for (i, d) in ds.into_iter().enumerate() {
            let gathered: SharedObject<Gather<T>> = gathered.clone();
            let cell: SharedIvar<Vec<T>> = result.clone();
            d.upon(move |value| {
                let mut gathered: SharedObject<Gather<T>> = gathered;
                gathered.slots[i] = Some(value);
                gathered.num_filled += 1;
                if gathered.num_filled == num_inputs {
                    let values: Vec<T> = gathered
                        .slots
                        .iter_mut()
                        .map(|slot| slot.take().expect("every input filled its slot"))
                        .collect();
                    let mut cell: SharedIvar<Vec<T>> = cell;
                    cell.fill(values);
                }
            });
        }
        result.read()
    }

    /// Determined with the value of the first input to become determined. The losing subscriptions are left in place:
    /// nothing cancels them, so an input backed by an unbounded operation keeps that operation alive. Callers that
    /// must release a loser's resource (an fd, say) close it themselves.
    pub fn any(ds: Vec<Deferred<T>>) -> Deferred<T> {
        let result: SharedIvar<T> = SharedIvar::new();
        for d in ds {
            let cell: SharedIvar<T> = result.clone();
            d.upon(move |value| {
                let mut cell: SharedIvar<T> = cell;
                let _ = cell.fill_if_empty(value);
            });
        }
        result.read()
    }

    /// Pairs this deferred with another; determined once both are.
    pub fn both<U: Clone + 'static>(&self, other: Deferred<U>) -> Deferred<(T, U)> {
        self.bind(move |v| other.map(move |u| (v, u)))
    }

    /// Returns an adapter implementing [Future] for this deferred.
    pub fn into_future(self) -> DeferredFuture<T> {
        DeferredFuture {
            deferred: self,
            waker: SharedObject::new(None),
            subscribed: false,
        }
    }
}

impl Deferred<()> {
    /// Determined once every input is.
    pub fn all_unit(ds: Vec<Deferred<()>>) -> Deferred<()> {
        Deferred::all(ds).map(|_| ())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: Clone + 'static> Future for DeferredFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if let Some(value) = self_.deferred.peek() {
            return Poll::Ready(value);
        }
        *self_.waker = Some(context.waker().clone());
        if !self_.subscribed {
            self_.subscribed = true;
            let waker: SharedObject<Option<Waker>> = self_.waker.clone();
            self_.deferred.upon(move |_| {
                let mut waker: SharedObject<Option<Waker>> = waker;
                if let Some(waker) = waker.take() {
                    waker.wake();
                }
            });
        }
        Poll::Pending
    }
}

impl<T: Clone + ToSexp + 'static> ToSexp for Deferred<T> {
    fn to_sexp(&self) -> Sexp {
        match self.peek() {
            None => Sexp::list(vec![Sexp::atom("deferred"), Sexp::atom("Empty")]),
            Some(value) => Sexp::list(vec![
                Sexp::atom("deferred"),
                Sexp::list(vec![Sexp::atom("Full"), value.to_sexp()]),
            ]),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
