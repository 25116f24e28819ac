// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deferred combinators over containers.
//!
//! Each combinator takes a [How] that selects between starting all element callbacks at once and starting each one
//! only after the previous element's deferred has determined. Output order equals input order in both modes.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deferred::Deferred,
    ivar::SharedIvar,
};
use ::std::vec::IntoIter;

//======================================================================================================================
// Structures
//======================================================================================================================

/// How a container combinator schedules its element callbacks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum How {
    /// The callback for element `n + 1` starts only once element `n`'s deferred has determined.
    #[default]
    Sequential,
    /// All callbacks start immediately; results are gathered in input order.
    Parallel,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Maps `f` over `items`, collecting the results in input order.
pub fn map<T, U, F>(items: Vec<T>, how: How, mut f: F) -> Deferred<Vec<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnMut(T) -> Deferred<U> + 'static,
{
    match how {
        How::Parallel => {
            let mut started: Vec<Deferred<U>> = Vec::with_capacity(items.len());
            for item in items {
                started.push(f(item));
            }
            Deferred::all(started)
        },
        How::Sequential => {
            let result: SharedIvar<Vec<U>> = SharedIvar::new();
            let gathered: Vec<U> = Vec::with_capacity(items.len());
            map_step(items.into_iter(), f, gathered, result.clone());
            result.read()
        },
    }
}

/// Runs `f` on every item for its effects.
pub fn iter<T, F>(items: Vec<T>, how: How, f: F) -> Deferred<()>
where
    T: Clone + 'static,
    F: FnMut(T) -> Deferred<()> + 'static,
{
    map(items, how, f).map(|_| ())
}

/// Keeps the items for which `f` yields true, in input order.
pub fn filter<T, F>(items: Vec<T>, how: How, mut f: F) -> Deferred<Vec<T>>
where
    T: Clone + 'static,
    F: FnMut(T) -> Deferred<bool> + 'static,
{
    let tagged: Deferred<Vec<(T, bool)>> = map(items, how, move |item: T| {
        let kept: T = item.clone();
        f(item).map(move |keep| (kept, keep))
    });
    tagged.map(|pairs| pairs.into_iter().filter(|(_, keep)| *keep).map(|(item, _)| item).collect())
}

/// Maps `f` over the items, keeping the Some results in input order.
pub fn filter_map<T, U, F>(items: Vec<T>, how: How, f: F) -> Deferred<Vec<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnMut(T) -> Deferred<Option<U>> + 'static,
{
    map(items, how, f).map(|options| options.into_iter().flatten().collect())
}

/// Threads an accumulator through the items, one at a time. A fold is inherently sequential, so it takes no [How].
pub fn fold<T, A, F>(items: Vec<T>, init: A, f: F) -> Deferred<A>
where
    T: Clone + 'static,
    A: Clone + 'static,
    F: FnMut(A, T) -> Deferred<A> + 'static,
{
    let result: SharedIvar<A> = SharedIvar::new();
    fold_step(items.into_iter(), f, init, result.clone());
    result.read()
}

/// One step of a sequential map: waits for the current element's deferred before starting the next.
fn map_step<T, U, F>(mut items: IntoIter<T>, mut f: F, mut gathered: Vec<U>, result: SharedIvar<Vec<U>>)
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnMut(T) -> Deferred<U> + 'static,
{
    match items.next() {
        None => {
            let mut result: SharedIvar<Vec<U>> = result;
            result.fill(gathered);
        },
        Some(item) => {
            f(item).upon(move |value| {
                gathered.push(value);
                map_step(items, f, gathered, result);
            });
        },
    }
}

/// One step of a fold.
fn fold_step<T, A, F>(mut items: IntoIter<T>, mut f: F, acc: A, result: SharedIvar<A>)
where
    T: Clone + 'static,
    A: Clone + 'static,
    F: FnMut(A, T) -> Deferred<A> + 'static,
{
    match items.next() {
        None => {
            let mut result: SharedIvar<A> = result;
            result.fill(acc);
        },
        Some(item) => {
            f(acc, item).upon(move |acc| fold_step(items, f, acc, result));
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
