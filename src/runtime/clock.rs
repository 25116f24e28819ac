// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    self,
    deferred::Deferred,
    fail::Fail,
    ivar::SharedIvar,
    SharedRuntime,
};
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct ClockEntry {
    expiry: Instant,
    /// Insertion counter. Entries with equal expiries fire in insertion order.
    seq: u64,
    ivar: SharedIvar<()>,
}

/// Pending time-triggered fills, ordered by trigger time.
pub struct Clock {
    now: Instant,
    // Reversed entries turn the max-heap into a min-heap.
    heap: BinaryHeap<Reverse<ClockEntry>>,
    next_seq: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for the Clock
impl Clock {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            now,
            heap: BinaryHeap::<Reverse<ClockEntry>>::new(),
            next_seq: 0,
        }
    }

    /// The time the clock last advanced to.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Inserts an entry firing at `expiry` and returns the deferred it will fill.
    pub(crate) fn schedule_at(&mut self, expiry: Instant) -> Deferred<()> {
        let ivar: SharedIvar<()> = SharedIvar::new();
        let seq: u64 = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ClockEntry {
            expiry,
            seq,
            ivar: ivar.clone(),
        }));
        ivar.read()
    }

    /// Moves time forward, handing back the cells of every entry whose trigger time has been reached, in firing
    /// order. The caller fills them; popping first keeps the heap untouched while the fills run their subscribers.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<SharedIvar<()>> {
        let mut due: Vec<SharedIvar<()>> = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if now < entry.expiry {
                break;
            }
            due.push(self.heap.pop().expect("an entry was just peeked").0.ivar);
        }
        self.now = now;
        due
    }

    /// Moves time forward and fills every entry whose trigger time has been reached.
    #[cfg(test)]
    pub(crate) fn advance(&mut self, now: Instant) {
        for mut ivar in self.take_due(now) {
            ivar.fill(());
        }
    }

    /// The earliest pending trigger time.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.expiry)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.heap.is_empty()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns a unit deferred that becomes determined `span` from now.
pub fn after(span: Duration) -> Deferred<()> {
    at(Instant::now() + span)
}

/// Returns a unit deferred that becomes determined at `time`.
pub fn at(time: Instant) -> Deferred<()> {
    let mut rt: SharedRuntime = runtime::current();
    rt.clock.schedule_at(time)
}

/// Calls `f` every `span`, rescheduling after each call. The repetition stops when `f` panics: the panic is routed to
/// the monitor that was current when `every` was called, and no further repetition is scheduled.
pub fn every(span: Duration, mut f: impl FnMut() + 'static) {
    after(span).upon(move |_| {
        f();
        every(span, f);
    });
}

/// Races `d` against a timer: `Ok` with the value when `d` determines within `span`, an ETIMEDOUT failure otherwise.
/// The losing branch is left in place, like any other lost race.
pub fn with_timeout<T: Clone + 'static>(span: Duration, d: Deferred<T>) -> Deferred<Result<T, Fail>> {
    let result: SharedIvar<Result<T, Fail>> = SharedIvar::new();
    {
        let cell: SharedIvar<Result<T, Fail>> = result.clone();
        d.upon(move |value| {
            let mut cell: SharedIvar<Result<T, Fail>> = cell;
            let _ = cell.fill_if_empty(Ok(value));
        });
    }
    {
        let cell: SharedIvar<Result<T, Fail>> = result.clone();
        after(span).upon(move |_| {
            let mut cell: SharedIvar<Result<T, Fail>> = cell;
            let _ = cell.fill_if_empty(Err(Fail::new(libc::ETIMEDOUT, "operation timed out")));
        });
    }
    result.read()
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PartialEq for ClockEntry {
    fn eq(&self, other: &ClockEntry) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl Eq for ClockEntry {}

impl PartialOrd for ClockEntry {
    fn partial_cmp(&self, other: &ClockEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClockEntry {
    fn cmp(&self, other: &ClockEntry) -> core::cmp::Ordering {
        (self.expiry, self.seq).cmp(&(other.expiry, other.seq))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Clock;
    use crate::runtime::{
        self,
        clock,
        deferred::Deferred,
        fail::Fail,
        SharedObject,
        SharedRuntime,
    };
    use ::anyhow::Result;
    use ::std::time::{
        Duration,
        Instant,
    };

    /// Tests that entries fire in trigger-time order regardless of insertion order.
    #[test]
    fn entries_fire_in_expiry_order() -> Result<()> {
        let start: Instant = Instant::now();
        let mut clock: Clock = Clock::new(start);
        let late: Deferred<()> = clock.schedule_at(start + Duration::from_millis(10));
        let early: Deferred<()> = clock.schedule_at(start + Duration::from_millis(5));

        clock.advance(start + Duration::from_millis(6));
        crate::ensure_eq!(early.is_determined(), true);
        crate::ensure_eq!(late.is_determined(), false);

        clock.advance(start + Duration::from_millis(11));
        crate::ensure_eq!(late.is_determined(), true);
        Ok(())
    }

    /// Tests that entries with equal trigger times fire in insertion order.
    #[test]
    fn equal_expiries_fire_in_insertion_order() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let expiry: Instant = Instant::now();
        let observed: SharedObject<Vec<&str>> = SharedObject::new(Vec::new());

        let first: Deferred<()> = clock::at(expiry);
        let second: Deferred<()> = clock::at(expiry);
        {
            let mut observed: SharedObject<Vec<&str>> = observed.clone();
            first.upon(move |_| observed.push("first"));
        }
        {
            let mut observed: SharedObject<Vec<&str>> = observed.clone();
            second.upon(move |_| observed.push("second"));
        }
        rt.run_until(second)?;
        // The cells determine when the clock fires; their callbacks run as jobs in the next drain.
        rt.run_until(runtime::yield_now())?;
        crate::ensure_eq!(observed.as_ref(), &vec!["first", "second"]);
        Ok(())
    }

    /// Tests that a timer registered later but firing earlier determines first.
    #[test]
    fn shorter_span_fires_first() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let late: Deferred<()> = clock::after(Duration::from_millis(40));
        let early: Deferred<()> = clock::after(Duration::from_millis(5));
        rt.run_until(early.clone())?;
        crate::ensure_eq!(late.is_determined(), false);
        rt.run_until(late)?;
        Ok(())
    }

    /// Tests the timeout race in both directions.
    #[test]
    fn with_timeout_races_the_clock() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();

        let timed_out: Result<u64, Fail> =
            rt.run_until(clock::with_timeout(Duration::from_millis(5), Deferred::never()))?;
        match timed_out {
            Err(e) => crate::ensure_eq!(e.errno, libc::ETIMEDOUT),
            Ok(_) => anyhow::bail!("expected a timeout"),
        }

        let completed: Result<u64, Fail> =
            rt.run_until(clock::with_timeout(Duration::from_secs(10), Deferred::from_value(7)))?;
        crate::ensure_eq!(completed, Ok(7));
        Ok(())
    }

    /// Tests that every keeps rescheduling itself.
    #[test]
    fn every_repeats() -> Result<()> {
        let mut rt: SharedRuntime = runtime::current();
        let ticks: SharedObject<u64> = SharedObject::new(0);
        {
            let mut ticks: SharedObject<u64> = ticks.clone();
            clock::every(Duration::from_millis(2), move || *ticks += 1);
        }
        rt.run_until(clock::after(Duration::from_millis(20)))?;
        crate::ensure_eq!(*ticks.as_ref() >= 2, true);
        Ok(())
    }
}
