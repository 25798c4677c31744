// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! A deferred-callback scheduler shared by every agent.
//!
//! Scheduled entries live in a deadline-ordered pending map.  A single waiter
//! thread sleeps until the earliest deadline, then moves every due entry, in
//! deadline order, onto a FIFO of ready callbacks.  A runner thread drains
//! that FIFO without holding the service lock, so a callback is free to
//! schedule or cancel other timers.  At most one runner exists at a time; it
//! exits when the FIFO is empty and a new one is spawned the next time
//! something comes due.
//!
//! Once an entry has been moved to the ready FIFO it can no longer be
//! cancelled: `cancel()` returns false and the callback runs anyway.  Callers
//! that care about this race must tolerate a stale callback.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use slog::debug;
use slog::error;
use slog::trace;

use crate::errors::LldpdError;
use crate::types::LldpdResult;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle for a scheduled callback.  Ids are never reused within a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    // Keyed by (deadline, id) so that entries sharing a deadline fire in the
    // order they were scheduled.
    pending: BTreeMap<(Instant, u64), TimerCallback>,
    deadlines: HashMap<u64, Instant>,
    ready: VecDeque<(TimerId, TimerCallback)>,
    runner_active: bool,
    shutdown: bool,
}

struct TimerInner {
    log: slog::Logger,
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub struct TimerService {
    inner: Arc<TimerInner>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(log: &slog::Logger) -> LldpdResult<Self> {
        let inner = Arc::new(TimerInner {
            log: log.new(slog::o!("unit" => "timer")),
            state: Mutex::new(TimerState {
                next_id: 1,
                ..Default::default()
            }),
            cv: Condvar::new(),
        });

        let waiter_inner = inner.clone();
        let waiter = std::thread::Builder::new()
            .name("timer-waiter".to_string())
            .spawn(move || waiter_loop(waiter_inner))
            .map_err(|e| {
                LldpdError::Timer(format!("failed to start waiter: {e:?}"))
            })?;

        Ok(TimerService {
            inner,
            waiter: Mutex::new(Some(waiter)),
        })
    }

    /// Arrange for `callback` to run once, no sooner than `delay` from now.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> LldpdResult<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let when = Instant::now() + delay;
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return Err(LldpdError::Timer("timer service is shut down".into()));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert((when, id), Box::new(callback));
        state.deadlines.insert(id, when);

        // Only a new earliest deadline changes how long the waiter sleeps
        if state.pending.keys().next() == Some(&(when, id)) {
            self.inner.cv.notify_one();
        }
        trace!(self.inner.log, "scheduled timer-{id} in {delay:?}");
        Ok(TimerId(id))
    }

    /// Remove a timer before it fires.  Returns true if the entry was still
    /// pending.  Returns false if it has already fired, is about to fire, or
    /// was never scheduled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(when) = state.deadlines.remove(&id.0) else {
            return false;
        };
        let removed = state.pending.remove(&(when, id.0));
        if state.pending.keys().next().map_or(true, |first| first.0 > when) {
            self.inner.cv.notify_one();
        }
        drop(state);
        trace!(self.inner.log, "cancelled {id}");
        removed.is_some()
    }

    /// Number of timers that have not yet come due
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Stop the waiter thread.  Pending callbacks are dropped without being
    /// run, which releases anything they captured.  Callbacks already on the
    /// ready FIFO still run.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.deadlines.clear();
            std::mem::take(&mut state.pending)
        };
        self.inner.cv.notify_all();
        drop(dropped);

        if let Some(waiter) = self.waiter.lock().unwrap().take() {
            if waiter.join().is_err() {
                error!(self.inner.log, "timer waiter panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_callback(log: &slog::Logger, id: TimerId, callback: TimerCallback) {
    trace!(log, "running {id}");
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(log, "{id} callback panicked");
    }
}

fn runner_loop(inner: Arc<TimerInner>) {
    loop {
        let (id, callback) = {
            let mut state = inner.state.lock().unwrap();
            match state.ready.pop_front() {
                Some(next) => next,
                None => {
                    state.runner_active = false;
                    return;
                }
            }
        };
        run_callback(&inner.log, id, callback);
    }
}

fn waiter_loop(inner: Arc<TimerInner>) {
    debug!(inner.log, "timer waiter started");
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        match state.pending.keys().next().map(|(when, _)| *when) {
            None => {
                state = inner.cv.wait(state).unwrap();
                continue;
            }
            Some(when) if when > now => {
                state = inner.cv.wait_timeout(state, when - now).unwrap().0;
                continue;
            }
            Some(_) => {}
        }

        while let Some(entry) = state.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), callback) = entry.remove_entry();
            state.deadlines.remove(&id);
            state.ready.push_back((TimerId(id), callback));
        }

        if state.runner_active {
            continue;
        }
        state.runner_active = true;
        let runner_inner = inner.clone();
        let spawned = std::thread::Builder::new()
            .name("timer-runner".to_string())
            .spawn(move || runner_loop(runner_inner));
        if let Err(e) = spawned {
            // Fall back to running the callbacks on this thread, still
            // without the lock held.
            error!(inner.log, "failed to spawn timer runner: {e:?}");
            let ready = std::mem::take(&mut state.ready);
            state.runner_active = false;
            drop(state);
            for (id, callback) in ready {
                run_callback(&inner.log, id, callback);
            }
            state = inner.state.lock().unwrap();
        }
    }
    debug!(inner.log, "timer waiter exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    const PATIENCE: Duration = Duration::from_secs(5);

    #[test]
    fn test_fires_no_sooner_than_delay() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timers
            .schedule(Duration::from_millis(100), move || {
                tx.send(Instant::now()).unwrap()
            })
            .unwrap();
        let fired = rx.recv_timeout(PATIENCE).unwrap();
        assert!(fired - start >= Duration::from_millis(100));
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_deadline_order_with_ties_in_schedule_order() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let (tx, rx) = mpsc::channel();
        let delays = [(60, "c"), (30, "a"), (60, "d"), (30, "b")];

        // Hold the lock so that every entry is scheduled before the waiter
        // can look at any of them.
        let guard = timers.inner.state.lock().unwrap();
        let base = Instant::now();
        drop(guard);
        for (ms, tag) in delays {
            let tx = tx.clone();
            let delay = (base + Duration::from_millis(ms))
                .saturating_duration_since(Instant::now());
            timers.schedule(delay, move || tx.send(tag).unwrap()).unwrap();
        }
        let order: Vec<&str> =
            (0..4).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cancel_before_firing() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = timers
            .schedule(Duration::from_millis(200), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_firing() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = timers
            .schedule(Duration::ZERO, move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(PATIENCE).unwrap();
        assert!(!timers.cancel(id));
    }

    // Schedule-then-cancel either wins (zero callbacks) or loses (exactly
    // one).  Nothing ever runs twice.
    #[test]
    fn test_cancel_race() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let runs: Arc<Vec<AtomicUsize>> =
            Arc::new((0..500).map(|_| AtomicUsize::new(0)).collect());
        let mut lost = Vec::new();
        for i in 0..500 {
            let r = runs.clone();
            let id = timers
                .schedule(Duration::ZERO, move || {
                    r[i].fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            if !timers.cancel(id) {
                lost.push(i);
            }
        }

        let deadline = Instant::now() + PATIENCE;
        while lost.iter().any(|i| runs[*i].load(Ordering::SeqCst) == 0)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        for (i, count) in runs.iter().enumerate() {
            let expected = if lost.contains(&i) { 1 } else { 0 };
            assert_eq!(count.load(Ordering::SeqCst), expected, "timer {i}");
        }
    }

    #[test]
    fn test_callback_may_reschedule() {
        let timers = Arc::new(TimerService::new(&test_logger()).unwrap());
        let (tx, rx) = mpsc::channel();
        let t = Arc::downgrade(&timers);
        timers
            .schedule(Duration::from_millis(10), move || {
                let timers = t.upgrade().unwrap();
                let id = timers
                    .schedule(Duration::from_millis(10), move || {
                        tx.send("second").unwrap()
                    })
                    .unwrap();
                // and cancel something that no longer exists
                assert!(!timers.cancel(TimerId(id.0 + 1000)));
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), "second");
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timers = TimerService::new(&test_logger()).unwrap();
        let token = Arc::new(());
        let held = token.clone();
        timers
            .schedule(Duration::from_secs(60), move || drop(held))
            .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);
        timers.shutdown();
        assert_eq!(Arc::strong_count(&token), 1);
        assert!(matches!(
            timers.schedule(Duration::ZERO, || {}),
            Err(LldpdError::Timer(_))
        ));
    }
}
