//! Bounded FIFO rendezvous between submitters and workers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Reasons a queue operation did not go through.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue stayed full past the deadline.
    #[error("task queue full past the submission deadline")]
    Full,

    /// The queue was closed.
    #[error("task queue closed")]
    Closed,

    /// The queue mutex was poisoned by a panicking holder.
    #[error("unable to acquire lock on task queue")]
    LockError,
}

/// Outcome of a pop attempt.
#[derive(Debug)]
pub enum Pop<T> {
    /// A dequeued item.
    Item(T),

    /// The timed wait elapsed with the queue still empty.
    TimedOut,

    /// The queue was closed; the caller should terminate.
    Closed,
}

/// A bounded multi-producer/multi-consumer FIFO guarded by one mutex and the
/// `not_full`/`not_empty` condition pair.
///
/// Both conditions are notified with a broadcast: with several consumers
/// parked on the same condvar, waking only one risks losing the wakeup to a
/// consumer whose predicate re-check fails. Every wait re-tests its predicate
/// after waking.
///
/// The queue also tracks how many consumers are parked in a pop;
/// [`TaskQueue::backlog`] reads that count and the queue length from one
/// critical section, so a producer sees a pair that actually coexisted.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

struct State<T> {
    items: VecDeque<T>,
    waiting: usize,
    closed: bool,
}

impl<T> TaskQueue<T> {
    /// Creates a queue admitting at most `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        TaskQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                waiting: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, waiting on `not_full` for at most `timeout`. A push
    /// that does not go through hands the item back together with the
    /// reason, so the caller can dispose of its result slot.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), (T, QueueError)> {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Err((item, QueueError::LockError)),
        };

        let resolved = self.not_full.wait_timeout_while(state, timeout, |state| {
            !state.closed && state.items.len() >= self.capacity
        });

        let (mut state, _) = match resolved {
            Ok(resolved) => resolved,
            Err(_) => return Err((item, QueueError::LockError)),
        };

        if state.closed {
            return Err((item, QueueError::Closed));
        }
        if state.items.len() >= self.capacity {
            return Err((item, QueueError::Full));
        }

        state.items.push_back(item);
        self.not_empty.notify_all();

        Ok(())
    }

    /// Dequeues an item, waiting on `not_empty` indefinitely. Returns
    /// [`Pop::Closed`] once the queue is closed.
    pub fn pop(&self) -> Result<Pop<T>, QueueError> {
        let mut state = self.state.lock().or(Err(QueueError::LockError))?;
        state.waiting += 1;

        while state.items.is_empty() && !state.closed {
            state = self.not_empty.wait(state).or(Err(QueueError::LockError))?;
        }

        Ok(self.take(state))
    }

    /// Dequeues an item, waiting on `not_empty` for at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Pop<T>, QueueError> {
        let mut state = self.state.lock().or(Err(QueueError::LockError))?;
        state.waiting += 1;

        let (mut state, wait) = self
            .not_empty
            .wait_timeout_while(state, timeout, |state| {
                state.items.is_empty() && !state.closed
            })
            .or(Err(QueueError::LockError))?;

        if wait.timed_out() && state.items.is_empty() && !state.closed {
            state.waiting -= 1;
            return Ok(Pop::TimedOut);
        }

        Ok(self.take(state))
    }

    /// Resolves a finished wait while still holding the queue mutex: the
    /// waiting count comes down before the item leaves, so producers never
    /// observe a consumer as both idle and holding work.
    fn take(&self, mut state: MutexGuard<'_, State<T>>) -> Pop<T> {
        state.waiting -= 1;

        if state.closed {
            return Pop::Closed;
        }

        let item = state
            .items
            .pop_front()
            .expect("queue is non-empty when a wait resolves");

        if !state.items.is_empty() {
            self.not_empty.notify_all();
        }
        self.not_full.notify_all();

        Pop::Item(item)
    }

    /// Closes the queue, wakes every parked thread, and returns the items
    /// that were still enqueued so the caller can dispose of them.
    pub fn close(&self) -> Result<Vec<T>, QueueError> {
        let mut state = self.state.lock().or(Err(QueueError::LockError))?;
        state.closed = true;

        let abandoned = state.items.drain(..).collect();

        self.not_empty.notify_all();
        self.not_full.notify_all();

        Ok(abandoned)
    }

    /// Read-only observers recover the guard from a poisoned mutex rather
    /// than fail: the counters stay meaningful even if a holder panicked.
    fn observe(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue length and parked-consumer count, read from one critical
    /// section.
    pub fn backlog(&self) -> (usize, usize) {
        let state = self.observe();
        (state.items.len(), state.waiting)
    }

    pub fn is_closed(&self) -> bool {
        self.observe().closed
    }

    /// Number of items currently enqueued.
    pub fn len(&self) -> usize {
        self.observe().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers currently parked in a pop.
    pub fn waiting(&self) -> usize {
        self.observe().waiting
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
