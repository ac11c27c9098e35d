//! Handles through which submitters retrieve task results.

use std::sync::mpsc::{channel, Receiver, Sender};

use thiserror::Error;

/// Ways a task can fail to produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The queue stayed full past the submission deadline; the task never ran.
    #[error("task queue full, submission rejected")]
    Rejected,

    /// The pool shut down before a worker picked the task up.
    #[error("task cancelled at pool shutdown")]
    Cancelled,

    /// The task panicked while executing. The worker survives.
    #[error("task panicked: {0}")]
    Panicked(String),
}

pub type TaskOutcome<T> = Result<T, TaskError>;

/// The consumer side of a task's one-shot result slot.
///
/// Exactly one outcome is ever sent into the slot: the produced value, a
/// panic captured during execution, or a rejection/cancellation signal. The
/// slot for a rejected submission is signalled before the handle is returned,
/// so observing it never blocks.
pub struct TaskHandle<T> {
    slot: Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(slot: Receiver<TaskOutcome<T>>) -> Self {
        TaskHandle { slot }
    }

    /// Creates a fresh sender/handle pair over a one-shot slot.
    pub(crate) fn slot() -> (Sender<TaskOutcome<T>>, Self) {
        let (tx, rx) = channel();

        (tx, TaskHandle::new(rx))
    }

    /// Creates an already-rejected handle.
    pub(crate) fn rejected() -> Self {
        let (tx, handle) = TaskHandle::slot();
        let _ = tx.send(Err(TaskError::Rejected));

        handle
    }

    /// Blocks until the task's outcome arrives and returns it.
    pub fn join(self) -> TaskOutcome<T> {
        // A dropped sender without a sent outcome only happens if the pool
        // was torn down mid-signal; treat it as cancellation.
        self.slot.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Blocks until the task's outcome arrives, mapping every failure to the
    /// default value of the result type. For a rejected submission this
    /// returns immediately.
    pub fn get(self) -> T
    where
        T: Default,
    {
        self.join().unwrap_or_default()
    }
}
