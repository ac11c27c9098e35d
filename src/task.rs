//! Units of work and the envelopes that carry them through the queue.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Sender;

use crate::any_value::AnyValue;
use crate::handle::{TaskError, TaskHandle, TaskOutcome};

/// Contract for user-defined task objects producing a dynamically typed
/// result. Submitting a `Task` is equivalent to submitting the closure
/// `|| task.run()`.
pub trait Task: Send {
    fn run(&mut self) -> AnyValue;
}

impl<F> Task for F
where
    F: FnMut() -> AnyValue + Send,
{
    fn run(&mut self) -> AnyValue {
        self()
    }
}

/// A queued unit of work: the user callable bundled with the sending half of
/// its result slot.
///
/// An envelope is consumed exactly once, by [`Envelope::execute`] on the
/// worker that dequeues it, or by [`Envelope::cancel`] when the pool shuts
/// down with the envelope still queued. Either way the slot is signalled.
pub struct Envelope {
    payload: Box<dyn Runnable>,
}

impl Envelope {
    /// Pairs a callable with a fresh result slot, returning the envelope to
    /// queue and the handle to give back to the submitter.
    pub(crate) fn new<F, T>(task: F) -> (Self, TaskHandle<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (slot, handle) = TaskHandle::slot();
        let envelope = Envelope {
            payload: Box::new(Sealed {
                task,
                slot: Some(slot),
            }),
        };

        (envelope, handle)
    }

    /// An envelope with no result slot: the callable still runs, its value
    /// is discarded.
    pub(crate) fn detached<F>(task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Envelope {
            payload: Box::new(Sealed::<_, ()> { task, slot: None }),
        }
    }

    /// Runs the callable and signals the slot with the produced value, or
    /// with the captured panic if the callable unwound.
    pub fn execute(self) {
        self.payload.execute();
    }

    /// Signals the slot as cancelled without running the callable.
    pub fn cancel(self) {
        self.payload.abort(TaskError::Cancelled);
    }

    /// Signals the slot as rejected without running the callable.
    pub fn reject(self) {
        self.payload.abort(TaskError::Rejected);
    }
}

trait Runnable: Send {
    fn execute(self: Box<Self>);
    fn abort(self: Box<Self>, error: TaskError);
}

struct Sealed<F, T> {
    task: F,
    slot: Option<Sender<TaskOutcome<T>>>,
}

impl<F, T> Runnable for Sealed<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    fn execute(self: Box<Self>) {
        let Sealed { task, slot } = *self;

        let outcome = catch_unwind(AssertUnwindSafe(task))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));

        if let Some(slot) = slot {
            // The handle may already have been dropped by an uninterested
            // submitter; a failed send is not an error.
            let _ = slot.send(outcome);
        }
    }

    fn abort(self: Box<Self>, error: TaskError) {
        if let Some(slot) = self.slot {
            let _ = slot.send(Err(error));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
