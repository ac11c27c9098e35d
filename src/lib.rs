//!A worker thread pool with a bounded task queue and two sizing modes.
//!
//!## How does it work?
//!
//!Submitters hand a callable to the pool, which wraps it in an envelope
//!together with the sending half of a one-shot result channel and pushes the
//!envelope onto a bounded FIFO queue. The submitter gets back a task handle
//!(the receiving half of that channel) on which it can block until the worker
//!that dequeued the envelope has executed the callable and sent the produced
//!value through.
//!
//!The queue is a mutex-and-condvar rendezvous: submitters wait on `not_full`
//!(bounded by a one second deadline, after which the task is rejected) and
//!workers wait on `not_empty`. All notifications are broadcast so that no
//!wakeup is lost to the multi-consumer topology.
//!
//!The pool runs in one of two modes. In `Fixed` mode the worker count chosen
//!at start is the worker count for the pool's lifetime. In `Elastic` mode the
//!pool grows by one worker whenever a submission finds the queue backlog
//!larger than the number of idle workers, up to a configured maximum, and
//!workers that have sat idle for longer than the idle timeout retire
//!themselves back down to the initial count.
//!
//!Dropping the pool shuts it down: the queue is closed, still-queued tasks
//!have their handles signalled as cancelled rather than left dangling, and
//!the destructor returns once every worker has deregistered itself.

pub mod any_value;
pub mod handle;
pub mod queue;
pub mod task;
pub mod threadpool;
pub mod worker;
