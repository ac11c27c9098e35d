//! Workers executing tasks pulled from the shared queue.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::queue::Pop;
use crate::threadpool::{PoolError, PoolMode, Shared};

/// How often an elastic worker wakes from its timed wait to check whether it
/// has idled long enough to retire.
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Registry record for a live worker thread.
///
/// Ids are assigned by the owning pool from a pool-local monotonic counter
/// and are never reused within that pool's lifetime.
pub struct Worker {
    id: u64,
}

impl Worker {
    pub(crate) fn new(id: u64) -> Self {
        Worker { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Launches a detached worker thread over the pool's shared state.
///
/// The launched thread must not synchronously take any pool lock, since the
/// launcher may still be holding the registry lock. The loop's errors have
/// nowhere to surface on a detached thread, so they are logged here; the
/// worker still deregisters itself so shutdown never waits on a dead record.
pub(crate) fn launch(shared: Arc<Shared>, id: u64) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("tidepool-worker-{}", id))
        .spawn(move || {
            if let Err(e) = run(&shared, id) {
                log::error!("worker {} terminated abnormally: {}", id, e);
                if shared.deregister(id).is_err() {
                    log::error!("worker {} could not deregister itself", id);
                }
            }
        })
        .map(|_| ())
}

/// The worker loop: wait for a task, execute it, repeat.
///
/// In `Fixed` mode the wait is indefinite. In `Elastic` mode the wait is
/// sliced into [`IDLE_POLL_INTERVAL`] chunks; a worker that finds itself idle
/// past the pool's idle timeout retires, provided the pool is still above its
/// initial size. A closed queue ends the loop in either mode.
fn run(shared: &Shared, id: u64) -> Result<(), PoolError> {
    log::debug!("worker {} started", id);

    let mut last_active = Instant::now();

    loop {
        let popped = match shared.mode {
            PoolMode::Fixed => shared.queue.pop()?,
            PoolMode::Elastic => shared.queue.pop_timeout(IDLE_POLL_INTERVAL)?,
        };

        match popped {
            Pop::Item(envelope) => {
                // The queue mutex is not held here; user code never runs
                // under a pool lock.
                envelope.execute();
                last_active = Instant::now();
            }
            Pop::TimedOut => {
                if last_active.elapsed() >= shared.idle_timeout && shared.try_retire(id)? {
                    log::debug!("worker {} retired after {:?} idle", id, last_active.elapsed());
                    return Ok(());
                }
            }
            Pop::Closed => {
                shared.deregister(id)?;
                log::debug!("worker {} exiting", id);
                return Ok(());
            }
        }
    }
}
