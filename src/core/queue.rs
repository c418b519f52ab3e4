//! Strict FIFO execution of async units of work
//!
//! Every submitted unit is spawned onto the tokio runtime but first waits for
//! the unit submitted before it, so units run one at a time in submission
//! order no matter how many callers submit concurrently. The most recently
//! submitted unit is the *tail*; when a unit finishes and is still the tail,
//! the queue is idle and the idle hook fires. If a newer unit was submitted
//! in the meantime, that unit's completion gets the check instead.
//!
//! [`SequentialQueue::cancel`] aborts every queued and running unit and starts
//! a fresh generation. Aborted units never fire the idle hook.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

type IdleHook = Arc<dyn Fn() + Send + Sync>;

struct QueueState {
    /// Completion signal of the most recently submitted unit
    tail: Option<oneshot::Receiver<()>>,
    tail_id: Option<u64>,
    next_id: u64,
    generation: u64,
    tasks: JoinSet<()>,
}

pub struct SequentialQueue {
    state: Arc<Mutex<QueueState>>,
    on_idle: IdleHook,
}

impl SequentialQueue {
    /// Creates a queue calling `on_idle` each time it drains naturally
    pub fn new(on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                tail: None,
                tail_id: None,
                next_id: 0,
                generation: 0,
                tasks: JoinSet::new(),
            })),
            on_idle: Arc::new(on_idle),
        }
    }

    /// Queues `unit` behind everything submitted so far.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        while state.tasks.try_join_next().is_some() {}

        let id = state.next_id;
        state.next_id += 1;
        let previous = state.tail.take();
        let (done_tx, done_rx) = oneshot::channel();
        state.tail = Some(done_rx);
        state.tail_id = Some(id);

        let guard = TailGuard {
            state: Arc::clone(&self.state),
            on_idle: Arc::clone(&self.on_idle),
            id,
            generation: state.generation,
            _done: done_tx,
        };

        state.tasks.spawn(async move {
            let _guard = guard;
            if let Some(previous) = previous {
                // An error only means the previous unit was dropped; either way it is over
                let _ = previous.await;
            }
            unit.await;
        });
    }

    /// Aborts all queued and running units and starts over with an empty queue
    pub fn cancel(&self) {
        let aborted = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.tail = None;
            state.tail_id = None;
            std::mem::take(&mut state.tasks)
        };
        // Dropping the set aborts its tasks; their guards take the lock again
        drop(aborted);
    }

    /// Whether no unit is queued or running
    pub fn is_idle(&self) -> bool {
        lock(&self.state).tail_id.is_none()
    }
}

impl Drop for SequentialQueue {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Lives as long as one unit's task. Dropping it signals the next unit and,
/// if the unit was the tail of the current generation, marks the queue idle.
struct TailGuard {
    state: Arc<Mutex<QueueState>>,
    on_idle: IdleHook,
    id: u64,
    generation: u64,
    _done: oneshot::Sender<()>,
}

impl Drop for TailGuard {
    fn drop(&mut self) {
        let drained = {
            let mut state = lock(&self.state);
            if state.generation == self.generation && state.tail_id == Some(self.id) {
                state.tail = None;
                state.tail_id = None;
                true
            } else {
                false
            }
        };
        if drained {
            (self.on_idle)();
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
