use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::lanes::CommandLane;

/// A task waiting longer than this before starting logs a slow-lane warning.
const SLOW_WAIT_MS: u128 = 2000;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The entry was cleared from its lane before running, or its runner died.
    #[error("queued task was cancelled")]
    Cancelled,
}

/// Observable lane state, used for the busy-notice decision.
#[derive(Debug, Clone, Copy)]
pub struct LaneSnapshot {
    pub active: usize,
    pub queued: usize,
}

struct QueueEntry {
    run: BoxFuture<'static, ()>,
    enqueued_at: Instant,
}

struct LaneState {
    queue: VecDeque<QueueEntry>,
    active: usize,
    max_concurrent: usize,
}

impl LaneState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent: 1,
        }
    }
}

/// In-process queue serializing task execution per lane.
///
/// Cheaply cloneable; all clones share the same lane table. Owned by the
/// agent composition root and passed by reference; no globals.
#[derive(Clone)]
pub struct CommandQueue {
    lanes: Arc<Mutex<HashMap<CommandLane, LaneState>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Raise (or lower) a lane's concurrency. Minimum 1.
    pub fn set_lane_concurrency(&self, lane: CommandLane, max_concurrent: usize) {
        {
            let mut lanes = self.lanes.lock().expect("lane table poisoned");
            lanes.entry(lane).or_insert_with(LaneState::new).max_concurrent =
                max_concurrent.max(1);
        }
        self.drain(lane);
    }

    /// Current `{active, queued}` counts for a lane.
    pub fn snapshot(&self, lane: CommandLane) -> LaneSnapshot {
        let lanes = self.lanes.lock().expect("lane table poisoned");
        match lanes.get(&lane) {
            Some(state) => LaneSnapshot {
                active: state.active,
                queued: state.queue.len(),
            },
            None => LaneSnapshot { active: 0, queued: 0 },
        }
    }

    /// Enqueue `task` on `lane` and wait for its result.
    pub async fn enqueue<T, F>(&self, lane: CommandLane, task: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<T>();
        let run: BoxFuture<'static, ()> = Box::pin(async move {
            let result = task.await;
            // Receiver may have been dropped by a cancelled caller.
            let _ = tx.send(result);
        });

        {
            let mut lanes = self.lanes.lock().expect("lane table poisoned");
            let state = lanes.entry(lane).or_insert_with(LaneState::new);
            state.queue.push_back(QueueEntry {
                run,
                enqueued_at: Instant::now(),
            });
            debug!(
                lane = %lane,
                queued = state.queue.len(),
                active = state.active,
                "task enqueued"
            );
        }
        self.drain(lane);

        rx.await.map_err(|_| QueueError::Cancelled)
    }

    /// Drop all pending entries in a lane (active tasks finish normally).
    /// Pending enqueuers observe `QueueError::Cancelled`. Returns the count.
    pub fn clear_lane(&self, lane: CommandLane) -> usize {
        let mut lanes = self.lanes.lock().expect("lane table poisoned");
        match lanes.get_mut(&lane) {
            Some(state) => {
                let removed = state.queue.len();
                state.queue.clear();
                removed
            }
            None => 0,
        }
    }

    /// Start queued entries while the lane has spare concurrency.
    fn drain(&self, lane: CommandLane) {
        loop {
            let entry = {
                let mut lanes = self.lanes.lock().expect("lane table poisoned");
                let state = lanes.entry(lane).or_insert_with(LaneState::new);
                if state.active >= state.max_concurrent || state.queue.is_empty() {
                    return;
                }
                state.active += 1;
                state.queue.pop_front().expect("queue non-empty")
            };

            let waited = entry.enqueued_at.elapsed().as_millis();
            if waited > SLOW_WAIT_MS {
                warn!(lane = %lane, waited_ms = waited, "slow lane: task waited before start");
            }

            let queue = self.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                entry.run.await;
                debug!(
                    lane = %lane,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "task done"
                );
                {
                    let mut lanes = queue.lanes.lock().expect("lane table poisoned");
                    if let Some(state) = lanes.get_mut(&lane) {
                        state.active = state.active.saturating_sub(1);
                    }
                }
                queue.drain(lane);
            });
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
