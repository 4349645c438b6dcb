//! `nanobot-process` — the command queue: named lanes with per-lane FIFO
//! ordering and bounded concurrency.
//!
//! Within one lane, tasks start in insertion order and at most
//! `max_concurrent` (default 1) run at a time. Across lanes there is no
//! ordering. The enqueuer gets a handle that resolves with the task's result;
//! clearing a lane cancels pending handles.

pub mod lanes;
pub mod queue;

pub use lanes::CommandLane;
pub use queue::{CommandQueue, LaneSnapshot, QueueError};
