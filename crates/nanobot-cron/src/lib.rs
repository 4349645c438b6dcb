//! `nanobot-cron` — persistent job scheduler.
//!
//! Jobs live in a single JSON document (`cron/jobs.json`) that is atomically
//! rewritten on every change. A 1-second ticker walks enabled jobs and fires
//! any whose `next_run_at_ms` has arrived, in `(next_run_at_ms, id)` order.
//!
//! # Schedule kinds
//!
//! | Kind    | Behaviour                                            |
//! |---------|------------------------------------------------------|
//! | `every` | repeat: `next = now + every_ms`                      |
//! | `cron`  | 5-field expression, next match in the configured tz  |
//! | `at`    | fire once; optionally delete the job after the run   |

pub mod error;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use error::{CronError, Result};
pub use service::{CronService, OnJob};
pub use store::CronStore;
pub use types::{CronJob, CronJobState, CronPayload, CronSchedule, PayloadKind};
