#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod announcer;
mod automation;
mod engine;
mod errors;
mod executor;
mod registry;
/// Database schema definitions.
pub mod schema;
mod silent;
mod storage;
mod util;

/// Bounded fire-and-forget dispatch queue for handler side effects.
pub use self::announcer::Announcer;
/// The main trait for defining automation handlers, and their run outcome.
pub use self::automation::{Automation, MIN_SCHEDULE_DELAY, RunResult};
/// The scheduling engine that discovers and dispatches due jobs.
pub use self::engine::{Engine, EngineHandle};
/// Error type for job scheduling operations.
pub use self::errors::ScheduleError;
/// Per-handler configuration passed at registration time.
pub use self::registry::{HandlerOptions, NextRunFn, Recurrence, RetryPolicy};
/// Database setup for the job table.
pub use self::storage::setup_database;
