use crate::automation::{Automation, RunResult};
use crate::schema::Job;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default wait between a failed attempt and its retry.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of additional attempts after the first failure.
pub const DEFAULT_TIMES_TO_RETRY: u16 = 3;

/// Default duration between occurrences of a recurring worker.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(crate) type RunFn<Context> =
    dyn Fn(Job, Context) -> BoxFuture<'static, RunResult> + Send + Sync;

/// Fixed-interval retry policy applied after a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Seconds to wait before a retry.
    pub interval: Duration,
    /// Maximum number of additional attempts after the first failure
    /// before the job is marked permanently failed.
    pub times_to_retry: u16,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            times_to_retry: DEFAULT_TIMES_TO_RETRY,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn delay(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::MAX)
    }
}

/// Override for a recurring worker's cadence, given the current time.
pub type NextRunFn = fn(DateTime<Utc>) -> DateTime<Utc>;

/// Recurring-worker capability attached to a handler at registration.
///
/// A handler carrying a `Recurrence` schedules its own next occurrence
/// after every terminal run. Silent recurrences run purely on an
/// in-process timer and never touch durable storage.
#[derive(Debug, Clone, Copy)]
pub struct Recurrence {
    /// Duration between occurrences.
    pub every: Duration,
    /// When true, the worker runs on an in-memory timer only.
    pub silent: bool,
    /// Optional custom cadence; defaults to `now + every`.
    pub next_run: Option<NextRunFn>,
}

impl Default for Recurrence {
    fn default() -> Self {
        Self {
            every: DEFAULT_REPEAT_INTERVAL,
            silent: false,
            next_run: None,
        }
    }
}

impl Recurrence {
    /// The next occurrence time relative to `now`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.next_run {
            Some(next_run) => next_run(now),
            None => now
                .checked_add_signed(
                    chrono::Duration::from_std(self.every).unwrap_or(chrono::Duration::MAX),
                )
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Per-handler configuration passed to the engine at registration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) recurrence: Option<Recurrence>,
}

impl HandlerOptions {
    /// Options with the default retry policy and no recurrence.
    pub fn new() -> Self {
        Self {
            retry: Some(RetryPolicy::default()),
            recurrence: None,
        }
    }

    /// Set the fixed retry interval and the number of additional attempts
    /// after the first failure.
    pub fn retry(mut self, interval: Duration, times_to_retry: u16) -> Self {
        self.retry = Some(RetryPolicy {
            interval,
            times_to_retry,
        });
        self
    }

    /// Disable retries; the first failure is terminal.
    pub fn no_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    /// Make the handler a recurring worker with the given interval
    /// between occurrences.
    pub fn recurring(mut self, every: Duration) -> Self {
        let recurrence = self.recurrence.get_or_insert_with(Recurrence::default);
        recurrence.every = every;
        self
    }

    /// Make the handler a silent recurring worker: driven by an in-process
    /// timer, never recorded in durable storage, failures logged only.
    pub fn silent(mut self, every: Duration) -> Self {
        self.recurrence = Some(Recurrence {
            every,
            silent: true,
            next_run: self.recurrence.and_then(|r| r.next_run),
        });
        self
    }

    /// Override the recurring cadence with a custom function.
    pub fn next_run_with(mut self, next_run: NextRunFn) -> Self {
        let recurrence = self.recurrence.get_or_insert_with(Recurrence::default);
        recurrence.next_run = Some(next_run);
        self
    }
}

/// A handler entry held by the registry: its configuration plus the boxed
/// run function the engine dispatches through.
pub(crate) struct RegisteredHandler<Context> {
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) recurrence: Option<Recurrence>,
    pub(crate) run_fn: Arc<RunFn<Context>>,
}

impl<Context> Clone for RegisteredHandler<Context> {
    fn clone(&self) -> Self {
        Self {
            retry: self.retry,
            recurrence: self.recurrence,
            run_fn: Arc::clone(&self.run_fn),
        }
    }
}

/// Init-time registration table mapping a type key to its handler.
pub(crate) struct HandlerRegistry<Context> {
    handlers: HashMap<&'static str, RegisteredHandler<Context>>,
}

impl<Context> Default for HandlerRegistry<Context> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> HandlerRegistry<Context> {
    /// Register a handler under its type key.
    ///
    /// Panics if the key is already taken: two handlers answering to the
    /// same key is a startup configuration error.
    pub(crate) fn register<A: Automation<Context = Context>>(&mut self, options: HandlerOptions) {
        let run_fn: Arc<RunFn<Context>> =
            Arc::new(|job, ctx| A::on_execute(job, ctx).boxed());

        let previous = self.handlers.insert(
            A::KEY,
            RegisteredHandler {
                retry: options.retry,
                recurrence: options.recurrence,
                run_fn,
            },
        );
        assert!(
            previous.is_none(),
            "duplicate automation key: {}",
            A::KEY
        );
    }

    pub(crate) fn get(&self, type_key: &str) -> Option<&RegisteredHandler<Context>> {
        self.handlers.get(type_key)
    }

    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (&'static str, &RegisteredHandler<Context>)> {
        self.handlers.iter().map(|(key, handler)| (*key, handler))
    }

    pub(crate) fn keys(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
