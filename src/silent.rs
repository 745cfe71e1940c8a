use crate::registry::{Recurrence, RunFn};
use crate::schema::Job;
use crate::util::panic_message;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{error, trace, warn};

/// In-memory next-run times for silent workers, keyed by type key.
///
/// This map is the only schedule a silent worker has; nothing about these
/// runs ever reaches durable storage.
pub(crate) type SilentSchedules = Mutex<HashMap<&'static str, DateTime<Utc>>>;

/// A silent worker as seen by the per-cycle pass.
pub(crate) struct SilentWorker<Context> {
    pub(crate) key: &'static str,
    pub(crate) recurrence: Recurrence,
    pub(crate) run_fn: Arc<RunFn<Context>>,
}

/// One pass over the silent workers, run concurrently with the persisted
/// dispatch loop of the same cycle.
///
/// A worker seen for the first time only gets its schedule seeded; a due
/// worker is executed and rescheduled; a worker that is not due yet is
/// left alone. Failures are logged and otherwise discarded — silent runs
/// are not retried.
pub(crate) async fn run_pass<Context: Clone + Send + 'static>(
    workers: Vec<SilentWorker<Context>>,
    schedules: Arc<SilentSchedules>,
    context: Context,
) {
    for worker in workers {
        let now = Utc::now();
        let next_run = {
            let schedules = schedules.lock().expect("silent schedule lock poisoned");
            schedules.get(worker.key).copied()
        };

        match next_run {
            Some(due) if due <= now => {
                run_silently(&worker, context.clone()).await;
            }
            Some(_) => continue,
            None => trace!(key = worker.key, "silent worker schedule seeded"),
        }

        let mut schedules = schedules.lock().expect("silent schedule lock poisoned");
        schedules.insert(worker.key, worker.recurrence.next_occurrence(Utc::now()));
    }
}

async fn run_silently<Context: Clone + Send + 'static>(
    worker: &SilentWorker<Context>,
    context: Context,
) {
    let job = Job::ephemeral(worker.key);
    let outcome = AssertUnwindSafe((worker.run_fn)(job, context))
        .catch_unwind()
        .await;

    match outcome {
        Ok(result) if result.success => trace!(key = worker.key, "silent worker run completed"),
        Ok(result) => warn!(
            key = worker.key,
            reason = result.message.as_deref().unwrap_or("unknown"),
            "silent worker run failed"
        ),
        Err(panic) => error!(
            key = worker.key,
            "silent worker panicked: {}",
            panic_message(&*panic)
        ),
    }
}
