use crate::automation::RunResult;
use crate::registry::{RegisteredHandler, RetryPolicy};
use crate::schema::{Job, JobStatus};
use crate::storage;
use crate::util::{panic_message, with_sentry_transaction};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The state transition to persist after one execution attempt.
pub(crate) struct Disposition {
    pub(crate) status: JobStatus,
    /// New `run_at` when a retry is scheduled; `None` leaves it untouched.
    pub(crate) retry_at: Option<DateTime<Utc>>,
    pub(crate) fail_reason: Option<String>,
}

/// Computes the next state from a run outcome.
///
/// `attempts` is the execution counter after this attempt is counted.
pub(crate) fn dispose(
    retry: Option<&RetryPolicy>,
    attempts: i32,
    result: &RunResult,
    now: DateTime<Utc>,
) -> Disposition {
    if result.success {
        return Disposition {
            status: JobStatus::Completed,
            retry_at: None,
            fail_reason: None,
        };
    }

    let fail_reason = result.message.clone();
    match retry {
        Some(policy) if attempts <= i32::from(policy.times_to_retry) => Disposition {
            status: JobStatus::RetryPending,
            retry_at: Some(
                now.checked_add_signed(policy.delay())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            fail_reason,
        },
        _ => Disposition {
            status: JobStatus::Failed,
            retry_at: None,
            fail_reason,
        },
    }
}

/// Runs one dispatch of a persisted job: transitions it to running,
/// invokes the handler with panic containment, persists the resulting
/// state, and spawns the next occurrence for recurring workers.
///
/// Exactly one call is made per dispatch; a panic inside the handler is
/// absorbed here and treated as an ordinary failure.
pub(crate) async fn execute<Context: Clone + Send + Sync + 'static>(
    pool: &PgPool,
    handler: &RegisteredHandler<Context>,
    context: Context,
    job: Job,
) -> anyhow::Result<()> {
    let job = storage::mark_running(pool, job.id).await?;

    let run_fn = Arc::clone(&handler.run_fn);
    let dispatched = job.clone();
    let outcome = with_sentry_transaction(&job.type_key, || {
        AssertUnwindSafe(run_fn(dispatched, context))
            .catch_unwind()
            .map(|outcome| outcome.map_err(|panic| panic_message(&*panic)))
    })
    .bind_hub(Hub::current())
    .await;

    let result = outcome.unwrap_or_else(|panic_text| {
        error!(job.id, job.type_key = %job.type_key, "handler panicked: {panic_text}");
        RunResult::failure(format!("Error: {panic_text}"))
    });

    if !result.success {
        warn!(
            job.id,
            job.type_key = %job.type_key,
            reason = result.message.as_deref().unwrap_or("unknown"),
            "job run failed"
        );
    }

    let attempts = job.times_executed + 1;
    let disposition = dispose(handler.retry.as_ref(), attempts, &result, Utc::now());
    let job = storage::finish_job(pool, job.id, &disposition).await?;

    if let Some(recurrence) = handler.recurrence.filter(|r| !r.silent) {
        if job.status.is_terminal() {
            let successor =
                storage::spawn_successor(pool, &job, recurrence.next_occurrence(Utc::now()))
                    .await?;
            debug!(successor.id, job.type_key = %job.type_key, "next occurrence scheduled");
        }
    }

    Ok(())
}
