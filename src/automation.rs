use crate::errors::ScheduleError;
use crate::schema::{Job, Metadata};
use crate::storage;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The smallest effective scheduling delay.
///
/// Jobs become eligible no earlier than one second after scheduling, so a
/// dispatch cycle can never race the creation of caller-owned records the
/// job refers to.
pub const MIN_SCHEDULE_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a single handler invocation.
///
/// Handlers report expected failures by returning `success = false` with a
/// message instead of panicking; the engine converts a panic into the same
/// shape with the panic text as the message.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Whether the run succeeded.
    pub success: bool,
    /// Failure detail, recorded as the job's `fail_reason`.
    pub message: Option<String>,
    /// Handler-specific output, consumed by handler code only.
    pub data: Option<Metadata>,
}

impl RunResult {
    /// A successful run.
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
            data: None,
        }
    }

    /// A successful run carrying handler-specific output.
    pub fn success_with(data: Metadata) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    /// A failed run with a failure message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Trait for defining automation handlers that can be scheduled and
/// executed by the engine.
pub trait Automation: Send + Sync + 'static {
    /// Unique type key of this handler.
    ///
    /// This MUST be unique for the whole application; registering two
    /// handlers under the same key is a startup configuration error.
    const KEY: &'static str;

    /// Metadata key under which [`Self::schedule_for_record`] stores the
    /// id of the handler's owned domain record.
    const RECORD_KEY: &'static str = "record_id";

    /// The application data provided to this handler at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the job. This method should define its logic.
    ///
    /// Expected failures are reported through the returned [`RunResult`];
    /// the retry policy configured at registration decides what happens
    /// next.
    fn on_execute(job: Job, ctx: Self::Context) -> impl Future<Output = RunResult> + Send;

    /// Schedule a job of this type for background execution.
    ///
    /// The job becomes eligible at `now + delay`, with `delay` clamped to
    /// [`MIN_SCHEDULE_DELAY`].
    #[instrument(name = "automation.schedule", skip(pool, metadata), fields(type_key = Self::KEY))]
    fn schedule(
        pool: &PgPool,
        delay: Duration,
        metadata: Metadata,
    ) -> BoxFuture<'_, Result<Job, ScheduleError>> {
        let delay = chrono::Duration::from_std(delay.max(MIN_SCHEDULE_DELAY))
            .unwrap_or(chrono::Duration::MAX);
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

        async move {
            let job = storage::create_job(pool, Self::KEY, run_at, Value::Object(metadata)).await?;
            Ok(job)
        }
        .boxed()
    }

    /// Schedule a job that operates on a caller-owned domain record.
    ///
    /// The record's id is stored in the job metadata under
    /// [`Self::RECORD_KEY`]; the caller creates the record itself before
    /// scheduling.
    fn schedule_for_record(
        pool: &PgPool,
        delay: Duration,
        record_id: i64,
        mut metadata: Metadata,
    ) -> BoxFuture<'_, Result<Job, ScheduleError>> {
        metadata.insert(Self::RECORD_KEY.to_owned(), record_id.into());
        Self::schedule(pool, delay, metadata)
    }
}
