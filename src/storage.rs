use crate::executor::Disposition;
use crate::schema::Job;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

const JOB_COLUMNS: &str = "id, type_key, status, run_at, started_at, finished_at, fail_reason, times_executed, metadata, created_at";

/// Set up the automation tables in the given database.
///
/// Runs the embedded migrations; safe to call on every startup.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Inserts a new job eligible for dispatch at `run_at`.
pub(crate) async fn create_job(
    pool: &PgPool,
    type_key: &str,
    run_at: DateTime<Utc>,
    metadata: Value,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "INSERT INTO automation_jobs (type_key, run_at, metadata) VALUES ($1, $2, $3) RETURNING {JOB_COLUMNS}"
    ))
    .bind(type_key)
    .bind(run_at)
    .bind(metadata)
    .fetch_one(pool)
    .await
}

/// Loads the due batch for one engine cycle: jobs that are `new` or
/// `retry_pending`, already past their `run_at`, oldest first.
pub(crate) async fn due_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM automation_jobs
        WHERE status IN ('new', 'retry_pending')
          AND run_at <= NOW()
        ORDER BY id ASC
        LIMIT $1
        "
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Whether a job of this type is still pending, running, or awaiting a
/// retry. Used to keep recurring workers down to one live chain.
pub(crate) async fn has_active_job(pool: &PgPool, type_key: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        r"
        SELECT EXISTS (
            SELECT 1 FROM automation_jobs
            WHERE type_key = $1
              AND status IN ('new', 'running', 'retry_pending')
        )
        ",
    )
    .bind(type_key)
    .fetch_one(pool)
    .await
}

/// Marks a job as running and stamps its start time, returning the fresh
/// record.
pub(crate) async fn mark_running(pool: &PgPool, job_id: i64) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "UPDATE automation_jobs SET status = 'running', started_at = NOW() WHERE id = $1 RETURNING {JOB_COLUMNS}"
    ))
    .bind(job_id)
    .fetch_one(pool)
    .await
}

/// Records the outcome of one execution attempt.
///
/// The attempt counter is incremented relative to the stored value, never
/// from an in-memory copy. `run_at` is only moved when the disposition
/// schedules a retry.
pub(crate) async fn finish_job(
    pool: &PgPool,
    job_id: i64,
    disposition: &Disposition,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE automation_jobs
        SET status = $2,
            run_at = COALESCE($3, run_at),
            fail_reason = $4,
            finished_at = NOW(),
            times_executed = times_executed + 1
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(job_id)
    .bind(disposition.status)
    .bind(disposition.retry_at)
    .bind(disposition.fail_reason.as_deref())
    .fetch_one(pool)
    .await
}

/// Creates the next occurrence of a recurring job, carrying the finished
/// occurrence's metadata forward.
pub(crate) async fn spawn_successor(
    pool: &PgPool,
    job: &Job,
    run_at: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    create_job(pool, &job.type_key, run_at, job.metadata.clone()).await
}
