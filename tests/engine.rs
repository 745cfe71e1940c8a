#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use automation::schema::{Job, Metadata};
use automation::{Automation, Engine, HandlerOptions, RunResult};
use chrono::{DateTime, Utc};
use claims::assert_none;
use insta::assert_compact_json_snapshot;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers_modules::testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        automation::setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// Pull a job's `run_at` forward so the next cycle picks it up.
    pub(super) async fn make_due(pool: &PgPool, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE automation_jobs SET run_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub(super) async fn make_all_due(pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query("UPDATE automation_jobs SET run_at = NOW()")
            .execute(pool)
            .await?;
        Ok(())
    }

    pub(super) async fn job_state(
        pool: &PgPool,
        id: i64,
    ) -> anyhow::Result<(String, i32, Option<String>)> {
        let row = sqlx::query(
            "SELECT status::TEXT AS status, times_executed, fail_reason FROM automation_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok((
            row.get("status"),
            row.get("times_executed"),
            row.get("fail_reason"),
        ))
    }

    pub(super) async fn run_at_of(pool: &PgPool, id: i64) -> anyhow::Result<DateTime<Utc>> {
        let row = sqlx::query("SELECT run_at FROM automation_jobs WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(row.get("run_at"))
    }
}

#[tokio::test]
async fn successful_job_is_completed() -> anyhow::Result<()> {
    struct GreetJob;

    impl Automation for GreetJob {
        const KEY: &'static str = "greet";
        type Context = Arc<AtomicU32>;

        async fn on_execute(_job: Job, ctx: Self::Context) -> RunResult {
            ctx.fetch_add(1, Ordering::SeqCst);
            RunResult::success()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;
    let runs = Arc::new(AtomicU32::new(0));

    let engine = Engine::new(pool.clone(), runs.clone()).register::<GreetJob>(HandlerOptions::new());

    let job = GreetJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;

    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "completed");
    assert_eq!(times_executed, 1);
    assert_none!(fail_reason);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let timestamps = sqlx::query(
        "SELECT started_at IS NOT NULL AS started, finished_at IS NOT NULL AS finished FROM automation_jobs WHERE id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await?;
    assert!(timestamps.get::<bool, _>("started"));
    assert!(timestamps.get::<bool, _>("finished"));

    Ok(())
}

#[tokio::test]
async fn expected_failure_schedules_a_retry_after_the_interval() -> anyhow::Result<()> {
    struct UnreachableSink;

    impl Automation for UnreachableSink {
        const KEY: &'static str = "unreachable-sink";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::failure("sink unreachable")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine = Engine::new(pool.clone(), ())
        .register::<UnreachableSink>(HandlerOptions::new().retry(Duration::from_secs(30), 3));

    let job = UnreachableSink::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
    test_utils::make_due(&pool, job.id).await?;

    let before = Utc::now();
    engine.run_cycle().await?;

    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "retry_pending");
    assert_eq!(times_executed, 1);
    assert_eq!(fail_reason.as_deref(), Some("sink unreachable"));

    let run_at = test_utils::run_at_of(&pool, job.id).await?;
    assert!(run_at >= before + chrono::Duration::seconds(30));

    Ok(())
}

#[tokio::test]
async fn failing_job_walks_the_retry_sequence_to_failed() -> anyhow::Result<()> {
    struct HopelessJob;

    impl Automation for HopelessJob {
        const KEY: &'static str = "hopeless";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::failure("still broken")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine = Engine::new(pool.clone(), ())
        .register::<HopelessJob>(HandlerOptions::new().retry(Duration::from_secs(30), 2));

    let job = HopelessJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;

    let mut sequence = Vec::new();
    for _ in 0..3 {
        test_utils::make_due(&pool, job.id).await?;
        engine.run_cycle().await?;
        let (status, times_executed, _) = test_utils::job_state(&pool, job.id).await?;
        sequence.push((status, times_executed));
    }

    assert_compact_json_snapshot!(sequence, @r#"[["retry_pending", 1], ["retry_pending", 2], ["failed", 3]]"#);

    // Terminal means terminal: another due cycle must not touch the job.
    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;
    let (status, times_executed, _) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "failed");
    assert_eq!(times_executed, 3);

    Ok(())
}

#[tokio::test]
async fn panicking_handler_counts_as_an_ordinary_failure() -> anyhow::Result<()> {
    struct PanickyJob;

    impl Automation for PanickyJob {
        const KEY: &'static str = "panicky";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            panic!("boom")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine = Engine::new(pool.clone(), ())
        .register::<PanickyJob>(HandlerOptions::new().retry(Duration::from_secs(30), 3));

    let job = PanickyJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;

    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "retry_pending");
    assert_eq!(times_executed, 1);
    assert_eq!(fail_reason.as_deref(), Some("Error: boom"));

    Ok(())
}

#[tokio::test]
async fn failure_without_retry_policy_is_immediately_terminal() -> anyhow::Result<()> {
    struct OneShotJob;

    impl Automation for OneShotJob {
        const KEY: &'static str = "one-shot";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::failure("no second chances")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine =
        Engine::new(pool.clone(), ()).register::<OneShotJob>(HandlerOptions::new().no_retry());

    let job = OneShotJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;

    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "failed");
    assert_eq!(times_executed, 1);
    assert_eq!(fail_reason.as_deref(), Some("no second chances"));

    Ok(())
}

#[tokio::test]
async fn success_clears_the_previous_fail_reason() -> anyhow::Result<()> {
    struct FlakyJob;

    impl Automation for FlakyJob {
        const KEY: &'static str = "flaky";
        type Context = Arc<AtomicU32>;

        async fn on_execute(_job: Job, ctx: Self::Context) -> RunResult {
            if ctx.fetch_add(1, Ordering::SeqCst) == 0 {
                RunResult::failure("first attempt wobbled")
            } else {
                RunResult::success()
            }
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;
    let attempts = Arc::new(AtomicU32::new(0));

    let engine = Engine::new(pool.clone(), attempts.clone())
        .register::<FlakyJob>(HandlerOptions::new().retry(Duration::from_secs(30), 3));

    let job = FlakyJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;

    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;
    let (status, _, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "retry_pending");
    assert_eq!(fail_reason.as_deref(), Some("first attempt wobbled"));

    test_utils::make_due(&pool, job.id).await?;
    engine.run_cycle().await?;
    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, job.id).await?;
    assert_eq!(status, "completed");
    assert_eq!(times_executed, 2);
    assert_none!(fail_reason);

    Ok(())
}

#[tokio::test]
async fn unknown_type_key_is_skipped_untouched() -> anyhow::Result<()> {
    struct RegisteredJob;

    impl Automation for RegisteredJob {
        const KEY: &'static str = "registered";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::success()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine =
        Engine::new(pool.clone(), ()).register::<RegisteredJob>(HandlerOptions::new());

    let orphan_id: i64 = sqlx::query_scalar(
        "INSERT INTO automation_jobs (type_key, run_at) VALUES ('never-registered', NOW()) RETURNING id",
    )
    .fetch_one(&pool)
    .await?;

    engine.run_cycle().await?;
    engine.run_cycle().await?;

    let (status, times_executed, fail_reason) = test_utils::job_state(&pool, orphan_id).await?;
    assert_eq!(status, "new");
    assert_eq!(times_executed, 0);
    assert_none!(fail_reason);

    Ok(())
}

#[tokio::test]
async fn batch_is_bounded_and_dispatched_in_id_order() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct SeenContext {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    struct RecordingJob;

    impl Automation for RecordingJob {
        const KEY: &'static str = "recording";
        type Context = SeenContext;

        async fn on_execute(job: Job, ctx: Self::Context) -> RunResult {
            ctx.seen.lock().unwrap().push(job.id);
            RunResult::success()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;
    let context = SeenContext {
        seen: Arc::new(Mutex::new(Vec::new())),
    };

    let engine =
        Engine::new(pool.clone(), context.clone()).register::<RecordingJob>(HandlerOptions::new());

    let mut ids = Vec::new();
    for _ in 0..150 {
        let job = RecordingJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
        ids.push(job.id);
    }
    test_utils::make_all_due(&pool).await?;

    engine.run_cycle().await?;

    {
        let seen = context.seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert_eq!(*seen, ids[..100]);
    }
    let still_pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM automation_jobs WHERE status = 'new'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(still_pending, 50);

    engine.run_cycle().await?;

    let seen = context.seen.lock().unwrap();
    assert_eq!(seen.len(), 150);
    assert_eq!(*seen, ids);

    Ok(())
}

#[tokio::test]
async fn short_delays_are_clamped_to_the_minimum() -> anyhow::Result<()> {
    struct EagerJob;

    impl Automation for EagerJob {
        const KEY: &'static str = "eager";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::success()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let before = Utc::now();
    let job = EagerJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;

    assert!(job.run_at >= before + chrono::Duration::seconds(1));

    // A job scheduled into the future is not picked up by a cycle.
    let future_job = EagerJob::schedule(&pool, Duration::from_secs(3600), Metadata::new()).await?;
    let engine = Engine::new(pool.clone(), ()).register::<EagerJob>(HandlerOptions::new());
    engine.run_cycle().await?;
    let (status, times_executed, _) = test_utils::job_state(&pool, future_job.id).await?;
    assert_eq!(status, "new");
    assert_eq!(times_executed, 0);

    Ok(())
}

#[tokio::test]
async fn polling_loop_dispatches_and_shuts_down_cleanly() -> anyhow::Result<()> {
    struct LoopedJob;

    impl Automation for LoopedJob {
        const KEY: &'static str = "looped";
        type Context = ();

        async fn on_execute(_job: Job, _ctx: Self::Context) -> RunResult {
            RunResult::success()
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let engine = Engine::new(pool.clone(), ())
        .register::<LoopedJob>(HandlerOptions::new())
        .poll_interval(Duration::from_millis(50))
        .jitter(Duration::ZERO);

    let job = LoopedJob::schedule(&pool, Duration::ZERO, Metadata::new()).await?;
    test_utils::make_due(&pool, job.id).await?;

    let handle = engine.start().await?;

    let mut status = String::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        (status, _, _) = test_utils::job_state(&pool, job.id).await?;
        if status == "completed" {
            break;
        }
    }
    assert_eq!(status, "completed");

    handle.shutdown().await;
    Ok(())
}
