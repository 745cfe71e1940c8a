use crate::automation::Automation;
use crate::executor;
use crate::registry::{HandlerOptions, HandlerRegistry};
use crate::silent::{self, SilentSchedules, SilentWorker};
use crate::storage;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_BATCH_SIZE: i64 = 100;

/// Marker type for a configured engine
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured engine
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The scheduling engine: discovers due jobs, dispatches them to their
/// registered handlers, and drives silent workers alongside the persisted
/// polling loop.
pub struct Engine<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    pool: PgPool,
    context: Context,
    registry: HandlerRegistry<Context>,
    silent_schedules: Arc<SilentSchedules>,
    poll_interval: Duration,
    jitter: Duration,
    batch_size: i64,
    _state: PhantomData<State>,
}

impl<Context: Clone + Send + Sync + 'static, State> std::fmt::Debug for Engine<Context, State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("handlers", &self.registry.keys())
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Engine<Context> {
    /// Create a new engine with the given connection pool and context.
    pub fn new(pool: PgPool, context: Context) -> Self {
        Self {
            pool,
            context,
            registry: HandlerRegistry::default(),
            silent_schedules: Arc::new(SilentSchedules::default()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            batch_size: DEFAULT_BATCH_SIZE,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Engine<Context, State> {
    /// Register a handler together with its configuration.
    pub fn register<A: Automation<Context = Context>>(
        mut self,
        options: HandlerOptions,
    ) -> Engine<Context, Configured> {
        self.registry.register::<A>(options);

        Engine {
            pool: self.pool,
            context: self.context,
            registry: self.registry,
            silent_schedules: self.silent_schedules,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            batch_size: self.batch_size,
            _state: PhantomData,
        }
    }

    /// Set how often the polling loop wakes up for a new cycle.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each poll interval.
    ///
    /// Jitter spreads out database load when several processes poll on
    /// the same cadence. The applied jitter is a random value between 0
    /// and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the maximum number of due jobs dispatched per cycle.
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Engine<Context, Configured> {
    /// Bootstrap the recurring workers.
    ///
    /// Ensures exactly one pending instance of every non-silent recurring
    /// worker exists: a worker with a job already in a non-terminal state
    /// is left alone, so calling this repeatedly never duplicates a
    /// chain. Silent workers are skipped entirely.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let mut initialized = 0_usize;
        for (key, handler) in self.registry.iter() {
            let Some(recurrence) = handler.recurrence else {
                continue;
            };
            if recurrence.silent {
                continue;
            }
            if storage::has_active_job(&self.pool, key).await? {
                debug!(key, "recurring worker already scheduled");
                continue;
            }

            let run_at = recurrence.next_occurrence(Utc::now());
            let job = storage::create_job(&self.pool, key, run_at, Value::Object(Default::default()))
                .await?;
            info!(job.id, key, "recurring worker initialized");
            initialized += 1;
        }
        info!(count = initialized, "recurring workers initialized");
        Ok(())
    }

    /// Run one engine cycle.
    ///
    /// Launches the silent-worker pass concurrently, dispatches the due
    /// batch sequentially in ascending id order, and joins the silent
    /// pass before returning so one cycle's side effects complete before
    /// the next begins. A single malfunctioning job never aborts the
    /// batch.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        let silent_pass = tokio::spawn(silent::run_pass(
            self.silent_workers(),
            Arc::clone(&self.silent_schedules),
            self.context.clone(),
        ));

        let due = match storage::due_jobs(&self.pool, self.batch_size).await {
            Ok(due) => due,
            Err(error) => {
                join_silent_pass(silent_pass).await;
                return Err(error.into());
            }
        };
        trace!(count = due.len(), "due jobs loaded");

        for job in due {
            let Some(handler) = self.registry.get(&job.type_key) else {
                error!(job.id, job.type_key = %job.type_key, "no handler registered for type key");
                continue;
            };

            let span = info_span!("job", job.id = %job.id, job.type_key = %job.type_key);
            let dispatch = executor::execute(&self.pool, handler, self.context.clone(), job);
            if let Err(error) = dispatch.instrument(span).await {
                error!(%error, "job dispatch failed");
            }
        }

        join_silent_pass(silent_pass).await;
        Ok(())
    }

    /// Start the polling loop.
    ///
    /// Initializes the recurring workers, then runs one cycle per poll
    /// interval (plus jitter) until the returned handle is shut down.
    /// Cycles never overlap: the next sleep starts only after the
    /// previous cycle, including its silent pass, returns.
    pub async fn start(self) -> anyhow::Result<EngineHandle> {
        self.initialize().await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!("engine polling loop started");
            loop {
                let sleep_duration = self.sleep_duration_with_jitter();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = sleep(sleep_duration) => {
                        if let Err(error) = self.run_cycle().await {
                            error!(%error, "engine cycle failed");
                        }
                    }
                }
            }
            info!("engine polling loop stopped");
        });

        Ok(EngineHandle {
            shutdown: shutdown_tx,
            handle,
        })
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    fn silent_workers(&self) -> Vec<SilentWorker<Context>> {
        self.registry
            .iter()
            .filter_map(|(key, handler)| {
                let recurrence = handler.recurrence.filter(|r| r.silent)?;
                Some(SilentWorker {
                    key,
                    recurrence,
                    run_fn: Arc::clone(&handler.run_fn),
                })
            })
            .collect()
    }
}

async fn join_silent_pass(silent_pass: JoinHandle<()>) {
    if let Err(error) = silent_pass.await {
        warn!(%error, "silent worker pass panicked");
    }
}

/// Handle to a running engine polling loop.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop the polling loop and wait for it to finish.
    ///
    /// A cycle in flight runs to completion first; process drivers call
    /// this from their interrupt handling.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            warn!(%error, "engine task panicked");
        }
    }
}
