//! Job executor
//!
//! A recurring acquisition loop finds due, unlocked jobs, claims them with a
//! compare-and-swap lock, and hands them to a bounded worker pool. Each job
//! runs its handler in a fresh unit of work; on failure the transaction is
//! rolled back in full and a separate bookkeeping transaction decrements the
//! retry budget, records the exception, and dead-letters at zero.

use crate::command::{CommandContext, CommandRunner};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::job::RepeatSpec;
use crate::store::JobQuery;
use crate::types::JobId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct JobExecutorConfig {
    /// Identity written into `lock_owner` on acquisition.
    pub lock_owner: String,
    pub lock_duration: chrono::Duration,
    /// Sleep after a pass that found work queued behind the batch.
    pub poll_interval: Duration,
    /// Longer sleep once the queue has drained.
    pub idle_poll_interval: Duration,
    /// Sleep after an acquisition error.
    pub error_backoff: Duration,
    pub batch_size: usize,
    /// Bounded worker pool size; acquisition never outruns free workers.
    pub worker_count: usize,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("procflow-{}", Uuid::now_v7().simple()),
            lock_duration: chrono::Duration::minutes(5),
            poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            batch_size: 8,
            worker_count: 4,
        }
    }
}

/// Background acquisition loop plus worker dispatch. Woken early whenever a
/// commit schedules an immediately-due job.
pub struct JobExecutor {
    runner: CommandRunner,
    config: JobExecutorConfig,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobExecutor {
    pub(crate) fn new(runner: CommandRunner, config: JobExecutorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.worker_count));
        Self {
            runner,
            config,
            workers,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Spawn the acquisition loop. Idempotent while running.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("executor handle poisoned");
        if handle.is_some() {
            return;
        }
        let _ = self.shutdown.send(false);
        let runner = self.runner.clone();
        let config = self.config.clone();
        let workers = self.workers.clone();
        let shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(run_loop(runner, config, workers, shutdown)));
    }

    /// Stop the loop and wait for it to exit. In-flight workers finish their
    /// current job.
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .expect("executor handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            self.runner.wake.notify_one();
            let _ = handle.await;
        }
    }

    /// Shorten the current wait: a new immediately-due job exists.
    pub fn wake(&self) {
        self.runner.wake.notify_one();
    }
}

async fn run_loop(
    runner: CommandRunner,
    config: JobExecutorConfig,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(owner = %config.lock_owner, "job executor started");
    let mut idle_streak: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match acquire_and_dispatch(&runner, &config, &workers).await {
            Ok(acquired) if acquired > 0 => {
                // Work was claimed; immediately look for more.
                idle_streak = 0;
                continue;
            }
            Ok(_) => {
                idle_streak = idle_streak.saturating_add(1);
                let wait = if idle_streak > 1 {
                    config.idle_poll_interval
                } else {
                    config.poll_interval
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = runner.wake.notified() => {
                        idle_streak = 0;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "job acquisition pass failed");
                tokio::time::sleep(config.error_backoff).await;
            }
        }
    }
    info!("job executor stopped");
}

/// One acquisition pass: query due unlocked jobs oldest-due first, claim each
/// with the conditional lock update, and spawn workers for the winners.
/// Losing the compare-and-swap is an expected race, not an error.
async fn acquire_and_dispatch(
    runner: &CommandRunner,
    config: &JobExecutorConfig,
    workers: &Arc<Semaphore>,
) -> Result<usize, EngineError> {
    let now = runner.clock.now();
    let query = JobQuery::new()
        .executable()
        .order_by_due_date_asc()
        .limit(config.batch_size);
    let candidates = runner.store.find_jobs(&query, now).await?;

    let mut acquired = 0;
    for candidate in candidates {
        let Ok(permit) = workers.clone().try_acquire_owned() else {
            // Pool is full; stop claiming so locks are not held idle.
            break;
        };
        let until = now + config.lock_duration;
        if !runner
            .store
            .try_lock_job(candidate.id, &config.lock_owner, until, now)
            .await?
        {
            debug!(job = %candidate.id, "lost lock race, skipping");
            continue;
        }
        acquired += 1;
        let job_id = candidate.id;
        let owner = config.lock_owner.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = execute_locked_job(&runner, job_id, &owner).await {
                warn!(job = %job_id, error = %err, "job execution failed");
            }
        });
    }
    Ok(acquired)
}

/// Execute one locked job in a fresh transaction. On success the handler's
/// side effects commit together with the job's deletion (or its reschedule,
/// for cycling timers). On failure everything is rolled back and the retry
/// bookkeeping runs in its own transaction, so it survives even though the
/// job's work did not.
pub(crate) async fn execute_locked_job(
    runner: &CommandRunner,
    job_id: JobId,
    owner: &str,
) -> Result<(), EngineError> {
    let owner = owner.to_string();
    let outcome = runner
        .run("execute-job", |ctx| {
            let owner = owner.clone();
            Box::pin(async move {
                let Some(job) = ctx.try_job(&job_id).await? else {
                    return Ok(());
                };
                if job.lock_owner.as_deref() != Some(owner.as_str()) {
                    debug!(job = %job_id, "lock no longer held, skipping");
                    return Ok(());
                }
                let handler = ctx
                    .services()
                    .handler(&job.handler_type)
                    .map_err(|err| EngineError::Handler(err.into()))?;
                handler
                    .execute(ctx, &job)
                    .await
                    .map_err(EngineError::Handler)?;
                finish_job(ctx, job_id).await
            })
        })
        .await;

    match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            record_failure(runner, job_id, &err).await?;
            Err(err)
        }
    }
}

/// Success path: cycling jobs reschedule, everything else is destroyed.
async fn finish_job(ctx: &mut CommandContext, job_id: JobId) -> Result<(), EngineError> {
    // The handler may already have cancelled the job (e.g. the execution
    // left the activity that owned it).
    let Some(mut job) = ctx.try_job(&job_id).await? else {
        return Ok(());
    };
    match job.repeat.clone() {
        Some(repeat) if repeat.remaining.is_none_or(|left| left > 0) => {
            let now = ctx.now();
            job.due_date = Some(now + chrono::Duration::milliseconds(repeat.interval_ms));
            job.repeat = Some(RepeatSpec {
                interval_ms: repeat.interval_ms,
                remaining: repeat.remaining.map(|left| left - 1),
            });
            job.clear_lock();
            ctx.update_job(job);
        }
        _ => {
            ctx.delete_job(&job_id).await?;
        }
    }
    Ok(())
}

/// Failure bookkeeping in its own transaction: decrement retries, clear the
/// lock, stamp the exception, apply the fixed backoff, dead-letter at zero.
async fn record_failure(
    runner: &CommandRunner,
    job_id: JobId,
    err: &EngineError,
) -> Result<(), EngineError> {
    let message = err.to_string();
    let stacktrace = format!("{err:?}");
    runner
        .run("record-job-failure", |ctx| {
            let message = message.clone();
            let stacktrace = stacktrace.clone();
            Box::pin(async move {
                let Some(mut job) = ctx.try_job(&job_id).await? else {
                    return Ok(());
                };
                job.retries = job.retries.saturating_sub(1);
                job.clear_lock();
                job.exception_message = Some(message.clone());
                job.exception_stacktrace = Some(stacktrace);
                let now = ctx.now();
                job.due_date = Some(now + ctx.services().retry_backoff);
                let exhausted = job.retries == 0;
                if exhausted {
                    job.dead_lettered = true;
                }
                ctx.fire(EngineEvent::JobFailed {
                    job_id,
                    retries_remaining: job.retries,
                    message,
                });
                if exhausted {
                    warn!(job = %job_id, "retries exhausted, moving job to dead-letter queue");
                    ctx.fire(EngineEvent::JobRetriesExhausted { job_id });
                }
                ctx.update_job(job);
                Ok(())
            })
        })
        .await
}
