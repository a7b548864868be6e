//! Job manager
//!
//! The sole writer of job lifecycle transitions. All operations run inside
//! the caller's unit of work; nothing here touches the store directly.

use crate::command::CommandContext;
use crate::error::EngineError;
use crate::execution::Execution;
use crate::job::{Job, JobType};
use crate::types::JobId;
use chrono::{DateTime, Utc};

pub struct JobManager;

impl JobManager {
    /// Allocate a new, unpersisted job bound to an execution, with the
    /// engine-default retry budget and no lock.
    pub fn create(
        ctx: &CommandContext,
        execution: &Execution,
        job_type: JobType,
        handler_type: &str,
        handler_config: serde_json::Value,
    ) -> Job {
        Job::new(
            job_type,
            handler_type,
            handler_config,
            Some(execution.id),
            execution.process_instance_id,
            execution.process_definition_id.clone(),
            ctx.services().default_retries,
            ctx.now(),
        )
    }

    /// Persist into the executable queue: no due date, fires as soon as a
    /// worker picks it up.
    pub fn schedule_async_job(ctx: &mut CommandContext, mut job: Job) {
        job.due_date = None;
        ctx.insert_job(job);
    }

    /// Persist into the timer queue; not acquirable until `due_date <= now`.
    pub fn schedule_timer_job(ctx: &mut CommandContext, mut job: Job, due_date: DateTime<Utc>) {
        job.due_date = Some(due_date);
        ctx.insert_job(job);
    }

    /// Operator action: park the job in the dead-letter queue. It stops
    /// appearing in default job queries until explicitly restored.
    pub async fn move_job_to_dead_letter(
        ctx: &mut CommandContext,
        job_id: JobId,
    ) -> Result<Job, EngineError> {
        let mut job = ctx.job(&job_id).await?;
        job.dead_lettered = true;
        job.clear_lock();
        ctx.update_job(job.clone());
        Ok(job)
    }

    /// Inverse of dead-lettering: restore a positive retry budget and
    /// re-queue as immediately due.
    pub async fn move_dead_letter_job_to_executable(
        ctx: &mut CommandContext,
        job_id: JobId,
        retries: u32,
    ) -> Result<Job, EngineError> {
        if retries == 0 {
            return Err(EngineError::illegal_argument(
                "retries must be positive to restore a dead-letter job",
            ));
        }
        let mut job = ctx.job(&job_id).await?;
        if !job.dead_lettered {
            return Err(EngineError::illegal_state(format!(
                "job {job_id} is not in the dead-letter queue"
            )));
        }
        job.dead_lettered = false;
        job.retries = retries;
        job.due_date = None;
        ctx.update_job(job.clone());
        Ok(job)
    }

    /// Idempotent removal regardless of queue.
    pub async fn cancel(ctx: &mut CommandContext, job_id: JobId) -> Result<(), EngineError> {
        ctx.delete_job(&job_id).await
    }

    /// Administrative override; zero is accepted and removes the job from
    /// the executable predicate.
    pub async fn set_retries(
        ctx: &mut CommandContext,
        job_id: JobId,
        retries: u32,
    ) -> Result<Job, EngineError> {
        let mut job = ctx.job(&job_id).await?;
        job.retries = retries;
        ctx.update_job(job.clone());
        Ok(job)
    }
}
