//! Job handlers and task delegates
//!
//! A job's `handler_type` selects the behavior the executor runs when the
//! job fires. The built-in handlers resume the interpreter: async
//! continuations re-enter their node, timer fires leave it, boundary timers
//! interrupt or fork. User code plugs in through [`TaskDelegate`] (service
//! tasks) and custom [`JobHandler`] registrations.

use crate::command::CommandContext;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::execution::Execution;
use crate::interpreter::{self, Op};
use crate::job::{Job, JobType};
use crate::job_manager::JobManager;
use crate::types::{ExecutionId, Value};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::debug;

pub const ASYNC_CONTINUATION: &str = "async-continuation";
pub const TIMER_FIRE: &str = "timer-fire";
pub const BOUNDARY_TIMER: &str = "boundary-timer";

// ─── Task delegates ───────────────────────────────────────────

/// Variable-scoped view of the execution a delegate runs against.
pub struct DelegateExecution<'a> {
    ctx: &'a mut CommandContext,
    execution_id: ExecutionId,
    process_instance_id: ExecutionId,
    node_id: String,
}

impl<'a> DelegateExecution<'a> {
    pub(crate) fn new(
        ctx: &'a mut CommandContext,
        execution_id: ExecutionId,
        process_instance_id: ExecutionId,
        node_id: &str,
    ) -> Self {
        Self {
            ctx,
            execution_id,
            process_instance_id,
            node_id: node_id.to_string(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn process_instance_id(&self) -> ExecutionId {
        self.process_instance_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn variable(&mut self, name: &str) -> Result<Option<Value>, EngineError> {
        self.ctx.get_variable(&self.execution_id, name).await
    }

    pub async fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        self.ctx.set_variable(&self.execution_id, name, value).await
    }
}

/// Behavior of a service task, registered by name at engine build time.
/// Failures feed error-boundary routing or the job retry policy.
#[async_trait]
pub trait TaskDelegate: Send + Sync {
    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()>;
}

// ─── Job handlers ─────────────────────────────────────────────

/// What the executor runs when a locked job fires. Handlers run inside a
/// fresh unit of work; throwing rolls the whole transaction back.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &mut CommandContext, job: &Job) -> anyhow::Result<()>;
}

fn config_str<'j>(job: &'j Job, field: &str) -> anyhow::Result<&'j str> {
    job.handler_config
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("job {} has no '{field}' in its handler config", job.id))
}

/// Resumes an execution parked on an async continuation by entering its node
/// with the async gate disarmed.
pub(crate) struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    async fn execute(&self, ctx: &mut CommandContext, job: &Job) -> anyhow::Result<()> {
        let execution_id = job
            .execution_id
            .ok_or_else(|| anyhow!("job {} references no execution", job.id))?;
        let Some(execution) = ctx.try_execution(&execution_id).await? else {
            debug!(job = %job.id, "continuation for deleted execution, dropping");
            return Ok(());
        };
        let definition = ctx
            .resolve_definition(&execution.process_definition_id)
            .await?;
        let node_id = config_str(job, "node")?.to_string();
        interpreter::run(
            ctx,
            &definition,
            VecDeque::from([Op::Enter {
                execution_id,
                node_id,
                skip_async: true,
            }]),
        )
        .await
        .context("async continuation")?;
        Ok(())
    }
}

/// Fires a timer-catch wait state: the execution leaves the timer node.
pub(crate) struct TimerFireHandler;

#[async_trait]
impl JobHandler for TimerFireHandler {
    async fn execute(&self, ctx: &mut CommandContext, job: &Job) -> anyhow::Result<()> {
        let execution_id = job
            .execution_id
            .ok_or_else(|| anyhow!("job {} references no execution", job.id))?;
        let node_id = config_str(job, "node")?.to_string();
        let Some(execution) = ctx.try_execution(&execution_id).await? else {
            debug!(job = %job.id, "timer for deleted execution, dropping");
            return Ok(());
        };
        if execution.current_node_id.as_deref() != Some(node_id.as_str()) {
            debug!(job = %job.id, "execution moved on, dropping timer");
            return Ok(());
        }
        let definition = ctx
            .resolve_definition(&execution.process_definition_id)
            .await?;
        ctx.fire(EngineEvent::TimerFired {
            job_id: job.id,
            execution_id,
            node_id,
        });
        interpreter::run(
            ctx,
            &definition,
            VecDeque::from([Op::Leave {
                execution_id,
                ignore_conditions: false,
            }]),
        )
        .await?;
        Ok(())
    }
}

/// Fires a boundary timer: interrupting fires move the execution to the
/// boundary target, non-interrupting fires spawn a concurrent child there.
pub(crate) struct BoundaryTimerHandler;

#[async_trait]
impl JobHandler for BoundaryTimerHandler {
    async fn execute(&self, ctx: &mut CommandContext, job: &Job) -> anyhow::Result<()> {
        let execution_id = job
            .execution_id
            .ok_or_else(|| anyhow!("job {} references no execution", job.id))?;
        let node_id = config_str(job, "node")?.to_string();
        let boundary_id = config_str(job, "boundary")?.to_string();

        let Some(execution) = ctx.try_execution(&execution_id).await? else {
            debug!(job = %job.id, "boundary timer for deleted execution, dropping");
            return Ok(());
        };
        if execution.current_node_id.as_deref() != Some(node_id.as_str()) {
            debug!(job = %job.id, "execution left the activity, dropping boundary timer");
            return Ok(());
        }
        let definition = ctx
            .resolve_definition(&execution.process_definition_id)
            .await?;
        let node = definition.node(&node_id)?;
        let Some(timer) = node.boundary_timers.iter().find(|t| t.id == boundary_id) else {
            debug!(job = %job.id, boundary_id, "boundary timer no longer declared, dropping");
            return Ok(());
        };

        ctx.fire(EngineEvent::TimerFired {
            job_id: job.id,
            execution_id,
            node_id: node_id.clone(),
        });

        if timer.interrupting {
            // The activity is aborted: its other boundary timers die with it.
            let outstanding_jobs = ctx.jobs_of_execution(execution_id).await?;
            for outstanding in outstanding_jobs {
                if outstanding.id != job.id
                    && outstanding.job_type == JobType::Boundary
                    && outstanding.handler_config.get("node").and_then(|v| v.as_str())
                        == Some(node_id.as_str())
                {
                    JobManager::cancel(ctx, outstanding.id).await?;
                }
            }
            interpreter::run(
                ctx,
                &definition,
                VecDeque::from([Op::Enter {
                    execution_id,
                    node_id: timer.target.clone(),
                    skip_async: false,
                }]),
            )
            .await?;
        } else {
            let mut parent = ctx.execution(&execution_id).await?;
            let child = Execution::new_child(&parent, ctx.now());
            let child_id = child.id;
            parent.child_ids.push(child_id);
            ctx.update_execution(parent);
            ctx.insert_execution(child);
            let target = timer.target.clone();
            interpreter::run(
                ctx,
                &definition,
                VecDeque::from([Op::Enter {
                    execution_id: child_id,
                    node_id: target,
                    skip_async: false,
                }]),
            )
            .await?;
        }
        Ok(())
    }
}
