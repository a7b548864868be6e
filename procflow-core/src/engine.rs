//! Process engine
//!
//! The public facade: deploys definitions, starts and drives process
//! instances, exposes the job management operations, and owns the job
//! executor. Every mutating entry point runs through the command runner —
//! one unit of work, committed or rolled back as a whole.

use crate::cache::DefinitionCache;
use crate::clock::{EngineClock, SystemClock};
use crate::command::{CommandContext, CommandRunner, EngineServices};
use crate::deployment::{self, DefinitionParser, DeploymentBuilder, JsonDefinitionParser};
use crate::error::EngineError;
use crate::events::{EngineEvent, EngineEventListener, EventDispatcher};
use crate::execution::Execution;
use crate::executor::{self, JobExecutor, JobExecutorConfig};
use crate::graph::ProcessDefinition;
use crate::handlers::{
    AsyncContinuationHandler, BoundaryTimerHandler, JobHandler, TaskDelegate, TimerFireHandler,
    ASYNC_CONTINUATION, BOUNDARY_TIMER, TIMER_FIRE,
};
use crate::interpreter;
use crate::job::Job;
use crate::job_manager::JobManager;
use crate::store::{Deployment, EngineStore, ExecutionQuery, JobQuery};
use crate::store_memory::MemoryStore;
use crate::types::{ExecutionId, JobId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

pub struct ProcessEngine {
    runner: CommandRunner,
    executor: JobExecutor,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.runner.store
    }

    pub fn clock(&self) -> &Arc<dyn EngineClock> {
        &self.runner.clock
    }

    pub fn job_executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn start_job_executor(&self) {
        self.executor.start();
    }

    pub async fn stop_job_executor(&self) {
        self.executor.stop().await;
    }

    // ── Deployment ──

    pub async fn deploy(&self, builder: DeploymentBuilder) -> Result<Deployment, EngineError> {
        self.runner
            .run("deploy", move |ctx| {
                let builder = builder.clone();
                Box::pin(async move { deployment::deploy(ctx, builder).await })
            })
            .await
    }

    /// Resolve a definition id through the cache.
    pub async fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.runner
            .services
            .resolve_definition(&self.runner.store, id)
            .await
    }

    /// Latest deployed version for a key.
    pub async fn latest_definition(
        &self,
        key: &str,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        if key.is_empty() {
            return Err(EngineError::illegal_argument("definition key is empty"));
        }
        let record = self
            .runner
            .store
            .latest_definition_by_key(key)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", key))?;
        self.definition(&record.id).await
    }

    // ── Process instances ──

    pub async fn start_process_instance_by_key(
        &self,
        key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        if key.is_empty() {
            return Err(EngineError::illegal_argument("definition key is empty"));
        }
        let key = key.to_string();
        self.runner
            .run("start-process-instance", move |ctx| {
                let key = key.clone();
                let variables = variables.clone();
                Box::pin(async move {
                    let record = ctx
                        .store()
                        .latest_definition_by_key(&key)
                        .await?
                        .ok_or_else(|| EngineError::not_found("process definition", &key))?;
                    let definition = ctx.resolve_definition(&record.id).await?;
                    interpreter::start_instance(ctx, &definition, variables).await
                })
            })
            .await
    }

    pub async fn start_process_instance_by_id(
        &self,
        definition_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        let definition_id = definition_id.to_string();
        self.runner
            .run("start-process-instance", move |ctx| {
                let definition_id = definition_id.clone();
                let variables = variables.clone();
                Box::pin(async move {
                    let definition = ctx.resolve_definition(&definition_id).await?;
                    interpreter::start_instance(ctx, &definition, variables).await
                })
            })
            .await
    }

    /// Complete a receive-task wait state.
    pub async fn signal(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        self.runner
            .run("signal-execution", move |ctx| {
                Box::pin(async move {
                    let execution = ctx.execution(&execution_id).await?;
                    let definition = ctx
                        .resolve_definition(&execution.process_definition_id)
                        .await?;
                    interpreter::signal(ctx, &definition, execution_id).await
                })
            })
            .await
    }

    /// Delete the whole execution tree and cancel every job referencing it,
    /// in one unit of work.
    pub async fn delete_process_instance(
        &self,
        process_instance_id: ExecutionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.runner
            .run("delete-process-instance", move |ctx| {
                let reason = reason.clone();
                Box::pin(async move {
                    let executions = ctx.executions_of_instance(process_instance_id).await?;
                    if executions.is_empty() {
                        return Err(EngineError::not_found(
                            "process instance",
                            process_instance_id,
                        ));
                    }
                    let jobs = ctx.jobs_of_instance(process_instance_id).await?;
                    for job in jobs {
                        JobManager::cancel(ctx, job.id).await?;
                    }
                    for execution in &executions {
                        ctx.delete_execution(&execution.id).await?;
                    }
                    ctx.fire(EngineEvent::ProcessCancelled {
                        process_instance_id,
                        reason,
                    });
                    Ok(())
                })
            })
            .await
    }

    pub async fn suspend_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<(), EngineError> {
        self.set_instance_suspended(process_instance_id, true).await
    }

    pub async fn activate_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<(), EngineError> {
        self.set_instance_suspended(process_instance_id, false)
            .await
    }

    async fn set_instance_suspended(
        &self,
        process_instance_id: ExecutionId,
        suspended: bool,
    ) -> Result<(), EngineError> {
        self.runner
            .run("set-instance-suspension", move |ctx| {
                Box::pin(async move {
                    let executions = ctx.executions_of_instance(process_instance_id).await?;
                    if executions.is_empty() {
                        return Err(EngineError::not_found(
                            "process instance",
                            process_instance_id,
                        ));
                    }
                    for mut execution in executions {
                        execution.suspended = suspended;
                        ctx.update_execution(execution);
                    }
                    let jobs = ctx.jobs_of_instance(process_instance_id).await?;
                    for mut job in jobs {
                        job.suspended = suspended;
                        ctx.update_job(job);
                    }
                    Ok(())
                })
            })
            .await
    }

    // ── Variables ──

    pub async fn set_variable(
        &self,
        execution_id: ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::illegal_argument("variable name is empty"));
        }
        let name = name.to_string();
        self.runner
            .run("set-variable", move |ctx| {
                let name = name.clone();
                let value = value.clone();
                Box::pin(
                    async move { ctx.set_variable(&execution_id, &name, value).await },
                )
            })
            .await
    }

    pub async fn get_variable(
        &self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        let mut ctx = CommandContext::new(
            self.runner.store.clone(),
            self.runner.clock.clone(),
            self.runner.services.clone(),
        );
        ctx.get_variable(&execution_id, name).await
    }

    // ── Job management ──

    pub async fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<(), EngineError> {
        self.runner
            .run("set-job-retries", move |ctx| {
                Box::pin(async move {
                    JobManager::set_retries(ctx, job_id, retries).await?;
                    Ok(())
                })
            })
            .await
    }

    pub async fn move_job_to_dead_letter(&self, job_id: JobId) -> Result<(), EngineError> {
        self.runner
            .run("move-job-to-dead-letter", move |ctx| {
                Box::pin(async move {
                    JobManager::move_job_to_dead_letter(ctx, job_id).await?;
                    Ok(())
                })
            })
            .await
    }

    pub async fn move_dead_letter_job_to_executable(
        &self,
        job_id: JobId,
        retries: u32,
    ) -> Result<(), EngineError> {
        self.runner
            .run("move-dead-letter-job-to-executable", move |ctx| {
                Box::pin(async move {
                    JobManager::move_dead_letter_job_to_executable(ctx, job_id, retries).await?;
                    Ok(())
                })
            })
            .await
    }

    pub async fn delete_job(&self, job_id: JobId) -> Result<(), EngineError> {
        self.runner
            .run("delete-job", move |ctx| {
                Box::pin(async move { JobManager::cancel(ctx, job_id).await })
            })
            .await
    }

    /// Management action: lock and execute one job synchronously, regardless
    /// of its due date. Failures surface to the caller after the retry
    /// bookkeeping has been applied.
    pub async fn execute_job(&self, job_id: JobId) -> Result<(), EngineError> {
        let owner = format!("manual-{}", Uuid::now_v7().simple());
        let lock_duration = self.executor.config().lock_duration;
        {
            let owner = owner.clone();
            self.runner
                .run("lock-job", move |ctx| {
                    let owner = owner.clone();
                    Box::pin(async move {
                        let mut job = ctx.job(&job_id).await?;
                        if job.dead_lettered {
                            return Err(EngineError::illegal_state(format!(
                                "job {job_id} is in the dead-letter queue"
                            )));
                        }
                        if job.suspended {
                            return Err(EngineError::Suspended {
                                kind: "job",
                                id: job_id.to_string(),
                            });
                        }
                        let now = ctx.now();
                        if job.is_locked(now) {
                            return Err(EngineError::illegal_state(format!(
                                "job {job_id} is locked by another owner"
                            )));
                        }
                        job.lock_owner = Some(owner);
                        job.lock_expiration_time = Some(now + lock_duration);
                        ctx.update_job(job);
                        Ok(())
                    })
                })
                .await?;
        }
        executor::execute_locked_job(&self.runner, job_id, &owner).await
    }

    // ── Queries ──

    pub async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        query.validate()?;
        self.runner
            .store
            .find_jobs(query, self.runner.clock.now())
            .await
    }

    pub async fn count_jobs(&self, query: &JobQuery) -> Result<usize, EngineError> {
        Ok(self.find_jobs(query).await?.len())
    }

    /// Fails with an ambiguous-result error when more than one job matches;
    /// absent on zero matches.
    pub async fn find_unique_job(&self, query: &JobQuery) -> Result<Option<Job>, EngineError> {
        let mut jobs = self.find_jobs(query).await?;
        match jobs.len() {
            0 => Ok(None),
            1 => Ok(jobs.pop()),
            count => Err(EngineError::AmbiguousResult { count }),
        }
    }

    pub async fn find_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<Vec<Execution>, EngineError> {
        query.validate()?;
        self.runner.store.find_executions(query).await
    }

    pub async fn count_executions(&self, query: &ExecutionQuery) -> Result<usize, EngineError> {
        Ok(self.find_executions(query).await?.len())
    }

    pub async fn find_unique_execution(
        &self,
        query: &ExecutionQuery,
    ) -> Result<Option<Execution>, EngineError> {
        let mut executions = self.find_executions(query).await?;
        match executions.len() {
            0 => Ok(None),
            1 => Ok(executions.pop()),
            count => Err(EngineError::AmbiguousResult { count }),
        }
    }
}

// ─── Builder ──────────────────────────────────────────────────

pub struct ProcessEngineBuilder {
    store: Option<Arc<dyn EngineStore>>,
    clock: Option<Arc<dyn EngineClock>>,
    parser: Option<Arc<dyn DefinitionParser>>,
    listeners: Vec<Arc<dyn EngineEventListener>>,
    delegates: HashMap<String, Arc<dyn TaskDelegate>>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    cache_capacity: usize,
    default_retries: u32,
    retry_backoff: chrono::Duration,
    executor_config: JobExecutorConfig,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            clock: None,
            parser: None,
            listeners: Vec::new(),
            delegates: HashMap::new(),
            handlers: HashMap::new(),
            cache_capacity: 128,
            default_retries: 3,
            retry_backoff: chrono::Duration::zero(),
            executor_config: JobExecutorConfig::default(),
        }
    }
}

impl ProcessEngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn EngineClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn DefinitionParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Listeners are append-only and fixed once the engine is built.
    pub fn add_listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn add_delegate(
        mut self,
        name: impl Into<String>,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Self {
        self.delegates.insert(name.into(), delegate);
        self
    }

    pub fn add_job_handler(
        mut self,
        handler_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.handlers.insert(handler_type.into(), handler);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Fixed delay applied to a failed job's due date before its next
    /// attempt.
    pub fn retry_backoff(mut self, backoff: chrono::Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn executor_config(mut self, config: JobExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn build(self) -> ProcessEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn EngineStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn EngineClock>);
        let parser = self
            .parser
            .unwrap_or_else(|| Arc::new(JsonDefinitionParser) as Arc<dyn DefinitionParser>);

        let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(
            ASYNC_CONTINUATION.to_string(),
            Arc::new(AsyncContinuationHandler),
        );
        handlers.insert(TIMER_FIRE.to_string(), Arc::new(TimerFireHandler));
        handlers.insert(BOUNDARY_TIMER.to_string(), Arc::new(BoundaryTimerHandler));
        handlers.extend(self.handlers);

        let services = Arc::new(EngineServices {
            dispatcher: EventDispatcher::new(self.listeners),
            cache: DefinitionCache::new(self.cache_capacity),
            parser,
            delegates: self.delegates,
            handlers,
            default_retries: self.default_retries,
            retry_backoff: self.retry_backoff,
        });

        let wake = Arc::new(Notify::new());
        let runner = CommandRunner::new(store, clock, services, wake);
        let executor = JobExecutor::new(runner.clone(), self.executor_config);
        ProcessEngine { runner, executor }
    }
}
