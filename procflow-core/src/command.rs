//! Command layer
//!
//! Every mutating entry point runs as a command: a fresh [`CommandContext`]
//! is threaded explicitly through the interpreter and managers (no ambient
//! state), writes are staged in an identity-mapped entity cache, and commit
//! applies one atomic change set. Rollback is dropping the context. Events
//! are dispatched only after a successful commit.

use crate::cache::DefinitionCache;
use crate::clock::EngineClock;
use crate::deployment::DefinitionParser;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventDispatcher};
use crate::execution::Execution;
use crate::graph::ProcessDefinition;
use crate::handlers::{JobHandler, TaskDelegate};
use crate::job::Job;
use crate::store::{ChangeSet, DefinitionRecord, Deployment, EngineStore};
use crate::types::{ExecutionId, JobId, Value};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Future type produced by command bodies; bounded to the context borrow.
pub type CommandFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Shared, immutable engine collaborators handed to every command.
pub struct EngineServices {
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) cache: DefinitionCache,
    pub(crate) parser: Arc<dyn DefinitionParser>,
    pub(crate) delegates: HashMap<String, Arc<dyn TaskDelegate>>,
    pub(crate) handlers: HashMap<String, Arc<dyn JobHandler>>,
    pub(crate) default_retries: u32,
    pub(crate) retry_backoff: chrono::Duration,
}

impl EngineServices {
    pub(crate) fn delegate(&self, name: &str) -> Result<Arc<dyn TaskDelegate>, EngineError> {
        self.delegates
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("task delegate", name))
    }

    pub(crate) fn handler(&self, handler_type: &str) -> Result<Arc<dyn JobHandler>, EngineError> {
        self.handlers
            .get(handler_type)
            .cloned()
            .ok_or_else(|| EngineError::not_found("job handler", handler_type))
    }

    /// Definition-cache resolution with the race-safe double lookup after a
    /// miss re-parses the owning deployment.
    pub(crate) async fn resolve_definition(
        &self,
        store: &Arc<dyn EngineStore>,
        id: &str,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        if let Some(definition) = self.cache.get(id) {
            return Ok(definition);
        }
        let record = store
            .definition_record(id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", id))?;
        let deployment = store
            .deployment(&record.deployment_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deployment", &record.deployment_id))?;
        let bytes = deployment
            .resources
            .get(&record.resource_name)
            .ok_or_else(|| EngineError::not_found("deployment resource", &record.resource_name))?;
        let model = self
            .parser
            .parse(&record.resource_name, bytes)?
            .into_iter()
            .find(|m| m.key == record.key)
            .ok_or_else(|| EngineError::not_found("process definition", id))?;
        let definition = Arc::new(ProcessDefinition {
            id: record.id,
            key: record.key,
            version: record.version,
            deployment_id: record.deployment_id,
            model,
        });
        // Another resolver may have populated the entry while we parsed;
        // content is identical either way.
        if let Some(existing) = self.cache.get(id) {
            return Ok(existing);
        }
        self.cache.insert(definition.clone());
        Ok(definition)
    }
}

enum EntityState<T> {
    Inserted(T),
    Loaded { entity: T, dirty: bool },
    Deleted(T),
}

impl<T: Clone> EntityState<T> {
    fn live(&self) -> Option<&T> {
        match self {
            EntityState::Inserted(entity) | EntityState::Loaded { entity, .. } => Some(entity),
            EntityState::Deleted(_) => None,
        }
    }
}

/// Result of a committed command.
pub struct CommitOutcome {
    pub events: Vec<EngineEvent>,
    /// A job became executable right now; the acquisition loop should be
    /// woken instead of waiting out its poll interval.
    pub schedule_hint: bool,
}

/// One command's unit of work over the store.
pub struct CommandContext {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn EngineClock>,
    services: Arc<EngineServices>,
    executions: BTreeMap<ExecutionId, EntityState<Execution>>,
    jobs: BTreeMap<JobId, EntityState<Job>>,
    deployment_inserts: Vec<Deployment>,
    definition_inserts: Vec<DefinitionRecord>,
    events: Vec<EngineEvent>,
}

impl CommandContext {
    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn EngineClock>,
        services: Arc<EngineServices>,
    ) -> Self {
        Self {
            store,
            clock,
            services,
            executions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            deployment_inserts: Vec::new(),
            definition_inserts: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn fire(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub async fn resolve_definition(
        &self,
        id: &str,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.services.resolve_definition(&self.store, id).await
    }

    // ── Executions ──

    pub fn insert_execution(&mut self, execution: Execution) {
        self.fire(EngineEvent::ExecutionCreated {
            process_instance_id: execution.process_instance_id,
            execution_id: execution.id,
            parent_id: execution.parent_id,
        });
        self.executions
            .insert(execution.id, EntityState::Inserted(execution));
    }

    pub fn update_execution(&mut self, execution: Execution) {
        match self.executions.get_mut(&execution.id) {
            Some(EntityState::Inserted(current)) => *current = execution,
            Some(EntityState::Loaded { entity, dirty }) => {
                *entity = execution;
                *dirty = true;
            }
            Some(EntityState::Deleted(_)) => {}
            None => {
                self.executions.insert(
                    execution.id,
                    EntityState::Loaded {
                        entity: execution,
                        dirty: true,
                    },
                );
            }
        }
    }

    pub async fn try_execution(
        &mut self,
        id: &ExecutionId,
    ) -> Result<Option<Execution>, EngineError> {
        if let Some(state) = self.executions.get(id) {
            return Ok(state.live().cloned());
        }
        match self.store.execution(*id).await? {
            Some(execution) => {
                self.executions.insert(
                    *id,
                    EntityState::Loaded {
                        entity: execution.clone(),
                        dirty: false,
                    },
                );
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    pub async fn execution(&mut self, id: &ExecutionId) -> Result<Execution, EngineError> {
        self.try_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", id))
    }

    pub async fn delete_execution(&mut self, id: &ExecutionId) -> Result<(), EngineError> {
        let removed = match self.executions.get(id) {
            Some(EntityState::Inserted(entity)) => {
                let instance = entity.process_instance_id;
                self.executions.remove(id);
                Some(instance)
            }
            Some(EntityState::Loaded { entity, .. }) => {
                let entity = entity.clone();
                let instance = entity.process_instance_id;
                self.executions.insert(*id, EntityState::Deleted(entity));
                Some(instance)
            }
            Some(EntityState::Deleted(_)) => None,
            None => match self.store.execution(*id).await? {
                Some(entity) => {
                    let instance = entity.process_instance_id;
                    self.executions.insert(*id, EntityState::Deleted(entity));
                    Some(instance)
                }
                None => None,
            },
        };
        if let Some(process_instance_id) = removed {
            self.fire(EngineEvent::ExecutionDeleted {
                process_instance_id,
                execution_id: *id,
            });
        }
        Ok(())
    }

    fn prime_execution(&mut self, execution: Execution) {
        self.executions
            .entry(execution.id)
            .or_insert(EntityState::Loaded {
                entity: execution,
                dirty: false,
            });
    }

    fn collect_executions(&self, predicate: impl Fn(&Execution) -> bool) -> Vec<Execution> {
        let mut matched: Vec<Execution> = self
            .executions
            .values()
            .filter_map(EntityState::live)
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        matched
    }

    /// Children of `parent`, including entities created or mutated in this
    /// unit of work.
    pub async fn children_of(
        &mut self,
        parent: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError> {
        let rows = self.store.executions_by_parent(parent).await?;
        for row in rows {
            self.prime_execution(row);
        }
        Ok(self.collect_executions(|e| e.parent_id == Some(parent)))
    }

    pub async fn executions_of_instance(
        &mut self,
        instance: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError> {
        let rows = self.store.executions_by_instance(instance).await?;
        for row in rows {
            self.prime_execution(row);
        }
        Ok(self.collect_executions(|e| e.process_instance_id == instance))
    }

    // ── Jobs ──

    pub fn insert_job(&mut self, job: Job) {
        self.fire(EngineEvent::JobCreated {
            job_id: job.id,
            job_type: job.job_type,
            process_instance_id: job.process_instance_id,
        });
        self.jobs.insert(job.id, EntityState::Inserted(job));
    }

    pub fn update_job(&mut self, job: Job) {
        match self.jobs.get_mut(&job.id) {
            Some(EntityState::Inserted(current)) => *current = job,
            Some(EntityState::Loaded { entity, dirty }) => {
                *entity = job;
                *dirty = true;
            }
            Some(EntityState::Deleted(_)) => {}
            None => {
                self.jobs.insert(
                    job.id,
                    EntityState::Loaded {
                        entity: job,
                        dirty: true,
                    },
                );
            }
        }
    }

    pub async fn try_job(&mut self, id: &JobId) -> Result<Option<Job>, EngineError> {
        if let Some(state) = self.jobs.get(id) {
            return Ok(state.live().cloned());
        }
        match self.store.job(*id).await? {
            Some(job) => {
                self.jobs.insert(
                    *id,
                    EntityState::Loaded {
                        entity: job.clone(),
                        dirty: false,
                    },
                );
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub async fn job(&mut self, id: &JobId) -> Result<Job, EngineError> {
        self.try_job(id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", id))
    }

    /// Idempotent delete: removing a missing or already-deleted job is a
    /// no-op.
    pub async fn delete_job(&mut self, id: &JobId) -> Result<(), EngineError> {
        let removed = match self.jobs.get(id) {
            Some(EntityState::Inserted(_)) => {
                self.jobs.remove(id);
                true
            }
            Some(EntityState::Loaded { entity, .. }) => {
                let entity = entity.clone();
                self.jobs.insert(*id, EntityState::Deleted(entity));
                true
            }
            Some(EntityState::Deleted(_)) => false,
            None => match self.store.job(*id).await? {
                Some(entity) => {
                    self.jobs.insert(*id, EntityState::Deleted(entity));
                    true
                }
                None => false,
            },
        };
        if removed {
            self.fire(EngineEvent::JobDeleted { job_id: *id });
        }
        Ok(())
    }

    fn prime_job(&mut self, job: Job) {
        self.jobs.entry(job.id).or_insert(EntityState::Loaded {
            entity: job,
            dirty: false,
        });
    }

    fn collect_jobs(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut matched: Vec<Job> = self
            .jobs
            .values()
            .filter_map(EntityState::live)
            .filter(|j| predicate(j))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        matched
    }

    pub async fn jobs_of_execution(
        &mut self,
        execution: ExecutionId,
    ) -> Result<Vec<Job>, EngineError> {
        let rows = self.store.jobs_by_execution(execution).await?;
        for row in rows {
            self.prime_job(row);
        }
        Ok(self.collect_jobs(|j| j.execution_id == Some(execution)))
    }

    pub async fn jobs_of_instance(
        &mut self,
        instance: ExecutionId,
    ) -> Result<Vec<Job>, EngineError> {
        let rows = self.store.jobs_by_instance(instance).await?;
        for row in rows {
            self.prime_job(row);
        }
        Ok(self.collect_jobs(|j| j.process_instance_id == instance))
    }

    // ── Deployments ──

    pub fn insert_deployment(&mut self, deployment: Deployment) {
        self.deployment_inserts.push(deployment);
    }

    pub fn insert_definition(&mut self, record: DefinitionRecord) {
        self.definition_inserts.push(record);
    }

    // ── Variable scope ──

    /// Variables visible from an execution: its own, with ancestors filled in
    /// underneath (nearer scopes shadow farther ones).
    pub async fn scope_variables(
        &mut self,
        execution_id: &ExecutionId,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut chain = Vec::new();
        let mut cursor = Some(*execution_id);
        while let Some(id) = cursor {
            let execution = self.execution(&id).await?;
            cursor = execution.parent_id;
            chain.push(execution);
        }
        let mut variables = BTreeMap::new();
        for execution in chain.into_iter().rev() {
            variables.extend(execution.variables);
        }
        Ok(variables)
    }

    pub async fn get_variable(
        &mut self,
        execution_id: &ExecutionId,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        let mut cursor = Some(*execution_id);
        while let Some(id) = cursor {
            let execution = self.execution(&id).await?;
            if let Some(value) = execution.variables.get(name) {
                return Ok(Some(value.clone()));
            }
            cursor = execution.parent_id;
        }
        Ok(None)
    }

    /// Write to the nearest enclosing scope execution.
    pub async fn set_variable(
        &mut self,
        execution_id: &ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let mut cursor = *execution_id;
        loop {
            let execution = self.execution(&cursor).await?;
            if execution.is_scope || execution.parent_id.is_none() {
                let mut scope = execution;
                scope.variables.insert(name.to_string(), value);
                self.update_execution(scope);
                return Ok(());
            }
            cursor = execution.parent_id.expect("non-scope execution has parent");
        }
    }

    /// Write to this execution regardless of scope ownership.
    pub async fn set_variable_local(
        &mut self,
        execution_id: &ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let mut execution = self.execution(execution_id).await?;
        execution.variables.insert(name.to_string(), value);
        self.update_execution(execution);
        Ok(())
    }

    // ── Commit ──

    pub async fn commit(self) -> Result<CommitOutcome, EngineError> {
        let now = self.clock.now();
        let mut changes = ChangeSet::default();
        let mut schedule_hint = false;

        for state in self.executions.into_values() {
            match state {
                EntityState::Inserted(e) => changes.execution_inserts.push(e),
                EntityState::Loaded { entity, dirty } => {
                    if dirty {
                        changes.execution_updates.push(entity);
                    }
                }
                EntityState::Deleted(e) => changes.execution_deletes.push(e),
            }
        }
        for state in self.jobs.into_values() {
            match state {
                EntityState::Inserted(j) => {
                    schedule_hint |= j.is_executable(now);
                    changes.job_inserts.push(j);
                }
                EntityState::Loaded { entity, dirty } => {
                    if dirty {
                        schedule_hint |= entity.is_executable(now);
                        changes.job_updates.push(entity);
                    }
                }
                EntityState::Deleted(j) => changes.job_deletes.push(j),
            }
        }
        changes.deployment_inserts = self.deployment_inserts;
        changes.definition_inserts = self.definition_inserts;

        if !changes.is_empty() {
            self.store.apply(changes).await?;
        }
        Ok(CommitOutcome {
            events: self.events,
            schedule_hint,
        })
    }
}

/// Runs command bodies in fresh contexts, commits, dispatches events, and
/// absorbs stale-entity races with a bounded retry.
#[derive(Clone)]
pub struct CommandRunner {
    pub(crate) store: Arc<dyn EngineStore>,
    pub(crate) clock: Arc<dyn EngineClock>,
    pub(crate) services: Arc<EngineServices>,
    pub(crate) wake: Arc<Notify>,
}

impl CommandRunner {
    const MAX_STALE_RETRIES: usize = 3;

    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn EngineClock>,
        services: Arc<EngineServices>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            clock,
            services,
            wake,
        }
    }

    pub async fn run<T, F>(&self, name: &'static str, mut body: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut CommandContext) -> CommandFuture<'a, T>,
    {
        let mut attempt = 0;
        loop {
            let mut ctx = CommandContext::new(
                self.store.clone(),
                self.clock.clone(),
                self.services.clone(),
            );
            let value = match body(&mut ctx).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(command = name, error = %err, "command failed, rolling back");
                    return Err(err);
                }
            };
            match ctx.commit().await {
                Ok(outcome) => {
                    self.services.dispatcher.dispatch_all(&outcome.events);
                    if outcome.schedule_hint {
                        self.wake.notify_one();
                    }
                    return Ok(value);
                }
                Err(err) if err.is_stale() && attempt < Self::MAX_STALE_RETRIES => {
                    attempt += 1;
                    debug!(command = name, attempt, "stale entity on commit, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
