//! Persistence boundary
//!
//! The engine operates exclusively through [`EngineStore`]: entity reads,
//! filtered queries, an atomic change-set apply with optimistic revision
//! checks, and the compare-and-swap job lock. Backends are pluggable; the
//! in-memory arena lives in `store_memory`.

use crate::error::EngineError;
use crate::execution::Execution;
use crate::job::{Job, JobType};
use crate::types::{ExecutionId, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ─── Deployment rows ──────────────────────────────────────────

/// A deployed set of named resources.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub resources: BTreeMap<String, Vec<u8>>,
    pub deployed_at: DateTime<Utc>,
}

/// Persisted definition metadata. The graph itself is re-parsed from the
/// owning deployment's resource on cache miss.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub deployment_id: String,
    pub resource_name: String,
    pub name: Option<String>,
}

// ─── Unit-of-work change set ──────────────────────────────────

/// Everything one command wants to persist, applied atomically. Updates and
/// deletes carry the revision the entity was loaded at; a mismatch fails the
/// whole set with a stale-entity error and nothing is applied.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub execution_inserts: Vec<Execution>,
    pub execution_updates: Vec<Execution>,
    pub execution_deletes: Vec<Execution>,
    pub job_inserts: Vec<Job>,
    pub job_updates: Vec<Job>,
    pub job_deletes: Vec<Job>,
    pub deployment_inserts: Vec<Deployment>,
    pub definition_inserts: Vec<DefinitionRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.execution_inserts.is_empty()
            && self.execution_updates.is_empty()
            && self.execution_deletes.is_empty()
            && self.job_inserts.is_empty()
            && self.job_updates.is_empty()
            && self.job_deletes.is_empty()
            && self.deployment_inserts.is_empty()
            && self.definition_inserts.is_empty()
    }
}

// ─── Job query ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOrder {
    DueDateAsc,
    DueDateDesc,
    RetriesAsc,
    RetriesDesc,
    CreatedAsc,
}

/// Filtered, sorted, limited job query. Dead-lettered jobs are excluded
/// unless the query selects the dead-letter queue explicitly.
#[derive(Clone, Debug, Default)]
pub struct JobQuery {
    process_instance_id: Option<ExecutionId>,
    execution_id: Option<ExecutionId>,
    job_type: Option<JobType>,
    executable: bool,
    dead_lettered: bool,
    with_exception: bool,
    exception_message: Option<String>,
    due_before: Option<DateTime<Utc>>,
    locked: Option<bool>,
    order_by: Vec<JobOrder>,
    limit: Option<usize>,
    arg_error: Option<String>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_instance_id(mut self, id: ExecutionId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    /// Restrict to jobs satisfying the executable predicate at query time.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    /// Select the dead-letter queue instead of the default queues.
    pub fn dead_lettered(mut self) -> Self {
        self.dead_lettered = true;
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn exception_message(mut self, message: &str) -> Self {
        if message.is_empty() {
            self.arg_error = Some("exception message filter is empty".into());
        } else {
            self.exception_message = Some(message.to_string());
        }
        self
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn order_by(mut self, order: JobOrder) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn order_by_due_date_asc(self) -> Self {
        self.order_by(JobOrder::DueDateAsc)
    }

    pub fn order_by_due_date_desc(self) -> Self {
        self.order_by(JobOrder::DueDateDesc)
    }

    pub fn order_by_retries_asc(self) -> Self {
        self.order_by(JobOrder::RetriesAsc)
    }

    pub fn order_by_retries_desc(self) -> Self {
        self.order_by(JobOrder::RetriesDesc)
    }

    pub fn limit(mut self, max: usize) -> Self {
        self.limit = Some(max);
        self
    }

    /// Fail fast on builder misuse, before any store access.
    pub fn validate(&self) -> Result<(), EngineError> {
        match &self.arg_error {
            Some(message) => Err(EngineError::illegal_argument(message.clone())),
            None => Ok(()),
        }
    }

    pub fn matches(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if self.dead_lettered != job.dead_lettered {
            return false;
        }
        if let Some(id) = self.process_instance_id {
            if job.process_instance_id != id {
                return false;
            }
        }
        if let Some(id) = self.execution_id {
            if job.execution_id != Some(id) {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if job.job_type != job_type {
                return false;
            }
        }
        if self.executable && !job.is_executable(now) {
            return false;
        }
        if self.with_exception && job.exception_message.is_none() {
            return false;
        }
        if let Some(message) = &self.exception_message {
            if job.exception_message.as_deref() != Some(message.as_str()) {
                return false;
            }
        }
        if let Some(at) = self.due_before {
            if !job.due_date.is_some_and(|due| due < at) {
                return false;
            }
        }
        if let Some(locked) = self.locked {
            if job.is_locked(now) != locked {
                return false;
            }
        }
        true
    }

    /// Stable multi-key sort in declared order, then creation order as the
    /// final tie-break, then the limit.
    pub fn sort_and_truncate(&self, jobs: &mut Vec<Job>) {
        jobs.sort_by(|a, b| {
            for order in &self.order_by {
                let ordering = match order {
                    JobOrder::DueDateAsc => a.due_date.cmp(&b.due_date),
                    JobOrder::DueDateDesc => b.due_date.cmp(&a.due_date),
                    JobOrder::RetriesAsc => a.retries.cmp(&b.retries),
                    JobOrder::RetriesDesc => b.retries.cmp(&a.retries),
                    JobOrder::CreatedAsc => a.created_at.cmp(&b.created_at),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (a.created_at, a.id).cmp(&(b.created_at, b.id))
        });
        if let Some(max) = self.limit {
            jobs.truncate(max);
        }
    }
}

// ─── Execution query ──────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct ExecutionQuery {
    process_instance_id: Option<ExecutionId>,
    parent_id: Option<ExecutionId>,
    node_id: Option<String>,
    only_active: bool,
    limit: Option<usize>,
    arg_error: Option<String>,
}

impl ExecutionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_instance_id(mut self, id: ExecutionId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn parent_id(mut self, id: ExecutionId) -> Self {
        self.parent_id = Some(id);
        self
    }

    /// Positioned at the given node.
    pub fn node_id(mut self, node_id: &str) -> Self {
        if node_id.is_empty() {
            self.arg_error = Some("node id filter is empty".into());
        } else {
            self.node_id = Some(node_id.to_string());
        }
        self
    }

    pub fn only_active(mut self) -> Self {
        self.only_active = true;
        self
    }

    pub fn limit(mut self, max: usize) -> Self {
        self.limit = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match &self.arg_error {
            Some(message) => Err(EngineError::illegal_argument(message.clone())),
            None => Ok(()),
        }
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        if let Some(id) = self.process_instance_id {
            if execution.process_instance_id != id {
                return false;
            }
        }
        if let Some(id) = self.parent_id {
            if execution.parent_id != Some(id) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if execution.current_node_id.as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        if self.only_active && !execution.is_active {
            return false;
        }
        true
    }

    pub fn sort_and_truncate(&self, executions: &mut Vec<Execution>) {
        executions.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Some(max) = self.limit {
            executions.truncate(max);
        }
    }
}

// ─── Store trait ──────────────────────────────────────────────

#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Executions ──

    async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, EngineError>;
    async fn executions_by_instance(
        &self,
        instance: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError>;
    async fn executions_by_parent(
        &self,
        parent: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError>;
    async fn find_executions(&self, query: &ExecutionQuery)
        -> Result<Vec<Execution>, EngineError>;

    // ── Jobs ──

    async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError>;
    async fn jobs_by_instance(&self, instance: ExecutionId) -> Result<Vec<Job>, EngineError>;
    async fn jobs_by_execution(&self, execution: ExecutionId) -> Result<Vec<Job>, EngineError>;
    async fn find_jobs(
        &self,
        query: &JobQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, EngineError>;

    /// Conditional lock acquisition: succeeds only while the job still
    /// satisfies the executable predicate. A `false` return means another
    /// acquirer won the race.
    async fn try_lock_job(
        &self,
        id: JobId,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    // ── Deployments and definitions ──

    async fn deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError>;
    async fn latest_deployment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Deployment>, EngineError>;
    async fn definition_record(&self, id: &str) -> Result<Option<DefinitionRecord>, EngineError>;
    async fn latest_definition_by_key(
        &self,
        key: &str,
    ) -> Result<Option<DefinitionRecord>, EngineError>;

    // ── Unit of work ──

    /// Apply one command's writes atomically, or fail the whole set.
    async fn apply(&self, changes: ChangeSet) -> Result<(), EngineError>;
}
