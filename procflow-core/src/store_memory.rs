//! In-memory store
//!
//! Single-mutex arena backend. Change sets are validated in full before any
//! mutation, which gives apply-or-fail atomicity; revision checks turn
//! concurrent writers into stale-entity failures handled upstream.

use crate::error::EngineError;
use crate::execution::Execution;
use crate::job::Job;
use crate::store::{
    ChangeSet, DefinitionRecord, Deployment, EngineStore, ExecutionQuery, JobQuery,
};
use crate::types::{ExecutionId, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    executions: BTreeMap<ExecutionId, Execution>,
    jobs: BTreeMap<JobId, Job>,
    deployments: BTreeMap<String, Deployment>,
    definitions: BTreeMap<String, DefinitionRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate(inner: &Inner, changes: &ChangeSet) -> Result<(), EngineError> {
    for e in &changes.execution_inserts {
        if inner.executions.contains_key(&e.id) {
            return Err(EngineError::stale("execution", e.id));
        }
    }
    for e in changes
        .execution_updates
        .iter()
        .chain(&changes.execution_deletes)
    {
        match inner.executions.get(&e.id) {
            Some(current) if current.revision == e.revision => {}
            _ => return Err(EngineError::stale("execution", e.id)),
        }
    }
    for j in &changes.job_inserts {
        if inner.jobs.contains_key(&j.id) {
            return Err(EngineError::stale("job", j.id));
        }
    }
    for j in changes.job_updates.iter().chain(&changes.job_deletes) {
        match inner.jobs.get(&j.id) {
            Some(current) if current.revision == j.revision => {}
            _ => return Err(EngineError::stale("job", j.id)),
        }
    }
    for d in &changes.deployment_inserts {
        if inner.deployments.contains_key(&d.id) {
            return Err(EngineError::stale("deployment", &d.id));
        }
    }
    for r in &changes.definition_inserts {
        if inner.definitions.contains_key(&r.id) {
            return Err(EngineError::stale("process definition", &r.id));
        }
    }
    Ok(())
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, EngineError> {
        Ok(self.inner.lock().unwrap().executions.get(&id).cloned())
    }

    async fn executions_by_instance(
        &self,
        instance: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .executions
            .values()
            .filter(|e| e.process_instance_id == instance)
            .cloned()
            .collect())
    }

    async fn executions_by_parent(
        &self,
        parent: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .executions
            .values()
            .filter(|e| e.parent_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn find_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<Vec<Execution>, EngineError> {
        query.validate()?;
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        drop(inner);
        query.sort_and_truncate(&mut matched);
        Ok(matched)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn jobs_by_instance(&self, instance: ExecutionId) -> Result<Vec<Job>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.process_instance_id == instance)
            .cloned()
            .collect())
    }

    async fn jobs_by_execution(&self, execution: ExecutionId) -> Result<Vec<Job>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.execution_id == Some(execution))
            .cloned()
            .collect())
    }

    async fn find_jobs(
        &self,
        query: &JobQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, EngineError> {
        query.validate()?;
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| query.matches(j, now))
            .cloned()
            .collect();
        drop(inner);
        query.sort_and_truncate(&mut matched);
        Ok(matched)
    }

    async fn try_lock_job(
        &self,
        id: JobId,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.is_executable(now) {
            return Ok(false);
        }
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(until);
        job.revision += 1;
        Ok(true)
    }

    async fn deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError> {
        Ok(self.inner.lock().unwrap().deployments.get(id).cloned())
    }

    async fn latest_deployment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Deployment>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deployments
            .values()
            .filter(|d| d.name == name)
            .max_by(|a, b| (a.deployed_at, &a.id).cmp(&(b.deployed_at, &b.id)))
            .cloned())
    }

    async fn definition_record(&self, id: &str) -> Result<Option<DefinitionRecord>, EngineError> {
        Ok(self.inner.lock().unwrap().definitions.get(id).cloned())
    }

    async fn latest_definition_by_key(
        &self,
        key: &str,
    ) -> Result<Option<DefinitionRecord>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .definitions
            .values()
            .filter(|r| r.key == key)
            .max_by_key(|r| r.version)
            .cloned())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        validate(&inner, &changes)?;

        for e in changes.execution_inserts {
            inner.executions.insert(e.id, e);
        }
        for mut e in changes.execution_updates {
            e.revision += 1;
            inner.executions.insert(e.id, e);
        }
        for e in changes.execution_deletes {
            inner.executions.remove(&e.id);
        }
        for j in changes.job_inserts {
            inner.jobs.insert(j.id, j);
        }
        for mut j in changes.job_updates {
            j.revision += 1;
            inner.jobs.insert(j.id, j);
        }
        for j in changes.job_deletes {
            inner.jobs.remove(&j.id);
        }
        for d in changes.deployment_inserts {
            inner.deployments.insert(d.id.clone(), d);
        }
        for r in changes.definition_inserts {
            inner.definitions.insert(r.id.clone(), r);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use chrono::Duration;
    use uuid::Uuid;

    fn immediate_job() -> Job {
        Job::new(
            JobType::Message,
            "noop",
            serde_json::Value::Null,
            None,
            Uuid::now_v7(),
            "p:1:x",
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn lock_race_has_exactly_one_winner() {
        let store = MemoryStore::new();
        let job = immediate_job();
        let id = job.id;
        let now = Utc::now();

        let changes = ChangeSet {
            job_inserts: vec![job],
            ..Default::default()
        };
        store.apply(changes).await.unwrap();

        let until = now + Duration::minutes(5);
        assert!(store.try_lock_job(id, "node-1", until, now).await.unwrap());
        assert!(!store.try_lock_job(id, "node-2", until, now).await.unwrap());

        // After the lock expires the job is lockable again.
        let later = now + Duration::minutes(6);
        assert!(store
            .try_lock_job(id, "node-2", later + Duration::minutes(5), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_update_rejects_whole_change_set() {
        let store = MemoryStore::new();
        let job = immediate_job();
        let id = job.id;
        store
            .apply(ChangeSet {
                job_inserts: vec![job.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        // Concurrent lock bumps the revision.
        let now = Utc::now();
        assert!(store
            .try_lock_job(id, "node-1", now + Duration::minutes(5), now)
            .await
            .unwrap());

        // An update against the originally loaded revision must fail, and a
        // fresh insert in the same set must not survive.
        let mut stale = job.clone();
        stale.retries = 1;
        let orphan = immediate_job();
        let orphan_id = orphan.id;
        let err = store
            .apply(ChangeSet {
                job_inserts: vec![orphan],
                job_updates: vec![stale],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert!(store.job(orphan_id).await.unwrap().is_none());
    }
}
