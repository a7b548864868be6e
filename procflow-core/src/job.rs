//! Job entity
//!
//! A job is a unit of deferred work: a timer, an async continuation message,
//! or a boundary timer. Queue membership (timer / executable / suspended /
//! dead-letter) is predicate-based and recomputed against the injected clock
//! on every query, never cached at creation time.

use crate::types::{ExecutionId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Due-date gated wait (timer catch node).
    Timer,
    /// Async continuation; executable as soon as a worker picks it up.
    Message,
    /// Timer attached to an activity boundary.
    Boundary,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Timer => "timer",
            JobType::Message => "message",
            JobType::Boundary => "boundary",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Repetition bookkeeping for cycling timers. `remaining: None` never
/// exhausts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub interval_ms: i64,
    /// Fires left after the current one.
    pub remaining: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: ExecutionId,
    pub process_definition_id: String,
    /// `None` means immediately executable.
    pub due_date: Option<DateTime<Utc>>,
    /// Remaining attempts. Zero removes the job from the executable queue.
    pub retries: u32,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    /// Opaque payload telling the executor what to do on fire.
    pub handler_type: String,
    pub handler_config: serde_json::Value,
    pub repeat: Option<RepeatSpec>,
    pub dead_lettered: bool,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub revision: u32,
}

impl Job {
    pub fn new(
        job_type: JobType,
        handler_type: impl Into<String>,
        handler_config: serde_json::Value,
        execution_id: Option<ExecutionId>,
        process_instance_id: ExecutionId,
        process_definition_id: impl Into<String>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type,
            execution_id,
            process_instance_id,
            process_definition_id: process_definition_id.into(),
            due_date: None,
            retries,
            lock_owner: None,
            lock_expiration_time: None,
            exception_message: None,
            exception_stacktrace: None,
            handler_type: handler_type.into(),
            handler_config,
            repeat: None,
            dead_lettered: false,
            suspended: false,
            created_at: now,
            revision: 1,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some()
            && self
                .lock_expiration_time
                .is_some_and(|expires| expires > now)
    }

    /// The executable-queue predicate: due, retries left, unlocked, and not
    /// parked in the suspended or dead-letter queue.
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        !self.dead_lettered
            && !self.suspended
            && self.retries > 0
            && self.is_due(now)
            && !self.is_locked(now)
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job_due_at(due: Option<DateTime<Utc>>) -> Job {
        let now = Utc::now();
        let mut job = Job::new(
            JobType::Timer,
            "noop",
            serde_json::Value::Null,
            None,
            Uuid::now_v7(),
            "p:1:x",
            3,
            now,
        );
        job.due_date = due;
        job
    }

    #[test]
    fn executable_requires_due_retries_and_no_lock() {
        let now = Utc::now();
        let mut job = job_due_at(None);
        assert!(job.is_executable(now));

        job.due_date = Some(now + Duration::hours(1));
        assert!(!job.is_executable(now));
        assert!(job.is_executable(now + Duration::hours(1)));

        job.due_date = None;
        job.retries = 0;
        assert!(!job.is_executable(now));

        job.retries = 1;
        job.lock_owner = Some("node-1".into());
        job.lock_expiration_time = Some(now + Duration::minutes(5));
        assert!(!job.is_executable(now));
        // Expired locks no longer exclude.
        assert!(job.is_executable(now + Duration::minutes(6)));
    }

    #[test]
    fn dead_letter_and_suspension_exclude_from_executable() {
        let now = Utc::now();
        let mut job = job_due_at(None);
        job.dead_lettered = true;
        assert!(!job.is_executable(now));

        job.dead_lettered = false;
        job.suspended = true;
        assert!(!job.is_executable(now));
    }
}
