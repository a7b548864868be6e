#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use procflow_core::{
    BusinessError, DelegateExecution, EngineEvent, EngineEventListener, TaskDelegate, Value,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every dispatched event for assertions.
pub struct CollectingListener {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn process_completed_count(&self) -> usize {
        self.count(|e| matches!(e, EngineEvent::ProcessCompleted { .. }))
    }

    pub fn timer_fired_count(&self) -> usize {
        self.count(|e| matches!(e, EngineEvent::TimerFired { .. }))
    }
}

impl EngineEventListener for CollectingListener {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn no_vars() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

pub fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .cloned()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Counts invocations, succeeds.
#[derive(Default)]
pub struct CountingDelegate {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TaskDelegate for CountingDelegate {
    async fn execute(&self, _execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts invocations, always fails with a plain error.
pub struct FailingDelegate {
    pub message: String,
    pub attempts: AtomicUsize,
}

impl FailingDelegate {
    pub fn new(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskDelegate for FailingDelegate {
    async fn execute(&self, _execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("{}", self.message))
    }
}

/// Fails with a coded business error for boundary routing.
pub struct BusinessFailingDelegate {
    pub code: String,
}

#[async_trait]
impl TaskDelegate for BusinessFailingDelegate {
    async fn execute(&self, _execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        Err(BusinessError::new(self.code.clone(), "rejected").into())
    }
}

/// Writes one variable into the execution's scope.
pub struct SetVariableDelegate {
    pub name: String,
    pub value: Value,
}

#[async_trait]
impl TaskDelegate for SetVariableDelegate {
    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        execution
            .set_variable(&self.name, self.value.clone())
            .await?;
        Ok(())
    }
}
