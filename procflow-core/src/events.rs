//! Lifecycle events
//!
//! Typed events emitted after every successful unit of work, in traversal
//! order, to listeners registered at engine build time. Listeners observe;
//! they cannot alter control flow.

use crate::graph::FlowNode;
use crate::job::JobType;
use crate::types::{ExecutionId, JobId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifying slice of a flow node carried on events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNodeRef {
    pub id: String,
    pub name: Option<String>,
    pub kind: String,
}

impl From<&FlowNode> for FlowNodeRef {
    fn from(node: &FlowNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            kind: node.kind.type_name().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessStarted {
        process_instance_id: ExecutionId,
        process_definition_id: String,
    },
    ProcessCompleted {
        process_instance_id: ExecutionId,
    },
    ProcessCancelled {
        process_instance_id: ExecutionId,
        reason: String,
    },
    ActivityStarted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node: FlowNodeRef,
    },
    ActivityCompleted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node: FlowNodeRef,
    },
    SequenceFlowTaken {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        transition_id: String,
        source: FlowNodeRef,
        target: FlowNodeRef,
    },
    ExecutionCreated {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        parent_id: Option<ExecutionId>,
    },
    ExecutionDeleted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
    },
    JobCreated {
        job_id: JobId,
        job_type: JobType,
        process_instance_id: ExecutionId,
    },
    JobDeleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        retries_remaining: u32,
        message: String,
    },
    JobRetriesExhausted {
        job_id: JobId,
    },
    TimerFired {
        job_id: JobId,
        execution_id: ExecutionId,
        node_id: String,
    },
    ErrorRouted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node_id: String,
        error_code: Option<String>,
        target: String,
    },
}

pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Synchronous fan-out to listeners in registration order. The list is fixed
/// at engine build time; no registration during dispatch.
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl EventDispatcher {
    pub fn new(listeners: Vec<Arc<dyn EngineEventListener>>) -> Self {
        Self { listeners }
    }

    pub fn dispatch_all(&self, events: &[EngineEvent]) {
        for event in events {
            for listener in &self.listeners {
                listener.on_event(event);
            }
        }
    }
}
