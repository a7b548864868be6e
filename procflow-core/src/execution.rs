//! Execution tokens
//!
//! An execution is one path of control within a process instance. Executions
//! form a tree stored arena-style: parent/child references are ids, and
//! deletion is an explicit cascading removal through the unit of work.

use crate::graph::ProcessDefinition;
use crate::types::{ExecutionId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Root execution's own id for the root, inherited by descendants.
    pub process_instance_id: ExecutionId,
    pub process_definition_id: String,
    pub parent_id: Option<ExecutionId>,
    /// Position in the graph. `None` while the execution is an inactive
    /// scope parent waiting on its children.
    pub current_node_id: Option<String>,
    /// Whether this token can currently proceed.
    pub is_active: bool,
    /// Whether it is one of several sibling tokens created by a fork.
    pub is_concurrent: bool,
    /// Whether it owns a variable scope.
    pub is_scope: bool,
    pub suspended: bool,
    /// Exclusively-owned children, cascade-deleted with this execution.
    pub child_ids: Vec<ExecutionId>,
    /// Variables local to this execution; reads fall back to ancestors.
    pub variables: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by the store on update.
    pub revision: u32,
}

impl Execution {
    /// Root execution of a fresh process instance.
    pub fn new_root(
        definition: &ProcessDefinition,
        variables: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            process_instance_id: id,
            process_definition_id: definition.id.clone(),
            parent_id: None,
            current_node_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            suspended: false,
            child_ids: Vec::new(),
            variables,
            created_at: now,
            revision: 1,
        }
    }

    /// Concurrent child created by a fork (or a non-interrupting boundary
    /// fire). Does not own a scope; variable writes land on an ancestor.
    pub fn new_child(parent: &Execution, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_instance_id: parent.process_instance_id,
            process_definition_id: parent.process_definition_id.clone(),
            parent_id: Some(parent.id),
            current_node_id: None,
            is_active: true,
            is_concurrent: true,
            is_scope: false,
            suspended: parent.suspended,
            child_ids: Vec::new(),
            variables: BTreeMap::new(),
            created_at: now,
            revision: 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
