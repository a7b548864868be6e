//! Process graph interpreter
//!
//! Walks execution tokens across the definition graph by draining an
//! explicit agenda of enter/leave/take/end operations inside one unit of
//! work. Wait states park the token and end the agenda path; forks create
//! concurrent children; joins collapse siblings back into the parent scope.

use crate::command::CommandContext;
use crate::error::{BusinessError, EngineError};
use crate::events::{EngineEvent, FlowNodeRef};
use crate::execution::Execution;
use crate::graph::{FlowNode, NodeKind, ProcessDefinition, Transition};
use crate::handlers::{self, DelegateExecution};
use crate::job::{JobType, RepeatSpec};
use crate::job_manager::JobManager;
use crate::types::{ExecutionId, Value};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// One step of interpretation. Ops referencing executions that have since
/// been deleted are skipped; a parked token simply queues no further ops.
#[derive(Debug)]
pub(crate) enum Op {
    Enter {
        execution_id: ExecutionId,
        node_id: String,
        /// Set when resuming from an async-continuation job so the async
        /// gate does not re-schedule.
        skip_async: bool,
    },
    Leave {
        execution_id: ExecutionId,
        ignore_conditions: bool,
    },
    Take {
        execution_id: ExecutionId,
        transition: Transition,
    },
    End {
        execution_id: ExecutionId,
    },
}

/// Drain the agenda to quiescence.
pub(crate) async fn run(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    mut agenda: VecDeque<Op>,
) -> Result<(), EngineError> {
    while let Some(op) = agenda.pop_front() {
        match op {
            Op::Enter {
                execution_id,
                node_id,
                skip_async,
            } => enter(ctx, def, &mut agenda, execution_id, &node_id, skip_async).await?,
            Op::Leave {
                execution_id,
                ignore_conditions,
            } => leave(ctx, def, &mut agenda, execution_id, ignore_conditions).await?,
            Op::Take {
                execution_id,
                transition,
            } => take(ctx, def, &mut agenda, execution_id, &transition).await?,
            Op::End { execution_id } => end(ctx, def, &mut agenda, execution_id).await?,
        }
    }
    Ok(())
}

/// Create the root execution and run the graph from the start node.
pub(crate) async fn start_instance(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    variables: BTreeMap<String, Value>,
) -> Result<ExecutionId, EngineError> {
    let root = Execution::new_root(def, variables, ctx.now());
    let instance_id = root.id;
    ctx.fire(EngineEvent::ProcessStarted {
        process_instance_id: instance_id,
        process_definition_id: def.id.clone(),
    });
    ctx.insert_execution(root);
    let agenda = VecDeque::from([Op::Enter {
        execution_id: instance_id,
        node_id: def.initial().to_string(),
        skip_async: false,
    }]);
    run(ctx, def, agenda).await?;
    Ok(instance_id)
}

/// Complete a receive-task wait state.
pub(crate) async fn signal(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    execution_id: ExecutionId,
) -> Result<(), EngineError> {
    let execution = ctx.execution(&execution_id).await?;
    if execution.suspended {
        return Err(EngineError::Suspended {
            kind: "execution",
            id: execution_id.to_string(),
        });
    }
    if !execution.is_active {
        return Err(EngineError::illegal_state(format!(
            "execution {execution_id} is not active"
        )));
    }
    let node_id = execution.current_node_id.clone().ok_or_else(|| {
        EngineError::illegal_state(format!("execution {execution_id} is not at a node"))
    })?;
    let node = def.node(&node_id)?;
    if node.kind != NodeKind::ReceiveTask {
        return Err(EngineError::illegal_state(format!(
            "execution {execution_id} is not waiting at a receive task"
        )));
    }
    run(
        ctx,
        def,
        VecDeque::from([Op::Leave {
            execution_id,
            ignore_conditions: false,
        }]),
    )
    .await
}

// ─── Node entry ───────────────────────────────────────────────

async fn enter(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    agenda: &mut VecDeque<Op>,
    execution_id: ExecutionId,
    node_id: &str,
    skip_async: bool,
) -> Result<(), EngineError> {
    let Some(mut execution) = ctx.try_execution(&execution_id).await? else {
        debug!(%execution_id, node_id, "enter on deleted execution, skipping");
        return Ok(());
    };
    let node = def.node(node_id)?;

    execution.current_node_id = Some(node.id.clone());
    ctx.update_execution(execution.clone());

    // Async gate: park here and let the job executor re-enter in its own
    // transaction.
    if node.async_before && !skip_async {
        let job = JobManager::create(
            ctx,
            &execution,
            JobType::Message,
            handlers::ASYNC_CONTINUATION,
            json!({ "node": node.id }),
        );
        JobManager::schedule_async_job(ctx, job);
        return Ok(());
    }

    ctx.fire(EngineEvent::ActivityStarted {
        process_instance_id: execution.process_instance_id,
        execution_id,
        node: FlowNodeRef::from(node),
    });

    for timer in &node.boundary_timers {
        let mut job = JobManager::create(
            ctx,
            &execution,
            JobType::Boundary,
            handlers::BOUNDARY_TIMER,
            json!({ "node": node.id, "boundary": timer.id }),
        );
        if let Some(cycle) = &timer.cycle {
            job.repeat = Some(RepeatSpec {
                interval_ms: cycle.interval_ms,
                remaining: Some(cycle.max_fires.saturating_sub(1)),
            });
        }
        let due = ctx.now() + chrono::Duration::milliseconds(timer.duration_ms);
        JobManager::schedule_timer_job(ctx, job, due);
    }

    match &node.kind {
        NodeKind::Start | NodeKind::Task | NodeKind::End => {
            agenda.push_back(Op::Leave {
                execution_id,
                ignore_conditions: false,
            });
        }
        NodeKind::ServiceTask { delegate } => {
            run_service_task(ctx, def, agenda, &execution, node, delegate).await?;
        }
        NodeKind::ReceiveTask => {
            // Wait state: parked until signalled.
        }
        NodeKind::TimerCatch { duration_ms } => {
            let job = JobManager::create(
                ctx,
                &execution,
                JobType::Timer,
                handlers::TIMER_FIRE,
                json!({ "node": node.id }),
            );
            let due = ctx.now() + chrono::Duration::milliseconds(*duration_ms);
            JobManager::schedule_timer_job(ctx, job, due);
        }
        NodeKind::ExclusiveGateway => {
            agenda.push_back(Op::Leave {
                execution_id,
                ignore_conditions: false,
            });
        }
        NodeKind::ParallelGateway => {
            if node.incoming_count > 1 {
                join_arrive(ctx, agenda, execution, node).await?;
            } else {
                agenda.push_back(Op::Leave {
                    execution_id,
                    ignore_conditions: true,
                });
            }
        }
    }
    Ok(())
}

async fn run_service_task(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    agenda: &mut VecDeque<Op>,
    execution: &Execution,
    node: &FlowNode,
    delegate_name: &str,
) -> Result<(), EngineError> {
    let outcome: anyhow::Result<()> = async {
        let delegate = ctx.services().delegate(delegate_name)?;
        let mut delegate_execution =
            DelegateExecution::new(ctx, execution.id, execution.process_instance_id, &node.id);
        delegate.execute(&mut delegate_execution).await
    }
    .await;

    match outcome {
        Ok(()) => {
            agenda.push_back(Op::Leave {
                execution_id: execution.id,
                ignore_conditions: false,
            });
            Ok(())
        }
        Err(err) => route_error(ctx, agenda, execution, node, err).await,
    }
}

/// Route a delegate failure to a declared error boundary, or propagate it to
/// the command layer (which rolls back and, in async contexts, triggers the
/// retry policy).
async fn route_error(
    ctx: &mut CommandContext,
    agenda: &mut VecDeque<Op>,
    execution: &Execution,
    node: &FlowNode,
    err: anyhow::Error,
) -> Result<(), EngineError> {
    let code = err
        .downcast_ref::<BusinessError>()
        .map(|business| business.code.clone());
    let boundary = node
        .error_boundaries
        .iter()
        .find(|b| b.error_code.is_some() && b.error_code == code)
        .or_else(|| node.error_boundaries.iter().find(|b| b.error_code.is_none()));

    match boundary {
        Some(boundary) => {
            ctx.fire(EngineEvent::ErrorRouted {
                process_instance_id: execution.process_instance_id,
                execution_id: execution.id,
                node_id: node.id.clone(),
                error_code: code,
                target: boundary.target.clone(),
            });
            agenda.push_back(Op::Enter {
                execution_id: execution.id,
                node_id: boundary.target.clone(),
                skip_async: false,
            });
            Ok(())
        }
        None => Err(EngineError::Handler(err)),
    }
}

// ─── Node exit ────────────────────────────────────────────────

async fn leave(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    agenda: &mut VecDeque<Op>,
    execution_id: ExecutionId,
    ignore_conditions: bool,
) -> Result<(), EngineError> {
    let Some(execution) = ctx.try_execution(&execution_id).await? else {
        debug!(%execution_id, "leave on deleted execution, skipping");
        return Ok(());
    };
    let Some(node_id) = execution.current_node_id.clone() else {
        return Ok(());
    };
    let node = def.node(&node_id)?;

    // Outstanding boundary timers die with the activity.
    let jobs = ctx.jobs_of_execution(execution_id).await?;
    for job in jobs {
        if job.job_type == JobType::Boundary
            && job.handler_config.get("node").and_then(|v| v.as_str()) == Some(node.id.as_str())
        {
            JobManager::cancel(ctx, job.id).await?;
        }
    }

    ctx.fire(EngineEvent::ActivityCompleted {
        process_instance_id: execution.process_instance_id,
        execution_id,
        node: FlowNodeRef::from(node),
    });

    if node.outgoing.is_empty() {
        agenda.push_back(Op::End { execution_id });
        return Ok(());
    }

    let variables = ctx.scope_variables(&execution_id).await?;
    let passes = |t: &Transition| {
        ignore_conditions
            || t.condition
                .as_ref()
                .is_none_or(|condition| condition.evaluate(&variables))
    };

    if node.kind == NodeKind::ExclusiveGateway {
        let transition = node
            .outgoing
            .iter()
            .find(|t| passes(t))
            .ok_or_else(|| EngineError::NoTransition {
                node: node.id.clone(),
            })?;
        agenda.push_back(Op::Take {
            execution_id,
            transition: transition.clone(),
        });
        return Ok(());
    }

    let matched: Vec<&Transition> = node.outgoing.iter().filter(|t| passes(t)).collect();
    if matched.is_empty() {
        return Err(EngineError::NoTransition {
            node: node.id.clone(),
        });
    }

    if node.outgoing.len() == 1 {
        agenda.push_back(Op::Take {
            execution_id,
            transition: matched[0].clone(),
        });
        return Ok(());
    }

    // Fork: the current execution becomes an inactive scope parent; each
    // selected transition gets its own concurrent child, created only after
    // its condition passed.
    let mut parent = execution;
    parent.is_active = false;
    parent.is_scope = true;
    parent.current_node_id = None;
    for transition in matched {
        let child = Execution::new_child(&parent, ctx.now());
        parent.child_ids.push(child.id);
        let child_id = child.id;
        ctx.insert_execution(child);
        agenda.push_back(Op::Take {
            execution_id: child_id,
            transition: transition.clone(),
        });
    }
    ctx.update_execution(parent);
    Ok(())
}

async fn take(
    ctx: &mut CommandContext,
    def: &ProcessDefinition,
    agenda: &mut VecDeque<Op>,
    execution_id: ExecutionId,
    transition: &Transition,
) -> Result<(), EngineError> {
    let Some(execution) = ctx.try_execution(&execution_id).await? else {
        debug!(%execution_id, transition = %transition.id, "take on deleted execution, skipping");
        return Ok(());
    };
    if !execution.is_active {
        debug!(%execution_id, transition = %transition.id, "take on inactive execution, skipping");
        return Ok(());
    }
    let source = def.node(&transition.source)?;
    let target = def.node(&transition.target)?;
    ctx.fire(EngineEvent::SequenceFlowTaken {
        process_instance_id: execution.process_instance_id,
        execution_id,
        transition_id: transition.id.clone(),
        source: FlowNodeRef::from(source),
        target: FlowNodeRef::from(target),
    });
    agenda.push_back(Op::Enter {
        execution_id,
        node_id: transition.target.clone(),
        skip_async: false,
    });
    Ok(())
}

// ─── Join ─────────────────────────────────────────────────────

/// Park the arriving token at the join; when the expected number of siblings
/// has arrived, collapse them into the parent scope and continue from the
/// gateway with the parent.
async fn join_arrive(
    ctx: &mut CommandContext,
    agenda: &mut VecDeque<Op>,
    mut execution: Execution,
    node: &FlowNode,
) -> Result<(), EngineError> {
    execution.is_active = false;
    let parent_id = execution.parent_id;
    ctx.update_execution(execution);

    // A lone non-concurrent token at a multi-incoming join waits forever;
    // only sibling arrival accounting can release it.
    let Some(parent_id) = parent_id else {
        return Ok(());
    };

    let siblings = ctx.children_of(parent_id).await?;
    let arrived: Vec<&Execution> = siblings
        .iter()
        .filter(|sibling| {
            !sibling.is_active && sibling.current_node_id.as_deref() == Some(node.id.as_str())
        })
        .collect();
    if (arrived.len() as u32) < node.incoming_count {
        return Ok(());
    }

    let arrived_ids: Vec<ExecutionId> = arrived.iter().map(|e| e.id).collect();
    let mut parent = ctx.execution(&parent_id).await?;
    for id in &arrived_ids {
        let jobs = ctx.jobs_of_execution(*id).await?;
        for job in jobs {
            JobManager::cancel(ctx, job.id).await?;
        }
        parent.child_ids.retain(|child| child != id);
        ctx.delete_execution(id).await?;
    }
    parent.is_active = true;
    parent.current_node_id = Some(node.id.clone());
    ctx.update_execution(parent);

    agenda.push_back(Op::Leave {
        execution_id: parent_id,
        ignore_conditions: true,
    });
    Ok(())
}

// ─── Termination ──────────────────────────────────────────────

/// End an execution. With live children it parks as an inactive scope; the
/// last child to end re-triggers it. Ending the root completes the process
/// instance; jobs referencing an ended execution are cancelled with it.
async fn end(
    ctx: &mut CommandContext,
    _def: &ProcessDefinition,
    agenda: &mut VecDeque<Op>,
    execution_id: ExecutionId,
) -> Result<(), EngineError> {
    let Some(execution) = ctx.try_execution(&execution_id).await? else {
        return Ok(());
    };

    if !execution.child_ids.is_empty() {
        let mut scope = execution;
        scope.is_active = false;
        scope.current_node_id = None;
        ctx.update_execution(scope);
        return Ok(());
    }

    let jobs = ctx.jobs_of_execution(execution_id).await?;
    for job in jobs {
        JobManager::cancel(ctx, job.id).await?;
    }

    let parent_id = execution.parent_id;
    let process_instance_id = execution.process_instance_id;
    ctx.delete_execution(&execution_id).await?;

    match parent_id {
        Some(parent_id) => {
            if let Some(mut parent) = ctx.try_execution(&parent_id).await? {
                parent.child_ids.retain(|child| child != &execution_id);
                let resume = !parent.is_active
                    && parent.current_node_id.is_none()
                    && parent.child_ids.is_empty();
                ctx.update_execution(parent);
                if resume {
                    agenda.push_back(Op::End {
                        execution_id: parent_id,
                    });
                }
            }
        }
        None => {
            ctx.fire(EngineEvent::ProcessCompleted {
                process_instance_id,
            });
        }
    }
    Ok(())
}
