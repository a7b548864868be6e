//! procflow-core
//!
//! A process-instance runtime: a token interpreter over a parsed process
//! graph, an asynchronous job subsystem with locking, retry, and dead-letter
//! semantics, and a bounded definition cache — all behind a command layer
//! that commits or rolls back each mutating operation as one unit of work
//! against an abstract transactional store.
//!
//! The crate is storage-agnostic: [`MemoryStore`] is the built-in backend,
//! anything else plugs in behind [`EngineStore`]. Time flows through
//! [`EngineClock`], so schedules are deterministic under test.

pub mod cache;
pub mod clock;
pub mod command;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod handlers;
mod interpreter;
pub mod job;
pub mod job_manager;
pub mod store;
pub mod store_memory;
pub mod types;

pub use cache::DefinitionCache;
pub use clock::{EngineClock, SystemClock, TestClock};
pub use command::{CommandContext, EngineServices};
pub use deployment::{DefinitionParser, DeploymentBuilder, JsonDefinitionParser};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{BusinessError, EngineError};
pub use events::{EngineEvent, EngineEventListener, EventDispatcher, FlowNodeRef};
pub use execution::Execution;
pub use executor::{JobExecutor, JobExecutorConfig};
pub use graph::{
    BoundaryTimer, Condition, CycleSpec, DefinitionModel, ErrorBoundary, FlowNode, NodeKind,
    ProcessBuilder, ProcessDefinition, Transition,
};
pub use handlers::{
    DelegateExecution, JobHandler, TaskDelegate, ASYNC_CONTINUATION, BOUNDARY_TIMER, TIMER_FIRE,
};
pub use job::{Job, JobType, RepeatSpec};
pub use job_manager::JobManager;
pub use store::{
    ChangeSet, DefinitionRecord, Deployment, EngineStore, ExecutionQuery, JobOrder, JobQuery,
};
pub use store_memory::MemoryStore;
pub use types::{ExecutionId, JobId, Value};
