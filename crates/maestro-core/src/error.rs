use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro orchestration core.
///
/// Variants follow the orchestration failure taxonomy: some are fatal for the
/// workflow that raised them (cycles, deadlocks), most are recoverable and are
/// retried by the scheduling loop. See [`MaestroError::is_recoverable`].
#[derive(Error, Debug)]
pub enum MaestroError {
    /// The task dependency relation contains a cycle.
    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Task ids along the detected cycle, first id repeated at the end.
        cycle: Vec<String>,
    },

    /// A referenced entity (workflow, task, node, plan, agent) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The concurrent workflow limit is reached; the caller should retry later.
    #[error("Capacity exceeded: {active} of {max} concurrent workflows active")]
    CapacityExceeded {
        /// Workflows currently running.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No node combination could satisfy a resource request.
    #[error("Resource allocation failed: {0}")]
    ResourceAllocationFailed(String),

    /// An agent reported an error while executing a task.
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// A task exceeded its own timeout.
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that timed out.
        task_id: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// Unterminated tasks remain but nothing is running or ready.
    #[error("Deadlock: {} task(s) can never become ready: {}", blocked.len(), blocked.join(", "))]
    Deadlock {
        /// Ids of the tasks that are stuck.
        blocked: Vec<String>,
    },

    /// The circuit breaker for an agent type refused the dispatch.
    #[error("Circuit open for agent type '{agent_type}'")]
    CircuitOpen {
        /// Agent type guarded by the breaker.
        agent_type: String,
    },

    /// A message outlived its TTL before delivery.
    #[error("Message {0} expired")]
    MessageExpired(Uuid),

    /// A message could not be routed to any queue.
    #[error("Message undeliverable: {0}")]
    MessageUndeliverable(String),

    /// A workflow definition is malformed (duplicate ids, unknown dependencies, ...).
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A resource node cannot be removed while allocations are outstanding.
    #[error("Node '{node_id}' still holds {allocations} active allocation(s)")]
    NodeInUse {
        /// The node being unregistered.
        node_id: String,
        /// Number of outstanding allocations.
        allocations: usize,
    },

    /// The workflow-level timeout elapsed.
    #[error("Workflow {workflow_id} timed out after {timeout_ms}ms")]
    WorkflowTimeout {
        /// The workflow that timed out.
        workflow_id: Uuid,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Whether the scheduling loop may transparently retry after this error.
    ///
    /// Cycles and deadlocks signal a broken graph invariant and abort the
    /// workflow; everything else is handled by retry, backoff or waiting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MaestroError::CapacityExceeded { .. }
                | MaestroError::ResourceAllocationFailed(_)
                | MaestroError::TaskExecutionFailed(_)
                | MaestroError::TaskTimeout { .. }
                | MaestroError::CircuitOpen { .. }
        )
    }
}
