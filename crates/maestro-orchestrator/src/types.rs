use chrono::{DateTime, Utc};
use maestro_core::{duration_ms_opt, Priority, ResourceRequest, ResourceSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Status of a task inside a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started, or waiting for a retry.
    Waiting,
    /// Dispatched to an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with no retries left.
    Failed,
    /// A dependency failed; the task can never run.
    Skipped,
    /// Cut short by workflow cancellation or timeout.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will not change state again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Waiting | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet executing.
    Pending,
    /// Being driven by the scheduler.
    Running,
    /// Every task completed.
    Completed,
    /// A task failed, the run timed out or deadlocked.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Declarative description of one task, as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within the workflow.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Agent type that executes the task.
    pub capability_type: String,
    /// Optional capability the chosen agent must also advertise.
    #[serde(default)]
    pub capability: Option<String>,
    /// Handed to the agent's `execute`.
    #[serde(default)]
    pub parameters: Value,
    /// Higher priority tasks are dispatched first.
    #[serde(default)]
    pub priority: Priority,
    /// Limit on one execution.
    #[serde(default, with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Retries allowed after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Capacity held while the task executes.
    #[serde(default)]
    pub resource_request: Option<ResourceRequest>,
    /// Inline dependency ids, merged with the workflow's edge list.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Planner estimate in seconds.
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
}

impl TaskDefinition {
    /// Task executed by an agent of `capability_type`, with three retries.
    pub fn new(id: impl Into<String>, capability_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capability_type: capability_type.into(),
            capability: None,
            parameters: Value::Null,
            priority: Priority::Normal,
            timeout: None,
            max_retries: default_max_retries(),
            resource_request: None,
            depends_on: Vec::new(),
            estimated_duration_secs: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Require an agent advertising `capability`.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Set the execution parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Limit each execution to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many retries are allowed.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Request capacity for every execution of this task.
    pub fn with_resources(mut self, resources: Vec<ResourceSpec>) -> Self {
        self.resource_request = Some(ResourceRequest::new(self.id.clone(), resources));
        self
    }

    /// Add an inline dependency.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    /// Set the planner estimate in seconds.
    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }
}

/// `task` cannot start before `depends_on` has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Dependent task id.
    pub task: String,
    /// Prerequisite task id.
    pub depends_on: String,
}

/// Declarative description of a workflow: tasks, edges and execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Tasks in submission order.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Dependency edges, merged with inline `depends_on` ids.
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// Falls back to the engine default when absent.
    #[serde(default)]
    pub max_parallel_tasks: Option<usize>,
    /// Limit on the whole run.
    #[serde(default, with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Caller-defined data carried with the workflow.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Empty workflow definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            dependencies: Vec::new(),
            max_parallel_tasks: None,
            timeout: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a task.
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add an edge: `task` waits for `depends_on`.
    pub fn with_dependency(mut self, task: impl Into<String>, depends_on: impl Into<String>) -> Self {
        self.dependencies.push(DependencyEdge {
            task: task.into(),
            depends_on: depends_on.into(),
        });
        self
    }

    /// Limit how many tasks run at the same time.
    pub fn with_max_parallel(mut self, max_parallel_tasks: usize) -> Self {
        self.max_parallel_tasks = Some(max_parallel_tasks);
        self
    }

    /// Limit the whole run to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A task owned by a workflow, with its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Agent type that executes the task.
    pub capability_type: String,
    /// Capability the agent must also advertise.
    pub capability: Option<String>,
    /// Parameters for the agent.
    pub parameters: Value,
    /// Deduplicated dependency ids in declaration order.
    pub dependencies: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Dispatch priority.
    pub priority: Priority,
    /// Limit on one execution.
    #[serde(with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Retries used so far.
    pub retry_count: u32,
    /// Retries allowed.
    pub max_retries: u32,
    /// Capacity held while executing.
    pub resource_request: Option<ResourceRequest>,
    /// Planner estimate in seconds.
    pub estimated_duration_secs: Option<f64>,
    /// Number of dispatches, including retries.
    pub attempts: u32,
    /// Agent of the latest attempt.
    pub agent_id: Option<String>,
    /// Output of the successful execution.
    pub result: Option<Value>,
    /// Latest error message.
    pub error: Option<String>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion index, the tie-breaker among equal priorities.
    pub seq: usize,
}

impl Task {
    pub(crate) fn from_definition(def: TaskDefinition, dependencies: Vec<String>, seq: usize) -> Self {
        let resource_request = def.resource_request.map(|mut request| {
            if request.requester_id.is_empty() {
                request.requester_id = def.id.clone();
            }
            request
        });
        Self {
            name: if def.name.is_empty() {
                def.id.clone()
            } else {
                def.name
            },
            id: def.id,
            capability_type: def.capability_type,
            capability: def.capability,
            parameters: def.parameters,
            dependencies,
            status: TaskStatus::Waiting,
            priority: def.priority,
            timeout: def.timeout,
            retry_count: 0,
            max_retries: def.max_retries,
            resource_request,
            estimated_duration_secs: def.estimated_duration_secs,
            attempts: 0,
            agent_id: None,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            seq,
        }
    }

    /// Whether the task is waiting and every dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<&str>) -> bool {
        self.status == TaskStatus::Waiting
            && self
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
    }

    /// Summed demand of the task's resource request, keyed by type.
    pub fn demand(&self) -> std::collections::BTreeMap<maestro_core::ResourceType, f64> {
        let mut demand = std::collections::BTreeMap::new();
        if let Some(request) = &self.resource_request {
            for spec in &request.resources {
                *demand.entry(spec.resource_type).or_insert(0.0) += spec.amount;
            }
        }
        demand
    }

    /// Caller-facing view of the task.
    pub fn report(&self) -> TaskReport {
        TaskReport {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            attempts: self.attempts,
            agent_id: self.agent_id.clone(),
            error: self.error.clone(),
            result: self.result.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// A DAG of tasks plus its execution policy and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id.
    pub id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Tasks by id.
    pub tasks: HashMap<String, Task>,
    /// Task ids in insertion order.
    pub order: Vec<String>,
    /// Limit on concurrently executing tasks.
    pub max_parallel_tasks: usize,
    /// Limit on the whole run.
    #[serde(with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Current status.
    pub status: WorkflowStatus,
    /// Why the workflow ended the way it did, when not a plain success.
    pub terminal_reason: Option<String>,
    /// Execution plan attached at creation.
    pub plan_id: Option<Uuid>,
    /// Caller-defined data.
    pub metadata: HashMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Look up a task.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Tasks in insertion order.
    pub fn tasks_in_order(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Number of tasks with `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Ids of completed tasks.
    pub fn completed_ids(&self) -> HashSet<&str> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Ready task ids, highest priority first, insertion order among equals.
    pub fn ready_ids(&self) -> Vec<String> {
        let completed = self.completed_ids();
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.is_ready(&completed))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Whether every task is terminal.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Share of tasks in a terminal state, `1.0` for an empty workflow.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let done = self.tasks.values().filter(|t| t.status.is_terminal()).count();
        done as f64 / self.tasks.len() as f64
    }

    /// Every task that transitively depends on `task_id`, in insertion order.
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([task_id]);
        while let Some(current) = queue.pop_front() {
            for task in self.tasks.values() {
                if task.dependencies.iter().any(|d| d == current) && reached.insert(&task.id) {
                    queue.push_back(&task.id);
                }
            }
        }
        self.order
            .iter()
            .filter(|id| reached.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Progress counters.
    pub fn metrics(&self) -> WorkflowMetrics {
        WorkflowMetrics {
            workflow_id: self.id,
            name: self.name.clone(),
            status: self.status,
            progress: self.progress(),
            total_tasks: self.tasks.len(),
            running_tasks: self.count(TaskStatus::Running),
            completed_tasks: self.count(TaskStatus::Completed),
            failed_tasks: self.count(TaskStatus::Failed),
        }
    }

    /// Full status report.
    pub fn report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id,
            name: self.name.clone(),
            status: self.status,
            terminal_reason: self.terminal_reason.clone(),
            progress: self.progress(),
            plan_id: self.plan_id,
            tasks: self.tasks_in_order().map(Task::report).collect(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Caller-facing view of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
    /// Retries used.
    pub retry_count: u32,
    /// Retries allowed.
    pub max_retries: u32,
    /// Dispatches, including retries.
    pub attempts: u32,
    /// Agent of the latest attempt.
    pub agent_id: Option<String>,
    /// Latest error message.
    pub error: Option<String>,
    /// Output of the successful execution.
    pub result: Option<Value>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queryable outcome of a workflow: status, terminal reason and per-task detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Why the workflow did not complete, if it did not.
    pub terminal_reason: Option<String>,
    /// Share of terminal tasks.
    pub progress: f64,
    /// Attached execution plan.
    pub plan_id: Option<Uuid>,
    /// Per-task detail in insertion order.
    pub tasks: Vec<TaskReport>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStatusReport {
    /// Report for one task.
    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

/// Periodic monitoring record for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Share of terminal tasks.
    pub progress: f64,
    /// Number of tasks.
    pub total_tasks: usize,
    /// Tasks executing.
    pub running_tasks: usize,
    /// Tasks completed.
    pub completed_tasks: usize,
    /// Tasks failed.
    pub failed_tasks: usize,
}

/// Lifecycle notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Execution began.
    WorkflowStarted {
        /// Workflow id.
        workflow_id: Uuid,
    },
    /// A task was dispatched to an agent.
    TaskStarted {
        /// Workflow id.
        workflow_id: Uuid,
        /// Task id.
        task_id: String,
        /// Agent executing the task.
        agent_id: String,
        /// Dispatch count, starting at 1.
        attempt: u32,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// Workflow id.
        workflow_id: Uuid,
        /// Task id.
        task_id: String,
        /// Execution time.
        duration_ms: u64,
    },
    /// A task failed and will be retried after a delay.
    TaskRetrying {
        /// Workflow id.
        workflow_id: Uuid,
        /// Task id.
        task_id: String,
        /// Retries used, this one included.
        retry_count: u32,
        /// Backoff before the next dispatch.
        delay_ms: u64,
        /// Error of the failed attempt.
        error: String,
    },
    /// A task failed with no retries left.
    TaskFailed {
        /// Workflow id.
        workflow_id: Uuid,
        /// Task id.
        task_id: String,
        /// Final error.
        error: String,
    },
    /// A task will never run because a prerequisite failed.
    TaskSkipped {
        /// Workflow id.
        workflow_id: Uuid,
        /// Skipped task id.
        task_id: String,
        /// The failed task it depended on.
        failed_dependency: String,
    },
    /// The circuit breaker for the task's agent type refused a dispatch.
    DispatchRefused {
        /// Workflow id.
        workflow_id: Uuid,
        /// Task id.
        task_id: String,
        /// Agent type whose breaker is open.
        agent_type: String,
    },
    /// The workflow reached a terminal state.
    WorkflowFinished {
        /// Workflow id.
        workflow_id: Uuid,
        /// Final status.
        status: WorkflowStatus,
        /// Terminal reason, if not a plain success.
        reason: Option<String>,
    },
}

impl EngineEvent {
    /// Workflow the event belongs to.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            EngineEvent::WorkflowStarted { workflow_id }
            | EngineEvent::TaskStarted { workflow_id, .. }
            | EngineEvent::TaskCompleted { workflow_id, .. }
            | EngineEvent::TaskRetrying { workflow_id, .. }
            | EngineEvent::TaskFailed { workflow_id, .. }
            | EngineEvent::TaskSkipped { workflow_id, .. }
            | EngineEvent::DispatchRefused { workflow_id, .. }
            | EngineEvent::WorkflowFinished { workflow_id, .. } => *workflow_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn workflow(defs: Vec<(TaskDefinition, Vec<&str>)>) -> Workflow {
        let mut tasks = HashMap::new();
        let mut order = Vec::new();
        for (seq, (def, deps)) in defs.into_iter().enumerate() {
            order.push(def.id.clone());
            let deps = deps.into_iter().map(String::from).collect();
            let task = Task::from_definition(def, deps, seq);
            tasks.insert(task.id.clone(), task);
        }
        Workflow {
            id: Uuid::new_v4(),
            name: "wf".into(),
            description: String::new(),
            tasks,
            order,
            max_parallel_tasks: 4,
            timeout: None,
            status: WorkflowStatus::Pending,
            terminal_reason: None,
            plan_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_ready_set_sorted_by_priority_then_insertion() {
        let wf = workflow(vec![
            (TaskDefinition::new("a", "coder"), vec![]),
            (TaskDefinition::new("b", "coder").with_priority(Priority::High), vec![]),
            (TaskDefinition::new("c", "coder"), vec![]),
            (TaskDefinition::new("d", "coder"), vec!["a"]),
        ]);
        assert_eq!(wf.ready_ids(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dependency_must_be_completed() {
        let mut wf = workflow(vec![
            (TaskDefinition::new("a", "coder"), vec![]),
            (TaskDefinition::new("b", "coder"), vec!["a"]),
        ]);
        wf.tasks.get_mut("a").unwrap().status = TaskStatus::Running;
        assert!(wf.ready_ids().is_empty());
        wf.tasks.get_mut("a").unwrap().status = TaskStatus::Completed;
        assert_eq!(wf.ready_ids(), vec!["b"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let wf = workflow(vec![
            (TaskDefinition::new("a", "x"), vec![]),
            (TaskDefinition::new("b", "x"), vec!["a"]),
            (TaskDefinition::new("c", "x"), vec!["b"]),
            (TaskDefinition::new("d", "x"), vec![]),
        ]);
        assert_eq!(wf.dependents_of("a"), vec!["b", "c"]);
        assert!(wf.dependents_of("d").is_empty());
    }

    #[test]
    fn test_progress_and_metrics() {
        let mut wf = workflow(vec![
            (TaskDefinition::new("a", "x"), vec![]),
            (TaskDefinition::new("b", "x"), vec![]),
        ]);
        wf.tasks.get_mut("a").unwrap().status = TaskStatus::Failed;
        let metrics = wf.metrics();
        assert_eq!(metrics.failed_tasks, 1);
        assert!((metrics.progress - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resource_request_requester_defaults_to_task() {
        let def: TaskDefinition = serde_json::from_value(serde_json::json!({
            "id": "train",
            "capability_type": "ml",
            "resource_request": { "resources": [{ "type": "gpu", "amount": 1.0 }] }
        }))
        .unwrap();
        assert_eq!(def.max_retries, 3);
        let task = Task::from_definition(def, vec![], 0);
        assert_eq!(task.resource_request.unwrap().requester_id, "train");
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = EngineEvent::WorkflowStarted {
            workflow_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "workflow_started");
    }
}
