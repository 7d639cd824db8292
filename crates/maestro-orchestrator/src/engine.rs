use crate::reliability::{CircuitBreakerRegistry, RetryPolicy};
use crate::types::{
    EngineEvent, Task, TaskStatus, Workflow, WorkflowDefinition, WorkflowMetrics,
    WorkflowStatus, WorkflowStatusReport,
};
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult, ResourceType};
use maestro_planner::{find_cycle, ExecutionPlanner, TaskEstimate};
use maestro_registry::{AgentRegistry, TaskOutcome};
use maestro_resources::{ResourceAllocation, ResourceManager};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::{Id as DriverId, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workflows allowed to run at the same time.
    pub max_concurrent_workflows: usize,
    /// Parallelism for workflows that do not set their own.
    pub default_max_parallel_tasks: usize,
    /// Upper bound on how long the scheduler sleeps between ticks.
    #[serde(with = "maestro_core::duration_ms")]
    pub poll_interval: Duration,
    /// Buffer of the engine event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            default_max_parallel_tasks: 4,
            poll_interval: Duration::from_millis(50),
            event_capacity: 1024,
        }
    }
}

/// How a scheduling loop ended.
enum LoopExit {
    Finished,
    Cancelled,
    TimedOut,
    Deadlock(Vec<String>),
}

/// Result of one dispatched execution.
struct TaskRun {
    task_id: String,
    result: MaestroResult<Value>,
    elapsed: Duration,
}

/// Bookkeeping for an execution that is in flight.
struct InFlight {
    agent_id: String,
    agent_type: String,
    allocations: Vec<ResourceAllocation>,
    started: Instant,
}

/// Per-run scheduler state; never shared outside `execute_workflow`.
#[derive(Default)]
struct RunState {
    join_set: JoinSet<TaskRun>,
    in_flight: HashMap<String, InFlight>,
    /// Task id behind each spawned driver, for drivers that die without a result.
    drivers: HashMap<DriverId, String>,
    /// Earliest instant a retried task may be dispatched again.
    not_before: HashMap<String, Instant>,
    /// Agents that already failed a task.
    failed_agents: HashMap<String, HashSet<String>>,
    /// Tasks currently held back by an open breaker, reported once.
    refused: HashSet<String>,
    usage: BTreeMap<ResourceType, f64>,
    cost: f64,
}

/// Aborts the wrapped task when dropped, so cancelling the wrapper cancels the agent call.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The orchestrator proper.
///
/// Validates workflows, attaches an execution plan, and drives each workflow
/// through a single scheduling loop that fans out task executions to agents
/// from the [`AgentRegistry`], backed by allocations from the
/// [`ResourceManager`]. Collaborators are injected at construction.
pub struct WorkflowEngine {
    config: EngineConfig,
    retry_policy: RetryPolicy,
    registry: Arc<AgentRegistry>,
    resources: Arc<ResourceManager>,
    planner: Arc<ExecutionPlanner>,
    breakers: Arc<CircuitBreakerRegistry>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    /// Cancellation handles of running workflows. Lock before `workflows`.
    active: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl WorkflowEngine {
    /// Create an engine over injected collaborators with the default retry policy and breakers.
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        resources: Arc<ResourceManager>,
        planner: Arc<ExecutionPlanner>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            retry_policy: RetryPolicy::default(),
            registry,
            resources,
            planner,
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            workflows: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Share a breaker registry, for example with monitoring.
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get a reference to the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Get a reference to the circuit breakers.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Get a reference to the agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Get a reference to the resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Get a reference to the planner.
    pub fn planner(&self) -> &Arc<ExecutionPlanner> {
        &self.planner
    }

    /// Receive engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Validate a definition, attach an execution plan and store it as `pending`.
    ///
    /// Nothing is stored when validation or the cycle check fails.
    pub fn create_workflow(&self, definition: WorkflowDefinition) -> MaestroResult<Uuid> {
        let WorkflowDefinition {
            name,
            description,
            tasks: definitions,
            dependencies: edges,
            max_parallel_tasks,
            timeout,
            metadata,
        } = definition;

        let mut known: HashSet<&str> = HashSet::new();
        for def in &definitions {
            if def.id.trim().is_empty() {
                return Err(MaestroError::InvalidWorkflow("task with an empty id".into()));
            }
            if def.capability_type.trim().is_empty() {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "task '{}' has no capability type",
                    def.id
                )));
            }
            if !known.insert(def.id.as_str()) {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "duplicate task id '{}'",
                    def.id
                )));
            }
        }

        let mut dependencies: HashMap<String, Vec<String>> = definitions
            .iter()
            .map(|def| (def.id.clone(), Vec::new()))
            .collect();
        let inline = definitions
            .iter()
            .flat_map(|def| def.depends_on.iter().map(move |dep| (def.id.as_str(), dep.as_str())));
        let listed = edges.iter().map(|e| (e.task.as_str(), e.depends_on.as_str()));
        for (task, dep) in inline.chain(listed) {
            if !known.contains(task) {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "dependency edge references unknown task '{task}'"
                )));
            }
            if !known.contains(dep) {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "task '{task}' depends on unknown task '{dep}'"
                )));
            }
            if task == dep {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "task '{task}' depends on itself"
                )));
            }
            if let Some(deps) = dependencies.get_mut(task) {
                if !deps.iter().any(|d| d == dep) {
                    deps.push(dep.to_string());
                }
            }
        }

        let graph: HashMap<&str, Vec<&str>> = dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        if let Some(cycle) = find_cycle(definitions.iter().map(|d| d.id.as_str()), &graph) {
            warn!(workflow = %name, cycle = ?cycle, "Rejected cyclic workflow");
            return Err(MaestroError::CyclicDependency { cycle });
        }

        let max_parallel_tasks = max_parallel_tasks.unwrap_or(self.config.default_max_parallel_tasks);
        if max_parallel_tasks == 0 {
            return Err(MaestroError::InvalidWorkflow(
                "max_parallel_tasks must be at least 1".into(),
            ));
        }

        let order: Vec<String> = definitions.iter().map(|d| d.id.clone()).collect();
        let tasks: HashMap<String, Task> = definitions
            .into_iter()
            .enumerate()
            .map(|(seq, def)| {
                let deps = dependencies.remove(&def.id).unwrap_or_default();
                let task = Task::from_definition(def, deps, seq);
                (task.id.clone(), task)
            })
            .collect();

        let estimates: Vec<TaskEstimate> = order
            .iter()
            .filter_map(|id| tasks.get(id))
            .map(estimate_for)
            .collect();
        let plan = self.planner.create_plan(&estimates)?;

        let workflow = Workflow {
            id: Uuid::new_v4(),
            name,
            description,
            tasks,
            order,
            max_parallel_tasks,
            timeout,
            status: WorkflowStatus::Pending,
            terminal_reason: None,
            plan_id: Some(plan.id),
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = workflow.id;
        info!(
            workflow_id = %id,
            name = %workflow.name,
            tasks = workflow.tasks.len(),
            critical_path = ?plan.critical_path,
            estimated_secs = plan.total_duration,
            "Workflow created"
        );
        self.workflows.write().insert(id, workflow);
        Ok(id)
    }

    /// Create and immediately execute a workflow.
    pub async fn run_workflow(&self, definition: WorkflowDefinition) -> MaestroResult<(Uuid, bool)> {
        let id = self.create_workflow(definition)?;
        let success = self.execute_workflow(id).await?;
        Ok((id, success))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Drive a pending workflow to a terminal state.
    ///
    /// Returns `Ok(true)` when every task completed and `Ok(false)` when the
    /// workflow failed, timed out or was cancelled; the reason is available
    /// through [`WorkflowEngine::workflow_status`]. A detected deadlock is
    /// returned as [`MaestroError::Deadlock`].
    pub async fn execute_workflow(&self, workflow_id: Uuid) -> MaestroResult<bool> {
        let (cancel_rx, deadline) = self.begin(workflow_id)?;
        let started = Instant::now();
        let mut run = RunState::default();
        let exit = self.drive(workflow_id, cancel_rx, deadline, &mut run).await;
        self.finish(workflow_id, exit, started, run).await
    }

    fn begin(&self, workflow_id: Uuid) -> MaestroResult<(watch::Receiver<bool>, Option<Instant>)> {
        let mut active = self.active.lock();
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))?;
        if workflow.status != WorkflowStatus::Pending {
            return Err(MaestroError::InvalidState(format!(
                "workflow {workflow_id} is {}",
                workflow.status
            )));
        }
        if active.len() >= self.config.max_concurrent_workflows {
            return Err(MaestroError::CapacityExceeded {
                active: active.len(),
                max: self.config.max_concurrent_workflows,
            });
        }

        let (tx, rx) = watch::channel(false);
        active.insert(workflow_id, tx);
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        let deadline = workflow.timeout.map(|t| Instant::now() + t);
        info!(
            workflow_id = %workflow_id,
            name = %workflow.name,
            max_parallel = workflow.max_parallel_tasks,
            "Workflow started"
        );
        self.emit(EngineEvent::WorkflowStarted { workflow_id });
        Ok((rx, deadline))
    }

    async fn drive(
        &self,
        workflow_id: Uuid,
        mut cancel_rx: watch::Receiver<bool>,
        deadline: Option<Instant>,
        run: &mut RunState,
    ) -> LoopExit {
        loop {
            if *cancel_rx.borrow() {
                return LoopExit::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return LoopExit::TimedOut;
            }

            self.dispatch_ready(workflow_id, run).await;

            if run.in_flight.is_empty() {
                let state = self.with_workflow(workflow_id, |wf| {
                    let blocked: Vec<String> = wf
                        .tasks_in_order()
                        .filter(|t| !t.status.is_terminal())
                        .map(|t| t.id.clone())
                        .collect();
                    (blocked, wf.ready_ids().is_empty())
                });
                let Some((blocked, nothing_ready)) = state else {
                    return LoopExit::Finished;
                };
                if blocked.is_empty() {
                    return LoopExit::Finished;
                }
                if nothing_ready {
                    return LoopExit::Deadlock(blocked);
                }
            }

            let now = Instant::now();
            let mut wait = self.config.poll_interval;
            if let Some(next) = run.not_before.values().filter(|t| **t > now).min() {
                wait = wait.min(*next - now);
            }
            let until_deadline = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = run.join_set.join_next_with_id(), if !run.join_set.is_empty() => {
                    match joined {
                        Some(Ok((driver, outcome))) => {
                            run.drivers.remove(&driver);
                            self.handle_outcome(workflow_id, outcome, run).await;
                        }
                        Some(Err(e)) => self.handle_lost_driver(workflow_id, e, run).await,
                        None => {}
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        return LoopExit::Cancelled;
                    }
                }
                _ = until_deadline => {}
            }
        }
    }

    /// Start as many ready tasks as parallelism, breakers, capacity and agents allow.
    async fn dispatch_ready(&self, workflow_id: Uuid, run: &mut RunState) {
        let Some((ready, max_parallel)) =
            self.with_workflow(workflow_id, |wf| (wf.ready_ids(), wf.max_parallel_tasks))
        else {
            return;
        };
        let now = Instant::now();

        for task_id in ready {
            if run.in_flight.len() >= max_parallel {
                break;
            }
            if run.not_before.get(&task_id).is_some_and(|t| *t > now) {
                continue;
            }
            let Some(task) = self
                .with_workflow(workflow_id, |wf| wf.tasks.get(&task_id).cloned())
                .flatten()
            else {
                continue;
            };

            if !self
                .registry
                .has_capable(&task.capability_type, task.capability.as_deref())
            {
                let reason = match &task.capability {
                    Some(cap) => format!(
                        "no agent of type '{}' with capability '{cap}' is registered",
                        task.capability_type
                    ),
                    None => format!("no agent of type '{}' is registered", task.capability_type),
                };
                self.fail_task(workflow_id, &task_id, reason);
                continue;
            }

            let breaker = self.breakers.get(&task.capability_type);
            if !breaker.poll_request() {
                if run.refused.insert(task_id.clone()) {
                    breaker.record_rejection();
                    warn!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        agent_type = %task.capability_type,
                        "Circuit open, dispatch deferred"
                    );
                    self.emit(EngineEvent::DispatchRefused {
                        workflow_id,
                        task_id: task_id.clone(),
                        agent_type: task.capability_type.clone(),
                    });
                }
                continue;
            }

            let allocations = match &task.resource_request {
                Some(request) if !request.is_empty() => {
                    let mut request = request.clone();
                    request.id = Uuid::new_v4();
                    match self.resources.try_allocate(&request).await {
                        Ok(allocations) => allocations,
                        Err(e) => {
                            debug!(
                                workflow_id = %workflow_id,
                                task_id = %task_id,
                                error = %e,
                                "Resources unavailable, task keeps waiting"
                            );
                            breaker.release_trial();
                            continue;
                        }
                    }
                }
                _ => Vec::new(),
            };

            let no_exclusions = HashSet::new();
            let excluded = run.failed_agents.get(&task_id).unwrap_or(&no_exclusions);
            let capability = task.capability.as_deref();
            let agent = self
                .registry
                .acquire(&task.capability_type, capability, excluded)
                .or_else(|| {
                    if excluded.is_empty() {
                        None
                    } else {
                        self.registry
                            .acquire(&task.capability_type, capability, &no_exclusions)
                    }
                });
            let Some(agent) = agent else {
                debug!(
                    workflow_id = %workflow_id,
                    task_id = %task_id,
                    agent_type = %task.capability_type,
                    "No idle agent, task keeps waiting"
                );
                self.release_allocations(&allocations).await;
                breaker.release_trial();
                continue;
            };

            let agent_id = agent.id().to_string();
            let attempt = self
                .with_workflow_mut(workflow_id, |wf| {
                    let task = wf.tasks.get_mut(&task_id)?;
                    task.status = TaskStatus::Running;
                    task.attempts += 1;
                    task.agent_id = Some(agent_id.clone());
                    task.started_at = Some(Utc::now());
                    Some(task.attempts)
                })
                .flatten()
                .unwrap_or(1);
            run.refused.remove(&task_id);
            run.not_before.remove(&task_id);

            info!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                agent_id = %agent_id,
                attempt,
                "Task started"
            );
            self.emit(EngineEvent::TaskStarted {
                workflow_id,
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
                attempt,
            });

            let parameters = task.parameters.clone();
            let timeout = task.timeout;
            let run_id = task_id.clone();
            let driver = run.join_set.spawn(async move {
                let started = Instant::now();
                let mut call =
                    AbortOnDrop(tokio::spawn(async move { agent.execute(&parameters).await }));
                let joined = match timeout {
                    Some(limit) => tokio::time::timeout(limit, &mut call.0)
                        .await
                        .map_err(|_| limit),
                    None => Ok((&mut call.0).await),
                };
                let result = match joined {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(MaestroError::TaskExecutionFailed(format!(
                        "agent call aborted: {join_error}"
                    ))),
                    Err(limit) => Err(MaestroError::TaskTimeout {
                        task_id: run_id.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    }),
                };
                TaskRun {
                    task_id: run_id,
                    result,
                    elapsed: started.elapsed(),
                }
            });
            run.drivers.insert(driver.id(), task_id.clone());
            run.in_flight.insert(
                task_id,
                InFlight {
                    agent_id,
                    agent_type: task.capability_type,
                    allocations,
                    started: Instant::now(),
                },
            );
        }
    }

    /// A driver that panicked or was aborted counts as a failed attempt.
    async fn handle_lost_driver(&self, workflow_id: Uuid, e: JoinError, run: &mut RunState) {
        let Some(task_id) = run.drivers.remove(&e.id()) else {
            error!(workflow_id = %workflow_id, error = %e, "Unknown task driver aborted");
            return;
        };
        error!(workflow_id = %workflow_id, task_id = %task_id, error = %e, "Task driver aborted");
        let elapsed = run
            .in_flight
            .get(&task_id)
            .map_or(Duration::ZERO, |flight| flight.started.elapsed());
        let outcome = TaskRun {
            result: Err(MaestroError::TaskExecutionFailed(format!(
                "task driver aborted: {e}"
            ))),
            task_id,
            elapsed,
        };
        self.handle_outcome(workflow_id, outcome, run).await;
    }

    async fn handle_outcome(&self, workflow_id: Uuid, outcome: TaskRun, run: &mut RunState) {
        let TaskRun {
            task_id,
            result,
            elapsed,
        } = outcome;
        let Some(flight) = run.in_flight.remove(&task_id) else {
            return;
        };

        self.release_allocations(&flight.allocations).await;
        let mut nodes: Vec<&str> = flight.allocations.iter().map(|a| a.node_id.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        for node_id in nodes {
            self.resources.record_node_outcome(node_id, result.is_ok()).await;
        }

        let breaker = self.breakers.get(&flight.agent_type);
        let secs = elapsed.as_secs_f64();

        match result {
            Ok(value) => {
                self.registry
                    .complete(&flight.agent_id, TaskOutcome::success(elapsed));
                breaker.record_success();
                let demand = self
                    .with_workflow_mut(workflow_id, |wf| {
                        let task = wf.tasks.get_mut(&task_id)?;
                        task.status = TaskStatus::Completed;
                        task.result = Some(value);
                        task.error = None;
                        task.completed_at = Some(Utc::now());
                        Some((task.capability_type.clone(), task.demand()))
                    })
                    .flatten();
                if let Some((capability_type, demand)) = demand {
                    self.planner.record_execution(&capability_type, secs, &demand);
                    for (rt, amount) in &demand {
                        *run.usage.entry(*rt).or_insert(0.0) += amount;
                        run.cost += amount * self.planner.config().unit_cost(*rt) * secs;
                    }
                }
                info!(
                    workflow_id = %workflow_id,
                    task_id = %task_id,
                    agent_id = %flight.agent_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                self.emit(EngineEvent::TaskCompleted {
                    workflow_id,
                    task_id,
                    duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Err(e) => {
                self.registry
                    .complete(&flight.agent_id, TaskOutcome::failure(elapsed));
                run.failed_agents
                    .entry(task_id.clone())
                    .or_default()
                    .insert(flight.agent_id.clone());
                let message = e.to_string();
                let retry = self
                    .with_workflow_mut(workflow_id, |wf| {
                        let task = wf.tasks.get_mut(&task_id)?;
                        task.error = Some(message.clone());
                        if task.retry_count < task.max_retries {
                            task.retry_count += 1;
                            task.status = TaskStatus::Waiting;
                            Some(Some(task.retry_count))
                        } else {
                            Some(None)
                        }
                    })
                    .flatten();

                match retry {
                    Some(Some(retry_count)) => {
                        breaker.record_transient_failure();
                        let delay = self.retry_policy.delay_for(retry_count);
                        run.not_before.insert(task_id.clone(), Instant::now() + delay);
                        warn!(
                            workflow_id = %workflow_id,
                            task_id = %task_id,
                            agent_id = %flight.agent_id,
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Task failed, retrying"
                        );
                        self.emit(EngineEvent::TaskRetrying {
                            workflow_id,
                            task_id,
                            retry_count,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error: message,
                        });
                    }
                    Some(None) => {
                        breaker.record_failure();
                        self.fail_task(workflow_id, &task_id, message);
                    }
                    None => {}
                }
            }
        }
    }

    /// Mark a task failed and skip everything that depends on it.
    fn fail_task(&self, workflow_id: Uuid, task_id: &str, reason: String) {
        let skipped = self
            .with_workflow_mut(workflow_id, |wf| {
                let now = Utc::now();
                if let Some(task) = wf.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Failed;
                    task.error = Some(reason.clone());
                    task.completed_at = Some(now);
                }
                let mut skipped = Vec::new();
                for dependent in wf.dependents_of(task_id) {
                    if let Some(task) = wf.tasks.get_mut(&dependent) {
                        if task.status == TaskStatus::Waiting {
                            task.status = TaskStatus::Skipped;
                            task.error = Some(format!("dependency '{task_id}' failed"));
                            task.completed_at = Some(now);
                            skipped.push(dependent);
                        }
                    }
                }
                skipped
            })
            .unwrap_or_default();

        error!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            error = %reason,
            skipped = skipped.len(),
            "Task failed"
        );
        self.emit(EngineEvent::TaskFailed {
            workflow_id,
            task_id: task_id.to_string(),
            error: reason,
        });
        for dependent in skipped {
            self.emit(EngineEvent::TaskSkipped {
                workflow_id,
                task_id: dependent,
                failed_dependency: task_id.to_string(),
            });
        }
    }

    async fn release_allocations(&self, allocations: &[ResourceAllocation]) {
        if allocations.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = allocations.iter().map(|a| a.id).collect();
        self.resources.release_all(&ids).await;
    }

    /// Stop every in-flight execution and return its agent and allocations.
    async fn abort_in_flight(&self, workflow_id: Uuid, run: &mut RunState) {
        run.join_set.shutdown().await;
        run.drivers.clear();
        for (task_id, flight) in run.in_flight.drain() {
            self.release_allocations(&flight.allocations).await;
            self.registry.release(&flight.agent_id);
            self.breakers.get(&flight.agent_type).release_trial();
            debug!(workflow_id = %workflow_id, task_id = %task_id, "Task execution aborted");
        }
    }

    async fn finish(
        &self,
        workflow_id: Uuid,
        exit: LoopExit,
        started: Instant,
        mut run: RunState,
    ) -> MaestroResult<bool> {
        let interrupted = !matches!(exit, LoopExit::Finished);
        if interrupted {
            // Allocations go back before any task is marked terminal.
            self.abort_in_flight(workflow_id, &mut run).await;
        }

        let (status, reason) = match &exit {
            LoopExit::Finished => {
                let failed = self
                    .with_workflow(workflow_id, |wf| {
                        wf.tasks_in_order()
                            .filter(|t| t.status == TaskStatus::Failed)
                            .map(|t| t.id.clone())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if failed.is_empty() {
                    (WorkflowStatus::Completed, None)
                } else {
                    (
                        WorkflowStatus::Failed,
                        Some(format!("{} task(s) failed: {}", failed.len(), failed.join(", "))),
                    )
                }
            }
            LoopExit::Cancelled => (WorkflowStatus::Cancelled, Some("Cancelled".to_string())),
            LoopExit::TimedOut => (WorkflowStatus::Failed, Some("Timeout".to_string())),
            LoopExit::Deadlock(blocked) => (
                WorkflowStatus::Failed,
                Some(format!("Deadlock: {}", blocked.join(", "))),
            ),
        };

        let plan_id = self
            .with_workflow_mut(workflow_id, |wf| {
                let now = Utc::now();
                if interrupted {
                    for task in wf.tasks.values_mut() {
                        if !task.status.is_terminal() {
                            task.status = TaskStatus::Cancelled;
                            task.completed_at = Some(now);
                        }
                    }
                }
                // A run that ends before every task ran still completes only if all did.
                let status = if status == WorkflowStatus::Completed
                    && wf.tasks.values().any(|t| t.status != TaskStatus::Completed)
                {
                    WorkflowStatus::Failed
                } else {
                    status
                };
                wf.status = status;
                wf.terminal_reason = reason.clone();
                wf.completed_at = Some(now);
                (wf.status, wf.plan_id)
            });
        self.active.lock().remove(&workflow_id);

        let Some((status, plan_id)) = plan_id else {
            return Err(MaestroError::NotFound(format!("workflow {workflow_id}")));
        };

        let elapsed = started.elapsed().as_secs_f64();
        if let Some(plan_id) = plan_id {
            if let Err(e) =
                self.planner
                    .update_plan(plan_id, elapsed, run.cost, std::mem::take(&mut run.usage))
            {
                warn!(workflow_id = %workflow_id, error = %e, "Could not record plan feedback");
            }
        }

        match status {
            WorkflowStatus::Completed => {
                info!(workflow_id = %workflow_id, elapsed_secs = elapsed, "Workflow completed");
            }
            _ => {
                warn!(
                    workflow_id = %workflow_id,
                    status = %status,
                    reason = reason.as_deref().unwrap_or(""),
                    elapsed_secs = elapsed,
                    "Workflow did not complete"
                );
            }
        }
        self.emit(EngineEvent::WorkflowFinished {
            workflow_id,
            status,
            reason,
        });

        match exit {
            LoopExit::Deadlock(blocked) => {
                error!(workflow_id = %workflow_id, blocked = ?blocked, "Workflow deadlocked");
                Err(MaestroError::Deadlock { blocked })
            }
            _ => Ok(status == WorkflowStatus::Completed),
        }
    }

    // -----------------------------------------------------------------------
    // Control and queries
    // -----------------------------------------------------------------------

    /// Cancel a pending or running workflow.
    ///
    /// Returns `Ok(false)` if the workflow had already reached a terminal state.
    /// Running tasks are aborted and their allocations released; completed
    /// tasks are kept as they are.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> MaestroResult<bool> {
        let active = self.active.lock();
        if let Some(cancel) = active.get(&workflow_id) {
            let _ = cancel.send(true);
            info!(workflow_id = %workflow_id, "Workflow cancellation requested");
            return Ok(true);
        }

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))?;
        if workflow.status != WorkflowStatus::Pending {
            return Ok(false);
        }

        let now = Utc::now();
        for task in workflow.tasks.values_mut() {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
        }
        workflow.status = WorkflowStatus::Cancelled;
        workflow.terminal_reason = Some("Cancelled".to_string());
        workflow.completed_at = Some(now);
        info!(workflow_id = %workflow_id, "Pending workflow cancelled");
        self.emit(EngineEvent::WorkflowFinished {
            workflow_id,
            status: WorkflowStatus::Cancelled,
            reason: workflow.terminal_reason.clone(),
        });
        Ok(true)
    }

    /// Snapshot of a workflow.
    pub fn get_workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.with_workflow(workflow_id, Workflow::clone)
    }

    /// Status, terminal reason and per-task details of a workflow.
    pub fn workflow_status(&self, workflow_id: Uuid) -> MaestroResult<WorkflowStatusReport> {
        self.with_workflow(workflow_id, Workflow::report)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))
    }

    /// Progress counters of a workflow.
    pub fn workflow_metrics(&self, workflow_id: Uuid) -> MaestroResult<WorkflowMetrics> {
        self.with_workflow(workflow_id, Workflow::metrics)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))
    }

    /// Metrics for every known workflow, oldest first.
    pub fn list_workflows(&self) -> Vec<WorkflowMetrics> {
        let workflows = self.workflows.read();
        let mut all: Vec<&Workflow> = workflows.values().collect();
        all.sort_by_key(|wf| wf.created_at);
        all.into_iter().map(Workflow::metrics).collect()
    }

    /// Number of workflows currently executing.
    pub fn active_workflows(&self) -> usize {
        self.active.lock().len()
    }

    /// Drop a terminal workflow and its plan.
    pub fn remove_workflow(&self, workflow_id: Uuid) -> MaestroResult<Workflow> {
        let mut workflows = self.workflows.write();
        let status = workflows
            .get(&workflow_id)
            .map(|wf| wf.status)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))?;
        if !status.is_terminal() {
            return Err(MaestroError::InvalidState(format!(
                "workflow {workflow_id} is {status} and cannot be removed"
            )));
        }
        let workflow = workflows
            .remove(&workflow_id)
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))?;
        if let Some(plan_id) = workflow.plan_id {
            self.planner.remove_plan(plan_id);
        }
        Ok(workflow)
    }

    fn with_workflow<R>(&self, workflow_id: Uuid, f: impl FnOnce(&Workflow) -> R) -> Option<R> {
        self.workflows.read().get(&workflow_id).map(f)
    }

    fn with_workflow_mut<R>(
        &self,
        workflow_id: Uuid,
        f: impl FnOnce(&mut Workflow) -> R,
    ) -> Option<R> {
        self.workflows.write().get_mut(&workflow_id).map(f)
    }
}

fn estimate_for(task: &Task) -> TaskEstimate {
    let mut estimate = TaskEstimate::new(task.id.clone(), task.capability_type.clone())
        .with_priority(task.priority);
    estimate.dependencies = task.dependencies.clone();
    estimate.duration = task.estimated_duration_secs;
    if let Some(request) = &task.resource_request {
        estimate.resources = request.resources.clone();
    }
    estimate
}
