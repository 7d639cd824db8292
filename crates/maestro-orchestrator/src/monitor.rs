use crate::engine::WorkflowEngine;
use crate::reliability::{CircuitBreakerStats, CircuitState};
use crate::types::{WorkflowMetrics, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_bus::{BusMetrics, MessageBus};
use maestro_core::MaestroResult;
use maestro_registry::{AgentMetrics, AgentStatus};
use maestro_resources::ResourceMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Roll-up counters across every subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Workflows known to the engine.
    pub workflows_total: usize,
    /// Workflows executing.
    pub workflows_running: usize,
    /// Workflows that completed.
    pub workflows_completed: usize,
    /// Workflows that failed.
    pub workflows_failed: usize,
    /// Tasks executing across all workflows.
    pub tasks_running: usize,
    /// Tasks that failed terminally.
    pub tasks_failed: usize,
    /// Registered agents.
    pub agents_total: usize,
    /// Agents executing a task.
    pub agents_busy: usize,
    /// Agents offline or in error.
    pub agents_unavailable: usize,
    /// Breakers currently open.
    pub open_circuits: usize,
}

/// Point-in-time view handed to the external observability collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Per-workflow progress.
    pub workflows: Vec<WorkflowMetrics>,
    /// Per-agent metrics.
    pub agents: Vec<AgentMetrics>,
    /// Resource ledger figures.
    pub resources: ResourceMetrics,
    /// Bus counters, when a bus is attached.
    pub bus: Option<BusMetrics>,
    /// Breaker stats by agent type.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    /// Roll-up counters.
    pub aggregate: AggregateMetrics,
}

/// Destination for periodic snapshots.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Deliver one snapshot.
    async fn publish(&self, snapshot: &MonitoringSnapshot) -> MaestroResult<()>;
}

/// Sink that writes a one-line summary through `tracing`.
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn publish(&self, snapshot: &MonitoringSnapshot) -> MaestroResult<()> {
        let a = &snapshot.aggregate;
        info!(
            workflows_running = a.workflows_running,
            tasks_running = a.tasks_running,
            agents_busy = a.agents_busy,
            active_allocations = snapshot.resources.active_allocations,
            open_circuits = a.open_circuits,
            "Orchestrator metrics"
        );
        Ok(())
    }
}

/// Collects workflow, agent, resource and bus metrics into snapshots.
pub struct OrchestrationMonitor {
    engine: Arc<WorkflowEngine>,
    bus: Option<Arc<MessageBus>>,
}

impl OrchestrationMonitor {
    /// Monitor over an engine and its collaborators.
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine, bus: None }
    }

    /// Include bus counters in snapshots.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Collect a snapshot from every subsystem.
    pub async fn snapshot(&self) -> MonitoringSnapshot {
        let workflows = self.engine.list_workflows();
        let agents = self.engine.registry().agent_metrics();
        let resources = self.engine.resources().metrics().await;
        let bus = self.bus.as_ref().map(|b| b.metrics());
        let circuit_breakers = self.engine.circuit_breakers().stats();

        let count = |status: WorkflowStatus| workflows.iter().filter(|w| w.status == status).count();
        let aggregate = AggregateMetrics {
            workflows_total: workflows.len(),
            workflows_running: count(WorkflowStatus::Running),
            workflows_completed: count(WorkflowStatus::Completed),
            workflows_failed: count(WorkflowStatus::Failed),
            tasks_running: workflows.iter().map(|w| w.running_tasks).sum(),
            tasks_failed: workflows.iter().map(|w| w.failed_tasks).sum(),
            agents_total: agents.len(),
            agents_busy: agents.iter().filter(|a| a.status == AgentStatus::Busy).count(),
            agents_unavailable: agents
                .iter()
                .filter(|a| matches!(a.status, AgentStatus::Offline | AgentStatus::Error))
                .count(),
            open_circuits: circuit_breakers
                .values()
                .filter(|s| s.state != CircuitState::Closed)
                .count(),
        };

        MonitoringSnapshot {
            timestamp: Utc::now(),
            workflows,
            agents,
            resources,
            bus,
            circuit_breakers,
            aggregate,
        }
    }

    /// Serialize the current state as JSON (for dashboards).
    pub async fn to_json(&self) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        serde_json::json!({
            "timestamp": snapshot.timestamp,
            "workflows": snapshot.workflows,
            "agents": snapshot.agents,
            "resources": snapshot.resources,
            "bus": snapshot.bus,
            "circuit_breakers": snapshot.circuit_breakers,
            "aggregate": snapshot.aggregate,
        })
    }

    /// Publish a snapshot to `sink` every `interval` until aborted.
    pub fn spawn_reporter(self: Arc<Self>, sink: Arc<dyn MetricsSink>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = self.snapshot().await;
                if let Err(e) = sink.publish(&snapshot).await {
                    warn!(error = %e, "Metrics sink rejected snapshot");
                }
            }
        })
    }
}
