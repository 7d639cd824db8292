use crate::strategy::PlanningStrategy;
use chrono::{DateTime, Utc};
use maestro_core::{Priority, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Planning-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Task id.
    pub task_id: String,
    /// Capability type.
    pub capability: String,
    /// Ids of prerequisite tasks.
    pub dependencies: Vec<String>,
    /// Seconds.
    pub estimated_duration: f64,
    /// Demand per resource type.
    pub resources: BTreeMap<ResourceType, f64>,
    /// Task priority.
    pub priority: Priority,
    /// Parallel group index.
    pub level: usize,
    /// Earliest start from the forward pass.
    pub earliest_start: f64,
    /// Latest start from the backward pass.
    pub latest_start: f64,
    /// `latest_start - earliest_start`.
    pub slack: f64,
    /// On the critical path.
    pub is_critical: bool,
    /// Start under the plan's strategy; equals `earliest_start` unless leveled.
    pub scheduled_start: f64,
}

impl ExecutionStep {
    /// Scheduled start plus estimated duration.
    pub fn scheduled_finish(&self) -> f64 {
        self.scheduled_start + self.estimated_duration
    }
}

/// Observed outcome of running a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFeedback {
    /// Measured wall time in seconds.
    pub actual_duration: f64,
    /// Measured cost.
    pub actual_cost: f64,
    /// Resources consumed per type.
    pub resource_usage: BTreeMap<ResourceType, f64>,
    /// When the feedback arrived.
    pub recorded_at: DateTime<Utc>,
}

/// Schedule estimate and critical-path analysis for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan id.
    pub id: Uuid,
    /// Strategy requested by the caller.
    pub strategy: PlanningStrategy,
    /// Strategy that produced the schedule; differs from `strategy` only for adaptive plans.
    pub selected_strategy: PlanningStrategy,
    /// Steps in input order.
    pub steps: Vec<ExecutionStep>,
    /// A topological order of task ids.
    pub execution_order: Vec<String>,
    /// Kahn levels; tasks in one level may run together.
    pub parallel_groups: Vec<Vec<String>>,
    /// Zero-slack tasks in topological order.
    pub critical_path: Vec<String>,
    /// Seconds.
    pub total_duration: f64,
    /// Estimated cost from unit costs and durations.
    pub total_cost: f64,
    /// Peak concurrent demand per resource type.
    pub resource_usage: BTreeMap<ResourceType, f64>,
    /// Weighted adaptive score, lower is better.
    #[serde(default)]
    pub score: Option<f64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Observed outcomes, oldest first.
    #[serde(default)]
    pub feedback: Vec<PlanFeedback>,
}

impl ExecutionPlan {
    /// Step for a task id.
    pub fn step(&self, task_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.task_id == task_id)
    }

    /// Whether a task sits on the critical path.
    pub fn is_critical(&self, task_id: &str) -> bool {
        self.step(task_id).is_some_and(|s| s.is_critical)
    }

    /// Latest actual duration divided by the estimate.
    pub fn duration_ratio(&self) -> Option<f64> {
        let last = self.feedback.last()?;
        (self.total_duration > 0.0).then(|| last.actual_duration / self.total_duration)
    }

    /// Serialize the plan as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
