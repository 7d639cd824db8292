use crate::graph::{TaskEstimate, TaskGraph};
use crate::history::ExecutionHistory;
use crate::plan::{ExecutionPlan, PlanFeedback};
use crate::strategy::{build_plan, AdaptiveWeights, PlanContext, PlanningStrategy};
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult, ResourceType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Strategy used by `create_plan`.
    pub strategy: PlanningStrategy,
    /// Estimate for tasks that declare no duration, in seconds.
    pub default_duration_secs: f64,
    /// Slack tolerance for critical-path membership.
    pub epsilon: f64,
    /// Concurrent demand ceilings used by resource leveling.
    pub resource_ceilings: BTreeMap<ResourceType, f64>,
    /// Cost per unit of resource per second.
    pub unit_costs: BTreeMap<ResourceType, f64>,
    /// Weights of the adaptive score.
    pub adaptive_weights: AdaptiveWeights,
    /// Observations needed before history overrides a declared estimate.
    pub min_history_samples: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            strategy: PlanningStrategy::CriticalPath,
            default_duration_secs: 60.0,
            epsilon: 1e-6,
            resource_ceilings: BTreeMap::new(),
            unit_costs: default_unit_costs(),
            adaptive_weights: AdaptiveWeights::default(),
            min_history_samples: 3,
        }
    }
}

fn default_unit_costs() -> BTreeMap<ResourceType, f64> {
    BTreeMap::from([
        (ResourceType::Cpu, 0.01),
        (ResourceType::Memory, 0.000_01),
        (ResourceType::Gpu, 0.1),
        (ResourceType::Storage, 0.000_1),
        (ResourceType::Network, 0.000_1),
        (ResourceType::ApiQuota, 0.001),
    ])
}

impl PlannerConfig {
    /// Cost per unit per second, 0 for unlisted types.
    pub fn unit_cost(&self, resource_type: ResourceType) -> f64 {
        self.unit_costs.get(&resource_type).copied().unwrap_or(0.0)
    }
}

/// Produces and stores execution plans and learns from their outcomes.
pub struct ExecutionPlanner {
    config: PlannerConfig,
    plans: RwLock<HashMap<Uuid, ExecutionPlan>>,
    history: RwLock<ExecutionHistory>,
}

impl ExecutionPlanner {
    /// Create a planner with an empty plan store and history.
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            plans: RwLock::new(HashMap::new()),
            history: RwLock::new(ExecutionHistory::default()),
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan `tasks` with the configured strategy.
    pub fn create_plan(&self, tasks: &[TaskEstimate]) -> MaestroResult<ExecutionPlan> {
        self.create_plan_with(tasks, self.config.strategy)
    }

    /// Plan `tasks` with an explicit strategy. The plan is stored for later feedback.
    pub fn create_plan_with(
        &self,
        tasks: &[TaskEstimate],
        strategy: PlanningStrategy,
    ) -> MaestroResult<ExecutionPlan> {
        let graph = TaskGraph::build(tasks)?;
        let plan = {
            let history = self.history.read();
            let ctx = PlanContext {
                graph: &graph,
                tasks,
                config: &self.config,
                history: &history,
            };
            build_plan(strategy, &ctx)
        };
        tracing::debug!(
            plan_id = %plan.id,
            strategy = ?plan.selected_strategy,
            steps = plan.steps.len(),
            total_duration = plan.total_duration,
            "Execution plan created"
        );
        self.plans.write().insert(plan.id, plan.clone());
        Ok(plan)
    }

    /// Look up a stored plan.
    pub fn get_plan(&self, plan_id: Uuid) -> Option<ExecutionPlan> {
        self.plans.read().get(&plan_id).cloned()
    }

    /// Drop a stored plan.
    pub fn remove_plan(&self, plan_id: Uuid) -> Option<ExecutionPlan> {
        self.plans.write().remove(&plan_id)
    }

    /// Number of stored plans.
    pub fn plan_count(&self) -> usize {
        self.plans.read().len()
    }

    /// Attach an observed outcome to a plan and calibrate future estimates.
    pub fn update_plan(
        &self,
        plan_id: Uuid,
        actual_duration: f64,
        actual_cost: f64,
        resource_usage: BTreeMap<ResourceType, f64>,
    ) -> MaestroResult<()> {
        let estimated = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| MaestroError::NotFound(format!("plan {plan_id}")))?;
            plan.feedback.push(PlanFeedback {
                actual_duration,
                actual_cost,
                resource_usage,
                recorded_at: Utc::now(),
            });
            plan.total_duration
        };
        self.history.write().record_calibration(estimated, actual_duration);
        tracing::debug!(
            plan_id = %plan_id,
            estimated,
            actual_duration,
            actual_cost,
            "Plan feedback recorded"
        );
        Ok(())
    }

    /// Record one task execution for the historical-average predictor.
    pub fn record_execution(
        &self,
        capability: &str,
        duration_secs: f64,
        resource_usage: &BTreeMap<ResourceType, f64>,
    ) {
        let cost = resource_usage
            .iter()
            .map(|(rt, amount)| amount * self.config.unit_cost(*rt))
            .sum::<f64>()
            * duration_secs;
        self.history
            .write()
            .record(capability, duration_secs, Some(cost), resource_usage);
    }

    /// Snapshot of the execution history.
    pub fn history(&self) -> ExecutionHistory {
        self.history.read().clone()
    }
}

impl Default for ExecutionPlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn chain() -> Vec<TaskEstimate> {
        vec![
            TaskEstimate::new("fetch", "scraper").with_duration(10.0),
            TaskEstimate::new("summarise", "writer")
                .with_duration(20.0)
                .depends_on("fetch"),
        ]
    }

    #[test]
    fn test_plan_is_stored_and_retrievable() {
        let planner = ExecutionPlanner::default();
        let plan = planner.create_plan(&chain()).unwrap();
        assert_eq!(planner.get_plan(plan.id).unwrap().critical_path, plan.critical_path);
        assert_eq!(planner.plan_count(), 1);
        assert!(planner.remove_plan(plan.id).is_some());
        assert!(planner.get_plan(plan.id).is_none());
    }

    #[test]
    fn test_update_unknown_plan_fails() {
        let planner = ExecutionPlanner::default();
        let err = planner
            .update_plan(Uuid::new_v4(), 1.0, 0.0, BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, MaestroError::NotFound(_)));
    }

    #[test]
    fn test_predictive_uses_recorded_history() {
        let planner = ExecutionPlanner::new(PlannerConfig {
            min_history_samples: 2,
            ..PlannerConfig::default()
        });
        for _ in 0..2 {
            planner.record_execution("writer", 5.0, &BTreeMap::new());
        }
        let plan = planner
            .create_plan_with(&chain(), PlanningStrategy::Predictive)
            .unwrap();
        assert!((plan.step("summarise").unwrap().estimated_duration - 5.0).abs() < 1e-9);
        assert!((plan.total_duration - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_feedback_calibrates_predictive_estimates() {
        let planner = ExecutionPlanner::new(PlannerConfig {
            min_history_samples: 1,
            ..PlannerConfig::default()
        });
        let plan = planner.create_plan(&chain()).unwrap();
        planner.update_plan(plan.id, 60.0, 1.5, BTreeMap::new()).unwrap();
        assert_eq!(planner.get_plan(plan.id).unwrap().duration_ratio(), Some(2.0));

        let predicted = planner
            .create_plan_with(&chain(), PlanningStrategy::Predictive)
            .unwrap();
        assert!((predicted.total_duration - 60.0).abs() < 1e-9);
    }
}
