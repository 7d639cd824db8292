use crate::cpm::critical_path_schedule;
use crate::graph::{TaskEstimate, TaskGraph};
use crate::history::ExecutionHistory;
use crate::leveling::{level_resources, peak_demand, LevelingInput};
use crate::plan::{ExecutionPlan, ExecutionStep};
use crate::planner::PlannerConfig;
use chrono::Utc;
use maestro_core::ResourceType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Interchangeable planning algorithms over the same task graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    /// Level-by-level topological order at earliest start.
    Topological,
    /// Earliest-start schedule ordered critical steps first.
    #[default]
    CriticalPath,
    /// Critical path plus resource leveling against configured ceilings.
    ResourceAware,
    /// Resource-aware over estimates corrected by execution history.
    Predictive,
    /// Runs the other strategies and keeps the lowest weighted score.
    Adaptive,
}

impl PlanningStrategy {
    /// Candidates evaluated by [`PlanningStrategy::Adaptive`], in tie-break order.
    pub const CANDIDATES: [PlanningStrategy; 4] = [
        PlanningStrategy::CriticalPath,
        PlanningStrategy::ResourceAware,
        PlanningStrategy::Predictive,
        PlanningStrategy::Topological,
    ];
}

/// Weights of the adaptive score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveWeights {
    /// Weight of the estimated total duration.
    pub duration: f64,
    /// Weight of the estimated cost.
    pub cost: f64,
    /// Weight of peak resource demand.
    pub resources: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            duration: 0.5,
            cost: 0.3,
            resources: 0.2,
        }
    }
}

pub(crate) struct PlanContext<'a> {
    pub graph: &'a TaskGraph,
    pub tasks: &'a [TaskEstimate],
    pub config: &'a PlannerConfig,
    pub history: &'a ExecutionHistory,
}

pub(crate) fn build_plan(strategy: PlanningStrategy, ctx: &PlanContext<'_>) -> ExecutionPlan {
    match strategy {
        PlanningStrategy::Topological
        | PlanningStrategy::CriticalPath
        | PlanningStrategy::ResourceAware => assemble(strategy, ctx, declared_inputs(ctx)),
        PlanningStrategy::Predictive => assemble(strategy, ctx, predicted_inputs(ctx)),
        PlanningStrategy::Adaptive => adaptive(ctx),
    }
}

fn declared_demand(task: &TaskEstimate) -> BTreeMap<ResourceType, f64> {
    let mut demand = BTreeMap::new();
    for spec in task.resources.iter().filter(|s| s.amount > 0.0) {
        *demand.entry(spec.resource_type).or_insert(0.0) += spec.amount;
    }
    demand
}

fn declared_duration(task: &TaskEstimate, config: &PlannerConfig) -> f64 {
    task.duration
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(config.default_duration_secs)
}

fn declared_inputs(ctx: &PlanContext<'_>) -> Vec<LevelingInput> {
    ctx.tasks
        .iter()
        .map(|task| LevelingInput {
            duration: declared_duration(task, ctx.config),
            priority: task.priority,
            demand: declared_demand(task),
        })
        .collect()
}

/// Historical averages per capability, else declared estimates scaled by the
/// plan-level calibration ratio.
fn predicted_inputs(ctx: &PlanContext<'_>) -> Vec<LevelingInput> {
    let min = ctx.config.min_history_samples;
    let calibration = ctx.history.calibration(min).unwrap_or(1.0);
    ctx.tasks
        .iter()
        .map(|task| {
            let duration = ctx
                .history
                .predicted_duration(&task.capability, min)
                .unwrap_or_else(|| declared_duration(task, ctx.config) * calibration);
            let demand = ctx
                .history
                .predicted_resources(&task.capability, min)
                .unwrap_or_else(|| declared_demand(task));
            LevelingInput {
                duration,
                priority: task.priority,
                demand,
            }
        })
        .collect()
}

fn assemble(
    strategy: PlanningStrategy,
    ctx: &PlanContext<'_>,
    inputs: Vec<LevelingInput>,
) -> ExecutionPlan {
    let graph = ctx.graph;
    let epsilon = ctx.config.epsilon;
    let durations: Vec<f64> = inputs.iter().map(|i| i.duration).collect();
    let cpm = critical_path_schedule(graph, &durations, epsilon);
    let levels = graph.levels();

    let mut level_of = vec![0_usize; graph.len()];
    for (l, nodes) in levels.iter().enumerate() {
        for &n in nodes {
            level_of[n] = l;
        }
    }

    let leveled = matches!(
        strategy,
        PlanningStrategy::ResourceAware | PlanningStrategy::Predictive
    );
    let starts = if leveled {
        level_resources(graph, &inputs, &ctx.config.resource_ceilings, epsilon)
    } else {
        cpm.earliest_start.clone()
    };

    let total_duration = (0..graph.len())
        .map(|i| starts[i] + durations[i])
        .fold(0.0, f64::max);

    let mut order: Vec<usize> = (0..graph.len()).collect();
    order.sort_by(|&a, &b| {
        let by_level = level_of[a].cmp(&level_of[b]);
        let by_start = starts[a].partial_cmp(&starts[b]).unwrap_or(Ordering::Equal);
        let by_priority = inputs[b].priority.cmp(&inputs[a].priority);
        let primary = match strategy {
            PlanningStrategy::Topological => by_level,
            PlanningStrategy::CriticalPath => by_start
                .then(by_level)
                .then(cpm.critical[b].cmp(&cpm.critical[a]))
                .then(cpm.slack[a].partial_cmp(&cpm.slack[b]).unwrap_or(Ordering::Equal))
                .then(by_priority),
            _ => by_start.then(by_level).then(by_priority),
        };
        primary.then(a.cmp(&b))
    });

    let total_cost: f64 = inputs
        .iter()
        .map(|input| {
            input
                .demand
                .iter()
                .map(|(rt, amount)| amount * ctx.config.unit_cost(*rt))
                .sum::<f64>()
                * input.duration
        })
        .sum();

    let steps = ctx
        .tasks
        .iter()
        .zip(&inputs)
        .enumerate()
        .map(|(i, (task, input))| ExecutionStep {
            task_id: task.id.clone(),
            capability: task.capability.clone(),
            dependencies: graph
                .predecessors(i)
                .iter()
                .map(|&p| graph.id(p).to_string())
                .collect(),
            estimated_duration: input.duration,
            resources: input.demand.clone(),
            priority: input.priority,
            level: level_of[i],
            earliest_start: cpm.earliest_start[i],
            latest_start: cpm.latest_start[i],
            slack: cpm.slack[i],
            is_critical: cpm.critical[i],
            scheduled_start: starts[i],
        })
        .collect();

    let ids = |nodes: &[usize]| -> Vec<String> {
        nodes.iter().map(|&n| graph.id(n).to_string()).collect()
    };

    ExecutionPlan {
        id: Uuid::new_v4(),
        strategy,
        selected_strategy: strategy,
        steps,
        execution_order: ids(&order),
        parallel_groups: levels.iter().map(|l| ids(l)).collect(),
        critical_path: ids(&cpm.critical_path(graph)),
        total_duration,
        total_cost,
        resource_usage: peak_demand(&starts, &inputs),
        score: None,
        created_at: Utc::now(),
        feedback: Vec::new(),
    }
}

fn normalise(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

/// Aggregate resource usage, each type measured against its ceiling (or
/// against the largest candidate's usage when no ceiling is configured).
fn resource_load(
    plan: &ExecutionPlan,
    ceilings: &BTreeMap<ResourceType, f64>,
    largest: &BTreeMap<ResourceType, f64>,
) -> f64 {
    plan.resource_usage
        .iter()
        .map(|(rt, usage)| {
            let scale = ceilings
                .get(rt)
                .copied()
                .filter(|c| *c > 0.0)
                .or_else(|| largest.get(rt).copied())
                .unwrap_or(0.0);
            normalise(*usage, scale)
        })
        .sum()
}

fn adaptive(ctx: &PlanContext<'_>) -> ExecutionPlan {
    let candidates: Vec<ExecutionPlan> = PlanningStrategy::CANDIDATES
        .iter()
        .map(|&s| build_plan(s, ctx))
        .collect();

    let mut largest: BTreeMap<ResourceType, f64> = BTreeMap::new();
    for plan in &candidates {
        for (rt, usage) in &plan.resource_usage {
            let entry = largest.entry(*rt).or_insert(0.0);
            *entry = entry.max(*usage);
        }
    }
    let ceilings = &ctx.config.resource_ceilings;
    let loads: Vec<f64> = candidates
        .iter()
        .map(|p| resource_load(p, ceilings, &largest))
        .collect();

    let max_duration = candidates.iter().map(|p| p.total_duration).fold(0.0, f64::max);
    let max_cost = candidates.iter().map(|p| p.total_cost).fold(0.0, f64::max);
    let max_load = loads.iter().copied().fold(0.0, f64::max);
    let weights = &ctx.config.adaptive_weights;

    let scored = candidates.into_iter().zip(loads).map(|(plan, load)| {
        let score = weights.duration * normalise(plan.total_duration, max_duration)
            + weights.cost * normalise(plan.total_cost, max_cost)
            + weights.resources * normalise(load, max_load);
        (plan, score)
    });

    let mut best: Option<(ExecutionPlan, f64)> = None;
    for (plan, score) in scored {
        let better = best
            .as_ref()
            .map_or(true, |(_, best_score)| score < *best_score - ctx.config.epsilon);
        if better {
            best = Some((plan, score));
        }
    }

    match best {
        Some((mut plan, score)) => {
            plan.strategy = PlanningStrategy::Adaptive;
            plan.score = Some(score);
            plan
        }
        None => assemble(PlanningStrategy::CriticalPath, ctx, declared_inputs(ctx)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::ResourceSpec;

    fn plan(strategy: PlanningStrategy, tasks: &[TaskEstimate], config: &PlannerConfig) -> ExecutionPlan {
        let graph = TaskGraph::build(tasks).unwrap();
        let history = ExecutionHistory::default();
        let ctx = PlanContext {
            graph: &graph,
            tasks,
            config,
            history: &history,
        };
        build_plan(strategy, &ctx)
    }

    fn contended() -> Vec<TaskEstimate> {
        vec![
            TaskEstimate::new("a", "x").with_duration(10.0).with_resource(ResourceSpec::cpu(4.0)),
            TaskEstimate::new("b", "x").with_duration(10.0).with_resource(ResourceSpec::cpu(4.0)),
        ]
    }

    #[test]
    fn test_topological_ignores_ceilings() {
        let mut config = PlannerConfig::default();
        config.resource_ceilings.insert(ResourceType::Cpu, 4.0);
        let p = plan(PlanningStrategy::Topological, &contended(), &config);
        assert!((p.total_duration - 10.0).abs() < 1e-9);
        assert_eq!(p.resource_usage[&ResourceType::Cpu], 8.0);
    }

    #[test]
    fn test_resource_aware_respects_ceilings() {
        let mut config = PlannerConfig::default();
        config.resource_ceilings.insert(ResourceType::Cpu, 4.0);
        let p = plan(PlanningStrategy::ResourceAware, &contended(), &config);
        assert!((p.total_duration - 20.0).abs() < 1e-9);
        assert_eq!(p.resource_usage[&ResourceType::Cpu], 4.0);
        assert_eq!(p.execution_order, ["a", "b"]);
    }

    #[test]
    fn test_adaptive_prefers_duration_by_default() {
        let mut config = PlannerConfig::default();
        config.resource_ceilings.insert(ResourceType::Cpu, 4.0);
        let p = plan(PlanningStrategy::Adaptive, &contended(), &config);
        assert_eq!(p.strategy, PlanningStrategy::Adaptive);
        assert_eq!(p.selected_strategy, PlanningStrategy::CriticalPath);
        assert!(p.score.is_some());
    }

    #[test]
    fn test_adaptive_can_favour_resources() {
        let mut config = PlannerConfig::default();
        config.resource_ceilings.insert(ResourceType::Cpu, 4.0);
        config.adaptive_weights = AdaptiveWeights {
            duration: 0.1,
            cost: 0.0,
            resources: 0.9,
        };
        let p = plan(PlanningStrategy::Adaptive, &contended(), &config);
        assert_eq!(p.selected_strategy, PlanningStrategy::ResourceAware);
    }

    #[test]
    fn test_cost_uses_unit_table() {
        let mut config = PlannerConfig::default();
        config.unit_costs = BTreeMap::from([(ResourceType::Cpu, 0.5)]);
        let p = plan(PlanningStrategy::CriticalPath, &contended(), &config);
        // 2 steps * 4 cpu * 0.5 * 10 s
        assert!((p.total_cost - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_duration_applies() {
        let config = PlannerConfig {
            default_duration_secs: 7.0,
            ..PlannerConfig::default()
        };
        let p = plan(PlanningStrategy::CriticalPath, &[TaskEstimate::new("solo", "x")], &config);
        assert!((p.total_duration - 7.0).abs() < 1e-9);
    }
}
