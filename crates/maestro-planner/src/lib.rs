//! Execution planner for the Maestro orchestration core.
//!
//! Turns a task dependency graph into a schedule estimate: critical path and
//! slack, Kahn parallel groups, optional resource leveling, and several
//! interchangeable planning strategies. Observed executions feed a
//! historical-average predictor used by the predictive strategy.
//!
//! # Main types
//!
//! - [`ExecutionPlanner`] — Creates, stores and updates plans.
//! - [`ExecutionPlan`] / [`ExecutionStep`] — Serializable planning output.
//! - [`TaskEstimate`] — Planner input for one task.
//! - [`PlanningStrategy`] — Topological, critical-path, resource-aware, predictive or adaptive.
//! - [`TaskGraph`] — Validated dependency graph with cycle detection.

/// Critical path method.
pub mod cpm;
/// Dependency graph and cycle detection.
pub mod graph;
/// Historical execution statistics.
pub mod history;
/// Resource leveling.
pub mod leveling;
/// Plan and step types.
pub mod plan;
/// The planner service.
pub mod planner;
/// Planning strategies and adaptive scoring.
pub mod strategy;

pub use cpm::{critical_path_schedule, CpmSchedule};
pub use graph::{find_cycle, TaskEstimate, TaskGraph};
pub use history::{CapabilityStats, ExecutionHistory};
pub use leveling::{level_resources, peak_demand, LevelingInput};
pub use plan::{ExecutionPlan, ExecutionStep, PlanFeedback};
pub use planner::{ExecutionPlanner, PlannerConfig};
pub use strategy::{AdaptiveWeights, PlanningStrategy};
