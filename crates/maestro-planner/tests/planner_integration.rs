#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the execution planner: critical path on the diamond
//! graph, slack properties, leveling and serialization.

use maestro_core::{MaestroError, Priority, ResourceSpec, ResourceType};
use maestro_planner::*;

const EPS: f64 = 1e-6;

fn diamond() -> Vec<TaskEstimate> {
    vec![
        TaskEstimate::new("A", "coder").with_duration(10.0),
        TaskEstimate::new("B", "coder").with_duration(20.0).depends_on("A"),
        TaskEstimate::new("C", "tester").with_duration(5.0).depends_on("A"),
        TaskEstimate::new("D", "reviewer")
            .with_duration(8.0)
            .depends_on("B")
            .depends_on("C"),
    ]
}

// ---------------------------------------------------------------------------
// Diamond A->B, A->C, B->D, C->D
// ---------------------------------------------------------------------------

#[test]
fn diamond_critical_path_and_slack() {
    let planner = ExecutionPlanner::default();
    let plan = planner.create_plan(&diamond()).unwrap();

    assert_eq!(plan.critical_path, ["A", "B", "D"]);
    assert!((plan.total_duration - 38.0).abs() < EPS);
    assert!((plan.step("C").unwrap().slack - 15.0).abs() < EPS);
    assert_eq!(
        plan.parallel_groups,
        vec![vec!["A".to_string()], vec!["B".to_string(), "C".to_string()], vec!["D".to_string()]]
    );
    // Critical B precedes C within the same start time.
    assert_eq!(plan.execution_order, ["A", "B", "C", "D"]);
}

#[test]
fn slack_is_zero_exactly_on_critical_path() {
    let tasks = vec![
        TaskEstimate::new("a", "x").with_duration(3.0),
        TaskEstimate::new("b", "x").with_duration(4.0).depends_on("a"),
        TaskEstimate::new("c", "x").with_duration(1.0).depends_on("a"),
        TaskEstimate::new("d", "x").with_duration(2.0),
        TaskEstimate::new("e", "x").with_duration(1.0).depends_on("c").depends_on("d"),
    ];
    for strategy in [
        PlanningStrategy::Topological,
        PlanningStrategy::CriticalPath,
        PlanningStrategy::ResourceAware,
        PlanningStrategy::Adaptive,
    ] {
        let plan = ExecutionPlanner::default().create_plan_with(&tasks, strategy).unwrap();
        for step in &plan.steps {
            let on_path = plan.critical_path.contains(&step.task_id);
            assert!(step.slack >= 0.0);
            assert_eq!(on_path, step.slack <= EPS, "step {}", step.task_id);
            assert_eq!(on_path, step.is_critical);
        }
    }
}

#[test]
fn scheduled_starts_respect_dependencies() {
    let mut tasks = diamond();
    for task in &mut tasks {
        task.resources.push(ResourceSpec::cpu(4.0));
    }
    let mut config = PlannerConfig::default();
    config.resource_ceilings.insert(ResourceType::Cpu, 4.0);
    let planner = ExecutionPlanner::new(config);
    let plan = planner
        .create_plan_with(&tasks, PlanningStrategy::ResourceAware)
        .unwrap();

    for step in &plan.steps {
        for dep in &step.dependencies {
            let dep = plan.step(dep).unwrap();
            assert!(step.scheduled_start + EPS >= dep.scheduled_finish());
        }
    }
    // B and C can no longer overlap.
    assert!((plan.total_duration - 43.0).abs() < EPS);
    assert!(plan.resource_usage[&ResourceType::Cpu] <= 4.0 + EPS);
}

#[test]
fn cyclic_graph_is_rejected() {
    let tasks = vec![
        TaskEstimate::new("x", "a").depends_on("y"),
        TaskEstimate::new("y", "a").depends_on("x"),
    ];
    let planner = ExecutionPlanner::default();
    assert!(matches!(
        planner.create_plan(&tasks),
        Err(MaestroError::CyclicDependency { .. })
    ));
    assert_eq!(planner.plan_count(), 0);
}

#[test]
fn higher_priority_leads_its_group() {
    let tasks = vec![
        TaskEstimate::new("root", "x").with_duration(1.0),
        TaskEstimate::new("low", "x").with_duration(2.0).depends_on("root"),
        TaskEstimate::new("urgent", "x")
            .with_duration(2.0)
            .with_priority(Priority::Critical)
            .depends_on("root"),
    ];
    let plan = ExecutionPlanner::default()
        .create_plan_with(&tasks, PlanningStrategy::ResourceAware)
        .unwrap();
    assert_eq!(plan.execution_order, ["root", "urgent", "low"]);
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

#[test]
fn plan_survives_json_round_trip() {
    let plan = ExecutionPlanner::default().create_plan(&diamond()).unwrap();
    let json = serde_json::to_string(&plan).unwrap();
    let back: ExecutionPlan = serde_json::from_str(&json).unwrap();

    assert_eq!(back.id, plan.id);
    assert_eq!(back.critical_path, plan.critical_path);
    let ids = |p: &ExecutionPlan| -> Vec<(String, Vec<String>)> {
        p.steps
            .iter()
            .map(|s| (s.task_id.clone(), s.dependencies.clone()))
            .collect()
    };
    assert_eq!(ids(&back), ids(&plan));
    assert!((back.total_duration - plan.total_duration).abs() < EPS);
}
