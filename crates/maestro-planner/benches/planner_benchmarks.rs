use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use maestro_core::{ResourceSpec, ResourceType};
use maestro_planner::{ExecutionPlanner, PlannerConfig, PlanningStrategy, TaskEstimate};

/// Layered DAG: `width` tasks per layer, each depending on two tasks of the previous layer.
fn layered(layers: usize, width: usize) -> Vec<TaskEstimate> {
    let mut tasks = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let mut task = TaskEstimate::new(format!("t{layer}_{slot}"), format!("cap{}", slot % 4))
                .with_duration(1.0 + (slot % 7) as f64)
                .with_resource(ResourceSpec::cpu(1.0 + (slot % 3) as f64));
            if layer > 0 {
                task = task
                    .depends_on(format!("t{}_{slot}", layer - 1))
                    .depends_on(format!("t{}_{}", layer - 1, (slot + 1) % width));
            }
            tasks.push(task);
        }
    }
    tasks
}

fn bench_critical_path(c: &mut Criterion) {
    let planner = ExecutionPlanner::default();
    let mut group = c.benchmark_group("critical_path");
    for size in [10usize, 50, 100] {
        let tasks = layered(size, 10);
        group.bench_with_input(BenchmarkId::from_parameter(size * 10), &tasks, |b, tasks| {
            b.iter(|| {
                planner
                    .create_plan_with(black_box(tasks), PlanningStrategy::CriticalPath)
                    .map(|plan| planner.remove_plan(plan.id))
            });
        });
    }
    group.finish();
}

fn bench_resource_leveling(c: &mut Criterion) {
    let mut config = PlannerConfig::default();
    config.resource_ceilings.insert(ResourceType::Cpu, 8.0);
    let planner = ExecutionPlanner::new(config);
    let tasks = layered(20, 10);
    c.bench_function("resource_aware_200", |b| {
        b.iter(|| {
            planner
                .create_plan_with(black_box(&tasks), PlanningStrategy::ResourceAware)
                .map(|plan| planner.remove_plan(plan.id))
        });
    });
}

criterion_group!(benches, bench_critical_path, bench_resource_leveling);
criterion_main!(benches);
