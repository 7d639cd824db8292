use crate::graph::TaskGraph;
use maestro_core::{Priority, ResourceType};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

/// Per-step inputs to resource leveling.
#[derive(Debug, Clone)]
pub struct LevelingInput {
    /// Seconds.
    pub duration: f64,
    /// Higher priority is placed first within a group.
    pub priority: Priority,
    /// Concurrent demand per resource type.
    pub demand: BTreeMap<ResourceType, f64>,
}

impl LevelingInput {
    fn weight(&self) -> f64 {
        self.demand.values().sum()
    }
}

struct Placed {
    start: f64,
    end: f64,
    demand: BTreeMap<ResourceType, f64>,
}

/// Peak usage of `resource_type` among `placed` over `[start, end)`.
fn peak_usage(placed: &[Placed], resource_type: ResourceType, start: f64, end: f64) -> f64 {
    let overlapping: Vec<&Placed> = placed
        .iter()
        .filter(|p| p.start < end && p.end > start)
        .collect();
    let mut probes: Vec<f64> = vec![start];
    probes.extend(
        overlapping
            .iter()
            .map(|p| p.start)
            .filter(|&s| s > start && s < end),
    );
    probes
        .into_iter()
        .map(|t| {
            overlapping
                .iter()
                .filter(|p| p.start <= t && p.end > t)
                .map(|p| p.demand.get(&resource_type).copied().unwrap_or(0.0))
                .sum::<f64>()
        })
        .fold(0.0, f64::max)
}

/// Push start times forward until concurrent demand respects `ceilings`.
///
/// Steps are placed level by level; inside a level by descending priority,
/// then descending resource weight, then insertion order. Each step starts no
/// earlier than its predecessors' leveled finish. A step whose own demand
/// exceeds a ceiling is placed after everything overlapping it has finished.
/// Returns the leveled start of every step.
pub fn level_resources(
    graph: &TaskGraph,
    inputs: &[LevelingInput],
    ceilings: &BTreeMap<ResourceType, f64>,
    epsilon: f64,
) -> Vec<f64> {
    let n = graph.len();
    let mut start = vec![0.0_f64; n];
    let mut placed: Vec<Placed> = Vec::with_capacity(n);

    for mut level in graph.levels() {
        level.sort_by(|&a, &b| {
            inputs[b]
                .priority
                .cmp(&inputs[a].priority)
                .then_with(|| {
                    inputs[b]
                        .weight()
                        .partial_cmp(&inputs[a].weight())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.cmp(&b))
        });

        for node in level {
            let input = &inputs[node];
            let mut candidate = graph
                .predecessors(node)
                .iter()
                .map(|&p| start[p] + inputs[p].duration)
                .fold(0.0, f64::max);

            loop {
                let end = candidate + input.duration.max(epsilon);
                let conflict = input.demand.iter().any(|(rt, amount)| {
                    let Some(&ceiling) = ceilings.get(rt) else {
                        return false;
                    };
                    if *amount > ceiling + epsilon {
                        // Can never fit beside others; run it alone.
                        return placed.iter().any(|p| {
                            p.start < end && p.end > candidate && p.demand.contains_key(rt)
                        });
                    }
                    peak_usage(&placed, *rt, candidate, end) + amount > ceiling + epsilon
                });
                if !conflict {
                    break;
                }
                // Jump to the next finish of an overlapping step.
                let next = placed
                    .iter()
                    .map(|p| p.end)
                    .filter(|&e| e > candidate + epsilon)
                    .fold(f64::INFINITY, f64::min);
                if !next.is_finite() {
                    warn!(task = graph.id(node), "Resource leveling could not resolve a conflict");
                    break;
                }
                candidate = next;
            }

            start[node] = candidate;
            placed.push(Placed {
                start: candidate,
                end: candidate + input.duration,
                demand: input.demand.clone(),
            });
        }
    }
    start
}

/// Peak concurrent demand per resource type for a given schedule.
pub fn peak_demand(starts: &[f64], inputs: &[LevelingInput]) -> BTreeMap<ResourceType, f64> {
    let placed: Vec<Placed> = starts
        .iter()
        .zip(inputs)
        .map(|(&s, input)| Placed {
            start: s,
            end: s + input.duration,
            demand: input.demand.clone(),
        })
        .collect();
    let mut peaks = BTreeMap::new();
    for input in inputs {
        for &rt in input.demand.keys() {
            if peaks.contains_key(&rt) {
                continue;
            }
            let peak = placed
                .iter()
                .filter(|p| p.demand.contains_key(&rt) && p.end > p.start)
                .map(|p| peak_usage(&placed, rt, p.start, p.end))
                .fold(0.0, f64::max);
            // Zero-length steps still hold their demand for an instant.
            let instant = inputs
                .iter()
                .filter(|i| i.duration <= 0.0)
                .map(|i| i.demand.get(&rt).copied().unwrap_or(0.0))
                .fold(0.0, f64::max);
            peaks.insert(rt, peak.max(instant));
        }
    }
    peaks
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::TaskEstimate;

    fn input(duration: f64, cpu: f64, priority: Priority) -> LevelingInput {
        LevelingInput {
            duration,
            priority,
            demand: BTreeMap::from([(ResourceType::Cpu, cpu)]),
        }
    }

    #[test]
    fn test_parallel_steps_serialised_by_ceiling() {
        let tasks = vec![
            TaskEstimate::new("a", "x"),
            TaskEstimate::new("b", "x"),
            TaskEstimate::new("c", "x"),
        ];
        let graph = TaskGraph::build(&tasks).unwrap();
        let inputs = vec![
            input(10.0, 4.0, Priority::Normal),
            input(5.0, 4.0, Priority::High),
            input(5.0, 2.0, Priority::Normal),
        ];
        let ceilings = BTreeMap::from([(ResourceType::Cpu, 6.0)]);
        let starts = level_resources(&graph, &inputs, &ceilings, 1e-9);

        // b (high priority) first, then a (heavier) must wait, c fits beside b.
        assert_eq!(starts[1], 0.0);
        assert_eq!(starts[2], 0.0);
        assert_eq!(starts[0], 5.0);

        let peaks = peak_demand(&starts, &inputs);
        assert!(peaks[&ResourceType::Cpu] <= 6.0);
    }

    #[test]
    fn test_dependencies_respected_after_leveling() {
        let tasks = vec![
            TaskEstimate::new("a", "x"),
            TaskEstimate::new("b", "x"),
            TaskEstimate::new("c", "x").depends_on("a"),
        ];
        let graph = TaskGraph::build(&tasks).unwrap();
        let inputs = vec![
            input(4.0, 3.0, Priority::Normal),
            input(4.0, 3.0, Priority::Normal),
            input(1.0, 1.0, Priority::Normal),
        ];
        let ceilings = BTreeMap::from([(ResourceType::Cpu, 3.0)]);
        let starts = level_resources(&graph, &inputs, &ceilings, 1e-9);
        assert_eq!(starts[0], 0.0);
        assert_eq!(starts[1], 4.0);
        // c waits for a and for b to free capacity.
        assert!(starts[2] >= starts[0] + 4.0);
        assert_eq!(starts[2], 8.0);
    }

    #[test]
    fn test_no_ceiling_means_no_delay() {
        let tasks = vec![TaskEstimate::new("a", "x"), TaskEstimate::new("b", "x")];
        let graph = TaskGraph::build(&tasks).unwrap();
        let inputs = vec![input(3.0, 100.0, Priority::Low), input(3.0, 100.0, Priority::Low)];
        let starts = level_resources(&graph, &inputs, &BTreeMap::new(), 1e-9);
        assert_eq!(starts, vec![0.0, 0.0]);
    }

    #[test]
    fn test_oversized_step_runs_alone() {
        let tasks = vec![TaskEstimate::new("a", "x"), TaskEstimate::new("huge", "x")];
        let graph = TaskGraph::build(&tasks).unwrap();
        let inputs = vec![input(2.0, 1.0, Priority::High), input(2.0, 50.0, Priority::Low)];
        let ceilings = BTreeMap::from([(ResourceType::Cpu, 8.0)]);
        let starts = level_resources(&graph, &inputs, &ceilings, 1e-9);
        assert_eq!(starts, vec![0.0, 2.0]);
    }
}
