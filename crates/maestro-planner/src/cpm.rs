use crate::graph::TaskGraph;

/// Forward and backward pass results, indexed like the graph.
#[derive(Debug, Clone)]
pub struct CpmSchedule {
    /// Earliest start per step, in seconds.
    pub earliest_start: Vec<f64>,
    /// Latest start that does not delay the project.
    pub latest_start: Vec<f64>,
    /// `latest_start - earliest_start`.
    pub slack: Vec<f64>,
    /// Whether the slack is within epsilon of zero.
    pub critical: Vec<bool>,
    /// Finish time of the last step.
    pub project_duration: f64,
}

impl CpmSchedule {
    /// Earliest start plus duration.
    pub fn earliest_finish(&self, index: usize, durations: &[f64]) -> f64 {
        self.earliest_start[index] + durations[index]
    }

    /// Critical steps in topological order.
    pub fn critical_path(&self, graph: &TaskGraph) -> Vec<usize> {
        graph
            .topological_order()
            .into_iter()
            .filter(|&i| self.critical[i])
            .collect()
    }
}

/// Critical path method over `graph` with per-node `durations`.
///
/// A step is critical when its slack is within `epsilon` of zero.
pub fn critical_path_schedule(graph: &TaskGraph, durations: &[f64], epsilon: f64) -> CpmSchedule {
    let n = graph.len();
    let order = graph.topological_order();

    let mut earliest_start = vec![0.0_f64; n];
    for &node in &order {
        earliest_start[node] = graph
            .predecessors(node)
            .iter()
            .map(|&p| earliest_start[p] + durations[p])
            .fold(0.0, f64::max);
    }

    let project_duration = (0..n)
        .map(|i| earliest_start[i] + durations[i])
        .fold(0.0, f64::max);

    let mut latest_start = vec![0.0_f64; n];
    for &node in order.iter().rev() {
        let successors = graph.successors(node);
        latest_start[node] = if successors.is_empty() {
            project_duration - durations[node]
        } else {
            successors
                .iter()
                .map(|&s| latest_start[s])
                .fold(f64::INFINITY, f64::min)
                - durations[node]
        };
    }

    let slack: Vec<f64> = (0..n)
        .map(|i| (latest_start[i] - earliest_start[i]).max(0.0))
        .collect();
    let critical = slack.iter().map(|s| *s <= epsilon).collect();

    CpmSchedule {
        earliest_start,
        latest_start,
        slack,
        critical,
        project_duration,
    }
}
