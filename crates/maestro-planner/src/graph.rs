use maestro_core::{MaestroError, MaestroResult, Priority, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Planner input for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEstimate {
    /// Task id.
    pub id: String,
    /// Capability type, the key for historical estimates.
    pub capability: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated duration in seconds; the planner default applies when absent.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Used to order steps within a group when leveling.
    #[serde(default)]
    pub priority: Priority,
    /// Resources held while the task runs.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

impl TaskEstimate {
    /// Estimate with no dependencies, duration or resources.
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            dependencies: Vec::new(),
            duration: None,
            priority: Priority::Normal,
            resources: Vec::new(),
        }
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Set the estimated duration in seconds.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a resource line item.
    pub fn with_resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }
}

/// Find a dependency cycle with a depth-first search.
///
/// `dependencies` maps a node to the nodes it depends on; ids missing from
/// the map have no dependencies. Returns the nodes along the cycle with the
/// first repeated at the end.
pub fn find_cycle<'a, I>(ids: I, dependencies: &HashMap<&'a str, Vec<&'a str>>) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    // 1 = on the current path, 2 = fully explored.
    let mut visited: HashMap<&str, u8> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    for id in ids {
        if let Some(cycle) = dfs_cycle(id, dependencies, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn dfs_cycle<'a>(
    id: &'a str,
    dependencies: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, u8>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match visited.get(id) {
        Some(1) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    path.push(id);
    if let Some(deps) = dependencies.get(id) {
        for dep in deps {
            if let Some(cycle) = dfs_cycle(*dep, dependencies, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    visited.insert(id, 2);
    None
}

/// Dependency graph over task indices, in insertion order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build and validate the graph: unique ids, known dependencies, no cycles.
    pub fn build(tasks: &[TaskEstimate]) -> MaestroResult<Self> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(MaestroError::InvalidWorkflow(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }

        let mut predecessors = vec![Vec::new(); tasks.len()];
        let mut successors = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.dependencies {
                let &d = index.get(dep).ok_or_else(|| {
                    MaestroError::InvalidWorkflow(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.id
                    ))
                })?;
                if seen.insert(d) {
                    predecessors[i].push(d);
                    successors[d].push(i);
                }
            }
        }

        let deps: HashMap<&str, Vec<&str>> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.iter().map(String::as_str).collect()))
            .collect();
        if let Some(cycle) = find_cycle(tasks.iter().map(|t| t.id.as_str()), &deps) {
            return Err(MaestroError::CyclicDependency { cycle });
        }

        Ok(Self {
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
            index,
            predecessors,
            successors,
        })
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Task id at `index`.
    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Index of a task id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices of direct prerequisites.
    pub fn predecessors(&self, index: usize) -> &[usize] {
        &self.predecessors[index]
    }

    /// Indices of direct dependents.
    pub fn successors(&self, index: usize) -> &[usize] {
        &self.successors[index]
    }

    /// Kahn levels: each level holds the nodes whose predecessors all sit in
    /// earlier levels, in insertion order.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &succ in &self.successors[node] {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_unstable();
            levels.push(std::mem::replace(&mut current, next));
        }
        levels
    }

    /// A dependency-respecting order, level by level.
    pub fn topological_order(&self) -> Vec<usize> {
        self.levels().into_iter().flatten().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn diamond() -> Vec<TaskEstimate> {
        vec![
            TaskEstimate::new("A", "coder"),
            TaskEstimate::new("B", "coder").depends_on("A"),
            TaskEstimate::new("C", "tester").depends_on("A"),
            TaskEstimate::new("D", "reviewer").depends_on("B").depends_on("C"),
        ]
    }

    #[test]
    fn test_levels_of_diamond() {
        let graph = TaskGraph::build(&diamond()).unwrap();
        let levels: Vec<Vec<&str>> = graph
            .levels()
            .iter()
            .map(|l| l.iter().map(|&i| graph.id(i)).collect())
            .collect();
        assert_eq!(levels, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
        assert_eq!(graph.topological_order(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let tasks = vec![
            TaskEstimate::new("A", "x").depends_on("C"),
            TaskEstimate::new("B", "x").depends_on("A"),
            TaskEstimate::new("C", "x").depends_on("B"),
        ];
        match TaskGraph::build(&tasks) {
            Err(MaestroError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let tasks = vec![TaskEstimate::new("A", "x").depends_on("A")];
        assert!(matches!(
            TaskGraph::build(&tasks),
            Err(MaestroError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_and_duplicate_ids() {
        let unknown = vec![TaskEstimate::new("A", "x").depends_on("missing")];
        assert!(matches!(
            TaskGraph::build(&unknown),
            Err(MaestroError::InvalidWorkflow(_))
        ));
        let dup = vec![TaskEstimate::new("A", "x"), TaskEstimate::new("A", "y")];
        assert!(matches!(TaskGraph::build(&dup), Err(MaestroError::InvalidWorkflow(_))));
    }

    #[test]
    fn test_repeated_dependency_counted_once() {
        let tasks = vec![
            TaskEstimate::new("A", "x"),
            TaskEstimate::new("B", "x").depends_on("A").depends_on("A"),
        ];
        let graph = TaskGraph::build(&tasks).unwrap();
        assert_eq!(graph.predecessors(1), &[0]);
        assert_eq!(graph.levels().len(), 2);
    }
}
