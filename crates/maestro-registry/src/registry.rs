use crate::agent::Agent;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Available for dispatch.
    Idle,
    /// Executing a task.
    Busy,
    /// Taken out of rotation.
    Offline,
    /// Failed a health check or went silent.
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// How an idle agent is chosen among several candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Rotate through candidates, one cursor per agent type.
    #[default]
    RoundRobin,
    /// Fewest net completed tasks (completed minus failed).
    LeastLoaded,
    /// Highest performance score (success rate over latency).
    PerformanceBased,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Selection strategy for `acquire`.
    pub strategy: LoadBalancingStrategy,
    /// Period of the health probe. Agents silent for twice this long are marked `error`.
    #[serde(with = "maestro_core::duration_ms")]
    pub health_check_interval: Duration,
    /// Upper bound on a single `health_check` call.
    #[serde(with = "maestro_core::duration_ms")]
    pub health_check_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome reported when an agent finishes a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskOutcome {
    /// Whether the task succeeded.
    pub success: bool,
    /// Wall time of the execution.
    pub latency: Duration,
}

impl TaskOutcome {
    /// Successful execution that took `latency`.
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
        }
    }

    /// Failed execution that took `latency`.
    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            latency,
        }
    }
}

/// Metrics snapshot for one agent, consumed by monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Agent id.
    pub agent_id: String,
    /// Agent type.
    pub agent_type: String,
    /// Current status.
    pub status: AgentStatus,
    /// Tasks finished successfully.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Tasks currently executing (0 or 1).
    pub active_tasks: u32,
    /// Mean execution latency.
    pub avg_latency_ms: f64,
    /// Completed over finished tasks; 1.0 before any task.
    pub success_rate: f64,
    /// Success rate weighted against latency.
    pub performance_score: f64,
    /// Last heartbeat or health check.
    pub last_heartbeat: DateTime<Utc>,
}

struct AgentEntry {
    agent: Arc<dyn Agent>,
    status: AgentStatus,
    seq: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    active_tasks: u32,
    total_latency_ms: f64,
    performance_score: f64,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
}

impl AgentEntry {
    fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.total_latency_ms / total as f64
        }
    }

    fn net_completed(&self) -> i64 {
        self.tasks_completed as i64 - self.tasks_failed as i64
    }

    // Success rate discounted by average latency in seconds. Agents without
    // history score 1.0 so they get picked up.
    fn recompute_score(&mut self) {
        self.performance_score = self.success_rate() / (1.0 + self.avg_latency_ms() / 1000.0);
    }

    fn metrics(&self) -> AgentMetrics {
        AgentMetrics {
            agent_id: self.agent.id().to_string(),
            agent_type: self.agent.agent_type().to_string(),
            status: self.status,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            active_tasks: self.active_tasks,
            avg_latency_ms: self.avg_latency_ms(),
            success_rate: self.success_rate(),
            performance_score: self.performance_score,
            last_heartbeat: self.last_heartbeat_at,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<String, AgentEntry>,
    by_type: HashMap<String, Vec<String>>,
    by_capability: HashMap<String, BTreeSet<String>>,
    rr_cursor: HashMap<String, usize>,
    next_seq: u64,
}

/// Directory and load balancer over agents.
///
/// Agents are indexed by type and by each declared capability. Selection only
/// considers `idle` agents; [`AgentRegistry::acquire`] flips the chosen agent
/// to `busy` under the same lock so two dispatches never share an agent.
pub struct AgentRegistry {
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an agent. Ids must be unique.
    pub fn register(&self, agent: Arc<dyn Agent>) -> MaestroResult<()> {
        let id = agent.id().to_string();
        let agent_type = agent.agent_type().to_string();
        let mut inner = self.inner.write();
        if inner.agents.contains_key(&id) {
            return Err(MaestroError::InvalidState(format!(
                "agent '{id}' is already registered"
            )));
        }

        for capability in agent.capabilities() {
            inner
                .by_capability
                .entry(capability.clone())
                .or_default()
                .insert(id.clone());
        }
        inner
            .by_type
            .entry(agent_type.clone())
            .or_default()
            .push(id.clone());

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut entry = AgentEntry {
            agent,
            status: AgentStatus::Idle,
            seq,
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            total_latency_ms: 0.0,
            performance_score: 0.0,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: Utc::now(),
        };
        entry.recompute_score();
        inner.agents.insert(id.clone(), entry);

        info!(agent_id = %id, agent_type = %agent_type, "Registered agent");
        Ok(())
    }

    /// Remove an agent and its index entries. Returns `false` if unknown.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.agents.remove(agent_id) else {
            return false;
        };

        let agent_type = entry.agent.agent_type().to_string();
        if let Some(ids) = inner.by_type.get_mut(&agent_type) {
            ids.retain(|id| id != agent_id);
            if ids.is_empty() {
                inner.by_type.remove(&agent_type);
                inner.rr_cursor.remove(&agent_type);
            }
        }
        for capability in entry.agent.capabilities() {
            if let Some(ids) = inner.by_capability.get_mut(capability) {
                ids.remove(agent_id);
                if ids.is_empty() {
                    inner.by_capability.remove(capability);
                }
            }
        }

        info!(agent_id = %agent_id, "Unregistered agent");
        true
    }

    /// Look up an agent by id.
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.inner
            .read()
            .agents
            .get(agent_id)
            .map(|e| Arc::clone(&e.agent))
    }

    /// Choose an idle agent of `agent_type` without reserving it.
    pub fn get_agent(
        &self,
        agent_type: &str,
        capability: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Option<Arc<dyn Agent>> {
        let mut inner = self.inner.write();
        let id = Self::select(&mut inner, self.config.strategy, agent_type, capability, exclude)?;
        inner.agents.get(&id).map(|e| Arc::clone(&e.agent))
    }

    /// Choose an idle agent and mark it busy in one step.
    pub fn acquire(
        &self,
        agent_type: &str,
        capability: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Option<Arc<dyn Agent>> {
        let mut inner = self.inner.write();
        let id = Self::select(&mut inner, self.config.strategy, agent_type, capability, exclude)?;
        let entry = inner.agents.get_mut(&id)?;
        entry.status = AgentStatus::Busy;
        entry.active_tasks += 1;
        debug!(agent_id = %id, agent_type = %agent_type, "Agent acquired");
        Some(Arc::clone(&entry.agent))
    }

    /// Record a finished task and return the agent to the pool.
    pub fn complete(&self, agent_id: &str, outcome: TaskOutcome) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.agents.get_mut(agent_id) else {
            warn!(agent_id = %agent_id, "Completion reported for unknown agent");
            return;
        };

        if outcome.success {
            entry.tasks_completed += 1;
        } else {
            entry.tasks_failed += 1;
        }
        entry.total_latency_ms += outcome.latency.as_secs_f64() * 1000.0;
        entry.recompute_score();
        Self::free(entry);
    }

    /// Return a busy agent to the pool without recording an outcome (cancel path).
    pub fn release(&self, agent_id: &str) {
        if let Some(entry) = self.inner.write().agents.get_mut(agent_id) {
            Self::free(entry);
        }
    }

    fn free(entry: &mut AgentEntry) {
        entry.active_tasks = entry.active_tasks.saturating_sub(1);
        if entry.status == AgentStatus::Busy && entry.active_tasks == 0 {
            entry.status = AgentStatus::Idle;
        }
    }

    /// Whether any agent of this type (and capability) is registered, whatever its status.
    pub fn has_capable(&self, agent_type: &str, capability: Option<&str>) -> bool {
        let inner = self.inner.read();
        let Some(ids) = inner.by_type.get(agent_type) else {
            return false;
        };
        match capability {
            None => !ids.is_empty(),
            Some(cap) => inner
                .by_capability
                .get(cap)
                .is_some_and(|holders| ids.iter().any(|id| holders.contains(id))),
        }
    }

    /// Current status of an agent.
    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.inner.read().agents.get(agent_id).map(|e| e.status)
    }

    /// Administrative status override (e.g. taking an agent offline).
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> MaestroResult<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent '{agent_id}'")))?;
        info!(agent_id = %agent_id, from = %entry.status, to = %status, "Agent status changed");
        entry.status = status;
        Ok(())
    }

    /// Record a liveness signal; an agent in `error` recovers to `idle`.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.agents.get_mut(agent_id) else {
            return false;
        };
        entry.last_heartbeat = Instant::now();
        entry.last_heartbeat_at = Utc::now();
        if entry.status == AgentStatus::Error {
            entry.status = if entry.active_tasks > 0 {
                AgentStatus::Busy
            } else {
                AgentStatus::Idle
            };
            info!(agent_id = %agent_id, "Agent recovered");
        }
        true
    }

    /// Mark agents silent for longer than `max_silence` as `error`. Returns their ids.
    pub(crate) fn mark_unreachable(&self, max_silence: Duration) -> Vec<String> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let mut marked = Vec::new();
        for (id, entry) in &mut inner.agents {
            if matches!(entry.status, AgentStatus::Offline | AgentStatus::Error) {
                continue;
            }
            if now.duration_since(entry.last_heartbeat) > max_silence {
                warn!(agent_id = %id, "Agent missed health probes, marking unreachable");
                entry.status = AgentStatus::Error;
                marked.push(id.clone());
            }
        }
        marked.sort();
        marked
    }

    /// Agents to probe, excluding those taken offline.
    pub(crate) fn probe_targets(&self) -> Vec<(String, Arc<dyn Agent>)> {
        self.inner
            .read()
            .agents
            .iter()
            .filter(|(_, e)| e.status != AgentStatus::Offline)
            .map(|(id, e)| (id.clone(), Arc::clone(&e.agent)))
            .collect()
    }

    /// Ids of agents of one type, in registration order.
    pub fn agents_of_type(&self, agent_type: &str) -> Vec<String> {
        self.inner
            .read()
            .by_type
            .get(agent_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Metrics for every agent, in registration order.
    pub fn agent_metrics(&self) -> Vec<AgentMetrics> {
        let inner = self.inner.read();
        let mut entries: Vec<&AgentEntry> = inner.agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(AgentEntry::metrics).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(
        inner: &mut RegistryInner,
        strategy: LoadBalancingStrategy,
        agent_type: &str,
        capability: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Option<String> {
        let ids = inner.by_type.get(agent_type)?;
        let holders = match capability {
            Some(cap) => Some(inner.by_capability.get(cap)?),
            None => None,
        };

        let mut candidates: Vec<&AgentEntry> = ids
            .iter()
            .filter(|id| !exclude.contains(*id))
            .filter(|id| holders.map_or(true, |h| h.contains(*id)))
            .filter_map(|id| inner.agents.get(id))
            .filter(|e| e.status == AgentStatus::Idle)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|e| e.seq);

        let chosen = match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let cursor = inner.rr_cursor.get(agent_type).copied().unwrap_or(0);
                let picked = candidates[cursor % candidates.len()].agent.id().to_string();
                inner
                    .rr_cursor
                    .insert(agent_type.to_string(), cursor.wrapping_add(1));
                return Some(picked);
            }
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .min_by_key(|e| (e.net_completed(), e.seq))
                .copied(),
            LoadBalancingStrategy::PerformanceBased => candidates
                .iter()
                .max_by(|a, b| {
                    a.performance_score
                        .total_cmp(&b.performance_score)
                        .then_with(|| b.seq.cmp(&a.seq))
                })
                .copied(),
        };
        chosen.map(|e| e.agent.id().to_string())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::SimulatedAgent;

    fn registry(strategy: LoadBalancingStrategy) -> AgentRegistry {
        AgentRegistry::new(RegistryConfig {
            strategy,
            ..RegistryConfig::default()
        })
    }

    fn add(reg: &AgentRegistry, id: &str, agent_type: &str, caps: &[&str]) {
        reg.register(Arc::new(
            SimulatedAgent::new(id, agent_type).with_capabilities(caps),
        ))
        .unwrap();
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &[]);
        let err = reg
            .register(Arc::new(SimulatedAgent::new("c1", "coder")))
            .unwrap_err();
        assert!(matches!(err, MaestroError::InvalidState(_)));
    }

    #[test]
    fn test_round_robin_rotates() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &[]);
        add(&reg, "c2", "coder", &[]);
        let none = HashSet::new();
        let picks: Vec<String> = (0..4)
            .map(|_| reg.get_agent("coder", None, &none).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, ["c1", "c2", "c1", "c2"]);
    }

    #[test]
    fn test_capability_and_exclude_filters() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &["rust"]);
        add(&reg, "c2", "coder", &["python"]);
        add(&reg, "c3", "coder", &["rust"]);

        let none = HashSet::new();
        assert!(reg.get_agent("coder", Some("go"), &none).is_none());
        assert_eq!(
            reg.get_agent("coder", Some("python"), &none).unwrap().id(),
            "c2"
        );

        let exclude: HashSet<String> = ["c1".to_string()].into_iter().collect();
        assert_eq!(
            reg.get_agent("coder", Some("rust"), &exclude).unwrap().id(),
            "c3"
        );
    }

    #[test]
    fn test_acquire_marks_busy_and_complete_frees() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &[]);
        let none = HashSet::new();

        let agent = reg.acquire("coder", None, &none).unwrap();
        assert_eq!(reg.status(agent.id()), Some(AgentStatus::Busy));
        assert!(reg.acquire("coder", None, &none).is_none());

        reg.complete("c1", TaskOutcome::success(Duration::from_millis(40)));
        assert_eq!(reg.status("c1"), Some(AgentStatus::Idle));
        let metrics = reg.agent_metrics();
        assert_eq!(metrics[0].tasks_completed, 1);
        assert!((metrics[0].avg_latency_ms - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_least_loaded_prefers_fewest_net_completed() {
        let reg = registry(LoadBalancingStrategy::LeastLoaded);
        add(&reg, "c1", "coder", &[]);
        add(&reg, "c2", "coder", &[]);
        let none = HashSet::new();

        reg.acquire("coder", None, &none).unwrap();
        reg.complete("c1", TaskOutcome::success(Duration::ZERO));
        assert_eq!(reg.get_agent("coder", None, &none).unwrap().id(), "c2");
    }

    #[test]
    fn test_performance_based_prefers_reliable_agent() {
        let reg = registry(LoadBalancingStrategy::PerformanceBased);
        add(&reg, "c1", "coder", &[]);
        add(&reg, "c2", "coder", &[]);
        reg.complete("c1", TaskOutcome::failure(Duration::from_millis(10)));
        reg.complete("c2", TaskOutcome::success(Duration::from_millis(10)));

        let none = HashSet::new();
        assert_eq!(reg.get_agent("coder", None, &none).unwrap().id(), "c2");
    }

    #[test]
    fn test_unregister_clears_indexes() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &["rust"]);
        assert!(reg.has_capable("coder", Some("rust")));
        assert!(reg.unregister("c1"));
        assert!(!reg.unregister("c1"));
        assert!(!reg.has_capable("coder", None));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_offline_agents_are_not_selected() {
        let reg = registry(LoadBalancingStrategy::RoundRobin);
        add(&reg, "c1", "coder", &[]);
        reg.set_status("c1", AgentStatus::Offline).unwrap();
        assert!(reg.get_agent("coder", None, &HashSet::new()).is_none());
        assert!(reg.has_capable("coder", None));
    }
}
