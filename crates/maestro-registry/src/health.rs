use crate::registry::AgentRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Result of one health sweep over the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSweep {
    /// Agents that answered the probe.
    pub healthy: Vec<String>,
    /// Agents that failed or timed out on this probe.
    pub failed_probe: Vec<String>,
    /// Agents newly marked `error` because they stayed silent too long.
    pub unreachable: Vec<String>,
}

impl AgentRegistry {
    /// Probe every agent once and mark long-silent agents unreachable.
    ///
    /// A successful probe counts as a heartbeat (and recovers an agent in
    /// `error`). An agent is only marked unreachable once it has missed
    /// probes for more than twice the probe interval.
    pub async fn run_health_checks(&self) -> HealthSweep {
        let timeout = self.config().health_check_timeout;
        let mut sweep = HealthSweep::default();

        for (id, agent) in self.probe_targets() {
            let healthy = matches!(
                tokio::time::timeout(timeout, agent.health_check()).await,
                Ok(true)
            );
            if healthy {
                self.heartbeat(&id);
                sweep.healthy.push(id);
            } else {
                debug!(agent_id = %id, "Health probe failed");
                sweep.failed_probe.push(id);
            }
        }

        sweep.unreachable = self.mark_unreachable(self.config().health_check_interval * 2);
        sweep.healthy.sort();
        sweep.failed_probe.sort();
        sweep
    }

    /// Run [`AgentRegistry::run_health_checks`] on the configured interval until aborted.
    pub fn spawn_health_monitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config().health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sweep = self.run_health_checks().await;
                if !sweep.unreachable.is_empty() {
                    warn!(agents = ?sweep.unreachable, "Agents became unreachable");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::agent::SimulatedAgent;
    use crate::registry::{AgentRegistry, AgentStatus, RegistryConfig};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig {
            health_check_interval: Duration::from_millis(20),
            health_check_timeout: Duration::from_millis(10),
            ..RegistryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_silent_agent_marked_unreachable_and_recovers() {
        let registry = fast_registry();
        let agent = Arc::new(SimulatedAgent::new("c1", "coder"));
        registry.register(agent.clone()).unwrap();

        agent.set_healthy(false);
        // One missed probe is tolerated.
        let sweep = registry.run_health_checks().await;
        assert_eq!(sweep.failed_probe, ["c1"]);
        assert!(sweep.unreachable.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sweep = registry.run_health_checks().await;
        assert_eq!(sweep.unreachable, ["c1"]);
        assert_eq!(registry.status("c1"), Some(AgentStatus::Error));
        assert!(registry.get_agent("coder", None, &HashSet::new()).is_none());

        agent.set_healthy(true);
        let sweep = registry.run_health_checks().await;
        assert_eq!(sweep.healthy, ["c1"]);
        assert_eq!(registry.status("c1"), Some(AgentStatus::Idle));
    }

    #[tokio::test]
    async fn test_offline_agents_are_not_probed() {
        let registry = fast_registry();
        registry
            .register(Arc::new(SimulatedAgent::new("c1", "coder")))
            .unwrap();
        registry.set_status("c1", AgentStatus::Offline).unwrap();

        let sweep = registry.run_health_checks().await;
        assert!(sweep.healthy.is_empty());
        assert!(sweep.failed_probe.is_empty());
        assert_eq!(registry.status("c1"), Some(AgentStatus::Offline));
    }
}
