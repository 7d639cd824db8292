use crate::config::MaestroConfig;
use crate::engine::WorkflowEngine;
use crate::monitor::{LogSink, MetricsSink, OrchestrationMonitor};
use crate::reliability::CircuitBreakerRegistry;
use maestro_bus::MessageBus;
use maestro_core::MaestroResult;
use maestro_planner::ExecutionPlanner;
use maestro_registry::{Agent, AgentRegistry};
use maestro_resources::{ResourceManager, ResourceNode};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// All subsystems built from one [`MaestroConfig`] and their background loops.
///
/// Construction only wires components together; [`MaestroRuntime::start`]
/// spawns the periodic tasks and [`MaestroRuntime::shutdown`] stops them.
pub struct MaestroRuntime {
    config: MaestroConfig,
    registry: Arc<AgentRegistry>,
    resources: Arc<ResourceManager>,
    bus: Arc<MessageBus>,
    planner: Arc<ExecutionPlanner>,
    engine: Arc<WorkflowEngine>,
    monitor: Arc<OrchestrationMonitor>,
    sink: Arc<dyn MetricsSink>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MaestroRuntime {
    /// Validate `config` and wire every subsystem. No background loop runs yet.
    pub fn new(config: MaestroConfig) -> MaestroResult<Self> {
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        let bus = Arc::new(MessageBus::new(config.bus.clone()));
        let planner = Arc::new(ExecutionPlanner::new(config.planner.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        let engine = Arc::new(
            WorkflowEngine::new(
                config.engine.clone(),
                Arc::clone(&registry),
                Arc::clone(&resources),
                Arc::clone(&planner),
            )
            .with_retry_policy(config.retry.clone())
            .with_circuit_breakers(breakers),
        );
        let monitor = Arc::new(OrchestrationMonitor::new(Arc::clone(&engine)).with_bus(Arc::clone(&bus)));

        Ok(Self {
            config,
            registry,
            resources,
            bus,
            planner,
            engine,
            monitor,
            sink: Arc::new(LogSink),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Build a runtime from a TOML file.
    pub fn from_config_file(path: impl AsRef<Path>) -> MaestroResult<Self> {
        Self::new(MaestroConfig::load(path)?)
    }

    /// Replace the default logging sink used by the metrics reporter.
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Spawn the expiry sweeper, auto-scaler, bus reliability loop, agent
    /// health monitor and metrics reporter. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }
        background.push(Arc::clone(&self.resources).spawn_expiry_sweeper());
        if self.config.resources.autoscale.enabled {
            background.push(Arc::clone(&self.resources).spawn_autoscaler());
        }
        background.push(Arc::clone(&self.bus).spawn_reliability_loop());
        background.push(Arc::clone(&self.registry).spawn_health_monitor());
        if self.config.monitor.enabled {
            background.push(
                Arc::clone(&self.monitor)
                    .spawn_reporter(Arc::clone(&self.sink), self.config.monitor.report_interval),
            );
        }
        info!(loops = background.len(), "Maestro runtime started");
    }

    /// Whether background loops are running.
    pub fn is_running(&self) -> bool {
        !self.background.lock().is_empty()
    }

    /// Abort every background loop. Workflows already executing keep running.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        if count > 0 {
            info!(loops = count, "Maestro runtime stopped");
        }
    }

    /// Register an agent with the directory and give it a bus mailbox.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> MaestroResult<()> {
        let id = agent.id().to_string();
        self.registry.register(agent)?;
        self.bus.register_agent(id);
        Ok(())
    }

    /// Add a resource node.
    pub async fn register_node(&self, node: ResourceNode) -> MaestroResult<()> {
        self.resources.register_node(node).await
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &MaestroConfig {
        &self.config
    }

    /// Get a reference to the workflow engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Get a reference to the agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Get a reference to the resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Get a reference to the message bus.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Get a reference to the planner.
    pub fn planner(&self) -> &Arc<ExecutionPlanner> {
        &self.planner
    }

    /// Get a reference to the monitor.
    pub fn monitor(&self) -> &Arc<OrchestrationMonitor> {
        &self.monitor
    }
}

impl Drop for MaestroRuntime {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}
