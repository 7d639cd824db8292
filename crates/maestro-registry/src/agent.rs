use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A capability-providing executor.
///
/// Implementations perform the actual work of a task. `execute` must not
/// retry internally: retries, backoff and circuit breaking belong to the
/// orchestrator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique identifier within a registry.
    fn id(&self) -> &str;

    /// Agent type, matched against a task's capability type.
    fn agent_type(&self) -> &str;

    /// Named capabilities this agent declares.
    fn capabilities(&self) -> &[String];

    /// Run one task with the given parameters.
    async fn execute(&self, parameters: &Value) -> MaestroResult<Value>;

    /// Answer a liveness probe.
    async fn health_check(&self) -> bool;
}

/// Default agent variant: sleeps for a configured latency and echoes its input.
///
/// Failures can be scripted, which makes it the workhorse for dry runs and tests.
pub struct SimulatedAgent {
    id: String,
    agent_type: String,
    capabilities: Vec<String>,
    latency: Duration,
    failures_remaining: AtomicU32,
    always_fail: AtomicBool,
    healthy: AtomicBool,
    executions: AtomicU32,
}

impl SimulatedAgent {
    /// Healthy agent with 10 ms latency and no capabilities.
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            latency: Duration::from_millis(10),
            failures_remaining: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            executions: AtomicU32::new(0),
        }
    }

    /// Replace the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Set the simulated execution time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `n` executions, then succeed.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every execution.
    pub fn always_failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    /// Control the result of `health_check`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of times `execute` has been called.
    pub fn execution_count(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, parameters: &Value) -> MaestroResult<Value> {
        let attempt = self.executions.fetch_add(1, Ordering::SeqCst) + 1;

        // A task may override the simulated latency.
        let latency = parameters
            .get("simulate_ms")
            .and_then(Value::as_u64)
            .map_or(self.latency, Duration::from_millis);
        tokio::time::sleep(latency).await;

        if self.should_fail() {
            return Err(MaestroError::TaskExecutionFailed(format!(
                "simulated failure in agent '{}' (attempt {attempt})",
                self.id
            )));
        }

        Ok(serde_json::json!({
            "agent": self.id,
            "attempt": attempt,
            "echo": parameters,
        }))
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Boxed future returned by an [`FnAgent`] handler.
pub type AgentFuture = Pin<Box<dyn Future<Output = MaestroResult<Value>> + Send>>;

/// Handler signature wrapped by [`FnAgent`].
pub type AgentFn = Arc<dyn Fn(Value) -> AgentFuture + Send + Sync>;

/// Specialised agent variant backed by an async closure.
pub struct FnAgent {
    id: String,
    agent_type: String,
    capabilities: Vec<String>,
    handler: AgentFn,
}

impl FnAgent {
    /// Wrap an async closure as an agent.
    pub fn new<F, Fut>(id: impl Into<String>, agent_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MaestroResult<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            handler: Arc::new(move |params: Value| -> AgentFuture { Box::pin(handler(params)) }),
        }
    }

    /// Replace the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, parameters: &Value) -> MaestroResult<Value> {
        (self.handler)(parameters.clone()).await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_agent_echoes_parameters() {
        let agent = SimulatedAgent::new("a1", "coder").with_latency(Duration::ZERO);
        let out = agent
            .execute(&serde_json::json!({"file": "main.rs"}))
            .await
            .unwrap();
        assert_eq!(out["agent"], "a1");
        assert_eq!(out["echo"]["file"], "main.rs");
        assert_eq!(agent.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_first_then_succeeds() {
        let agent = SimulatedAgent::new("a1", "coder")
            .with_latency(Duration::ZERO)
            .failing_first(2);
        let params = serde_json::json!({});
        assert!(agent.execute(&params).await.is_err());
        assert!(agent.execute(&params).await.is_err());
        assert!(agent.execute(&params).await.is_ok());
        assert_eq!(agent.execution_count(), 3);
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let agent = SimulatedAgent::new("a1", "coder");
        assert!(agent.health_check().await);
        agent.set_healthy(false);
        assert!(!agent.health_check().await);
    }

    #[tokio::test]
    async fn test_fn_agent_runs_closure() {
        let agent = FnAgent::new("sum", "math", |params: Value| async move {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok(serde_json::json!(a + b))
        })
        .with_capabilities(&["add"]);

        let out = agent
            .execute(&serde_json::json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!(5));
        assert_eq!(agent.capabilities(), ["add".to_string()]);
    }
}
