//! Workflow engine and runtime wiring for the Maestro orchestration core.
//!
//! Runs dependency graphs of tasks to completion: tasks become ready when their
//! prerequisites complete, are dispatched under per-workflow parallelism limits
//! once resources and an idle agent are available, and are retried with backoff
//! behind per-agent-type circuit breakers.
//!
//! # Main types
//!
//! - [`WorkflowEngine`] — Creates, executes, cancels and reports on workflows.
//! - [`WorkflowDefinition`] / [`TaskDefinition`] — Declarative workflow input.
//! - [`RetryPolicy`] — Fixed, linear, exponential or Fibonacci backoff with jitter.
//! - [`CircuitBreakerRegistry`] — One consecutive-failure breaker per agent type.
//! - [`OrchestrationMonitor`] — Snapshots across engine, registry, resources and bus.
//! - [`MaestroConfig`] / [`MaestroRuntime`] — TOML configuration and assembled subsystems.

/// TOML configuration.
pub mod config;
/// Workflow scheduling loop.
pub mod engine;
/// Metrics snapshots and periodic reporting.
pub mod monitor;
/// Backoff and circuit breakers.
pub mod reliability;
/// Subsystem assembly and background loops.
pub mod runtime;
/// Workflow and task types, status reports and engine events.
pub mod types;

pub use config::{LoggingConfig, MaestroConfig, MonitorConfig};
pub use engine::{EngineConfig, WorkflowEngine};
pub use monitor::{AggregateMetrics, LogSink, MetricsSink, MonitoringSnapshot, OrchestrationMonitor};
pub use reliability::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, RetryPolicy,
};
pub use runtime::MaestroRuntime;
pub use types::{
    DependencyEdge, EngineEvent, Task, TaskDefinition, TaskReport, TaskStatus, Workflow,
    WorkflowDefinition, WorkflowMetrics, WorkflowStatus, WorkflowStatusReport,
};
