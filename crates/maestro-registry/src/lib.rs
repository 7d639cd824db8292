//! Agent directory for the Maestro orchestration core.
//!
//! Tracks known executors, their capabilities, health and load, and picks an
//! idle executor for a task's capability type.
//!
//! # Main types
//!
//! - [`Agent`] — Capability interface implemented by executors (`execute`, `health_check`).
//! - [`SimulatedAgent`] — Default variant with scripted latency and failures.
//! - [`FnAgent`] — Variant backed by an async closure.
//! - [`AgentRegistry`] — Indexes agents by type and capability and load-balances among them.
//! - [`LoadBalancingStrategy`] — Round-robin, least-loaded or performance-based selection.

/// Agent capability trait and built-in variants.
pub mod agent;
/// Periodic health probing.
pub mod health;
/// Agent directory and selection.
pub mod registry;

pub use agent::{Agent, AgentFn, AgentFuture, FnAgent, SimulatedAgent};
pub use health::HealthSweep;
pub use registry::{
    AgentMetrics, AgentRegistry, AgentStatus, LoadBalancingStrategy, RegistryConfig, TaskOutcome,
};
