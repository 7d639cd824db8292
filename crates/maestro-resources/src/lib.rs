//! Capacity ledger for the Maestro orchestration core.
//!
//! Tracks CPU, memory, GPU and other capacity per node, grants and releases
//! multi-resource allocations atomically, and raises auto-scaling events.
//!
//! # Main types
//!
//! - [`ResourceManager`] — Allocation ledger guarded by a single async lock.
//! - [`ResourceNode`] — A capacity-bearing host; [`NodeDriver`] is its external contract.
//! - [`AllocationStrategy`] — First-fit, best-fit, priority-based or predictive placement.
//! - [`ResourceAllocation`] — One granted line item, optionally leased for a duration.
//! - [`ScaleEvent`] — Emitted when aggregate utilisation crosses a threshold.

/// Threshold-based scaling triggers.
pub mod autoscale;
/// The allocation ledger.
pub mod manager;
/// Resource nodes and the node driver contract.
pub mod node;
/// Candidate scoring for each allocation strategy.
pub mod strategy;

pub use autoscale::{AutoScaleConfig, ScaleDirection, ScaleEvent, ScalingHandler};
pub use manager::{
    AllocationState, ResourceAllocation, ResourceManager, ResourceManagerConfig, ResourceMetrics,
    ResourceUsage,
};
pub use node::{NodeDriver, NodeStatus, ResourceNode, CAPACITY_EPSILON};
pub use strategy::{AllocationStrategy, NodeHistory, NodeScore};
