//! Core types and error definitions for the Maestro orchestration core.
//!
//! This crate provides the foundational types shared across all Maestro crates:
//! the unified error enum, priorities, resource descriptions and logging setup.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`Priority`] — Ordering used by the scheduler, allocator and message queues.
//! - [`ResourceType`], [`ResourceSpec`], [`ResourceRequest`] — Capacity requests.
//! - [`init_logging`] — Installs the `tracing` subscriber.

/// Error taxonomy.
pub mod error;
/// Tracing subscriber initialisation.
pub mod logging;
/// Priorities and resource descriptions.
pub mod types;

pub use error::{MaestroError, MaestroResult};
pub use logging::{init_logging, LogFormat};
pub use types::{duration_ms, duration_ms_opt, Priority, ResourceRequest, ResourceSpec, ResourceType};
