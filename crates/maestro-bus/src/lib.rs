//! Message bus for the Maestro orchestration core.
//!
//! Asynchronous, priority-ordered, at-least-once delivery between the
//! orchestrator and agents, with TTLs, filters, routing rules, handlers,
//! retries and a bounded dead-letter queue.
//!
//! # Main types
//!
//! - [`MessageBus`] — Per-agent priority queues plus a shared broadcast queue.
//! - [`AgentMessage`] — A unit of communication with TTL and retry accounting.
//! - [`MessageHandler`] — Reacts to delivered messages, optionally replying.
//! - [`ConsensusCoordinator`] — Majority-vote propose/collect/commit rounds.
//! - [`LeaderElection`] — Smallest-id leader pick with re-election on leave.

/// The bus itself.
pub mod bus;
/// Consensus and leader election.
pub mod coordination;
/// Message envelope.
pub mod message;
/// Priority queue used for every mailbox.
pub mod queue;

pub use bus::{
    BusConfig, BusMetrics, DeadLetter, DeadLetterReason, MessageBus, MessageFilter,
    MessageHandler, RetrySweep, RoutingRule,
};
pub use coordination::{vote_for, ConsensusCoordinator, ConsensusOutcome, LeaderElection};
pub use message::{AgentMessage, MessageType};
pub use queue::MessageQueue;
