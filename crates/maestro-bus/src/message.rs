use chrono::{DateTime, Utc};
use maestro_core::Priority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Kind of a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed to an agent.
    TaskRequest,
    /// Result of a task request.
    TaskResult,
    /// Progress or state change.
    StatusUpdate,
    /// Liveness signal.
    Heartbeat,
    /// Consensus round proposal.
    ConsensusPropose,
    /// Vote on a proposal.
    ConsensusVote,
    /// Proposal accepted.
    ConsensusCommit,
    /// Proposal rejected or timed out.
    ConsensusAbort,
    /// New leader elected.
    LeaderAnnouncement,
    /// Application-defined type.
    Custom(String),
}

/// A unit of communication between the orchestrator and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Message id.
    pub id: Uuid,
    /// Sending agent or component.
    pub sender: String,
    /// `None` addresses the broadcast queue.
    pub receiver: Option<String>,
    /// Kind of message, used to pick handlers.
    pub message_type: MessageType,
    /// Delivery priority within a queue.
    #[serde(default)]
    pub priority: Priority,
    /// Message body.
    #[serde(default)]
    pub payload: Value,
    /// Creation time; TTL counts from here.
    pub created_at: DateTime<Utc>,
    /// Time to live in milliseconds, counted from `created_at`.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Retries performed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Retries allowed before dead-lettering.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Links replies to the message they answer.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

fn default_max_retries() -> u32 {
    3
}

impl AgentMessage {
    /// Message addressed to `receiver`.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            receiver: Some(receiver.into()),
            ..Self::broadcast(sender, message_type, payload)
        }
    }

    /// Message for the broadcast queue.
    pub fn broadcast(sender: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            receiver: None,
            message_type,
            priority: Priority::Normal,
            payload,
            created_at: Utc::now(),
            ttl_ms: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            correlation_id: None,
        }
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Expire the message `ttl` after creation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set how many retries are allowed.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Link the message to an earlier one.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build a reply addressed to this message's sender.
    pub fn reply(&self, sender: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self::new(sender, self.sender.clone(), message_type, payload)
            .with_priority(self.priority)
            .with_correlation(self.correlation_id.unwrap_or(self.id))
    }

    /// Whether the message has no receiver.
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    /// Expiry instant, if the message has a TTL.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_ms?).ok()?;
        Some(self.created_at + chrono::Duration::milliseconds(ttl))
    }

    /// Whether the TTL ended at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Whether the TTL has already ended.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ttl_expiry() {
        let msg = AgentMessage::broadcast("orchestrator", MessageType::Heartbeat, json!({}))
            .with_ttl(Duration::from_secs(5));
        assert!(!msg.is_expired());
        let later = msg.created_at + chrono::Duration::seconds(6);
        assert!(msg.is_expired_at(later));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let msg = AgentMessage::new("a", "b", MessageType::TaskRequest, json!(null));
        let far = msg.created_at + chrono::Duration::days(365);
        assert!(!msg.is_expired_at(far));
    }

    #[test]
    fn test_reply_correlates() {
        let request = AgentMessage::new("orchestrator", "coder-1", MessageType::TaskRequest, json!({}))
            .with_priority(Priority::High);
        let reply = request.reply("coder-1", MessageType::TaskResult, json!({"ok": true}));
        assert_eq!(reply.receiver.as_deref(), Some("orchestrator"));
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.priority, Priority::High);
    }

    #[test]
    fn test_message_serialization() {
        let msg = AgentMessage::new("a", "b", MessageType::Custom("ping".into()), json!({"n": 1}));
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_type, MessageType::Custom("ping".into()));
        assert_eq!(back.payload["n"], 1);
    }
}
