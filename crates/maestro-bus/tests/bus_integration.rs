#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the message bus: TTL expiry, handler replies,
//! the reliability loop and consensus rounds.

use async_trait::async_trait;
use maestro_bus::*;
use maestro_core::MaestroResult;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// A broadcast whose TTL elapses before anyone polls is neither delivered nor retried
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_broadcast_is_not_delivered_or_retried() {
    let bus = MessageBus::new(BusConfig {
        retry_after: Duration::ZERO,
        ..BusConfig::default()
    });
    bus.register_agent("worker");
    assert!(bus.send(
        AgentMessage::broadcast("orchestrator", MessageType::StatusUpdate, json!({"phase": "plan"}))
            .with_ttl(Duration::from_millis(50))
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(bus.receive("worker", Duration::from_millis(10)).await.is_none());
    assert_eq!(bus.process_retries(), RetrySweep::default());

    let metrics = bus.metrics();
    assert_eq!(metrics.delivered, 0);
    assert_eq!(metrics.retried, 0);
    assert_eq!(metrics.expired, 1);
    assert_eq!(bus.dead_letters()[0].reason, DeadLetterReason::Expired);
}

#[tokio::test]
async fn already_expired_message_is_refused() {
    let bus = MessageBus::default();
    bus.register_agent("worker");
    let mut msg = AgentMessage::new("a", "worker", MessageType::Heartbeat, json!({}))
        .with_ttl(Duration::from_millis(1));
    msg.created_at -= chrono::Duration::seconds(1);
    assert!(!bus.send(msg));
    assert_eq!(bus.queue_len("worker"), 0);
}

// ---------------------------------------------------------------------------
// Handler responses travel back through the bus
// ---------------------------------------------------------------------------

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, message: &AgentMessage) -> MaestroResult<Option<AgentMessage>> {
        let responder = message.receiver.clone().unwrap_or_default();
        Ok(Some(message.reply(
            responder,
            MessageType::TaskResult,
            json!({ "echo": message.payload }),
        )))
    }
}

#[tokio::test]
async fn handler_reply_reaches_sender() {
    let bus = MessageBus::default();
    bus.register_agent("orchestrator");
    bus.register_agent("coder");
    bus.register_handler(MessageType::TaskRequest, Arc::new(Echo));

    let request = AgentMessage::new("orchestrator", "coder", MessageType::TaskRequest, json!("fix #12"));
    let request_id = request.id;
    bus.send(request);

    bus.receive("coder", Duration::from_millis(10)).await.unwrap();
    let reply = bus.receive("orchestrator", Duration::from_millis(10)).await.unwrap();
    assert_eq!(reply.message_type, MessageType::TaskResult);
    assert_eq!(reply.correlation_id, Some(request_id));
    assert_eq!(reply.payload["echo"], "fix #12");
}

// ---------------------------------------------------------------------------
// The reliability loop retries and finally dead-letters an unread message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reliability_loop_exhausts_retries() {
    let bus = Arc::new(MessageBus::new(BusConfig {
        retry_after: Duration::from_millis(5),
        reliability_interval: Duration::from_millis(5),
        ..BusConfig::default()
    }));
    bus.register_agent("asleep");
    bus.send(AgentMessage::new("o", "asleep", MessageType::TaskRequest, json!({})).with_max_retries(1));

    let handle = Arc::clone(&bus).spawn_reliability_loop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let metrics = bus.metrics();
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.pending, 0);
    assert_eq!(bus.dead_letters()[0].reason, DeadLetterReason::RetriesExhausted);
}

// ---------------------------------------------------------------------------
// Consensus: majority commits, minority aborts
// ---------------------------------------------------------------------------

fn spawn_voter(bus: Arc<MessageBus>, id: &'static str, accept: bool) -> tokio::task::JoinHandle<Option<MessageType>> {
    bus.register_agent(id);
    tokio::spawn(async move {
        let proposal = bus.receive(id, Duration::from_secs(1)).await?;
        bus.send(vote_for(&proposal, id, accept));
        let decision = bus
            .receive_matching(
                id,
                |m| m.correlation_id == proposal.correlation_id,
                Duration::from_secs(1),
            )
            .await?;
        Some(decision.message_type)
    })
}

#[tokio::test]
async fn majority_commits() {
    let bus = Arc::new(MessageBus::default());
    let voters = vec![
        spawn_voter(Arc::clone(&bus), "v1", true),
        spawn_voter(Arc::clone(&bus), "v2", true),
        spawn_voter(Arc::clone(&bus), "v3", false),
    ];
    let coordinator = ConsensusCoordinator::new(Arc::clone(&bus), "coord", Duration::from_millis(500));
    let participants = vec!["v1".to_string(), "v2".to_string(), "v3".to_string()];
    let outcome = coordinator.propose(&participants, json!({"plan": "p-1"})).await.unwrap();

    assert!(outcome.committed);
    assert_eq!((outcome.votes_for, outcome.votes_against), (2, 1));
    for voter in voters {
        assert_eq!(voter.await.unwrap(), Some(MessageType::ConsensusCommit));
    }
}

#[tokio::test]
async fn silent_participants_block_majority() {
    let bus = Arc::new(MessageBus::default());
    let _v1 = spawn_voter(Arc::clone(&bus), "v1", true);
    bus.register_agent("mute-1");
    bus.register_agent("mute-2");

    let coordinator = ConsensusCoordinator::new(Arc::clone(&bus), "coord", Duration::from_millis(50));
    let participants = vec!["v1".to_string(), "mute-1".to_string(), "mute-2".to_string()];
    let outcome = coordinator.propose(&participants, json!({})).await.unwrap();

    assert!(!outcome.committed);
    assert_eq!(outcome.responded, 1);
}
