//! Best-effort coordination aids built on the bus.
//!
//! Neither primitive is a replicated state machine: consensus is a single
//! majority vote round and leader election is a deterministic pick over the
//! locally known participant set.

use crate::bus::MessageBus;
use crate::message::{AgentMessage, MessageType};
use maestro_core::{MaestroError, MaestroResult, Priority};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of one consensus round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    /// Id of the proposal message.
    pub proposal_id: Uuid,
    /// Whether a majority accepted.
    pub committed: bool,
    /// Participants asked to vote.
    pub participants: usize,
    /// Participants that voted before the timeout.
    pub responded: usize,
    /// Accept votes.
    pub votes_for: usize,
    /// Reject votes.
    pub votes_against: usize,
}

/// Build the vote a participant sends back for a proposal.
pub fn vote_for(proposal: &AgentMessage, voter: &str, accept: bool) -> AgentMessage {
    proposal.reply(voter, MessageType::ConsensusVote, json!({ "accept": accept }))
}

/// Runs propose, collect, commit rounds from one coordinator identity.
pub struct ConsensusCoordinator {
    bus: Arc<MessageBus>,
    coordinator_id: String,
    timeout: Duration,
}

impl ConsensusCoordinator {
    /// Coordinator on `bus` with its own mailbox; rounds wait at most `timeout` for votes.
    pub fn new(bus: Arc<MessageBus>, coordinator_id: impl Into<String>, timeout: Duration) -> Self {
        let coordinator_id = coordinator_id.into();
        bus.register_agent(coordinator_id.clone());
        Self {
            bus,
            coordinator_id,
            timeout,
        }
    }

    /// Propose `payload` to `participants`.
    ///
    /// The proposal commits when strictly more than half of the participants
    /// accept before the timeout; otherwise it is aborted. Either decision is
    /// sent to every participant.
    pub async fn propose(&self, participants: &[String], payload: Value) -> MaestroResult<ConsensusOutcome> {
        let participants: BTreeSet<&String> = participants.iter().collect();
        if participants.is_empty() {
            return Err(MaestroError::InvalidState(
                "consensus needs at least one participant".to_string(),
            ));
        }

        let proposal_id = Uuid::new_v4();
        for participant in &participants {
            let proposal = AgentMessage::new(
                self.coordinator_id.clone(),
                participant.as_str(),
                MessageType::ConsensusPropose,
                payload.clone(),
            )
            .with_priority(Priority::High)
            .with_correlation(proposal_id)
            .with_ttl(self.timeout);
            if !self.bus.send(proposal) {
                debug!(proposal_id = %proposal_id, participant = %participant, "Proposal not delivered");
            }
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut voted: HashSet<String> = HashSet::new();
        let mut votes_for = 0;
        let mut votes_against = 0;
        while voted.len() < participants.len() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let vote = self
                .bus
                .receive_matching(
                    &self.coordinator_id,
                    |m| {
                        m.message_type == MessageType::ConsensusVote
                            && m.correlation_id == Some(proposal_id)
                    },
                    remaining,
                )
                .await;
            let Some(vote) = vote else {
                break;
            };
            if !participants.contains(&vote.sender) || !voted.insert(vote.sender.clone()) {
                continue;
            }
            if vote.payload.get("accept").and_then(Value::as_bool).unwrap_or(false) {
                votes_for += 1;
            } else {
                votes_against += 1;
            }
        }

        let committed = votes_for * 2 > participants.len();
        let decision = if committed {
            MessageType::ConsensusCommit
        } else {
            MessageType::ConsensusAbort
        };
        for participant in &participants {
            self.bus.send(
                AgentMessage::new(
                    self.coordinator_id.clone(),
                    participant.as_str(),
                    decision.clone(),
                    json!({ "proposal_id": proposal_id }),
                )
                .with_priority(Priority::High)
                .with_correlation(proposal_id),
            );
        }

        info!(
            proposal_id = %proposal_id,
            committed,
            votes_for,
            votes_against,
            participants = participants.len(),
            "Consensus round finished"
        );
        Ok(ConsensusOutcome {
            proposal_id,
            committed,
            participants: participants.len(),
            responded: voted.len(),
            votes_for,
            votes_against,
        })
    }
}

#[derive(Debug, Default)]
struct ElectionState {
    participants: BTreeSet<String>,
    leader: Option<String>,
    term: u64,
}

/// Deterministic leader pick: the lexicographically smallest participant id.
pub struct LeaderElection {
    state: RwLock<ElectionState>,
    bus: Option<Arc<MessageBus>>,
    node_id: String,
}

impl LeaderElection {
    /// Election with no participants, seen from `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(ElectionState::default()),
            bus: None,
            node_id: node_id.into(),
        }
    }

    /// Broadcast a leader announcement on every change of leader.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add a participant; returns the leader afterwards.
    pub fn join(&self, participant: impl Into<String>) -> Option<String> {
        let changed = {
            let mut state = self.state.write();
            state.participants.insert(participant.into());
            Self::elect_locked(&mut state)
        };
        self.announce(changed)
    }

    /// Remove a participant, re-electing if it was the leader.
    pub fn leave(&self, participant: &str) -> Option<String> {
        let changed = {
            let mut state = self.state.write();
            state.participants.remove(participant);
            Self::elect_locked(&mut state)
        };
        self.announce(changed)
    }

    /// Current leader, if any participant joined.
    pub fn leader(&self) -> Option<String> {
        self.state.read().leader.clone()
    }

    /// Incremented on every change of leader.
    pub fn term(&self) -> u64 {
        self.state.read().term
    }

    /// Whether `participant` is the current leader.
    pub fn is_leader(&self, participant: &str) -> bool {
        self.state.read().leader.as_deref() == Some(participant)
    }

    /// Participants in id order.
    pub fn participants(&self) -> Vec<String> {
        self.state.read().participants.iter().cloned().collect()
    }

    /// Returns the new leader and term when the leader changed.
    fn elect_locked(state: &mut ElectionState) -> Option<(Option<String>, u64)> {
        let candidate = state.participants.iter().next().cloned();
        if candidate == state.leader {
            return None;
        }
        state.leader = candidate.clone();
        state.term += 1;
        Some((candidate, state.term))
    }

    fn announce(&self, changed: Option<(Option<String>, u64)>) -> Option<String> {
        if let Some((leader, term)) = &changed {
            info!(leader = ?leader, term, "Leader elected");
            if let Some(bus) = &self.bus {
                bus.send(
                    AgentMessage::broadcast(
                        self.node_id.clone(),
                        MessageType::LeaderAnnouncement,
                        json!({ "leader": leader, "term": term }),
                    )
                    .with_priority(Priority::Critical),
                );
            }
        }
        self.leader()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_id_leads() {
        let election = LeaderElection::new("self");
        assert_eq!(election.join("node-c").as_deref(), Some("node-c"));
        assert_eq!(election.join("node-a").as_deref(), Some("node-a"));
        assert_eq!(election.join("node-b").as_deref(), Some("node-a"));
        assert_eq!(election.term(), 2);
    }

    #[test]
    fn test_reelect_when_leader_leaves() {
        let election = LeaderElection::new("self");
        for id in ["b", "a", "c"] {
            election.join(id);
        }
        let term = election.term();
        // Non-leader leaving keeps the leader and the term.
        assert_eq!(election.leave("c").as_deref(), Some("a"));
        assert_eq!(election.term(), term);
        assert_eq!(election.leave("a").as_deref(), Some("b"));
        assert!(election.is_leader("b"));
        assert_eq!(election.leave("b"), None);
    }

    #[tokio::test]
    async fn test_election_announces_on_bus() {
        let bus = Arc::new(MessageBus::default());
        bus.register_agent("watcher");
        let election = LeaderElection::new("self").with_bus(Arc::clone(&bus));
        election.join("n1");
        let msg = bus.receive("watcher", Duration::from_millis(10)).await.unwrap();
        assert_eq!(msg.message_type, MessageType::LeaderAnnouncement);
        assert_eq!(msg.payload["leader"], "n1");
    }

    #[tokio::test]
    async fn test_consensus_without_participants_fails() {
        let bus = Arc::new(MessageBus::default());
        let coordinator = ConsensusCoordinator::new(bus, "coord", Duration::from_millis(10));
        assert!(coordinator.propose(&[], json!({})).await.is_err());
    }
}
