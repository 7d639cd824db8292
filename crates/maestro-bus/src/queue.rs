use crate::message::AgentMessage;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry {
    seq: u64,
    message: AgentMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue, FIFO within one priority.
pub struct MessageQueue {
    heap: BinaryHeap<Entry>,
    capacity: usize,
    next_seq: u64,
}

impl MessageQueue {
    /// Create an empty queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Enqueue and return the arrival sequence assigned to the message.
    /// Hands the message back when the queue is full.
    pub fn push(&mut self, message: AgentMessage) -> Result<u64, AgentMessage> {
        let seq = self.next_seq;
        self.push_with_seq(seq, message)?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Re-enqueue a message under a sequence previously returned by
    /// [`MessageQueue::push`], so it keeps its place among equal priorities.
    pub fn push_with_seq(&mut self, seq: u64, message: AgentMessage) -> Result<u64, AgentMessage> {
        if self.heap.len() >= self.capacity {
            return Err(message);
        }
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
        self.heap.push(Entry { seq, message });
        Ok(seq)
    }

    /// Remove the highest-priority, earliest-queued message.
    pub fn pop(&mut self) -> Option<AgentMessage> {
        self.heap.pop().map(|e| e.message)
    }

    /// Remove the best-ranked message satisfying `predicate`, keeping the rest queued.
    pub fn pop_matching<F>(&mut self, mut predicate: F) -> Option<AgentMessage>
    where
        F: FnMut(&AgentMessage) -> bool,
    {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(entry) = self.heap.pop() {
            if predicate(&entry.message) {
                found = Some(entry.message);
                break;
            }
            skipped.push(entry);
        }
        self.heap.extend(skipped);
        found
    }

    /// Drop every message for which `predicate` holds and return them.
    pub fn drain_where<F>(&mut self, mut predicate: F) -> Vec<AgentMessage>
    where
        F: FnMut(&AgentMessage) -> bool,
    {
        let (drained, kept): (Vec<Entry>, Vec<Entry>) =
            std::mem::take(&mut self.heap).into_iter().partition(|e| predicate(&e.message));
        self.heap = kept.into_iter().collect();
        drained.into_iter().map(|e| e.message).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use maestro_core::Priority;
    use serde_json::json;

    fn msg(tag: &str, priority: Priority) -> AgentMessage {
        AgentMessage::new("s", "r", MessageType::StatusUpdate, json!(tag)).with_priority(priority)
    }

    fn tag(m: &AgentMessage) -> &str {
        m.payload.as_str().unwrap()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = MessageQueue::new(16);
        q.push(msg("n1", Priority::Normal)).unwrap();
        q.push(msg("c1", Priority::Critical)).unwrap();
        q.push(msg("n2", Priority::Normal)).unwrap();
        q.push(msg("l1", Priority::Low)).unwrap();
        q.push(msg("c2", Priority::Critical)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.pop()).map(|m| tag(&m).to_string()).collect();
        assert_eq!(order, ["c1", "c2", "n1", "n2", "l1"]);
    }

    #[test]
    fn test_pop_matching_keeps_order_of_rest() {
        let mut q = MessageQueue::new(16);
        q.push(msg("a", Priority::Normal)).unwrap();
        q.push(msg("b", Priority::Normal)).unwrap();
        q.push(msg("c", Priority::Normal)).unwrap();

        let b = q.pop_matching(|m| tag(m) == "b").unwrap();
        assert_eq!(tag(&b), "b");
        assert_eq!(tag(&q.pop().unwrap()), "a");
        assert_eq!(tag(&q.pop().unwrap()), "c");
        assert!(q.pop_matching(|_| true).is_none());
    }

    #[test]
    fn test_capacity_bound() {
        let mut q = MessageQueue::new(1);
        q.push(msg("a", Priority::Normal)).unwrap();
        let rejected = q.push(msg("b", Priority::Critical)).unwrap_err();
        assert_eq!(tag(&rejected), "b");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_requeue_keeps_arrival_order() {
        let mut q = MessageQueue::new(8);
        let first = q.push(msg("first", Priority::Normal)).unwrap();
        q.push(msg("second", Priority::Normal)).unwrap();

        let mut taken = q.drain_where(|m| tag(m) == "first");
        q.push_with_seq(first, taken.remove(0)).unwrap();
        q.push(msg("third", Priority::Normal)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.pop()).map(|m| tag(&m).to_string()).collect();
        assert_eq!(order, ["first", "second", "third"]);
    }

    #[test]
    fn test_drain_where() {
        let mut q = MessageQueue::new(8);
        q.push(msg("x", Priority::Low)).unwrap();
        q.push(msg("y", Priority::High)).unwrap();
        let drained = q.drain_where(|m| m.priority == Priority::Low);
        assert_eq!(drained.len(), 1);
        assert_eq!(q.len(), 1);
    }
}
