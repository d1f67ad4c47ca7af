//! Per-producer outbound queues and the round-robin scheduler.
//!
//! Each producer owns a [`ProducerQueue`] with two parts:
//!
//! ```text
//!   in_flight (sent, unacked)      pending (not yet sent)
//!   [ 3 ][ 4 ][ 5 ]          ◄──   [ 6 ][ 7 ][ 8 ]   ◄── enqueue
//! ```
//!
//! Sequence numbers only grow. Requeueing after a reconnect moves
//! `in_flight` back in front of `pending`, keeping original numbers
//! and order.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use super::{ProducerId, StreamMessage};

#[derive(Debug, Default)]
pub(crate) struct ProducerQueue {
    /// Last sequence handed out; the first message gets 1.
    last_sequence: u64,
    pending: VecDeque<StreamMessage>,
    in_flight: VecDeque<StreamMessage>,
}

impl ProducerQueue {
    /// Messages owned by the queue (pending + unacknowledged).
    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn enqueue(&mut self, producer: &ProducerId, payload: Value, timestamp: u64) -> u64 {
        self.last_sequence += 1;
        self.pending.push_back(StreamMessage {
            producer: producer.clone(),
            sequence: self.last_sequence,
            payload,
            timestamp,
        });
        self.last_sequence
    }

    /// Move the oldest pending message to in-flight and return a copy.
    pub(crate) fn take_next(&mut self) -> Option<StreamMessage> {
        let msg = self.pending.pop_front()?;
        self.in_flight.push_back(msg.clone());
        Some(msg)
    }

    /// Drop the in-flight message `sequence`. `false` if unknown.
    pub(crate) fn acknowledge(&mut self, sequence: u64) -> bool {
        match self
            .in_flight
            .binary_search_by_key(&sequence, |m| m.sequence)
        {
            Ok(idx) => {
                self.in_flight.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Put every unacknowledged message back in front of `pending`.
    pub(crate) fn requeue(&mut self) -> usize {
        let n = self.in_flight.len();
        while let Some(msg) = self.in_flight.pop_back() {
            self.pending.push_front(msg);
        }
        n
    }

    /// Remove everything, returning the dropped sequence numbers in order.
    pub(crate) fn drain(&mut self) -> Vec<u64> {
        self.in_flight
            .drain(..)
            .chain(self.pending.drain(..))
            .map(|m| m.sequence)
            .collect()
    }
}

/// All producer queues plus the fairness cursor.
#[derive(Debug, Default)]
pub(crate) struct RoundRobin {
    queues: HashMap<ProducerId, ProducerQueue>,
    /// Producers in first-seen order.
    order: Vec<ProducerId>,
    cursor: usize,
}

impl RoundRobin {
    pub(crate) fn queue(&self, producer: &ProducerId) -> Option<&ProducerQueue> {
        self.queues.get(producer)
    }

    /// Like [`queue_mut`](Self::queue_mut), without creating an entry.
    pub(crate) fn existing_mut(&mut self, producer: &ProducerId) -> Option<&mut ProducerQueue> {
        self.queues.get_mut(producer)
    }

    pub(crate) fn producer_count(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn queue_mut(&mut self, producer: &ProducerId) -> &mut ProducerQueue {
        if !self.queues.contains_key(producer) {
            self.order.push(producer.clone());
        }
        self.queues.entry(producer.clone()).or_default()
    }

    /// Next message, visiting non-empty producers in turn.
    pub(crate) fn next(&mut self) -> Option<StreamMessage> {
        let n = self.order.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let Some(queue) = self.queues.get_mut(&self.order[idx]) else {
                continue;
            };
            if let Some(msg) = queue.take_next() {
                self.cursor = (idx + 1) % n;
                return Some(msg);
            }
        }
        None
    }

    pub(crate) fn requeue_all(&mut self) -> usize {
        self.queues.values_mut().map(ProducerQueue::requeue).sum()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<(ProducerId, Vec<u64>)> {
        self.order
            .iter()
            .filter_map(|id| {
                let seqs = self.queues.get_mut(id)?.drain();
                (!seqs.is_empty()).then(|| (id.clone(), seqs))
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> ProducerId {
        ProducerId::from(s)
    }

    #[test]
    fn sequences_start_at_one_and_grow() {
        let mut q = ProducerQueue::default();
        let p = id("a");
        assert_eq!(q.enqueue(&p, json!(1), 0), 1);
        assert_eq!(q.enqueue(&p, json!(2), 0), 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn requeue_preserves_numbers_and_order() {
        let mut q = ProducerQueue::default();
        let p = id("a");
        for i in 0..5 {
            q.enqueue(&p, json!(i), 0);
        }
        assert_eq!(q.take_next().unwrap().sequence, 1);
        assert_eq!(q.take_next().unwrap().sequence, 2);
        assert_eq!(q.take_next().unwrap().sequence, 3);
        assert!(q.acknowledge(2));
        assert_eq!(q.requeue(), 2);

        let order: Vec<u64> = std::iter::from_fn(|| q.take_next().map(|m| m.sequence)).collect();
        assert_eq!(order, vec![1, 3, 4, 5]);
        // New messages never reuse numbers.
        assert_eq!(q.enqueue(&p, json!("late"), 0), 6);
    }

    #[test]
    fn ack_of_unknown_sequence() {
        let mut q = ProducerQueue::default();
        q.enqueue(&id("a"), json!(0), 0);
        assert!(!q.acknowledge(1)); // still pending, not in flight
        q.take_next();
        assert!(q.acknowledge(1));
        assert!(!q.acknowledge(1));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn round_robin_is_fair() {
        let mut rr = RoundRobin::default();
        let (a, b, c) = (id("a"), id("b"), id("c"));
        for i in 0..3 {
            rr.queue_mut(&a).enqueue(&a, json!(i), 0);
        }
        rr.queue_mut(&b).enqueue(&b, json!(0), 0);
        for i in 0..2 {
            rr.queue_mut(&c).enqueue(&c, json!(i), 0);
        }

        let order: Vec<(String, u64)> = std::iter::from_fn(|| rr.next())
            .map(|m| (m.producer.to_string(), m.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".into(), 1),
                ("b".into(), 1),
                ("c".into(), 1),
                ("a".into(), 2),
                ("c".into(), 2),
                ("a".into(), 3),
            ]
        );
    }

    #[test]
    fn drain_reports_everything_once() {
        let mut rr = RoundRobin::default();
        let a = id("a");
        for i in 0..3 {
            rr.queue_mut(&a).enqueue(&a, json!(i), 0);
        }
        rr.next();
        let drained = rr.drain_all();
        assert_eq!(drained, vec![(a.clone(), vec![1, 2, 3])]);
        assert!(rr.drain_all().is_empty());
        assert_eq!(rr.queue(&a).unwrap().len(), 0);
    }
}
