//! Bounded history of state transitions.

use std::collections::VecDeque;
use std::time::SystemTime;

use super::ConnectionState;

/// One observable state change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Human-readable cause.
    pub reason: String,
    pub at: SystemTime,
}

/// Ring of the most recent [`StatusEvent`]s; oldest are dropped first.
#[derive(Debug)]
pub struct TransitionLog {
    events: VecDeque<StatusEvent>,
    capacity: usize,
}

impl TransitionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: StatusEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<StatusEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(to: ConnectionState) -> StatusEvent {
        StatusEvent {
            from: ConnectionState::Idle,
            to,
            reason: String::new(),
            at: SystemTime::now(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut log = TransitionLog::new(2);
        log.push(ev(ConnectionState::Connecting));
        log.push(ev(ConnectionState::Authenticating));
        log.push(ev(ConnectionState::Connected));
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].to, ConnectionState::Authenticating);
        assert_eq!(recent[1].to, ConnectionState::Connected);
    }

    #[test]
    fn zero_capacity_keeps_one() {
        let mut log = TransitionLog::new(0);
        log.push(ev(ConnectionState::Closed));
        assert_eq!(log.len(), 1);
    }
}
