//! Time-ordered event queue with deterministic tie-breaking.
//!
//! A min-heap over (time, sequence): events are processed in time order and
//! ties are broken by insertion order, so a run's event ordering is a total
//! order that never depends on heap internals.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::engine::state::SimEvent;
use crate::engine::SimTime;

/// An event with its queue position.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Scheduled time.
    pub time: SimTime,
    /// Monotonic insertion index for tie-breaking.
    pub sequence: u64,
    /// The event itself.
    pub event: SimEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.time.cmp(&other.time) {
            std::cmp::Ordering::Equal => self.sequence.cmp(&other.sequence),
            ord => ord,
        }
    }
}

/// Priority-ordered event queue for one simulation run.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    sequence: u64,
}

impl EventQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event at its own `time`.
    pub fn push(&mut self, event: SimEvent) {
        let seq = self.sequence;
        self.sequence += 1;
        self.heap.push(Reverse(QueuedEvent {
            time: event.time,
            sequence: seq,
            event,
        }));
    }

    /// Remove and return the earliest event.
    pub fn pop(&mut self) -> Option<QueuedEvent> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    /// Look at the earliest event without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&QueuedEvent> {
        self.heap.peek().map(|Reverse(e)| e)
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod proptests {
    use super::*;
    use crate::engine::state::{EventType, SimEvent};
    use proptest::prelude::*;

    proptest! {
        /// Falsification: pops are always non-decreasing in time.
        #[test]
        fn prop_pops_in_time_order(days in prop::collection::vec(0.0f64..1000.0, 1..100)) {
            let mut queue = EventQueue::new();
            for (i, d) in days.iter().enumerate() {
                queue.push(SimEvent::new(
                    EventType::SiteActivation,
                    format!("s{i}"),
                    SimTime::from_days(*d),
                ));
            }
            let mut last = SimTime::ZERO;
            while let Some(q) = queue.pop() {
                prop_assert!(q.time >= last);
                last = q.time;
            }
        }
    }
}
