//! Bounded per-client ring of outbound events.
//!
//! Fixed size, oldest-evicted on overflow. `poll` returns the oldest
//! pending entry, so per-client order is preserved; nothing is ever
//! delivered twice.

use std::sync::Mutex;

use monxrt_common::time::monotonic_ns;
use monxrt_proto::{Event, EVENT_QUEUE_SIZE};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct QueuedEvent {
    timestamp_ns: u64,
    pending: bool,
    event: Event,
}

/// The per-client event ring.
#[derive(Debug, Default)]
pub struct EventQueue {
    slots: Mutex<Vec<QueuedEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// First non-pending slot, else the oldest pending one (which is then
    /// lost).
    fn find_slot(slots: &[QueuedEvent]) -> usize {
        let mut oldest_timestamp = u64::MAX;
        let mut oldest_index = 0;
        for (i, slot) in slots.iter().enumerate() {
            if !slot.pending {
                return i;
            }
            if slot.timestamp_ns < oldest_timestamp {
                oldest_timestamp = slot.timestamp_ns;
                oldest_index = i;
            }
        }
        warn!("event queue full, dropping oldest unconsumed event");
        oldest_index
    }

    /// Enqueue an event with the current timestamp.
    pub fn push(&self, event: Event) {
        self.push_at(event, monotonic_ns());
    }

    /// Enqueue an event with an explicit timestamp.
    pub fn push_at(&self, event: Event, timestamp_ns: u64) {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() < EVENT_QUEUE_SIZE {
            slots.push(QueuedEvent {
                timestamp_ns,
                pending: true,
                event,
            });
            return;
        }
        let index = Self::find_slot(&slots);
        slots[index] = QueuedEvent {
            timestamp_ns,
            pending: true,
            event,
        };
    }

    /// Take the oldest pending event, if any.
    pub fn poll(&self) -> Option<(u64, Event)> {
        let mut slots = self.slots.lock().unwrap();
        let mut best: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            if slot.pending
                && best.map_or(true, |b| slot.timestamp_ns < slots[b].timestamp_ns)
            {
                best = Some(i);
            }
        }
        best.map(|i| {
            slots[i].pending = false;
            (slots[i].timestamp_ns, slots[i].event)
        })
    }

    /// Number of undelivered events.
    pub fn pending_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.pending).count()
    }

    /// Drop everything, delivered or not.
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monxrt_proto::SessionState;

    fn state_event(state: SessionState) -> Event {
        Event::SessionStateChanged { state }
    }

    #[test]
    fn poll_returns_oldest_first() {
        let queue = EventQueue::new();
        queue.push_at(state_event(SessionState::Ready), 10);
        queue.push_at(state_event(SessionState::Synchronized), 20);
        queue.push_at(state_event(SessionState::Visible), 30);

        assert_eq!(queue.poll().unwrap().0, 10);
        assert_eq!(queue.poll().unwrap().0, 20);
        assert_eq!(queue.poll().unwrap().0, 30);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn nothing_delivered_twice() {
        let queue = EventQueue::new();
        queue.push_at(state_event(SessionState::Ready), 1);
        assert!(queue.poll().is_some());
        assert!(queue.poll().is_none());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let queue = EventQueue::new();
        for i in 0..EVENT_QUEUE_SIZE as u64 {
            queue.push_at(state_event(SessionState::Ready), i);
        }
        // One past capacity: the oldest (timestamp 0) must go.
        queue.push_at(state_event(SessionState::Exiting), 1_000);

        let mut timestamps = Vec::new();
        while let Some((ts, _)) = queue.poll() {
            timestamps.push(ts);
        }
        assert_eq!(timestamps.len(), EVENT_QUEUE_SIZE);
        assert!(!timestamps.contains(&0));
        assert!(timestamps.contains(&1_000));
    }

    #[test]
    fn delivered_slots_are_reused_before_eviction() {
        let queue = EventQueue::new();
        for i in 0..EVENT_QUEUE_SIZE as u64 {
            queue.push_at(state_event(SessionState::Ready), i);
        }
        // Deliver one, freeing a slot; the next push must not evict.
        let (first, _) = queue.poll().unwrap();
        assert_eq!(first, 0);
        queue.push_at(state_event(SessionState::Visible), 500);
        assert_eq!(queue.pending_count(), EVENT_QUEUE_SIZE);

        let mut timestamps = Vec::new();
        while let Some((ts, _)) = queue.poll() {
            timestamps.push(ts);
        }
        // Everything from 1..SIZE plus the late push survived.
        assert!(timestamps.contains(&1));
        assert!(timestamps.contains(&500));
    }
}
