// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Priority lanes backing the event queue.
//!
//! Each lane is a bounded tokio mpsc channel. Producers on any thread hold
//! the senders; the processing loop checks the receivers out while it runs
//! and hands them back on a clean stop.
//!
//! If the loop's runtime goes away while it owns the receivers, they are
//! dropped with the task and the senders start reporting `Closed`. That is
//! the one recoverable fault the lanes know about, and [`LaneSet::recreate`]
//! rebuilds the channels so the queue keeps working. Subscriptions and
//! history live outside the lanes and survive.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::warn;

use crate::domain::events::{Event, EventId, EventPriority, EventType};

/// Per-lane depth, as reported by `EventQueue::get_queue_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSize {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

impl QueueSize {
    pub fn get(&self, lane: EventPriority) -> usize {
        match lane {
            EventPriority::High => self.high,
            EventPriority::Normal => self.normal,
            EventPriority::Low => self.low,
        }
    }
}

/// Reasons a push did not land in its lane.
#[derive(Debug)]
pub(crate) enum LaneFault {
    Full(Event),
    /// Receiver side is gone. Recoverable via [`LaneSet::recreate`].
    Closed(Event),
}

/// Why the lanes were rebuilt.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RecreateCause {
    /// The processing loop's runtime dropped the receivers.
    ReceiverDropped,
    /// The loop was aborted on stop and never returned the receivers.
    ReceiversLost,
}

/// Unit of work pulled off a lane: one event, or a same-type burst.
#[derive(Debug)]
pub(crate) struct DeliveryUnit {
    lane: EventPriority,
    events: Vec<Event>,
}

impl DeliveryUnit {
    pub fn lane(&self) -> EventPriority {
        self.lane
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_batch(&self) -> bool {
        self.events.len() > 1
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Batches are keyed by their first event for retry bookkeeping.
    pub fn key(&self) -> Option<EventId> {
        self.events.first().map(Event::event_id)
    }

    pub fn event_type(&self) -> Option<&EventType> {
        self.events.first().map(Event::event_type)
    }

    /// Payload handed to subscribers. A single event is delivered as-is; a
    /// burst is wrapped as `{batch, count, items}` and keeps the correlation
    /// id when every item shares it.
    pub fn payload(&self) -> serde_json::Value {
        if !self.is_batch() {
            return self
                .events
                .first()
                .map(|e| e.data().clone())
                .unwrap_or(serde_json::Value::Null);
        }

        let items: Vec<_> = self.events.iter().map(|e| e.data().clone()).collect();
        let mut wrapper = serde_json::json!({
            "batch": true,
            "count": self.events.len(),
            "items": items,
        });
        if let Some(correlation_id) = self.shared_correlation_id() {
            wrapper["correlation_id"] = serde_json::Value::String(correlation_id.to_string());
        }
        wrapper
    }

    fn shared_correlation_id(&self) -> Option<&str> {
        let first = self.events.first()?.correlation_id()?;
        self.events
            .iter()
            .all(|e| e.correlation_id() == Some(first))
            .then_some(first)
    }
}

pub(crate) struct BatchSettings {
    pub enabled: bool,
    pub max_batch_size: usize,
}

/// Receiving half of the lanes, owned by the processing loop while it runs.
pub(crate) struct LaneReceivers {
    receivers: [mpsc::Receiver<Event>; 3],
    /// Event pulled while extending a batch that belongs to the next unit.
    lookahead: [Option<Event>; 3],
    in_flight: Arc<AtomicUsize>,
}

impl LaneReceivers {
    fn pop(&mut self, lane: EventPriority) -> Option<Event> {
        let idx = lane.index();
        if let Some(event) = self.lookahead[idx].take() {
            return Some(event);
        }
        match self.receivers[idx].try_recv() {
            Ok(event) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Next unit in strict priority order. The high lane is never batched.
    pub fn next_unit(&mut self, batching: &BatchSettings) -> Option<DeliveryUnit> {
        for lane in EventPriority::ORDERED {
            let Some(first) = self.pop(lane) else {
                continue;
            };

            let mut events = vec![first];
            if lane != EventPriority::High && batching.enabled {
                while events.len() < batching.max_batch_size {
                    match self.pop(lane) {
                        Some(next) if next.event_type() == events[0].event_type() => events.push(next),
                        Some(other) => {
                            self.lookahead[lane.index()] = Some(other);
                            break;
                        }
                        None => break,
                    }
                }
            }
            return Some(DeliveryUnit { lane, events });
        }
        None
    }

    /// Waits until any lane yields an event. Returns the lane it arrived on,
    /// or `None` once every sender is gone. Cancel-safe.
    pub async fn wait_any(&mut self) -> Option<EventPriority> {
        let [high, normal, low] = &mut self.receivers;
        let (lane, event) = tokio::select! {
            biased;
            Some(event) = high.recv() => (EventPriority::High, event),
            Some(event) = normal.recv() => (EventPriority::Normal, event),
            Some(event) = low.recv() => (EventPriority::Low, event),
            else => return None,
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.lookahead[lane.index()] = Some(event);
        Some(lane)
    }

    /// Marks `count` pulled events as finished.
    pub fn complete(&self, count: usize) {
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
    }
}

pub(crate) struct LaneSet {
    capacities: [usize; 3],
    senders: RwLock<[mpsc::Sender<Event>; 3]>,
    parked: Mutex<Option<LaneReceivers>>,
    in_flight: Arc<AtomicUsize>,
    generation: AtomicU64,
}

impl LaneSet {
    pub fn new(high: usize, normal: usize, low: usize) -> Self {
        let capacities = [high.max(1), normal.max(1), low.max(1)];
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (senders, receivers) = Self::channels(capacities, in_flight.clone());
        Self {
            capacities,
            senders: RwLock::new(senders),
            parked: Mutex::new(Some(receivers)),
            in_flight,
            generation: AtomicU64::new(0),
        }
    }

    fn channels(capacities: [usize; 3], in_flight: Arc<AtomicUsize>) -> ([mpsc::Sender<Event>; 3], LaneReceivers) {
        let (high_tx, high_rx) = mpsc::channel(capacities[0]);
        let (normal_tx, normal_rx) = mpsc::channel(capacities[1]);
        let (low_tx, low_rx) = mpsc::channel(capacities[2]);
        (
            [high_tx, normal_tx, low_tx],
            LaneReceivers {
                receivers: [high_rx, normal_rx, low_rx],
                lookahead: [None, None, None],
                in_flight,
            },
        )
    }

    pub fn capacity(&self, lane: EventPriority) -> usize {
        self.capacities[lane.index()]
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn try_push(&self, lane: EventPriority, event: Event) -> Result<(), LaneFault> {
        let senders = self.senders.read();
        match senders[lane.index()].try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => Err(LaneFault::Full(event)),
            Err(TrySendError::Closed(event)) => Err(LaneFault::Closed(event)),
        }
    }

    pub fn has_room(&self, lane: EventPriority) -> bool {
        self.senders.read()[lane.index()].capacity() > 0
    }

    pub fn len(&self, lane: EventPriority) -> usize {
        let senders = self.senders.read();
        let sender = &senders[lane.index()];
        sender.max_capacity().saturating_sub(sender.capacity())
    }

    pub fn sizes(&self) -> QueueSize {
        let high = self.len(EventPriority::High);
        let normal = self.len(EventPriority::Normal);
        let low = self.len(EventPriority::Low);
        QueueSize {
            high,
            normal,
            low,
            total: high + normal + low,
        }
    }

    /// Events pulled off a lane whose delivery has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.sizes().total == 0 && self.in_flight() == 0
    }

    /// Hands the receivers to a new processing loop, rebuilding the lanes if
    /// a previous loop never returned them.
    pub fn checkout(&self) -> LaneReceivers {
        if let Some(receivers) = self.parked.lock().take() {
            return receivers;
        }
        self.rebuild(RecreateCause::ReceiversLost)
    }

    /// Returns receivers from a loop that stopped cleanly.
    pub fn park(&self, receivers: LaneReceivers) {
        *self.parked.lock() = Some(receivers);
    }

    /// Rebuilds the lanes and parks the new receivers for the next loop.
    ///
    /// `seen_generation` is the generation the caller observed the fault on;
    /// if another caller already rebuilt the lanes since then, nothing happens.
    pub fn recreate(&self, seen_generation: u64, cause: RecreateCause) {
        let mut senders = self.senders.write();
        if self.generation() != seen_generation {
            return;
        }
        let receivers = self.rebuild_locked(&mut senders, cause);
        *self.parked.lock() = Some(receivers);
    }

    fn rebuild(&self, cause: RecreateCause) -> LaneReceivers {
        let mut senders = self.senders.write();
        self.rebuild_locked(&mut senders, cause)
    }

    fn rebuild_locked(&self, senders: &mut [mpsc::Sender<Event>; 3], cause: RecreateCause) -> LaneReceivers {
        let (fresh, receivers) = Self::channels(self.capacities, self.in_flight.clone());
        *senders = fresh;
        self.in_flight.store(0, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(?cause, generation, "Event lanes recreated");
        receivers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, n: i64) -> Event {
        Event::new(kind, json!({ "n": n }))
    }

    fn batching() -> BatchSettings {
        BatchSettings {
            enabled: true,
            max_batch_size: 50,
        }
    }

    #[test]
    fn test_push_respects_capacity() {
        let lanes = LaneSet::new(1, 2, 4);
        assert!(lanes.try_push(EventPriority::Normal, event("a", 1)).is_ok());
        assert!(lanes.try_push(EventPriority::Normal, event("a", 2)).is_ok());
        assert!(matches!(
            lanes.try_push(EventPriority::Normal, event("a", 3)),
            Err(LaneFault::Full(_))
        ));
        assert!(!lanes.has_room(EventPriority::Normal));
        assert_eq!(lanes.sizes().normal, 2);
        assert_eq!(lanes.sizes().total, 2);
    }

    #[test]
    fn test_units_follow_strict_priority() {
        let lanes = LaneSet::new(10, 10, 10);
        lanes.try_push(EventPriority::Low, event("low", 1)).unwrap();
        lanes.try_push(EventPriority::Normal, event("normal", 1)).unwrap();
        lanes.try_push(EventPriority::High, event("high", 1)).unwrap();

        let mut rx = lanes.checkout();
        let order: Vec<_> = std::iter::from_fn(|| rx.next_unit(&batching()))
            .map(|unit| unit.lane())
            .collect();
        assert_eq!(order, vec![EventPriority::High, EventPriority::Normal, EventPriority::Low]);
    }

    #[test]
    fn test_same_type_run_is_batched() {
        let lanes = LaneSet::new(10, 10, 10);
        for n in 0..3 {
            lanes.try_push(EventPriority::Normal, event("a", n)).unwrap();
        }
        lanes.try_push(EventPriority::Normal, event("b", 9)).unwrap();

        let mut rx = lanes.checkout();
        let first = rx.next_unit(&batching()).unwrap();
        assert_eq!(first.len(), 3);
        let payload = first.payload();
        assert_eq!(payload["batch"], true);
        assert_eq!(payload["count"], 3);
        assert_eq!(payload["items"], json!([{"n": 0}, {"n": 1}, {"n": 2}]));

        let second = rx.next_unit(&batching()).unwrap();
        assert!(!second.is_batch());
        assert_eq!(second.payload(), json!({"n": 9}));
        assert_eq!(lanes.in_flight(), 4);
    }

    #[test]
    fn test_high_lane_is_not_batched() {
        let lanes = LaneSet::new(10, 10, 10);
        lanes.try_push(EventPriority::High, event("a", 1)).unwrap();
        lanes.try_push(EventPriority::High, event("a", 2)).unwrap();

        let mut rx = lanes.checkout();
        assert_eq!(rx.next_unit(&batching()).unwrap().len(), 1);
        assert_eq!(rx.next_unit(&batching()).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_keeps_shared_correlation_id() {
        let lanes = LaneSet::new(10, 10, 10);
        for n in 0..2 {
            let e = event("a", n).with_correlation_id(Some("corr-1".to_string()));
            lanes.try_push(EventPriority::Low, e).unwrap();
        }
        let mut rx = lanes.checkout();
        let payload = rx.next_unit(&batching()).unwrap().payload();
        assert_eq!(payload["correlation_id"], "corr-1");
    }

    #[test]
    fn test_closed_lanes_are_recreated() {
        let lanes = LaneSet::new(10, 10, 10);
        drop(lanes.checkout());

        let fault = lanes.try_push(EventPriority::Normal, event("a", 1));
        assert!(matches!(fault, Err(LaneFault::Closed(_))));

        lanes.recreate(0, RecreateCause::ReceiverDropped);
        assert_eq!(lanes.generation(), 1);
        lanes.recreate(0, RecreateCause::ReceiverDropped);
        assert_eq!(lanes.generation(), 1);
        assert!(lanes.try_push(EventPriority::Normal, event("a", 1)).is_ok());
        assert_eq!(lanes.sizes().normal, 1);
    }
}
