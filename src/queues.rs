use crate::error::SensorError;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What to do when a bounded queue is full.
///
/// Raw sensor feeds shed the incoming sample (the consumer is behind; newest
/// data is the cheapest to regenerate). Filter input queues evict the oldest
/// so the filter always sees the freshest window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropNewest,
    DropOldest,
}

/// Bounded sample channel with drop accounting. Producers never block;
/// `produced() == delivered() + dropped() + len()` holds at all times.
pub struct SampleQueue<T> {
    name: &'static str,
    tx: Sender<T>,
    rx: Receiver<T>,
    policy: OverflowPolicy,
    produced: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<T> SampleQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            name,
            tx,
            rx,
            policy,
            produced: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Overflow sheds one sample per the policy and
    /// never propagates as an error.
    pub fn push(&self, item: T) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => match self.policy {
                OverflowPolicy::DropNewest => self.note_drop(),
                OverflowPolicy::DropOldest => {
                    if self.rx.try_recv().is_ok() {
                        self.note_drop();
                    }
                    if self.tx.try_send(item).is_err() {
                        self.note_drop();
                    }
                }
            },
            Err(TrySendError::Disconnected(_)) => self.note_drop(),
        }
    }

    /// Blocking dequeue with a bounded wait; `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 1000 == 0 {
            let err = SensorError::QueueFull {
                queue: self.name,
                dropped: total,
            };
            warn!("[QUEUE] {err}");
        }
    }
}

/// Capacity-1 overwrite slot for the status publisher: writers always win,
/// readers take the latest value.
pub struct StatusSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> StatusSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn publish(&self, value: T) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(value);
        }
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl<T> Default for StatusSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_newest_sheds_incoming() {
        let q = SampleQueue::new("test", 2, OverflowPolicy::DropNewest);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_recv(), Some(1));
        assert_eq!(q.try_recv(), Some(2));
        assert_eq!(q.try_recv(), None);
    }

    #[test]
    fn drop_oldest_keeps_freshest() {
        let q = SampleQueue::new("test", 2, OverflowPolicy::DropOldest);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_recv(), Some(2));
        assert_eq!(q.try_recv(), Some(3));
    }

    #[test]
    fn conservation_under_pressure() {
        let q = SampleQueue::new("test", 8, OverflowPolicy::DropNewest);
        for i in 0..1000 {
            q.push(i);
            if i % 3 == 0 {
                let _ = q.try_recv();
            }
        }
        while q.try_recv().is_some() {}
        assert_eq!(q.produced(), q.delivered() + q.dropped());
    }

    #[test]
    fn status_slot_overwrites() {
        let slot = StatusSlot::new();
        slot.publish(1);
        slot.publish(2);
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn recv_timeout_bounded() {
        let q: SampleQueue<u32> = SampleQueue::new("test", 1, OverflowPolicy::DropNewest);
        let start = std::time::Instant::now();
        assert!(q.recv_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
