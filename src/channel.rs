//! Bounded MPSC observation queue.
//!
//! Producers (radio receive callbacks, scan-complete handlers) enqueue
//! non-blockingly; a full queue drops the incoming observation rather than
//! stalling the caller. The sole consumer is the processing loop in
//! `tracker.rs`.
//!
//! Built on the same `critical_section::Mutex<RefCell<_>>` primitive the
//! host uses for its shared statics (see `main.rs`'s `FILTER_CONFIG`), with
//! `heapless::Deque` as the backing ring — this is the "small custom ring"
//! the design notes explicitly allow in place of a platform channel type.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

use crate::observation::Observation;

/// A bounded, lossy-when-full multi-producer single-consumer queue of
/// [`Observation`] values.
pub struct ObservationQueue<const N: usize> {
    inner: Mutex<RefCell<Deque<Observation, N>>>,
    dropped: Mutex<RefCell<u32>>,
}

impl<const N: usize> ObservationQueue<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Deque::new())),
            dropped: Mutex::new(RefCell::new(0)),
        }
    }

    /// Enqueue without blocking. Returns `false` (and counts a drop) if the
    /// queue is full. Safe to call from an interrupt/callback context.
    pub fn try_send(&self, obs: Observation) -> bool {
        critical_section::with(|cs| {
            let mut q = self.inner.borrow(cs).borrow_mut();
            if q.push_back(obs).is_err() {
                let mut dropped = self.dropped.borrow(cs).borrow_mut();
                *dropped = dropped.saturating_add(1);
                false
            } else {
                true
            }
        })
    }

    /// Dequeue the oldest pending observation, if any.
    pub fn try_recv(&self) -> Option<Observation> {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().pop_front())
    }

    /// Drop every pending observation without processing it.
    pub fn drain(&self) {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().clear());
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of observations dropped for arriving into a full queue.
    pub fn dropped_count(&self) -> u32 {
        critical_section::with(|cs| *self.dropped.borrow(cs).borrow())
    }
}

impl<const N: usize> Default for ObservationQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationKind;

    fn obs(ts: u32) -> Observation {
        Observation::wifi(ObservationKind::WifiApBeacon, [0; 6], -50, "", ts)
    }

    #[test]
    fn fifo_order() {
        let q: ObservationQueue<4> = ObservationQueue::new();
        assert!(q.try_send(obs(1)));
        assert!(q.try_send(obs(2)));
        assert_eq!(q.try_recv().unwrap().ts_s, 1);
        assert_eq!(q.try_recv().unwrap().ts_s, 2);
        assert!(q.try_recv().is_none());
    }

    #[test]
    fn full_queue_drops_without_corrupting_later_observations() {
        let q: ObservationQueue<2> = ObservationQueue::new();
        assert!(q.try_send(obs(1)));
        assert!(q.try_send(obs(2)));
        // Queue full — dropped, not blocked.
        assert!(!q.try_send(obs(3)));
        assert_eq!(q.dropped_count(), 1);
        // Earlier entries are intact and in order.
        assert_eq!(q.try_recv().unwrap().ts_s, 1);
        assert_eq!(q.try_recv().unwrap().ts_s, 2);
        assert!(q.try_recv().is_none());
        // Queue usable again after drain.
        assert!(q.try_send(obs(4)));
        assert_eq!(q.try_recv().unwrap().ts_s, 4);
    }

    #[test]
    fn drain_clears_pending_observations() {
        let q: ObservationQueue<4> = ObservationQueue::new();
        q.try_send(obs(1));
        q.try_send(obs(2));
        q.drain();
        assert!(q.is_empty());
        assert!(q.try_recv().is_none());
    }
}
