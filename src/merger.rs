//! Merges events from many per-CPU/per-fd producers into one stream with
//! non-decreasing timestamps.
//!
//! Each ring buffer has its own head and tail and gets read round-robin, so
//! a younger event can show up from a slowly-read fd after an older event
//! has already been queued from a faster one. The merger holds events back
//! for a fixed window after the largest timestamp seen, which bounds the
//! reordering it can repair but keeps delivery monotonic for any producer
//! skew below the window.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::events::{EventVisitor, TypedEvent};

/// While merging, events with a timestamp less than this far below the most
/// recent one in the queue are not touched, so that all sources have had
/// time to deliver anything older.
pub const DEFAULT_HOLDBACK_NS: u64 = 10_000_000;

/// Allowed backwards slack before a dispatch is reported as out of order.
/// Delivery still happens; the warning is a calibration signal that the
/// holdback window is too small.
const ORDER_SLACK_NS: u64 = 1_000;

struct QueueEntry {
    event: TypedEvent,
    origin: RawFd,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.event.timestamp() == other.event.timestamp() && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Invert order to make BinaryHeap a min-heap. The push sequence
        // breaks timestamp ties, so equal timestamps pop in FIFO order.
        (self.event.timestamp(), self.seq)
            .cmp(&(other.event.timestamp(), other.seq))
            .reverse()
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct MergerState {
    heap: BinaryHeap<QueueEntry>,
    max_timestamp: u64,
    next_seq: u64,
}

/// Timestamp-ordered merger. `push` may be called from any number of reader
/// threads; `drain_up_to_window` and `drain_all` must be called from the one
/// consumer thread that owns the visitor.
pub struct Merger {
    state: Mutex<MergerState>,
    data_available: Condvar,
    holdback_ns: u64,
    #[cfg(debug_assertions)]
    last_dispatched: Mutex<u64>,
}

impl Merger {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HOLDBACK_NS)
    }

    pub fn with_window(holdback_ns: u64) -> Self {
        Merger {
            state: Mutex::new(MergerState::default()),
            data_available: Condvar::new(),
            holdback_ns,
            #[cfg(debug_assertions)]
            last_dispatched: Mutex::new(0),
        }
    }

    pub fn holdback_ns(&self) -> u64 {
        self.holdback_ns
    }

    /// Queues one event and updates the largest seen timestamp.
    pub fn push(&self, event: TypedEvent, origin: RawFd) {
        let mut state = self.state.lock();
        let timestamp = event.timestamp();
        if timestamp > state.max_timestamp {
            state.max_timestamp = timestamp;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueueEntry { event, origin, seq });
        drop(state);
        self.data_available.notify_one();
    }

    pub fn has_queued_events(&self) -> bool {
        !self.state.lock().heap.is_empty()
    }

    /// Blocks the consumer until at least one event is queued or the timeout
    /// elapses.
    pub fn wait_for_events(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.heap.is_empty() {
            let _ = self.data_available.wait_for(&mut state, timeout);
        }
    }

    /// Pops and dispatches every event that is at least the holdback window
    /// older than the largest timestamp seen so far. Returns the number of
    /// events dispatched.
    pub fn drain_up_to_window<V: EventVisitor + ?Sized>(&self, visitor: &mut V) -> usize {
        let ready = {
            let mut state = self.state.lock();
            let max_timestamp = state.max_timestamp;
            let mut ready = Vec::new();
            while let Some(entry) = state.heap.peek() {
                if entry.event.timestamp() + self.holdback_ns > max_timestamp {
                    break;
                }
                let entry = state.heap.pop().unwrap();
                ready.push(entry);
            }
            ready
        };
        self.dispatch(ready, visitor)
    }

    /// Pops and dispatches everything. Called at capture stop, after all
    /// producers have finished pushing.
    pub fn drain_all<V: EventVisitor + ?Sized>(&self, visitor: &mut V) -> usize {
        let ready = {
            let mut state = self.state.lock();
            let mut ready = Vec::with_capacity(state.heap.len());
            while let Some(entry) = state.heap.pop() {
                ready.push(entry);
            }
            ready
        };
        self.dispatch(ready, visitor)
    }

    fn dispatch<V: EventVisitor + ?Sized>(
        &self,
        entries: Vec<QueueEntry>,
        visitor: &mut V,
    ) -> usize {
        let count = entries.len();
        for entry in entries {
            self.check_dispatch_order(&entry);
            entry.event.visit(visitor);
        }
        count
    }

    #[cfg(debug_assertions)]
    fn check_dispatch_order(&self, entry: &QueueEntry) {
        let mut last = self.last_dispatched.lock();
        let timestamp = entry.event.timestamp();
        if *last > ORDER_SLACK_NS && timestamp < *last - ORDER_SLACK_NS {
            log::warn!(
                "event from fd {} dispatched out of order: {} after {} (holdback window too small?)",
                entry.origin, timestamp, *last
            );
        }
        if timestamp > *last {
            *last = timestamp;
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_dispatch_order(&self, _entry: &QueueEntry) {}
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}
