// Bounded packet queue shared between the ingest thread and a decode thread.
//
// - Strict FIFO, `len() <= max_size` at all times
// - Per-queue overflow policy (Block / DropOldest)
// - `close()` wakes every waiter immediately; draining stays allowed until `clear()`
// - Liveness flag is re-checked every LIVENESS_POLL while waiting

use crate::core::packet::{Packet, StreamKind};
use log::trace;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const LIVENESS_POLL: Duration = Duration::from_millis(20);

/// Behavior of [`PacketQueue::push`] when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the producer until a consumer makes room or the queue closes.
    Block,
    /// Never suspend: evict the oldest packets until the new one fits.
    DropOldest,
}

struct QueueState {
    packets: VecDeque<Packet>,
    max_size: usize,
    closed: bool,
    dropped: u64,
}

/// Thread-safe bounded FIFO that doubles as the jitter buffer between the
/// ingest and decode stages.
///
/// Failure is never raised: `push` reports `false` and `pop` reports `None`
/// when the queue is closed or the caller's liveness flag dropped, which lets
/// callers tell "nothing yet" from "shutting down" by checking their flag.
pub struct PacketQueue {
    kind: StreamKind,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl PacketQueue {
    /// Creates an open queue. A capacity of zero is raised to one so that the
    /// queue can always make progress.
    pub fn new(kind: StreamKind, max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            kind,
            policy,
            state: Mutex::new(QueueState {
                packets: VecDeque::with_capacity(max_size.max(1)),
                max_size: max_size.max(1),
                closed: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Changes the capacity and returns the one actually applied.
    ///
    /// Under `DropOldest` shrinking evicts the oldest packets down to the new
    /// bound. Under `Block` nothing is evicted, so the capacity never goes
    /// below the current length.
    pub fn set_max_size(&self, max_size: usize) -> usize {
        let mut state = self.lock();
        let mut max_size = max_size.max(1);
        match self.policy {
            OverflowPolicy::Block => max_size = max_size.max(state.packets.len()),
            OverflowPolicy::DropOldest => {
                let excess = state.packets.len().saturating_sub(max_size);
                state.packets.drain(..excess);
                state.dropped += excess as u64;
                if excess > 0 {
                    trace!("{} queue shrunk, dropped {excess} packets", self.kind.label());
                }
            }
        }
        state.max_size = max_size;
        drop(state);
        self.not_full.notify_all();
        max_size
    }

    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }

    /// Enqueues `packet` according to the queue's overflow policy.
    ///
    /// Returns `false` without inserting when the queue is closed or `live`
    /// is (or, under `Block`, becomes) false. The rejected packet is dropped.
    pub fn push(&self, packet: Packet, live: &AtomicBool) -> bool {
        let mut state = self.lock();

        match self.policy {
            OverflowPolicy::Block => {
                while !state.closed
                    && state.packets.len() >= state.max_size
                    && live.load(Ordering::Acquire)
                {
                    state = self
                        .not_full
                        .wait_timeout(state, LIVENESS_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                if state.closed || !live.load(Ordering::Acquire) {
                    return false;
                }
            }
            OverflowPolicy::DropOldest => {
                if state.closed || !live.load(Ordering::Acquire) {
                    return false;
                }
                while state.packets.len() >= state.max_size {
                    match state.packets.pop_front() {
                        Some(evicted) => {
                            state.dropped += 1;
                            trace!(
                                "{} queue full, dropped packet of stream {}",
                                self.kind.label(),
                                evicted.stream_index()
                            );
                        }
                        None => break,
                    }
                }
            }
        }

        state.packets.push_back(packet);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues the oldest packet, waiting while the queue is empty.
    ///
    /// Returns `None` if it wakes with an empty queue because the queue was
    /// closed or `live` turned false. A closed queue still hands out the
    /// packets it holds.
    pub fn pop(&self, live: &AtomicBool) -> Option<Packet> {
        let mut state = self.lock();
        while !state.closed && state.packets.is_empty() && live.load(Ordering::Acquire) {
            state = self
                .not_empty
                .wait_timeout(state, LIVENESS_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let packet = state.packets.pop_front();
        drop(state);
        if packet.is_some() {
            self.not_full.notify_one();
        }
        packet
    }

    /// Releases every queued packet. The open/closed state is unchanged.
    pub fn clear(&self) {
        let mut state = self.lock();
        let released = state.packets.len();
        state.packets.clear();
        drop(state);
        if released > 0 {
            trace!("{} queue cleared {released} packets", self.kind.label());
        }
        self.not_full.notify_all();
    }

    /// Rejects further pushes and wakes every blocked producer and consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn open(&self) {
        self.lock().closed = false;
        self.not_full.notify_all();
    }

    pub fn is_open(&self) -> bool {
        !self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().packets.is_empty()
    }

    /// Number of packets evicted by `DropOldest` since creation or the last
    /// [`reset_dropped`](Self::reset_dropped).
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn reset_dropped(&self) {
        self.lock().dropped = 0;
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        self.close();
        self.clear();
    }
}
