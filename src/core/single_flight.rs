//! Single-flight execution: at most one instance of an operation runs at a
//! time, and callers arriving while it runs attach to the running instance.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct TicketState {
    done: bool,
    #[cfg(feature = "async")]
    wakers: Vec<std::task::Waker>,
}

#[derive(Default)]
struct TicketInner {
    state: Mutex<TicketState>,
    done_cond: Condvar,
}

/// Shared, awaitable handle on one in-progress stop sequence.
///
/// Every caller that asked for the stop receives a clone of the same ticket
/// and observes its completion exactly once the sequence has finished. With
/// the `async` feature the ticket is also a [`Future`](std::future::Future).
#[derive(Clone, Default)]
pub struct ShutdownTicket {
    inner: Arc<TicketInner>,
}

impl ShutdownTicket {
    fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Blocks until the stop sequence has completed.
    pub fn wait(&self) {
        let mut state = self.lock();
        while !state.done {
            state = self
                .inner
                .done_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks for at most `timeout`; returns whether the sequence completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .done_cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Returns `true` if both tickets refer to the same sequence.
    pub fn same_flight(&self, other: &ShutdownTicket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn complete(&self) {
        let mut state = self.lock();
        if state.done {
            return;
        }
        state.done = true;
        #[cfg(feature = "async")]
        let wakers = std::mem::take(&mut state.wakers);
        drop(state);
        self.inner.done_cond.notify_all();
        #[cfg(feature = "async")]
        for waker in wakers {
            waker.wake();
        }
    }
}

#[cfg(feature = "async")]
impl std::future::Future for ShutdownTicket {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut state = self.lock();
        if state.done {
            return std::task::Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        std::task::Poll::Pending
    }
}

/// Outcome of [`SingleFlight::begin`].
pub(crate) enum Flight {
    /// The caller started a new flight and must run it; dropping the guard
    /// completes the ticket.
    Leader(FlightGuard),
    /// A flight is already running; the caller shares its ticket.
    Follower(ShutdownTicket),
}

#[derive(Clone, Default)]
pub(crate) struct SingleFlight {
    current: Arc<Mutex<Option<ShutdownTicket>>>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Joins the running flight or starts a new one. The new ticket is
    /// published before the lock is released, so concurrent callers can
    /// never start a second flight.
    pub(crate) fn begin(&self) -> Flight {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ticket) = current.as_ref() {
            if !ticket.is_done() {
                return Flight::Follower(ticket.clone());
            }
        }
        let ticket = ShutdownTicket::new();
        *current = Some(ticket.clone());
        Flight::Leader(FlightGuard {
            flight: self.clone(),
            ticket,
        })
    }

    /// The ticket of the running flight, if any.
    pub(crate) fn in_flight(&self) -> Option<ShutdownTicket> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|ticket| !ticket.is_done())
            .cloned()
    }

    fn finish(&self, ticket: &ShutdownTicket) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|t| t.same_flight(ticket)) {
            *current = None;
        }
        ticket.complete();
    }
}

pub(crate) struct FlightGuard {
    flight: SingleFlight,
    ticket: ShutdownTicket,
}

impl FlightGuard {
    pub(crate) fn ticket(&self) -> ShutdownTicket {
        self.ticket.clone()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.finish(&self.ticket);
    }
}
