//! Execution of owner-affine work.
//!
//! Some collaborators (the audio output device in particular) must be torn
//! down on the context that owns the player. Workers never touch such
//! resources directly; they hand a task to the player's [`Dispatcher`].

use crate::core::player::LivePlayer;
use crate::core::single_flight::ShutdownTicket;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{trace, warn};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

const OWNER_PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Runs tasks on the owning context.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs every task immediately on the calling thread.
///
/// Suitable when no collaborator needs thread affinity.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Queues tasks for an [`OwnerContext`] to run.
///
/// A task dispatched from the owning thread itself runs immediately, since
/// nothing would pump the queue while that thread waits for it.
#[derive(Clone)]
pub struct QueuedDispatcher {
    sender: Sender<Task>,
    owner: ThreadId,
}

impl QueuedDispatcher {
    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }
}

impl Dispatcher for QueuedDispatcher {
    fn dispatch(&self, task: Task) {
        if self.is_owner_thread() {
            task();
            return;
        }
        if let Err(e) = self.sender.send(task) {
            // the owner is gone, nothing is left to be affine to
            trace!("Owner context dropped, running task inline");
            (e.into_inner())();
        }
    }
}

/// The receiving end of a [`QueuedDispatcher`], held by the owning thread.
///
/// Not `Send`: it stays on the thread that created it. The owner should call
/// [`run_pending`](Self::run_pending) regularly, for example whenever it
/// drains player events; audio device negotiation waits on it.
pub struct OwnerContext {
    receiver: Receiver<Task>,
    _not_send: PhantomData<*const ()>,
}

/// Creates a dispatcher whose tasks run on the calling thread, whenever the
/// returned [`OwnerContext`] is pumped there.
pub fn owner_context() -> (Arc<QueuedDispatcher>, OwnerContext) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (
        Arc::new(QueuedDispatcher {
            sender,
            owner: std::thread::current().id(),
        }),
        OwnerContext {
            receiver,
            _not_send: PhantomData,
        },
    )
}

impl OwnerContext {
    /// Runs every queued task; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for tasks and runs them.
    pub fn run_for(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                1 + self.run_pending()
            }
            Err(_) => 0,
        }
    }

    /// Stops `player` from the owning context.
    ///
    /// If a stop is already in flight the shared ticket is returned at once
    /// and the owner is not blocked. Otherwise the stop sequence runs on a
    /// helper thread while this context keeps executing dispatched tasks
    /// until the sequence has completed.
    pub fn stop(&self, player: &LivePlayer) -> ShutdownTicket {
        let (ticket, started) = player.begin_detached_stop();
        if !started {
            return ticket;
        }
        self.pump_until(&ticket);
        ticket
    }

    /// Starts `player` from the owning context, stopping any previous session
    /// first.
    pub fn start(&self, player: &LivePlayer, address: &str) -> crate::error::Result<()> {
        if player.has_session() {
            let ticket = self.stop(player);
            self.pump_until(&ticket);
        }
        player.start_session(address)
    }

    fn pump_until(&self, ticket: &ShutdownTicket) {
        while !ticket.is_done() {
            match self.receiver.recv_timeout(OWNER_PUMP_INTERVAL) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    ticket.wait();
                    break;
                }
            }
        }
        self.run_pending();
    }
}

/// Runs `f` through `dispatcher` and waits up to `timeout` for its result.
///
/// Returns `None` if the owner did not run the task in time; the task stays
/// queued and runs whenever the owner next pumps.
pub(crate) fn call_on_owner<T, F>(dispatcher: &dyn Dispatcher, f: F, timeout: Duration) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (result_tx, result_rx) = crossbeam_channel::bounded::<T>(1);
    dispatcher.dispatch(Box::new(move || {
        let _ = result_tx.send(f());
    }));
    match result_rx.recv_timeout(timeout) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Owner context did not run dispatched task within {timeout:?}: {e}");
            None
        }
    }
}

/// Dispatches `task` and waits up to `timeout` for it to finish.
pub(crate) fn dispatch_and_wait(dispatcher: &dyn Dispatcher, task: Task, timeout: Duration) -> bool {
    call_on_owner(dispatcher, task, timeout).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_inline_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        assert!(dispatch_and_wait(
            &InlineDispatcher,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_runs_on_owner() {
        let (dispatcher, owner) = owner_context();
        let owner_thread = thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));

        let worker = {
            let ran_on = ran_on.clone();
            thread::spawn(move || {
                dispatch_and_wait(
                    dispatcher.as_ref(),
                    Box::new(move || {
                        *ran_on.lock().unwrap() = Some(thread::current().id());
                    }),
                    Duration::from_secs(5),
                )
            })
        };

        let mut ran = 0;
        while ran == 0 {
            ran = owner.run_for(Duration::from_millis(50));
        }
        assert!(worker.join().unwrap());
        assert_eq!(*ran_on.lock().unwrap(), Some(owner_thread));
    }

    #[test]
    fn test_queued_times_out_without_owner_pump() {
        let (dispatcher, owner) = owner_context();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let done = thread::spawn(move || {
            dispatch_and_wait(
                dispatcher.as_ref(),
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(20),
            )
        })
        .join()
        .unwrap();
        assert!(!done);
        assert_eq!(owner.run_pending(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owner_thread_runs_inline() {
        let (dispatcher, owner) = owner_context();
        assert!(dispatcher.is_owner_thread());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let started = std::time::Instant::now();
        assert!(dispatch_and_wait(
            dispatcher.as_ref(),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(2),
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(owner.run_pending(), 0);

        let elsewhere = dispatcher.clone();
        assert!(!thread::spawn(move || elsewhere.is_owner_thread()).join().unwrap());
    }

    #[test]
    fn test_dropped_owner_runs_inline() {
        let (dispatcher, owner) = owner_context();
        drop(owner);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        dispatcher.dispatch(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
