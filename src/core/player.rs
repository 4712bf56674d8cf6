use crate::core::backend::{AudioSink, MediaBackend};
use crate::core::config::{validate_address, PlayerConfig};
use crate::core::dispatcher::{dispatch_and_wait, Dispatcher, InlineDispatcher};
use crate::core::events::{EventEmitter, PlayerEvent, PlayerStatus};
use crate::core::scheduler::audio_pacer::audio_pacer_init;
use crate::core::scheduler::decode_task::{audio_decoder_init, video_decoder_init};
use crate::core::scheduler::ingest_task::{ingest_init, ExhaustedHook};
use crate::core::scheduler::stats_task::stats_init;
use crate::core::scheduler::PipelineShared;
use crate::core::single_flight::{Flight, FlightGuard, ShutdownTicket, SingleFlight};
use crate::core::stats::PlayerStats;
use crate::error::Result;
use crossbeam_channel::Receiver;
use log::{debug, error, info};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the stop sequence waits for the owner to close the audio device.
const OWNER_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for [`LivePlayer`].
pub struct LivePlayerBuilder {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    dispatcher: Arc<dyn Dispatcher>,
    audio_sink: Option<Box<dyn AudioSink>>,
}

impl LivePlayerBuilder {
    pub fn config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where owner-affine work (audio device open/close) runs. Defaults to
    /// [`InlineDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Without a sink, audio streams are ignored.
    pub fn audio_sink(mut self, sink: impl AudioSink + 'static) -> Self {
        self.audio_sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<LivePlayer> {
        self.config.validate()?;
        crate::core::initialize();
        let (events, receiver) = EventEmitter::channel(self.config.event_backlog);
        let shared = Arc::new(PipelineShared::new(
            self.config,
            self.backend,
            self.dispatcher,
            events,
        ));
        if let Some(sink) = self.audio_sink {
            shared.audio.attach(sink);
        }
        Ok(LivePlayer {
            inner: Arc::new(PlayerInner {
                shared,
                workers: Mutex::new(Vec::new()),
                shutdown: SingleFlight::new(),
                session: Mutex::new(()),
                events: receiver,
            }),
        })
    }
}

struct PlayerInner {
    shared: Arc<PipelineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: SingleFlight,
    session: Mutex<()>,
    events: Receiver<PlayerEvent>,
}

impl PlayerInner {
    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a stop on a helper thread unless one is already in flight.
    /// Returns the shared ticket and whether this call started the sequence.
    fn request_stop(self: &Arc<Self>) -> (ShutdownTicket, bool) {
        let guard = match self.shutdown.begin() {
            Flight::Follower(ticket) => return (ticket, false),
            Flight::Leader(guard) => guard,
        };
        let ticket = guard.ticket();

        let slot = Arc::new(Mutex::new(Some(guard)));
        let thread_slot = slot.clone();
        let inner = self.clone();
        let result = std::thread::Builder::new()
            .name("player-shutdown".to_string())
            .spawn(move || {
                if let Some(guard) = take_guard(&thread_slot) {
                    inner.shutdown_sequence();
                    drop(guard);
                }
            });
        if let Err(e) = result {
            error!("Shutdown thread exited with error: {e}, stopping inline");
            if let Some(guard) = take_guard(&slot) {
                self.shutdown_sequence();
                drop(guard);
            }
        }
        (ticket, true)
    }

    fn stop_blocking(&self) {
        match self.shutdown.begin() {
            Flight::Leader(guard) => {
                self.shutdown_sequence();
                drop(guard);
            }
            Flight::Follower(ticket) => ticket.wait(),
        }
    }

    /// The one stop sequence. Only ever run by the leader of a flight.
    fn shutdown_sequence(&self) {
        let shared = &self.shared;
        debug!("Stopping player");
        shared.halt();
        shared.close_queues();

        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!("{name} thread panicked");
            }
        }

        shared.clear_queues();
        shared.release_decoders();
        shared.audio.clear_pending();

        let owner_shared = shared.clone();
        if !dispatch_and_wait(
            shared.dispatcher.as_ref(),
            Box::new(move || owner_shared.audio.teardown()),
            OWNER_TEARDOWN_TIMEOUT,
        ) {
            error!("Audio output was not closed by the owning context");
        }

        shared.stats.reset();
        shared.video_queue.reset_dropped();
        shared.publish_stats();
        shared.events.status(PlayerStatus::Stopped);
        info!("Player stopped");
    }
}

fn take_guard(slot: &Mutex<Option<FlightGuard>>) -> Option<FlightGuard> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// A live stream player: one ingest thread feeding two decode threads
/// through bounded queues, plus an audio pacer and a stats publisher.
///
/// Everything the player reports arrives as [`PlayerEvent`]s on
/// [`events`](Self::events).
pub struct LivePlayer {
    inner: Arc<PlayerInner>,
}

impl LivePlayer {
    pub fn builder(backend: impl MediaBackend) -> LivePlayerBuilder {
        LivePlayerBuilder {
            config: PlayerConfig::default(),
            backend: Arc::new(backend),
            dispatcher: Arc::new(InlineDispatcher),
            audio_sink: None,
        }
    }

    pub fn new(config: PlayerConfig, backend: impl MediaBackend) -> Result<Self> {
        Self::builder(backend).config(config).build()
    }

    /// Starts playing `address`, stopping any previous session first.
    ///
    /// An empty or malformed address is rejected before anything else
    /// happens, both as the returned error and as an error event.
    ///
    /// When a [`QueuedDispatcher`](crate::QueuedDispatcher) is in use and
    /// this is called from its owning thread, use
    /// [`OwnerContext::start`](crate::OwnerContext::start) instead.
    pub fn start(&self, address: &str) -> Result<()> {
        let address = self.check_address(address)?;
        if self.has_session() {
            self.stop();
        }
        self.start_session(address)
    }

    /// Whether a session is running or still being torn down.
    pub(crate) fn has_session(&self) -> bool {
        self.is_running() || self.active_workers() > 0 || self.inner.shutdown.in_flight().is_some()
    }

    pub(crate) fn start_session(&self, address: &str) -> Result<()> {
        let address = self.check_address(address)?;
        let _session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ticket) = self.inner.shutdown.in_flight() {
            ticket.wait();
        }

        let shared = &self.inner.shared;
        shared.clear_queues();
        shared.video_queue.reset_dropped();
        shared.stats.reset();
        shared.stop_requested.store(false, Ordering::Release);
        shared.running.store(true, Ordering::Release);
        shared.open_queues();

        info!("Starting player for {address}");
        shared.events.status(PlayerStatus::Connecting);
        shared.publish_stats();

        if let Err(e) = self.spawn_workers(address) {
            error!("Failed to start player: {e}");
            shared.events.error(e.to_string(), true);
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_workers(&self, address: &str) -> Result<()> {
        let shared = &self.inner.shared;
        let weak = Arc::downgrade(&self.inner);
        let on_exhausted: ExhaustedHook = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.request_stop();
            }
        });

        let mut workers = self.inner.lock_workers();
        workers.push(ingest_init(shared.clone(), address.to_string(), on_exhausted)?);
        workers.push(video_decoder_init(shared.clone())?);
        workers.push(audio_decoder_init(shared.clone())?);
        workers.push(audio_pacer_init(shared.clone())?);
        workers.push(stats_init(shared.clone())?);
        Ok(())
    }

    fn check_address<'a>(&self, address: &'a str) -> Result<&'a str> {
        validate_address(address).map_err(|e| {
            error!("{e}");
            self.inner.shared.events.error(e.to_string(), true);
            e
        })
    }

    /// Stops the pipeline and blocks until every worker has been joined.
    ///
    /// Concurrent and repeated calls share one stop sequence; calling it on
    /// an idle player still emits `Stopped`.
    ///
    /// On the thread that owns a [`QueuedDispatcher`](crate::QueuedDispatcher)
    /// the device teardown runs inline, but a stop already in flight on
    /// another thread still waits for this thread to pump. Owner threads
    /// should use [`OwnerContext::stop`](crate::OwnerContext::stop).
    pub fn stop(&self) {
        self.inner.stop_blocking();
    }

    /// Begins stopping without blocking and returns the ticket to wait on.
    pub fn request_stop(&self) -> ShutdownTicket {
        self.inner.request_stop().0
    }

    pub(crate) fn begin_detached_stop(&self) -> (ShutdownTicket, bool) {
        self.inner.request_stop()
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.running.load(Ordering::Acquire)
    }

    /// Worker threads started and not yet joined.
    pub fn active_workers(&self) -> usize {
        self.inner.lock_workers().len()
    }

    /// Event stream of this player. Every clone competes for the same events.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.inner.events.clone()
    }

    /// The most recently published stats snapshot.
    pub fn stats(&self) -> PlayerStats {
        self.inner.shared.stats.latest()
    }

    /// Takes effect at the next failure. Negative values mean no retries.
    pub fn set_max_reconnect_attempts(&self, attempts: i64) {
        self.inner.shared.reconnect.set_max_attempts(attempts);
    }

    /// Takes effect at the next failure. Negative values are clamped to 0.
    pub fn set_reconnect_delay_ms(&self, delay_ms: i64) {
        self.inner.shared.reconnect.set_delay_ms(delay_ms);
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.inner.shared.config
    }
}

impl Drop for LivePlayer {
    fn drop(&mut self) {
        if self.is_running() || self.active_workers() > 0 {
            self.inner.request_stop();
        }
    }
}
