//! Utilities to start the controller's event loop, meter monitor and worker
//! pool.

use crate::gateway::{Event, Gateway};
use crate::monitor::monitor_loop;
use crate::pool::{Spawner, WorkerPool};
use crate::{Error, QosConfig, Qos, Registry, Result, SubscriberTable};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::{atomic, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// How often the event loop checks its stop handle while idle.
const STOP_POLL: Duration = Duration::from_secs(1);

/// A handle to manage a running controller.
#[derive(Debug)]
pub struct ControllerHandle {
    pub continue_listening: Arc<atomic::AtomicBool>,
    pub join_handle: thread::JoinHandle<Result<()>>,
    registry: Registry,
}

impl ControllerHandle {
    /// Instruct the event loop to exit.
    pub fn kill(&self) {
        self.continue_listening
            .store(false, atomic::Ordering::SeqCst);
    }

    /// The live switch registry, for inspection while the controller runs.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Collect the error from the thread running the event loop once it
    /// exits.
    pub fn wait(self) -> Result<()> {
        match self.join_handle.join() {
            Ok(r) => r,
            Err(_) => Err(Error(String::from("Call to run_inner panicked"))),
        }
    }
}

/// Builds and starts the controller runtime.
///
/// The runtime consumes [`Event`]s from `events` until the channel closes or
/// the stop handle is cleared. It owns three kinds of threads: the event loop
/// itself, a meter monitor that polls every switch once per
/// `poll_interval`, and a pool of `workers` threads that run admissions and
/// reallocations.
///
/// # Example
///
/// ```rust,no_run
/// use fairmeter::gateway::chan::ChanGateway;
/// use fairmeter::gateway::Event;
/// use fairmeter::{QosConfig, RunBuilder, SubscriberTable, SwitchId};
///
/// let (gw, _commands) = ChanGateway::pair();
/// let (events_tx, events) = crossbeam::channel::unbounded();
/// let handle = RunBuilder::new(gw, events)
///     .config(QosConfig::default())
///     .subscribers(SubscriberTable::default())
///     .spawn_thread()
///     .run()
///     .unwrap();
/// events_tx.send(Event::SwitchConnected(SwitchId(1))).unwrap();
/// handle.kill();
/// handle.wait().unwrap();
/// ```
pub struct RunBuilder<G: Gateway, Spawnness> {
    gateway: G,
    events: Receiver<Event>,
    cfg: QosConfig,
    subscribers: SubscriberTable,
    stop_handle: Option<Arc<atomic::AtomicBool>>,
    inline_jobs: bool,
    _phantom: std::marker::PhantomData<Spawnness>,
}

pub struct Spawn;
pub struct NoSpawn;

impl<G: Gateway> RunBuilder<G, NoSpawn> {
    pub fn new(gateway: G, events: Receiver<Event>) -> Self {
        Self {
            gateway,
            events,
            cfg: QosConfig::default(),
            subscribers: SubscriberTable::default(),
            stop_handle: None,
            inline_jobs: false,
            _phantom: Default::default(),
        }
    }

    /// Spawn a thread which will run the event loop. `run` then returns a
    /// `ControllerHandle`, which the caller can use to stop the controller.
    pub fn spawn_thread(self) -> RunBuilder<G, Spawn> {
        RunBuilder {
            gateway: self.gateway,
            events: self.events,
            cfg: self.cfg,
            subscribers: self.subscribers,
            stop_handle: self.stop_handle,
            inline_jobs: self.inline_jobs,
            _phantom: Default::default(),
        }
    }

    /// Run the controller on the calling thread. Blocks until the event
    /// channel closes or the stop handle is cleared.
    pub fn run(self) -> Result<()> {
        let (qos, pool, events, h) = self.prepare()?;
        run_inner(h, qos, pool, events)
    }
}

impl<G: Gateway, S> RunBuilder<G, S> {
    pub fn config(self, cfg: QosConfig) -> Self {
        Self { cfg, ..self }
    }

    pub fn subscribers(self, subscribers: SubscriberTable) -> Self {
        Self {
            subscribers,
            ..self
        }
    }

    /// Pass an `AtomicBool` stop handle.
    pub fn with_stop_handle(self, handle: Arc<atomic::AtomicBool>) -> Self {
        Self {
            stop_handle: Some(handle),
            ..self
        }
    }

    /// Run admissions and reallocations on the thread that triggered them
    /// instead of on the worker pool.
    pub fn inline_jobs(self) -> Self {
        Self {
            inline_jobs: true,
            ..self
        }
    }

    fn prepare(self) -> Result<(Qos<G>, Option<WorkerPool>, Receiver<Event>, Arc<atomic::AtomicBool>)> {
        self.cfg.validate()?;
        let h = self
            .stop_handle
            .unwrap_or_else(|| Arc::new(atomic::AtomicBool::new(true)));
        let (pool, spawner) = if self.inline_jobs {
            (None, Spawner::Inline)
        } else {
            let pool = WorkerPool::new(self.cfg.workers)?;
            let spawner = pool.spawner();
            (Some(pool), spawner)
        };

        let qos = Qos::new(self.cfg, self.subscribers, self.gateway, spawner);
        Ok((qos, pool, self.events, h))
    }
}

impl<G: Gateway> RunBuilder<G, Spawn> {
    pub fn run(self) -> Result<ControllerHandle> {
        let (qos, pool, events, stop_signal) = self.prepare()?;
        let registry = qos.registry().clone();
        let h = stop_signal.clone();
        let join_handle = thread::Builder::new()
            .name(String::from("fairmeter-events"))
            .spawn(move || run_inner(h, qos, pool, events))?;
        Ok(ControllerHandle {
            continue_listening: stop_signal,
            join_handle,
            registry,
        })
    }
}

// Main event loop of the controller.
//
// Dispatches every event to the engine until either the event channel
// closes or `continue_listening` is cleared, then stops the monitor and
// drains the worker pool. A closed channel while still asked to listen is
// returned as an error.
fn run_inner<G: Gateway>(
    continue_listening: Arc<atomic::AtomicBool>,
    qos: Qos<G>,
    pool: Option<WorkerPool>,
    events: Receiver<Event>,
) -> Result<()> {
    info!(
        gateway = %G::name(),
        capacity = qos.config().capacity,
        baseline = qos.config().baseline,
        "starting fairmeter"
    );

    let (stop_monitor, monitor_stopped) = bounded::<()>(0);
    let monitor = {
        let qos = qos.clone();
        thread::Builder::new()
            .name(String::from("fairmeter-monitor"))
            .spawn(move || monitor_loop(qos, monitor_stopped))?
    };

    let mut channel_closed = false;
    while continue_listening.load(atomic::Ordering::SeqCst) {
        match events.recv_timeout(STOP_POLL) {
            Ok(ev) => qos.on_event(ev),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                channel_closed = true;
                break;
            }
        }
    }

    debug!("event loop exited, stopping monitor");
    drop(stop_monitor);
    monitor
        .join()
        .map_err(|_| Error(String::from("monitor thread panicked")))?;

    // the pool's workers exit once the last spawner, held by `qos`, is gone
    drop(qos);
    if let Some(pool) = pool {
        pool.join()?;
    }

    if channel_closed && continue_listening.load(atomic::Ordering::SeqCst) {
        Err(Error(String::from("The gateway event channel has closed.")))
    } else {
        info!("fairmeter shutting down");
        Ok(())
    }
}
