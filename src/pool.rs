//! Fire-and-forget jobs.
//!
//! Admissions, default-meter installs and reallocations run as independent
//! jobs; whoever dispatches one never waits for it and gets nothing back.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use tracing::{debug, error};

use crate::{Error, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where jobs run.
#[derive(Clone)]
pub enum Spawner {
    /// Queue onto a [`WorkerPool`].
    Pool(Sender<Job>),
    /// Run on the dispatching thread before `spawn` returns. Deterministic,
    /// meant for tests.
    Inline,
}

impl Spawner {
    /// Dispatch `f`. Must not be called with a switch lock held.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Spawner::Pool(tx) => {
                if tx.send(Box::new(f)).is_err() {
                    debug!("worker pool closed, dropping job");
                }
            }
            Spawner::Inline => f(),
        }
    }
}

/// A fixed set of worker threads draining a shared job queue.
///
/// Workers exit once every [`Spawner`] clone has been dropped and the queue is
/// empty.
pub struct WorkerPool {
    spawner: Spawner,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("fairmeter-worker-{}", i))
                    .spawn(move || {
                        for job in rx.iter() {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!(worker = i, "job panicked");
                            }
                        }
                    })
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkerPool {
            spawner: Spawner::Pool(tx),
            workers,
        })
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Wait for the workers to drain the queue and exit.
    pub fn join(self) -> Result<()> {
        let WorkerPool { spawner, workers } = self;
        drop(spawner);
        for w in workers {
            w.join()
                .map_err(|_| Error(String::from("worker thread panicked")))?;
        }

        Ok(())
    }
}
