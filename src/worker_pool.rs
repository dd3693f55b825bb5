//! Fixed pools of OS threads running recurring jobs.
//!
//! Jobs come in two flavours: pre-built jobs handed to one worker (`assign`), and factories run
//! on every worker thread at startup (`assign_all`). Factory-built jobs never leave the thread
//! that created them, so they may own thread-confined state.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::config::WorkerPoolConfig;
use crate::error::ServerError;

pub trait Job {
    /// Run one pass. Returns true when the pass did useful work.
    fn run(&mut self, worker_id: usize) -> bool;

    /// Runs on the owning worker thread once the pool halts.
    fn close(&mut self, _worker_id: usize) {}
}

type JobFactory = Arc<dyn Fn(usize) -> io::Result<Box<dyn Job>> + Send + Sync>;

pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    assigned: Vec<Vec<Box<dyn Job + Send>>>,
    factories: Vec<JobFactory>,
    halted: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let assigned = (0..config.worker_count).map(|_| Vec::new()).collect();
        Self {
            name: name.into(),
            config,
            assigned,
            factories: Vec::new(),
            halted: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Pin a job to one worker. `worker_id` wraps around the worker count.
    pub fn assign(&mut self, worker_id: usize, job: Box<dyn Job + Send>) {
        debug_assert!(!self.assigned.is_empty(), "pool {} has no workers", self.name);
        let slot = worker_id % self.assigned.len();
        self.assigned[slot].push(job);
    }

    /// Build one job per worker, on that worker's thread, before it starts looping.
    pub fn assign_all<F>(&mut self, factory: F)
    where
        F: Fn(usize) -> io::Result<Box<dyn Job>> + Send + Sync + 'static,
    {
        self.factories.push(Arc::new(factory));
    }

    /// Spawn the workers and wait until each has built its jobs.
    /// Any setup failure halts the workers already running.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyStarted {
                pool: self.name.clone(),
            });
        }
        self.halted.store(false, Ordering::Release);

        let (setup_tx, setup_rx) = mpsc::channel::<(usize, io::Result<()>)>();
        let factories = std::mem::take(&mut self.factories);
        let assigned = std::mem::take(&mut self.assigned);

        for (worker_id, jobs) in assigned.into_iter().enumerate() {
            let factories = factories.clone();
            let halted = Arc::clone(&self.halted);
            let config = self.config.clone();
            let setup = setup_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || {
                    let mut jobs: Vec<Box<dyn Job>> =
                        jobs.into_iter().map(|job| job as Box<dyn Job>).collect();
                    for factory in &factories {
                        match factory(worker_id) {
                            Ok(job) => jobs.push(job),
                            Err(e) => {
                                close_jobs(worker_id, &mut jobs);
                                let _ = setup.send((worker_id, Err(e)));
                                return;
                            }
                        }
                    }
                    drop(factories);
                    let _ = setup.send((worker_id, Ok(())));
                    run_worker(worker_id, &mut jobs, &halted, &config);
                });
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(source) => {
                    self.halt();
                    return Err(ServerError::Spawn {
                        pool: self.name.clone(),
                        worker: worker_id,
                        source,
                    });
                }
            }
        }
        drop(setup_tx);

        for _ in 0..self.threads.len() {
            match setup_rx.recv() {
                Ok((_, Ok(()))) => {}
                Ok((worker, Err(source))) => {
                    self.halt();
                    return Err(ServerError::WorkerSetup {
                        pool: self.name.clone(),
                        worker,
                        source,
                    });
                }
                // A worker panicked before reporting.
                Err(_) => {
                    self.halt();
                    return Err(ServerError::WorkerSetup {
                        pool: self.name.clone(),
                        worker: usize::MAX,
                        source: io::Error::other("worker exited during setup"),
                    });
                }
            }
        }

        info!(pool = %self.name, workers = self.threads.len(), "worker pool started");
        Ok(())
    }

    /// Stop the workers and join them. Each worker closes its jobs on its own thread first.
    pub fn halt(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.halted.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.name, "worker panicked");
            }
        }
        info!(pool = %self.name, "worker pool halted");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_worker(
    worker_id: usize,
    jobs: &mut [Box<dyn Job>],
    halted: &AtomicBool,
    config: &WorkerPoolConfig,
) {
    debug!(worker = worker_id, jobs = jobs.len(), "worker running");
    let mut idle: u64 = 0;
    while !halted.load(Ordering::Acquire) {
        let mut useful = false;
        for job in jobs.iter_mut() {
            useful |= job.run(worker_id);
        }
        if useful {
            idle = 0;
            continue;
        }
        idle = idle.saturating_add(1);
        if idle > config.sleep_threshold {
            thread::sleep(config.sleep_timeout);
        } else if idle > config.yield_threshold {
            thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
    close_jobs(worker_id, jobs);
}

fn close_jobs(worker_id: usize, jobs: &mut [Box<dyn Job>]) {
    for job in jobs.iter_mut() {
        job.close(worker_id);
    }
}
