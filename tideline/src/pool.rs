//! The task pool: a bounded MPSC queue drained by N worker threads.
//!
//! With `threads <= 1` no workers are spawned and every task executes
//! inline on the calling thread, preserving the caller's thread identity.
//! Enqueueing never blocks: a full queue is an error surfaced to the
//! caller, and nothing is scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::Error;
use crate::metrics;
use crate::server::Server;

pub(crate) type PoolTask = Box<dyn FnOnce(&Server) + Send>;

pub(crate) struct TaskPool {
    tx: Sender<PoolTask>,
    rx: Receiver<PoolTask>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    threads: usize,
}

impl TaskPool {
    pub fn new(threads: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = bounded(queue_capacity);
        TaskPool {
            tx,
            rx,
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads,
        }
    }

    /// Spawn the worker threads. No-op in inline mode.
    pub fn start(&self, server: &Arc<Server>) -> Result<(), Error> {
        if self.threads <= 1 {
            return Ok(());
        }
        let mut workers = self.workers.lock();
        for id in 0..self.threads {
            let server = Arc::clone(server);
            let rx = self.rx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::Builder::new()
                .name(format!("tideline-worker-{id}"))
                .spawn(move || {
                    log::debug!("worker {id} started");
                    if let Some(hook) = server.settings().on_init_thread.as_deref() {
                        hook(&server);
                    }
                    loop {
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(task) => task(&server),
                            Err(RecvTimeoutError::Timeout) => {
                                if shutdown.load(Ordering::Acquire) {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    // Drain what was queued before the flag landed.
                    while let Ok(task) = rx.try_recv() {
                        task(&server);
                    }
                    log::debug!("worker {id} stopped");
                })
                .map_err(Error::Io)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Schedule a task, or run it inline when threading is disabled.
    pub fn spawn<T>(&self, server: &Server, task: T) -> Result<(), Error>
    where
        T: FnOnce(&Server) + Send + 'static,
    {
        if self.threads <= 1 {
            task(server);
            metrics::TASKS_SCHEDULED.increment();
            return Ok(());
        }
        match self.tx.try_send(Box::new(task)) {
            Ok(()) => {
                metrics::TASKS_SCHEDULED.increment();
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                metrics::TASKS_REJECTED.increment();
                Err(Error::QueueFull)
            }
        }
    }

    /// Like [`spawn`](Self::spawn), but hands an already-boxed task back
    /// to the caller when the queue is full, so it can run inline.
    pub fn try_spawn_boxed(&self, server: &Server, task: PoolTask) -> Result<(), PoolTask> {
        if self.threads <= 1 {
            task(server);
            metrics::TASKS_SCHEDULED.increment();
            return Ok(());
        }
        match self.tx.try_send(task) {
            Ok(()) => {
                metrics::TASKS_SCHEDULED.increment();
                Ok(())
            }
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                metrics::TASKS_REJECTED.increment();
                Err(task)
            }
        }
    }

    /// Stop the workers: set the flag, join, then run anything still
    /// queued on the calling thread so no scheduled task is lost.
    pub fn shutdown(&self, server: &Server) {
        self.shutdown.store(true, Ordering::Release);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        while let Ok(task) = self.rx.try_recv() {
            task(server);
        }
    }
}
