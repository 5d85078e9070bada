//! STRATUM - Command Dispatcher
//! Bounded FIFO inbox in front of the engine. Producers `offer` validated
//! commands without blocking; one worker thread executes them in order and
//! answers each on its own reply channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::command::{StorageCommand, StorageResponse};
use crate::error::{Result, StratumError};

use super::Stratum;

struct Job {
    command: StorageCommand,
    reply: SyncSender<StorageResponse>,
}

/// Reply slot for an accepted command.
#[derive(Debug)]
pub struct PendingResponse {
    rx: Receiver<StorageResponse>,
}

impl PendingResponse {
    /// Block until the worker has executed the command.
    pub fn wait(self) -> Result<StorageResponse> {
        self.rx.recv().map_err(|_| StratumError::DispatcherClosed)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. A timeout
    /// hands the slot back so the caller can keep waiting.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<StorageResponse, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::Timeout(self)),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Closed),
        }
    }
}

/// Why [`PendingResponse::wait_timeout`] returned without a response.
#[derive(Debug)]
pub enum WaitError {
    Timeout(PendingResponse),
    Closed,
}

/// Single-consumer command queue backed by a [`Stratum`] engine.
pub struct StorageCommandDispatcher {
    capacity: usize,
    sender: Mutex<Option<SyncSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageCommandDispatcher {
    /// Start the worker thread. `capacity` bounds the number of commands
    /// waiting to run; with capacity 0 every offer is rejected.
    pub fn start(engine: Arc<Stratum>, capacity: usize) -> Result<Self> {
        // A rendezvous channel would accept offers while the worker is idle,
        // so zero capacity never opens a channel slot at all.
        let (tx, rx) = mpsc::sync_channel::<Job>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("stratum-dispatcher".into())
            .spawn(move || dispatch_loop(&engine, rx))?;

        log::info!("Dispatcher started (capacity {})", capacity);
        Ok(Self {
            capacity,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a command without blocking.
    ///
    /// Fails with `DispatcherFull` when the inbox is at capacity and with
    /// `DispatcherClosed` after shutdown.
    pub fn offer(&self, command: StorageCommand) -> Result<PendingResponse> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(StratumError::DispatcherClosed);
        };
        if self.capacity == 0 {
            return Err(StratumError::DispatcherFull {
                capacity: self.capacity,
            });
        }

        let (reply, rx) = mpsc::sync_channel(1);
        match sender.try_send(Job { command, reply }) {
            Ok(()) => Ok(PendingResponse { rx }),
            Err(TrySendError::Full(job)) => {
                log::debug!("Dispatcher full, rejecting {}", job.command.command_type());
                Err(StratumError::DispatcherFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(StratumError::DispatcherClosed),
        }
    }

    /// Offer a command and wait for its response.
    pub fn submit(&self, command: StorageCommand) -> Result<StorageResponse> {
        self.offer(command)?.wait()
    }

    /// Stop accepting commands, drain the ones already queued and join the
    /// worker. Idempotent.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Dispatcher worker panicked");
            }
            log::info!("Dispatcher stopped");
        }
    }
}

impl Drop for StorageCommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(engine: &Stratum, inbox: Receiver<Job>) {
    // Ends once every sender is gone and the queue is drained.
    for job in inbox {
        let response = engine.execute(&job.command);
        // The caller may have dropped its PendingResponse.
        let _ = job.reply.send(response);
    }
}
