//! Host-side flow control in front of a worker boundary
//!
//! Messages leave the queue in FIFO order. At most `max_inflight` may be
//! unacknowledged at once, and each slot is held for an extra
//! `release_delay` after the worker acknowledges it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use super::boundary::WorkerBoundary;
use super::message::WorkerMessage;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_inflight: usize,
    pub release_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1,
            release_delay: Duration::ZERO,
        }
    }
}

/// Counts unacknowledged deliveries.
///
/// Going below zero means an acknowledgement was counted twice; `release`
/// panics in that case.
#[derive(Debug)]
pub(crate) struct InflightCounter {
    count: Mutex<i64>,
    max: i64,
    released: Notify,
}

impl InflightCounter {
    pub(crate) fn new(max_inflight: usize) -> Self {
        Self {
            count: Mutex::new(0),
            max: max_inflight.max(1) as i64,
            released: Notify::new(),
        }
    }

    /// Wait for a free slot and take it
    pub(crate) async fn acquire(&self) {
        loop {
            let notified = self.released.notified();
            {
                let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
                if *count < self.max {
                    *count += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn release(&self) {
        let remaining = {
            let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
            *count -= 1;
            *count
        };
        if remaining < 0 {
            panic!("in-flight message count went negative ({})", remaining);
        }
        self.released.notify_one();
    }

    pub(crate) fn current(&self) -> i64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue with bounded in-flight deliveries to one worker
pub struct WorkerQueue {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    counter: Arc<InflightCounter>,
    pump: JoinHandle<()>,
}

impl WorkerQueue {
    pub fn new(boundary: WorkerBoundary, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counter = Arc::new(InflightCounter::new(config.max_inflight));

        let pump = tokio::spawn(pump(boundary, receiver, counter.clone(), config.release_delay));

        Self {
            sender,
            counter,
            pump,
        }
    }

    /// Enqueue a message for delivery; never blocks.
    pub fn send(&self, message: WorkerMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .map_err(|_| SyncError::WorkerClosed("worker queue is closed".to_string()))
    }

    /// Deliveries sent to the worker and not yet released
    pub fn inflight(&self) -> i64 {
        self.counter.current()
    }

    /// Deliver what is already queued, then terminate the worker.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.pump.await {
            log::warn!("Worker queue pump ended abnormally: {}", e);
        }
    }
}

async fn pump(
    boundary: WorkerBoundary,
    mut receiver: mpsc::UnboundedReceiver<WorkerMessage>,
    counter: Arc<InflightCounter>,
    release_delay: Duration,
) {
    while let Some(message) = receiver.recv().await {
        counter.acquire().await;

        let tag = message.tag();
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Err(e) = boundary.deliver(message, ack_tx) {
            log::warn!("Dropping {}: {}", tag, e);
            counter.release();
            continue;
        }
        log::debug!("Delivered {} ({} in flight)", tag, counter.current());

        let counter = counter.clone();
        tokio::spawn(async move {
            // A dropped ack means the worker went away; the slot is freed either way.
            let _ = ack_rx.await;
            if !release_delay.is_zero() {
                tokio::time::sleep(release_delay).await;
            }
            counter.release();
        });
    }

    boundary.terminate().await;
}
