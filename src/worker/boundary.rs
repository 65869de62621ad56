//! Isolated worker hosting one scheduler
//!
//! The host and the worker share no state: commands go in through one channel,
//! events come out through another, and both carry owned values only. Each
//! boundary runs as its own task, so a stalled adapter on one chain never
//! blocks another chain's polling.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::message::{
    Envelope, StartTimerData, TimerCommand, WorkerEvent, WorkerFailure, WorkerMessage,
};
use crate::error::SyncError;
use crate::model::{Address, Chain, SyncResult, Token};
use crate::scheduler::{Scheduler, SchedulerEvent, SyncJob, SyncTarget, TimerParams};

/// A command plus an optional acknowledgement fired once it was handled
pub(crate) struct Delivery {
    message: WorkerMessage,
    ack: Option<oneshot::Sender<()>>,
}

/// Host-side handle of one (chain, token) worker
pub struct WorkerBoundary {
    chain: Chain,
    commands: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

impl WorkerBoundary {
    /// Spawn a worker running `job` and return its handle and event stream.
    ///
    /// `default_interval` applies to `start` commands that carry no
    /// `pollingIntervalMs`.
    pub fn spawn<J>(
        chain: Chain,
        job: J,
        default_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>)
    where
        J: SyncJob<Output = SyncResult>,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_worker(chain, job, default_interval, command_rx, event_tx));
        log::info!("Spawned {} wallet worker", chain);

        (
            Self {
                chain,
                commands,
                task,
            },
            events,
        )
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Queue a command; commands are handled in the order they were posted.
    pub fn post(&self, message: WorkerMessage) -> Result<(), SyncError> {
        self.send(Delivery { message, ack: None })
    }

    /// Decode a wire envelope and post it
    pub fn post_envelope(&self, envelope: Envelope) -> Result<(), SyncError> {
        self.post(WorkerMessage::from_envelope(envelope)?)
    }

    pub(crate) fn deliver(
        &self,
        message: WorkerMessage,
        ack: oneshot::Sender<()>,
    ) -> Result<(), SyncError> {
        self.send(Delivery {
            message,
            ack: Some(ack),
        })
    }

    fn send(&self, delivery: Delivery) -> Result<(), SyncError> {
        self.commands
            .send(delivery)
            .map_err(|_| SyncError::WorkerClosed(format!("{} worker has terminated", self.chain)))
    }

    /// Close the command channel and wait for the worker to wind down
    pub async fn terminate(self) {
        let Self { chain, commands, task } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::warn!("{} worker task ended abnormally: {}", chain, e);
        }
    }
}

async fn run_worker<J>(
    chain: Chain,
    job: J,
    default_interval: Duration,
    mut commands: mpsc::UnboundedReceiver<Delivery>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    J: SyncJob<Output = SyncResult>,
{
    let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(job, scheduler_tx);

    loop {
        tokio::select! {
            biased;

            delivery = commands.recv() => {
                let Some(Delivery { message, ack }) = delivery else {
                    break;
                };
                let replaced =
                    handle_command(chain, &scheduler, default_interval, message, &events);

                if replaced {
                    // Events still queued belong to the timer that was just replaced.
                    while scheduler_rx.try_recv().is_ok() {}
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Some(event) = scheduler_rx.recv() => forward(chain, event, &events),
        }
    }

    scheduler.stop();
    log::info!("{} wallet worker terminated", chain);
}

/// Apply one command; returns whether the running timer was replaced or stopped.
fn handle_command<J>(
    chain: Chain,
    scheduler: &Scheduler<J>,
    default_interval: Duration,
    message: WorkerMessage,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> bool
where
    J: SyncJob<Output = SyncResult>,
{
    log::debug!("{} worker received {}", chain, message.tag());

    if message.chain != chain {
        reject(
            chain,
            events,
            SyncError::ChainMismatch {
                expected: chain,
                received: message.chain,
            },
        );
        return false;
    }

    match message.command {
        TimerCommand::Start(StartTimerData {
            address,
            token,
            polling_interval_ms,
        }) => {
            if let Err(e) = validate_target(chain, &token, &address) {
                reject(chain, events, e);
                return false;
            }
            let polling_interval = polling_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default_interval);
            scheduler.start(TimerParams {
                target: SyncTarget::new(token, address),
                polling_interval,
            });
            true
        }
        TimerCommand::Stop => {
            scheduler.stop();
            true
        }
        TimerCommand::Trigger(data) => {
            if let Err(e) = validate_target(chain, &data.token, &data.address) {
                reject(chain, events, e);
                return false;
            }
            let _ = scheduler.trigger(SyncTarget::from(data));
            false
        }
    }
}

fn validate_target(chain: Chain, token: &Token, address: &Address) -> Result<(), SyncError> {
    if token.chain() != chain {
        return Err(SyncError::ChainMismatch {
            expected: chain,
            received: token.chain(),
        });
    }
    address.validate(chain)
}

fn reject(chain: Chain, events: &mpsc::UnboundedSender<WorkerEvent>, error: SyncError) {
    log::warn!("{} worker rejected command: {}", chain, error);
    let _ = events.send(WorkerEvent::Failed {
        chain,
        error: WorkerFailure::Rejected(error.to_string()),
    });
}

fn forward(
    chain: Chain,
    event: SchedulerEvent<SyncResult>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) {
    let event = match event {
        SchedulerEvent::Result(result) => WorkerEvent::Synced { chain, result },
        SchedulerEvent::Error(e) => WorkerEvent::Failed {
            chain,
            error: WorkerFailure::Adapter(e),
        },
        SchedulerEvent::Status(status) => WorkerEvent::Status { chain, status },
    };
    if events.send(event).is_err() {
        log::debug!("{} worker event dropped: host is gone", chain);
    }
}
