//! Polling scheduler shared by every chain worker
//!
//! A `Scheduler` owns at most one recurring timer. Each tick runs the injected
//! [`SyncJob`] against a snapshot of the per-key state and only commits the new
//! state when the job succeeds. Ticks are serialized: a slow tick delays the
//! next fire instead of overlapping it.
//!
//! `stop` is cooperative. A tick already waiting on the network is allowed to
//! finish, but its result is dropped because the generation it captured no
//! longer matches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adapter::ChainAdapter;
use crate::error::AdapterError;
use crate::model::{
    Address, Balance, CertifiedData, SyncResult, Token, TokenId, TransactionStatus,
};

/// Lower bound applied to polling intervals; a zero period would spin.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// The (token, address) pair a scheduler polls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub token: Token,
    pub address: Address,
}

impl SyncTarget {
    pub fn new(token: Token, address: Address) -> Self {
        Self { token, address }
    }

    pub fn key(&self) -> (TokenId, Address) {
        (self.token.id().clone(), self.address.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TimerParams {
    pub target: SyncTarget,
    pub polling_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Idle,
    Error,
}

/// What a scheduler reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent<O> {
    Result(O),
    Error(AdapterError),
    Status(SyncStatus),
}

/// New state to commit plus an optional result to emit.
#[derive(Debug, Clone)]
pub struct JobOutcome<S, O> {
    pub state: S,
    pub output: Option<O>,
}

/// Work performed on every tick.
pub trait SyncJob: Send + Sync + 'static {
    type State: Clone + Default + Send + Sync + 'static;
    type Output: Send + 'static;

    fn run(
        &self,
        target: &SyncTarget,
        state: &Self::State,
    ) -> impl Future<Output = Result<JobOutcome<Self::State, Self::Output>, AdapterError>> + Send;
}

/// Per-key state, alive between `start` and `stop`.
struct SchedulerState<S> {
    target: SyncTarget,
    polling_interval: Duration,
    state: S,
    /// Dropping or signalling this ends the timer loop after its current tick.
    timer: watch::Sender<bool>,
}

impl<S> SchedulerState<S> {
    fn cancel(&self) {
        let _ = self.timer.send(true);
    }
}

struct Slot<S> {
    generation: u64,
    active: Option<SchedulerState<S>>,
}

struct Shared<J: SyncJob> {
    slot: Mutex<Slot<J::State>>,
    tick_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<SchedulerEvent<J::Output>>,
}

impl<J: SyncJob> Shared<J> {
    fn lock_slot(&self) -> MutexGuard<'_, Slot<J::State>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SchedulerEvent<J::Output>) {
        if self.events.send(event).is_err() {
            log::debug!("Scheduler event dropped: receiver is gone");
        }
    }
}

pub struct Scheduler<J: SyncJob> {
    job: Arc<J>,
    shared: Arc<Shared<J>>,
}

impl<J: SyncJob> Scheduler<J> {
    pub fn new(job: J, events: mpsc::UnboundedSender<SchedulerEvent<J::Output>>) -> Self {
        Self {
            job: Arc::new(job),
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    generation: 0,
                    active: None,
                }),
                tick_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Start polling; replaces any timer that is already running.
    ///
    /// The first tick fires immediately, then every `polling_interval`.
    pub fn start(&self, params: TimerParams) {
        let polling_interval = params.polling_interval.max(MIN_POLLING_INTERVAL);
        let mut slot = self.shared.lock_slot();

        if let Some(previous) = slot.active.take() {
            previous.cancel();
            log::info!(
                "Replacing {} timer for {} ({})",
                previous.target.token.chain(),
                previous.target.token.id(),
                previous.target.address
            );
        }

        slot.generation += 1;
        let generation = slot.generation;
        let (timer, shutdown) = watch::channel(false);

        tokio::spawn(timer_loop(
            self.job.clone(),
            self.shared.clone(),
            params.target.clone(),
            polling_interval,
            generation,
            shutdown,
        ));

        log::info!(
            "Started {} timer for {} ({}) every {:?}",
            params.target.token.chain(),
            params.target.token.id(),
            params.target.address,
            polling_interval
        );

        slot.active = Some(SchedulerState {
            target: params.target,
            polling_interval,
            state: J::State::default(),
            timer,
        });
    }

    /// Stop polling. Safe to call when nothing is running.
    pub fn stop(&self) {
        let mut slot = self.shared.lock_slot();
        slot.generation += 1;

        match slot.active.take() {
            Some(active) => {
                active.cancel();
                log::info!(
                    "Stopped {} timer for {} ({})",
                    active.target.token.chain(),
                    active.target.token.id(),
                    active.target.address
                );
            }
            None => log::debug!("Stop requested but no timer is running"),
        }
    }

    /// Run one tick now without touching the recurring timer's phase.
    ///
    /// When `target` matches the running timer the tick reads and commits the
    /// live state; otherwise it runs against a throwaway default state.
    pub fn trigger(&self, target: SyncTarget) -> JoinHandle<()> {
        let generation = self.shared.lock_slot().generation;
        let job = self.job.clone();
        let shared = self.shared.clone();

        log::debug!(
            "Triggering out-of-band {} tick for {}",
            target.token.chain(),
            target.token.id()
        );

        tokio::spawn(async move { run_tick(&*job, &shared, &target, generation).await })
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock_slot().active.is_some()
    }

    pub fn target(&self) -> Option<SyncTarget> {
        self.shared
            .lock_slot()
            .active
            .as_ref()
            .map(|a| a.target.clone())
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        self.shared
            .lock_slot()
            .active
            .as_ref()
            .map(|a| a.polling_interval)
    }

    /// Snapshot of the committed per-key state, if started
    pub fn state(&self) -> Option<J::State> {
        self.shared
            .lock_slot()
            .active
            .as_ref()
            .map(|a| a.state.clone())
    }
}

impl<J: SyncJob> Drop for Scheduler<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn timer_loop<J: SyncJob>(
    job: Arc<J>,
    shared: Arc<Shared<J>>,
    target: SyncTarget,
    period: Duration,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    // A tick that overruns the period is followed immediately by the next one.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        run_tick(&*job, &shared, &target, generation).await;
    }

    log::debug!(
        "{} timer loop for {} exited",
        target.token.chain(),
        target.token.id()
    );
}

async fn run_tick<J: SyncJob>(
    job: &J,
    shared: &Shared<J>,
    target: &SyncTarget,
    generation: u64,
) {
    let _serialized = shared.tick_lock.lock().await;

    let baseline = {
        let slot = shared.lock_slot();
        if slot.generation != generation {
            log::debug!("Skipping tick for {}: scheduler was stopped or restarted", target.token.id());
            return;
        }
        shared.emit(SchedulerEvent::Status(SyncStatus::InProgress));
        slot.active
            .as_ref()
            .filter(|a| a.target == *target)
            .map(|a| a.state.clone())
            .unwrap_or_default()
    };

    let outcome = job.run(target, &baseline).await;

    let mut slot = shared.lock_slot();
    if slot.generation != generation {
        log::debug!(
            "Discarding tick result for {}: scheduler was stopped or restarted",
            target.token.id()
        );
        return;
    }

    match outcome {
        Ok(JobOutcome { state, output }) => {
            if let Some(active) = slot.active.as_mut().filter(|a| a.target == *target) {
                active.state = state;
            }
            if let Some(output) = output {
                shared.emit(SchedulerEvent::Result(output));
            }
            shared.emit(SchedulerEvent::Status(SyncStatus::Idle));
        }
        Err(e) => {
            log::warn!(
                "{} sync failed for {} ({}): {}",
                target.token.chain(),
                target.token.id(),
                target.address,
                e
            );
            shared.emit(SchedulerEvent::Error(e));
            shared.emit(SchedulerEvent::Status(SyncStatus::Error));
        }
    }
}

/// Per-key memory of the wallet sync job
#[derive(Debug, Clone, Default)]
pub struct WalletSyncState {
    /// Last status and certification seen for every transaction id
    pub seen: HashMap<String, (TransactionStatus, bool)>,
    pub cursor: Option<String>,
    pub last_balance: Option<CertifiedData<Balance>>,
}

/// Balance + transaction polling against one chain adapter.
pub struct WalletSyncJob<A> {
    adapter: A,
}

impl<A: ChainAdapter> WalletSyncJob<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: ChainAdapter> SyncJob for WalletSyncJob<A> {
    type State = WalletSyncState;
    type Output = SyncResult;

    async fn run(
        &self,
        target: &SyncTarget,
        state: &WalletSyncState,
    ) -> Result<JobOutcome<WalletSyncState, SyncResult>, AdapterError> {
        let address = &target.address;
        let (balance, page) = tokio::try_join!(
            self.adapter.fetch_balance(address),
            self.adapter.fetch_transactions(address, state.cursor.as_deref()),
        )?;

        let certifies = target.token.chain().produces_certified_reads();
        if !certifies && (balance.certified || page.certified) {
            log::debug!(
                "Ignoring certified flag from {} adapter: chain has no certified reads",
                target.token.chain()
            );
        }
        let balance = CertifiedData {
            data: balance.data,
            certified: balance.certified && certifies,
        };
        let transactions_certified = page.certified && certifies;

        let mut next = state.clone();
        let mut fresh = Vec::new();
        for tx in page.data.transactions {
            if let Some(&(status, certified)) = next.seen.get(&tx.id) {
                // A certified copy of an uncertified transaction is news too.
                let advanced = tx.status > status
                    || (tx.status == status && transactions_certified && !certified);
                if !advanced {
                    continue;
                }
            }
            next.seen.insert(tx.id.clone(), (tx.status, transactions_certified));
            fresh.push(tx);
        }
        next.cursor = page.data.cursor;

        let balance_changed = state.last_balance.as_ref() != Some(&balance);
        next.last_balance = Some(balance.clone());

        log::debug!(
            "{} tick for {}: balance {} (certified: {}), {} new or advanced transaction(s)",
            target.token.chain(),
            target.token.id(),
            balance.data,
            balance.certified,
            fresh.len()
        );

        let output = (balance_changed || !fresh.is_empty()).then(|| SyncResult {
            token: target.token.clone(),
            balance,
            new_transactions: CertifiedData {
                data: fresh,
                certified: transactions_certified,
            },
        });

        Ok(JobOutcome {
            state: next,
            output,
        })
    }
}
