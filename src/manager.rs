/// Sync Manager - Orchestration Layer
///
/// Owns one queue-fronted worker per (chain, token) and pumps their events
/// into the shared certified store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::adapter::ChainAdapter;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::esplora::EsploraAdapter;
use crate::model::{Address, Chain, Token, TokenId};
use crate::scheduler::WalletSyncJob;
use crate::store::{CertifiedStore, ClientCache, PersistentCache};
use crate::utxo::{select_utxos, SelectionRequest, UtxoSelection};
use crate::worker::{
    StartTimerData, TriggerTimerData, WorkerBoundary, WorkerEvent, WorkerMessage, WorkerQueue,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type WorkerKey = (Chain, TokenId);

struct WorkerHandle {
    queue: WorkerQueue,
    token: Token,
    address: Address,
    pump: JoinHandle<()>,
}

pub struct SyncManager {
    pub config: SyncConfig,
    store: Arc<CertifiedStore>,
    cache: Option<Arc<dyn PersistentCache>>,
    workers: Mutex<HashMap<WorkerKey, WorkerHandle>>,
    esplora_clients: ClientCache<EsploraAdapter>,
    events: broadcast::Sender<WorkerEvent>,
}

impl SyncManager {
    // ============================================================================
    // Constructor
    // ============================================================================

    pub fn new(config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            store: Arc::new(CertifiedStore::new()),
            cache: None,
            workers: Mutex::new(HashMap::new()),
            esplora_clients: ClientCache::new(),
            events,
        }
    }

    /// Persist store entries to `cache` after every applied result and warm
    /// the store from it when a token is first watched.
    pub fn with_cache(mut self, cache: Arc<dyn PersistentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<CertifiedStore> {
        &self.store
    }

    /// Every worker event, after it has been applied to the store
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<WorkerKey, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================================================
    // Watching
    // ============================================================================

    /// Start syncing `token` for `address` through `adapter`.
    ///
    /// Watching a token that already has a worker restarts its timer with the
    /// new address; the worker keeps the adapter it was created with. When the
    /// address differs, the token's stored and persisted entries are cleared
    /// first.
    pub fn watch<A: ChainAdapter>(&self, token: Token, address: Address, adapter: A) -> Result<(), SyncError> {
        let chain = token.chain();
        address.validate(chain)?;
        let key = (chain, token.id().clone());

        let start = WorkerMessage::start(
            chain,
            StartTimerData {
                address: address.clone(),
                token: token.clone(),
                polling_interval_ms: Some(self.config.polling_interval_for(chain).as_millis() as u64),
            },
        );

        let mut workers = self.lock_workers();
        if let Some(handle) = workers.get_mut(&key) {
            log::info!("Restarting {} worker for {}", chain, token.id());
            if handle.address != address {
                // Entries under this token belong to the previous address.
                log::info!(
                    "Address for {} changed from {} to {}; clearing stored entries",
                    token.id(),
                    handle.address,
                    address
                );
                match &self.cache {
                    Some(cache) => {
                        let _ = self.store.evict(token.id(), cache.as_ref());
                    }
                    None => self.store.reset(token.id()),
                }
            }
            handle.queue.send(start)?;
            handle.token = token;
            handle.address = address;
            return Ok(());
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = self.store.hydrate(token.id(), cache.as_ref()) {
                log::warn!("Could not hydrate {} from cache: {}", token.id(), e);
            }
        }

        let (boundary, events) = WorkerBoundary::spawn(
            chain,
            WalletSyncJob::new(adapter),
            self.config.polling_interval_for(chain),
        );
        let queue = WorkerQueue::new(boundary, self.config.queue);
        queue.send(start)?;

        let pump = tokio::spawn(pump_events(
            events,
            self.store.clone(),
            self.cache.clone(),
            self.events.clone(),
        ));

        workers.insert(
            key,
            WorkerHandle {
                queue,
                token,
                address,
                pump,
            },
        );
        Ok(())
    }

    /// Watch a Bitcoin token through a cached Esplora client for `identity`.
    ///
    /// The first call per identity resolves a working provider from
    /// `config.esplora_urls`.
    pub async fn watch_bitcoin(&self, identity: &str, token: Token, address: Address) -> Result<(), SyncError> {
        if token.chain() != Chain::Btc {
            return Err(SyncError::ChainMismatch {
                expected: Chain::Btc,
                received: token.chain(),
            });
        }
        address.require_bitcoin_network(self.config.bitcoin_network)?;

        let adapter = self.bitcoin_client(identity).await?;
        self.watch(token, address, adapter)
    }

    async fn bitcoin_client(&self, identity: &str) -> Result<Arc<EsploraAdapter>, SyncError> {
        let urls = self.config.esplora_urls.clone();
        let network = self.config.bitcoin_network;
        let adapter = self
            .esplora_clients
            .get_or_create(identity, Chain::Btc, || async move {
                EsploraAdapter::resolve(&urls, network).await
            })
            .await?;
        Ok(adapter)
    }

    /// Run one out-of-band sync for a watched token
    pub fn trigger(&self, chain: Chain, token: &TokenId) -> Result<(), SyncError> {
        let workers = self.lock_workers();
        let handle = workers
            .get(&(chain, token.clone()))
            .ok_or_else(|| SyncError::WorkerClosed(format!("{} is not watched on {}", token, chain)))?;

        handle.queue.send(WorkerMessage::trigger(
            chain,
            TriggerTimerData {
                address: handle.address.clone(),
                token: handle.token.clone(),
            },
        ))
    }

    pub fn is_watching(&self, chain: Chain, token: &TokenId) -> bool {
        self.lock_workers().contains_key(&(chain, token.clone()))
    }

    pub fn watched(&self) -> Vec<(Chain, TokenId)> {
        self.lock_workers().keys().cloned().collect()
    }

    // ============================================================================
    // Teardown
    // ============================================================================

    /// Stop and tear down one worker. Returns false if it was not watched.
    pub async fn unwatch(&self, chain: Chain, token: &TokenId) -> bool {
        let handle = self.lock_workers().remove(&(chain, token.clone()));
        match handle {
            Some(handle) => {
                stop_worker(chain, handle).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every worker; store contents are kept.
    pub async fn shutdown(&self) {
        let handles: Vec<(WorkerKey, WorkerHandle)> = self.lock_workers().drain().collect();
        for ((chain, _), handle) in handles {
            stop_worker(chain, handle).await;
        }
    }

    /// Tear down every worker and forget everything tied to the session.
    pub async fn sign_out(&self) {
        self.shutdown().await;
        self.store.clear();
        self.esplora_clients.clear();
        log::info!("Signed out: workers stopped, store and clients cleared");
    }

    // ============================================================================
    // Send helpers
    // ============================================================================

    /// Fetch spendable outputs for `address` and select inputs for a send.
    ///
    /// Confirmation and fee policy come from the configuration.
    pub async fn select_bitcoin_inputs(
        &self,
        identity: &str,
        address: &Address,
        amount_sats: u64,
        fee_rate: u64,
        exclude_txids: impl IntoIterator<Item = String>,
    ) -> Result<UtxoSelection, SyncError> {
        address.require_bitcoin_network(self.config.bitcoin_network)?;
        let client = self.bitcoin_client(identity).await?;
        let utxos = client.fetch_utxos(address).await?;

        let mut request = SelectionRequest::new(amount_sats, fee_rate)
            .with_min_confirmations(self.config.min_confirmations);
        request.exclude_txids.extend(exclude_txids);

        Ok(select_utxos(&utxos, &request, &self.config.fee_model)?)
    }
}

async fn stop_worker(chain: Chain, handle: WorkerHandle) {
    let WorkerHandle {
        queue, token, pump, ..
    } = handle;

    if let Err(e) = queue.send(WorkerMessage::stop(chain)) {
        log::warn!("Could not stop {} worker for {}: {}", chain, token.id(), e);
    }
    queue.shutdown().await;
    // The boundary is gone, so its event stream ends and the pump drains out.
    if let Err(e) = pump.await {
        log::warn!("{} event pump for {} ended abnormally: {}", chain, token.id(), e);
    }
    log::info!("Unwatched {} on {}", token.id(), chain);
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    store: Arc<CertifiedStore>,
    cache: Option<Arc<dyn PersistentCache>>,
    forward: broadcast::Sender<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            WorkerEvent::Synced { chain, result } => {
                let outcome = store.apply(result);
                log::debug!(
                    "Applied {} result for {}: balance written {}, {} transaction(s)",
                    chain,
                    result.token.id(),
                    outcome.balance_written,
                    outcome.transactions_applied
                );
                if let Some(cache) = &cache {
                    // Failures are logged inside persist; the store stays authoritative.
                    let _ = store.persist(result.token.id(), cache.as_ref());
                }
            }
            WorkerEvent::Failed { chain, error } => {
                log::warn!("{} worker reported: {}", chain, error);
            }
            WorkerEvent::Status { chain, status } => {
                log::debug!("{} worker status: {:?}", chain, status);
            }
        }
        let _ = forward.send(event);
    }
}
