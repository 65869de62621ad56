//! Wallet Sync: multi-chain wallet synchronization core
//!
//! Per-chain background workers poll remote ledgers and indexers on their own
//! timers, normalize balances and transactions into one model, and hand the
//! results to a store that tracks whether each value came back certified.
//!
//! # Architecture
//!
//! - **Scheduler**: one recurring timer per worker, running an injected sync job
//! - **Worker Boundary**: message-passing wall around each scheduler, fronted by a
//!   flow-controlled **WorkerQueue**
//! - **Certified Store**: per-token reconciliation where certified data never
//!   regresses to uncertified
//! - **UTXO Selector**: largest-first Bitcoin input selection with a linear fee model
//! - **Escalating Resolver**: picks the first healthy provider out of ordered groups
//!
//! # Example
//!
//! ```ignore
//! use wallet_sync::{Address, Chain, SyncConfig, SyncManager, Token};
//!
//! let manager = SyncManager::new(SyncConfig::from_env());
//! let token = Token::new("BTC-mainnet", "BTC", Chain::Btc, "mainnet", 8);
//! let address = Address::parse(Chain::Btc, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq")?;
//!
//! manager.watch_bitcoin("user-principal", token.clone(), address).await?;
//!
//! let mut updates = manager.store().subscribe();
//! while let Ok(update) = updates.recv().await {
//!     println!("{:?}", update);
//! }
//! ```

// Public modules
pub mod adapter;
pub mod config;
pub mod error;
pub mod esplora;
pub mod manager;
pub mod model;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod utxo;
pub mod worker;

// Re-exports for convenience
pub use adapter::{ChainAdapter, TransactionPage};
pub use config::SyncConfig;
pub use error::{AdapterError, CacheError, ResolveError, SelectionError, SyncError};
pub use esplora::EsploraAdapter;
pub use manager::SyncManager;
pub use model::{
    Address, Balance, CertifiedData, Chain, SyncResult, Token, TokenId, Transaction,
    TransactionStatus, TransactionType,
};
pub use resolver::{resolve_by_probing, ProbeGroup};
pub use scheduler::{
    JobOutcome, Scheduler, SchedulerEvent, SyncJob, SyncStatus, SyncTarget, TimerParams,
    WalletSyncJob, WalletSyncState,
};
pub use store::{CertifiedStore, ClientCache, FileCache, KeyState, MemoryCache, PersistentCache, StoreUpdate};
pub use utxo::{select_utxos, FeeModel, SelectionFailure, SelectionRequest, Utxo, UtxoSelection};
pub use worker::{Envelope, QueueConfig, WorkerBoundary, WorkerEvent, WorkerMessage, WorkerQueue};

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
