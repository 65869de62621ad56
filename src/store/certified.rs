//! Certified store reconciler
//!
//! Merges sync results from every worker into one per-token view. Each token
//! has its own mutex, so a write only ever blocks writers of the same token.
//! Certified data is never replaced by uncertified data: such writes are
//! dropped silently, because certified and uncertified responses routinely
//! race each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::cache::PersistentCache;
use crate::error::CacheError;
use crate::model::{Balance, CertifiedData, SyncResult, TokenId, Transaction};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Provenance of a token's balance entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Empty,
    Uncertified,
    Certified,
}

/// A write that was applied to the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    Balance {
        token: TokenId,
        balance: CertifiedData<Balance>,
    },
    Transactions {
        token: TokenId,
        applied: usize,
    },
    Reset {
        token: TokenId,
    },
}

/// What `apply` changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub balance_written: bool,
    pub transactions_applied: usize,
}

#[derive(Debug, Default)]
struct TokenEntry {
    balance: Option<CertifiedData<Balance>>,
    /// Newest first
    transactions: Vec<CertifiedData<Transaction>>,
}

/// On-disk shape of one token's entries
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    balance: Option<Balance>,
    transactions: Vec<Transaction>,
}

pub struct CertifiedStore {
    entries: RwLock<HashMap<TokenId, Arc<Mutex<TokenEntry>>>>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl Default for CertifiedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CertifiedStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Get or create the entry for a token
    fn entry(&self, token: &TokenId) -> Arc<Mutex<TokenEntry>> {
        // Fast path: read lock
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(token) {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TokenEntry::default())))
            .clone()
    }

    fn existing(&self, token: &TokenId) -> Option<Arc<Mutex<TokenEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    fn publish(&self, update: StoreUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }

    /// Write a balance unless it would demote a certified one.
    ///
    /// Returns whether the write was applied.
    pub fn set_balance(&self, token: &TokenId, balance: CertifiedData<Balance>) -> bool {
        let entry = self.entry(token);
        let mut entry = lock(&entry);

        if let Some(existing) = &entry.balance {
            if balance.would_regress(existing) {
                log::warn!(
                    "Ignoring uncertified balance {} for {}: certified {} already stored",
                    balance.data,
                    token,
                    existing.data
                );
                return false;
            }
        }

        entry.balance = Some(balance.clone());
        self.publish(StoreUpdate::Balance {
            token: token.clone(),
            balance,
        });
        true
    }

    /// Merge transactions by id, newest first.
    ///
    /// Unknown ids are prepended in the order given. A known id is replaced
    /// only when the incoming copy is certified over an uncertified one, or
    /// carries a later status without losing certification; otherwise it is
    /// a duplicate and dropped. Returns the number of inserted plus replaced
    /// transactions.
    pub fn prepend_transactions(
        &self,
        token: &TokenId,
        transactions: CertifiedData<Vec<Transaction>>,
    ) -> usize {
        let CertifiedData {
            data: incoming,
            certified,
        } = transactions;
        if incoming.is_empty() {
            return 0;
        }

        let entry = self.entry(token);
        let mut entry = lock(&entry);

        let mut fresh: Vec<CertifiedData<Transaction>> = Vec::new();
        let mut replaced = 0;

        for tx in incoming {
            let candidate = CertifiedData {
                data: tx,
                certified,
            };

            if let Some(existing) = entry
                .transactions
                .iter_mut()
                .find(|e| e.data.id == candidate.data.id)
            {
                if supersedes(&candidate, existing) {
                    *existing = candidate;
                    replaced += 1;
                } else if candidate.would_regress(existing) {
                    log::warn!(
                        "Ignoring uncertified copy of transaction {} for {}",
                        candidate.data.id,
                        token
                    );
                }
                continue;
            }

            if fresh.iter().any(|f| f.data.id == candidate.data.id) {
                continue;
            }
            fresh.push(candidate);
        }

        let applied = fresh.len() + replaced;
        if applied == 0 {
            return 0;
        }

        fresh.append(&mut entry.transactions);
        entry.transactions = fresh;

        self.publish(StoreUpdate::Transactions {
            token: token.clone(),
            applied,
        });
        applied
    }

    /// Clear everything stored for a token, certified or not.
    pub fn reset(&self, token: &TokenId) {
        if let Some(entry) = self.existing(token) {
            *lock(&entry) = TokenEntry::default();
        }
        log::debug!("Reset store entries for {}", token);
        self.publish(StoreUpdate::Reset {
            token: token.clone(),
        });
    }

    /// Reset a token and drop its persisted copy as well.
    pub fn evict(&self, token: &TokenId, cache: &dyn PersistentCache) -> Result<(), CacheError> {
        self.reset(token);
        cache
            .delete(&cache_key(token))
            .inspect_err(|e| log::error!("Failed to drop persisted entries for {}: {}", token, e))
    }

    /// Reset every token, e.g. on sign-out
    pub fn clear(&self) {
        let tokens: Vec<TokenId> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for token in &tokens {
            self.reset(token);
        }
    }

    /// Apply one worker result
    pub fn apply(&self, result: &SyncResult) -> ApplyOutcome {
        let token = result.token.id();
        ApplyOutcome {
            balance_written: self.set_balance(token, result.balance.clone()),
            transactions_applied: self
                .prepend_transactions(token, result.new_transactions.clone()),
        }
    }

    pub fn balance(&self, token: &TokenId) -> Option<CertifiedData<Balance>> {
        let entry = self.existing(token)?;
        let entry = lock(&entry);
        entry.balance.clone()
    }

    /// Stored transactions, newest first
    pub fn transactions(&self, token: &TokenId) -> Vec<CertifiedData<Transaction>> {
        match self.existing(token) {
            Some(entry) => lock(&entry).transactions.clone(),
            None => Vec::new(),
        }
    }

    pub fn key_state(&self, token: &TokenId) -> KeyState {
        match self.balance(token) {
            None => KeyState::Empty,
            Some(b) if b.certified => KeyState::Certified,
            Some(_) => KeyState::Uncertified,
        }
    }

    /// Receive every applied write from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    /// Write a token's entries to a persistent cache.
    pub fn persist(&self, token: &TokenId, cache: &dyn PersistentCache) -> Result<(), CacheError> {
        let snapshot = match self.existing(token) {
            Some(entry) => {
                let entry = lock(&entry);
                Snapshot {
                    balance: entry.balance.as_ref().map(|b| b.data),
                    transactions: entry.transactions.iter().map(|t| t.data.clone()).collect(),
                }
            }
            None => return cache.delete(&cache_key(token)),
        };

        cache
            .set(&cache_key(token), serde_json::to_value(&snapshot)?)
            .inspect_err(|e| log::error!("Failed to persist store entries for {}: {}", token, e))
    }

    /// Restore a token's entries from a persistent cache as uncertified.
    ///
    /// Cached data has not been through certification in this session, so it
    /// never overrides certified entries already in the store. Returns whether
    /// anything was found.
    pub fn hydrate(&self, token: &TokenId, cache: &dyn PersistentCache) -> Result<bool, CacheError> {
        let Some(value) = cache.get(&cache_key(token))? else {
            return Ok(false);
        };
        let snapshot: Snapshot = serde_json::from_value(value)?;

        if let Some(balance) = snapshot.balance {
            self.set_balance(token, CertifiedData::uncertified(balance));
        }
        self.prepend_transactions(token, CertifiedData::uncertified(snapshot.transactions));

        log::debug!("Hydrated store entries for {} from cache", token);
        Ok(true)
    }
}

fn cache_key(token: &TokenId) -> String {
    format!("store:{}", token)
}

fn lock(entry: &Mutex<TokenEntry>) -> MutexGuard<'_, TokenEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `incoming` should replace a stored transaction with the same id
fn supersedes(incoming: &CertifiedData<Transaction>, existing: &CertifiedData<Transaction>) -> bool {
    if incoming.would_regress(existing) {
        return false;
    }
    (incoming.certified && !existing.certified) || incoming.data.status > existing.data.status
}
