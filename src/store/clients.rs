//! Long-lived chain clients keyed by (identity, chain)
//!
//! Building a client may involve provider resolution, so clients are created
//! once per signed-in identity and reused. `clear` drops them all on sign-out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::Chain;

type ClientKey = (String, Chain);

pub struct ClientCache<C> {
    clients: RwLock<HashMap<ClientKey, Arc<C>>>,
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ClientCache<C> {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, identity: &str, chain: Chain) -> Option<Arc<C>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(identity.to_string(), chain))
            .cloned()
    }

    /// Return the cached client or build one with `create`.
    ///
    /// Two callers racing on the same key may both build a client; the first
    /// one inserted wins and both get it back.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        identity: &str,
        chain: Chain,
        create: F,
    ) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        // Fast path: read lock
        if let Some(client) = self.get(identity, chain) {
            log::debug!("Client cache hit for {} / {}", identity, chain);
            return Ok(client);
        }

        // Creation may await, so no lock is held across it.
        let created = Arc::new(create().await?);

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let client = clients
            .entry((identity.to_string(), chain))
            .or_insert(created)
            .clone();
        log::info!("Cached {} client for {}", chain, identity);
        Ok(client)
    }

    pub fn remove(&self, identity: &str, chain: Chain) -> Option<Arc<C>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(identity.to_string(), chain))
    }

    /// Drop every cached client
    pub fn clear(&self) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        log::info!("Clearing {} cached client(s)", clients.len());
        clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
