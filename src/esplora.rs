//! Bitcoin chain adapter over the Esplora HTTP API
//!
//! Esplora reads go straight to an indexer with no certification step, so
//! every response from this adapter is uncertified.

use std::collections::{BTreeSet, HashMap};

use bitcoin::Network;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::adapter::{ChainAdapter, TransactionPage};
use crate::error::{AdapterError, ResolveError};
use crate::model::{
    Address, Balance, CertifiedData, Transaction, TransactionStatus, TransactionType,
};
use crate::resolver::{resolve_by_probing, ProbeGroup};
use crate::utxo::Utxo;

/// Confirmations after which a transaction is reported as confirmed
pub const CONFIRMED_DEPTH: u64 = 6;

/// Default public Esplora endpoint for a network
pub fn default_esplora_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "https://mempool.space/api",
        Network::Testnet => "https://mempool.space/testnet/api",
        Network::Regtest => "http://localhost:3002",
        _ => "https://mempool.space/signet/api",
    }
}

/// `/address/{address}` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressInfo {
    #[serde(default)]
    pub chain_stats: AddressStats,
    #[serde(default)]
    pub mempool_stats: AddressStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressStats {
    #[serde(default)]
    pub funded_txo_sum: u64,
    #[serde(default)]
    pub spent_txo_sum: u64,
    #[serde(default)]
    pub tx_count: u64,
}

impl AddressInfo {
    /// Confirmed plus mempool balance
    pub fn total_balance(&self) -> u64 {
        let funded = self
            .chain_stats
            .funded_txo_sum
            .saturating_add(self.mempool_stats.funded_txo_sum);
        let spent = self
            .chain_stats
            .spent_txo_sum
            .saturating_add(self.mempool_stats.spent_txo_sum);
        funded.saturating_sub(spent)
    }
}

/// `/address/{address}/utxo` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoResponse {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
}

impl TxStatus {
    pub fn confirmations(&self, tip_height: u64) -> u64 {
        match (self.confirmed, self.block_height) {
            (true, Some(height)) if tip_height >= height => tip_height - height + 1,
            _ => 0,
        }
    }
}

/// `/address/{address}/txs` entry, reduced to the fields used here
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResponse {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    #[serde(default)]
    pub status: TxStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prevout: Option<TxOutput>,
    #[serde(default)]
    pub is_coinbase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

/// Map an Esplora transaction onto the normalized model from `address`'s
/// point of view.
pub fn normalize_transaction(tx: TxResponse, address: &Address, tip_height: u64) -> Transaction {
    let owner = address.as_str();
    let is_owner = |out: &TxOutput| out.scriptpubkey_address.as_deref() == Some(owner);

    let spent: u64 = tx
        .vin
        .iter()
        .filter_map(|input| input.prevout.as_ref())
        .filter(|out| is_owner(*out))
        .fold(0, |total, out| total.saturating_add(out.value));
    let received: u64 = tx
        .vout
        .iter()
        .filter(|out| is_owner(*out))
        .fold(0, |total, out| total.saturating_add(out.value));

    let (kind, value) = if spent > received {
        (TransactionType::Send, spent - received)
    } else {
        (TransactionType::Receive, received - spent)
    };

    let from: BTreeSet<String> = tx
        .vin
        .iter()
        .filter_map(|input| input.prevout.as_ref()?.scriptpubkey_address.clone())
        .collect();
    let to: BTreeSet<String> = tx
        .vout
        .iter()
        .filter_map(|out| out.scriptpubkey_address.clone())
        .collect();

    let status = if !tx.status.confirmed {
        TransactionStatus::Pending
    } else if tx.status.confirmations(tip_height) < CONFIRMED_DEPTH {
        TransactionStatus::Unconfirmed
    } else {
        TransactionStatus::Confirmed
    };

    Transaction {
        id: tx.txid,
        kind,
        status,
        value: u128::from(value),
        from: from.into_iter().collect(),
        to: to.into_iter().collect(),
        timestamp: tx
            .status
            .block_time
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
    }
}

#[derive(Debug, Clone)]
pub struct EsploraAdapter {
    client: reqwest::Client,
    base_url: String,
    network: Network,
}

impl EsploraAdapter {
    pub fn new(base_url: impl Into<String>, network: Network) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, network)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, network: Network) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            network,
        }
    }

    /// Pick the first provider whose tip-height and fee endpoints both answer.
    pub async fn resolve(urls: &[String], network: Network) -> Result<Self, ResolveError> {
        let client = reqwest::Client::new();

        let groups = urls
            .iter()
            .map(|url| {
                let candidate = Self::with_client(client.clone(), url.as_str(), network);
                let tip = candidate.clone();
                let fees = candidate.clone();

                ProbeGroup::new(url.clone(), move || candidate)
                    .probe(move || async move { tip.get_tip_height().await.map(|_| ()) })
                    .probe(move || async move { fees.get_fee_estimates().await.map(|_| ()) })
            })
            .collect();

        let adapter = resolve_by_probing(groups).await?;
        log::info!("Using Esplora provider {} ({})", adapter.base_url, adapter.network);
        Ok(adapter)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn network(&self) -> Network {
        self.network
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        log::debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AdapterError> {
        let response = self.get(path).await?;
        Ok(response.json().await?)
    }

    pub async fn get_tip_height(&self) -> Result<u64, AdapterError> {
        let text = self.get("/blocks/tip/height").await?.text().await?;
        text.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| AdapterError::Decode(format!("tip height '{}': {}", text, e)))
    }

    /// Fee rate estimates in sat/vB keyed by confirmation target (blocks)
    pub async fn get_fee_estimates(&self) -> Result<HashMap<String, f64>, AdapterError> {
        self.get_json("/fee-estimates").await
    }

    /// Whole sat/vB rate for confirmation within `target_blocks`, rounded up.
    ///
    /// Falls back to the nearest slower target Esplora reports, and to 1 when
    /// none is available.
    pub async fn recommended_fee_rate(&self, target_blocks: u32) -> Result<u64, AdapterError> {
        let estimates = self.get_fee_estimates().await?;
        let mut targets: Vec<(u32, f64)> = estimates
            .into_iter()
            .filter_map(|(target, rate)| Some((target.parse().ok()?, rate)))
            .collect();
        targets.sort_by_key(|(target, _)| *target);

        let rate = targets
            .iter()
            .find(|(target, _)| *target >= target_blocks)
            .or(targets.last())
            .map(|(_, rate)| rate.ceil() as u64)
            .unwrap_or(1);
        Ok(rate.max(1))
    }

    pub async fn get_address_info(&self, address: &Address) -> Result<AddressInfo, AdapterError> {
        self.get_json(&format!("/address/{}", address)).await
    }

    /// Spendable outputs of `address` with confirmations counted from the tip
    pub async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>, AdapterError> {
        let path = format!("/address/{}/utxo", address);
        let (responses, tip_height) = tokio::try_join!(
            self.get_json::<Vec<UtxoResponse>>(&path),
            self.get_tip_height(),
        )?;

        Ok(responses
            .into_iter()
            .map(|utxo| Utxo {
                confirmations: u32::try_from(utxo.status.confirmations(tip_height)).unwrap_or(u32::MAX),
                txid: utxo.txid,
                vout: utxo.vout,
                value: utxo.value,
            })
            .collect())
    }
}

impl ChainAdapter for EsploraAdapter {
    async fn fetch_balance(&self, address: &Address) -> Result<CertifiedData<Balance>, AdapterError> {
        let info = self.get_address_info(address).await?;
        Ok(CertifiedData::uncertified(Balance(u128::from(info.total_balance()))))
    }

    /// Esplora returns the newest page (mempool first) on every call, so no
    /// cursor is handed back; the scheduler's seen set filters repeats.
    async fn fetch_transactions(
        &self,
        address: &Address,
        _cursor: Option<&str>,
    ) -> Result<CertifiedData<TransactionPage>, AdapterError> {
        let path = format!("/address/{}/txs", address);
        let (txs, tip_height) = tokio::try_join!(
            self.get_json::<Vec<TxResponse>>(&path),
            self.get_tip_height(),
        )?;

        let transactions = txs
            .into_iter()
            .map(|tx| normalize_transaction(tx, address, tip_height))
            .collect();

        Ok(CertifiedData::uncertified(TransactionPage {
            transactions,
            cursor: None,
        }))
    }
}
