/// Sync configuration from environment variables
///
/// Controls the Bitcoin network, Esplora providers, polling cadence, worker
/// queue flow control and the UTXO fee model. Defaults to Signet.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::esplora::default_esplora_url;
use crate::model::Chain;
use crate::utxo::{
    FeeModel, DEFAULT_BASE_OVERHEAD_VBYTES, DEFAULT_DUST_THRESHOLD_SATS, DEFAULT_PER_INPUT_VBYTES,
};
use crate::worker::QueueConfig;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(30_000);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub bitcoin_network: bitcoin::Network,
    /// Esplora providers, tried in order
    pub esplora_urls: Vec<String>,
    pub polling_interval: Duration,
    /// Per-chain overrides of `polling_interval`
    pub chain_intervals: HashMap<Chain, Duration>,
    pub queue: QueueConfig,
    pub min_confirmations: u32,
    pub fee_model: FeeModel,
}

impl SyncConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BITCOIN_NETWORK`: "signet" (default), "bitcoin"/"mainnet", "testnet" or "regtest"
    /// - `ESPLORA_URLS`: comma separated Esplora endpoints (defaults per network)
    /// - `WALLET_SYNC_INTERVAL_MS`: default polling interval (30000)
    /// - `WALLET_SYNC_<CHAIN>_INTERVAL_MS`: per-chain interval, e.g. `WALLET_SYNC_BTC_INTERVAL_MS`
    /// - `WALLET_QUEUE_MAX_INFLIGHT` (1), `WALLET_QUEUE_RELEASE_DELAY_MS` (0)
    /// - `UTXO_MIN_CONFIRMATIONS` (1), `UTXO_BASE_OVERHEAD_VBYTES` (78),
    ///   `UTXO_PER_INPUT_VBYTES` (68), `UTXO_DUST_THRESHOLD_SATS` (546)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Regtest against a local Esplora, polling every 5 seconds
    /// BITCOIN_NETWORK=regtest ESPLORA_URLS=http://localhost:3002 WALLET_SYNC_INTERVAL_MS=5000 cargo test
    /// ```
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bitcoin_network = match lookup("BITCOIN_NETWORK")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "bitcoin" | "mainnet" => bitcoin::Network::Bitcoin,
            "testnet" => bitcoin::Network::Testnet,
            "regtest" => bitcoin::Network::Regtest,
            "signet" | "" => bitcoin::Network::Signet,
            other => {
                log::warn!("Unknown network '{}', defaulting to Signet", other);
                bitcoin::Network::Signet
            }
        };
        log::info!("Using {} network", bitcoin_network);

        let esplora_urls: Vec<String> = lookup("ESPLORA_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect()
            })
            .filter(|urls: &Vec<String>| !urls.is_empty())
            .unwrap_or_else(|| vec![default_esplora_url(bitcoin_network).to_string()]);
        log::info!("Esplora providers: {}", esplora_urls.join(", "));

        let polling_interval = Duration::from_millis(parse_or(
            &lookup,
            "WALLET_SYNC_INTERVAL_MS",
            DEFAULT_POLLING_INTERVAL.as_millis() as u64,
        ));

        let chain_intervals = Chain::ALL
            .into_iter()
            .filter_map(|chain| {
                let key = format!("WALLET_SYNC_{}_INTERVAL_MS", chain.env_name());
                parse_var::<u64>(&lookup, &key).map(|ms| (chain, Duration::from_millis(ms)))
            })
            .collect();

        let queue = QueueConfig {
            max_inflight: parse_or(&lookup, "WALLET_QUEUE_MAX_INFLIGHT", 1),
            release_delay: Duration::from_millis(parse_or(&lookup, "WALLET_QUEUE_RELEASE_DELAY_MS", 0)),
        };

        let fee_model = FeeModel {
            base_overhead_vbytes: parse_or(&lookup, "UTXO_BASE_OVERHEAD_VBYTES", DEFAULT_BASE_OVERHEAD_VBYTES),
            per_input_vbytes: parse_or(&lookup, "UTXO_PER_INPUT_VBYTES", DEFAULT_PER_INPUT_VBYTES),
            dust_threshold: parse_or(&lookup, "UTXO_DUST_THRESHOLD_SATS", DEFAULT_DUST_THRESHOLD_SATS),
        };

        Self {
            bitcoin_network,
            esplora_urls,
            polling_interval,
            chain_intervals,
            queue,
            min_confirmations: parse_or(&lookup, "UTXO_MIN_CONFIRMATIONS", 1),
            fee_model,
        }
    }

    pub fn polling_interval_for(&self, chain: Chain) -> Duration {
        self.chain_intervals
            .get(&chain)
            .copied()
            .unwrap_or(self.polling_interval)
    }
}

impl Default for SyncConfig {
    /// Default configuration (Signet, public mempool.space Esplora)
    fn default() -> Self {
        Self {
            bitcoin_network: bitcoin::Network::Signet,
            esplora_urls: vec![default_esplora_url(bitcoin::Network::Signet).to_string()],
            polling_interval: DEFAULT_POLLING_INTERVAL,
            chain_intervals: HashMap::new(),
            queue: QueueConfig::default(),
            min_confirmations: 1,
            fee_model: FeeModel::default(),
        }
    }
}

/// Parse a variable, warning and returning `None` when it is malformed
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {}='{}'", key, raw);
            None
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse_var(lookup, key).unwrap_or(default)
}
