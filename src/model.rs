//! Common data model shared by every chain worker
//!
//! Chain adapters map their native shapes into these types; the scheduler, the
//! worker protocol and the certified store only ever see this model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Chains with a wallet worker.
///
/// The variant name is the message-tag prefix (`startBtcWalletTimer`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Btc,
    Eth,
    Icp,
    Icrc,
    CkBtc,
    CkEth,
    Sol,
    Kaspa,
}

impl Chain {
    pub const ALL: [Chain; 8] = [
        Chain::Btc,
        Chain::Eth,
        Chain::Icp,
        Chain::Icrc,
        Chain::CkBtc,
        Chain::CkEth,
        Chain::Sol,
        Chain::Kaspa,
    ];

    /// Prefix used inside worker message tags
    pub fn tag_prefix(&self) -> &'static str {
        match self {
            Chain::Btc => "Btc",
            Chain::Eth => "Eth",
            Chain::Icp => "Icp",
            Chain::Icrc => "Icrc",
            Chain::CkBtc => "CkBtc",
            Chain::CkEth => "CkEth",
            Chain::Sol => "Sol",
            Chain::Kaspa => "Kaspa",
        }
    }

    pub fn from_tag_prefix(prefix: &str) -> Option<Chain> {
        Chain::ALL.into_iter().find(|c| c.tag_prefix() == prefix)
    }

    /// Upper-case name used for per-chain environment overrides
    pub fn env_name(&self) -> &'static str {
        match self {
            Chain::Btc => "BTC",
            Chain::Eth => "ETH",
            Chain::Icp => "ICP",
            Chain::Icrc => "ICRC",
            Chain::CkBtc => "CKBTC",
            Chain::CkEth => "CKETH",
            Chain::Sol => "SOL",
            Chain::Kaspa => "KASPA",
        }
    }

    /// Whether reads for this chain can ever come back certified.
    ///
    /// Ledgers hosted on the Internet Computer answer through certified
    /// update calls. Ethereum, Solana and Kaspa are read from public RPC or
    /// indexer endpoints and their entries stay uncertified forever, which
    /// means they never reach the terminal `Certified` state in the store.
    pub fn produces_certified_reads(&self) -> bool {
        matches!(
            self,
            Chain::Btc | Chain::Icp | Chain::Icrc | Chain::CkBtc | Chain::CkEth
        )
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_prefix())
    }
}

/// Identity of a token; the only thing per-token maps are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A specific asset on a specific network. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    id: TokenId,
    symbol: String,
    chain: Chain,
    network: String,
    decimals: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ledger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    indexer: Option<String>,
}

impl Token {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        chain: Chain,
        network: impl Into<String>,
        decimals: u8,
    ) -> Self {
        Self {
            id: TokenId::new(id),
            symbol: symbol.into(),
            chain,
            network: network.into(),
            decimals,
            ledger: None,
            indexer: None,
        }
    }

    pub fn with_ledger(mut self, ledger: impl Into<String>) -> Self {
        self.ledger = Some(ledger.into());
        self
    }

    pub fn with_indexer(mut self, indexer: impl Into<String>) -> Self {
        self.indexer = Some(indexer.into());
        self
    }

    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn ledger(&self) -> Option<&str> {
        self.ledger.as_deref()
    }

    pub fn indexer(&self) -> Option<&str> {
        self.indexer.as_deref()
    }
}

// Tokens compare by identity only.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Token {}

/// Chain-specific account address.
///
/// Deserialization does not validate; call [`Address::validate`] with the
/// owning chain before using a value that came off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Parse and validate an address for the given chain
    pub fn parse(chain: Chain, raw: &str) -> Result<Self, SyncError> {
        let address = Self(raw.trim().to_string());
        address.validate(chain)?;
        Ok(address)
    }

    pub fn validate(&self, chain: Chain) -> Result<(), SyncError> {
        let invalid = |reason: String| SyncError::InvalidAddress { chain, reason };
        let raw = self.0.as_str();

        if raw.is_empty() {
            return Err(invalid("empty address".to_string()));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid(format!("'{}' contains whitespace", raw)));
        }

        match chain {
            Chain::Btc => {
                bitcoin::Address::from_str(raw).map_err(|e| invalid(e.to_string()))?;
            }
            Chain::Eth | Chain::CkEth => {
                let hex = raw
                    .strip_prefix("0x")
                    .ok_or_else(|| invalid(format!("'{}' is missing the 0x prefix", raw)))?;
                if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid(format!("'{}' is not a 20-byte hex address", raw)));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Validate a Bitcoin address against a specific network
    pub fn require_bitcoin_network(&self, network: bitcoin::Network) -> Result<(), SyncError> {
        bitcoin::Address::from_str(&self.0)
            .map_err(|e| e.to_string())
            .and_then(|a| a.require_network(network).map_err(|e| e.to_string()))
            .map(|_| ())
            .map_err(|reason| SyncError::InvalidAddress {
                chain: Chain::Btc,
                reason,
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Amount in the chain-native smallest unit (satoshi, wei, e8s, lamports, sompi).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(#[serde(with = "u128_string")] pub u128);

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Send,
    Receive,
    Mint,
    Burn,
    Approve,
    Deposit,
    Withdraw,
}

/// Confirmation progress; only ever moves forward within a polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Unconfirmed,
    Confirmed,
}

/// Transaction normalized across chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub status: TransactionStatus,
    #[serde(with = "u128_string")]
    pub value: u128,
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A value together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedData<T> {
    pub data: T,
    pub certified: bool,
}

impl<T> CertifiedData<T> {
    pub fn certified(data: T) -> Self {
        Self {
            data,
            certified: true,
        }
    }

    pub fn uncertified(data: T) -> Self {
        Self {
            data,
            certified: false,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CertifiedData<U> {
        CertifiedData {
            data: f(self.data),
            certified: self.certified,
        }
    }

    /// Whether writing `self` over `existing` would demote certified data
    pub fn would_regress(&self, existing: &CertifiedData<T>) -> bool {
        existing.certified && !self.certified
    }
}

/// Unit of work exchanged over a worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub token: Token,
    pub balance: CertifiedData<Balance>,
    pub new_transactions: CertifiedData<Vec<Transaction>>,
}

/// Amounts travel as decimal strings: wei balances overflow JSON-safe integers.
mod u128_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(D::Error::custom),
            Repr::Number(n) => Ok(u128::from(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_compare_by_identity() {
        let a = Token::new("BTC-mainnet", "BTC", Chain::Btc, "mainnet", 8);
        let b = Token::new("BTC-mainnet", "XBT", Chain::Btc, "mainnet", 8);
        let c = Token::new("BTC-testnet", "BTC", Chain::Btc, "testnet", 8);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_chain_tag_prefix_lookup() {
        for chain in Chain::ALL {
            assert_eq!(Chain::from_tag_prefix(chain.tag_prefix()), Some(chain));
        }
        assert_eq!(Chain::from_tag_prefix("Doge"), None);
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::parse(Chain::Btc, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").is_ok());
        assert!(Address::parse(Chain::Btc, "not-an-address").is_err());
        assert!(Address::parse(Chain::Eth, "0x52908400098527886E0F7030069857D2E4169EE7").is_ok());
        assert!(Address::parse(Chain::Eth, "52908400098527886E0F7030069857D2E4169EE7").is_err());
        assert!(Address::parse(Chain::Sol, "").is_err());
        assert!(Address::parse(Chain::Kaspa, "kaspa:qz0c8gf8lm54u4m3dw6p0z23vhfmryj8x7qxmq9k5v").is_ok());
    }

    #[test]
    fn test_bitcoin_network_check() {
        let mainnet = Address::parse(Chain::Btc, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").unwrap();
        assert!(mainnet.require_bitcoin_network(bitcoin::Network::Bitcoin).is_ok());
        assert!(mainnet.require_bitcoin_network(bitcoin::Network::Signet).is_err());
    }

    #[test]
    fn test_status_order_is_forward_only() {
        assert!(TransactionStatus::Pending < TransactionStatus::Unconfirmed);
        assert!(TransactionStatus::Unconfirmed < TransactionStatus::Confirmed);
    }

    #[test]
    fn test_large_amounts_travel_as_strings() {
        let wei = Balance(123_456_789_000_000_000_000_000);
        let json = serde_json::to_string(&wei).unwrap();
        assert_eq!(json, "\"123456789000000000000000\"");
        assert_eq!(serde_json::from_str::<Balance>(&json).unwrap(), wei);
        assert_eq!(serde_json::from_str::<Balance>("42").unwrap(), Balance(42));
    }

    #[test]
    fn test_regression_detection() {
        let certified = CertifiedData::certified(Balance(10));
        let uncertified = CertifiedData::uncertified(Balance(20));

        assert!(uncertified.would_regress(&certified));
        assert!(!certified.would_regress(&uncertified));
        assert!(!certified.would_regress(&certified));
    }
}
