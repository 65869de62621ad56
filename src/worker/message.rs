//! Worker message protocol
//!
//! Commands flowing host → worker are tagged `<verb><Chain>WalletTimer`, with
//! verbs `start`, `stop` and `trigger`. Events flowing worker → host are tagged
//! `sync<Chain>Wallet`, `sync<Chain>WalletError` and `sync<Chain>WalletStatus`.
//! Inside the crate both directions are plain enums; the string tags only exist
//! on the JSON envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdapterError, SyncError};
use crate::model::{Address, Chain, SyncResult, Token};
use crate::scheduler::{SyncStatus, SyncTarget};

const TIMER_SUFFIX: &str = "WalletTimer";
const EVENT_PREFIX: &str = "sync";

/// Wire shape: `{ "msg": <tag>, "data": <payload> }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerVerb {
    Start,
    Stop,
    Trigger,
}

impl TimerVerb {
    pub const ALL: [TimerVerb; 3] = [TimerVerb::Start, TimerVerb::Stop, TimerVerb::Trigger];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerVerb::Start => "start",
            TimerVerb::Stop => "stop",
            TimerVerb::Trigger => "trigger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimerData {
    pub address: Address,
    pub token: Token,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTimerData {
    pub address: Address,
    pub token: Token,
}

impl From<&StartTimerData> for TriggerTimerData {
    fn from(data: &StartTimerData) -> Self {
        Self {
            address: data.address.clone(),
            token: data.token.clone(),
        }
    }
}

impl From<TriggerTimerData> for SyncTarget {
    fn from(data: TriggerTimerData) -> Self {
        SyncTarget::new(data.token, data.address)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerCommand {
    Start(StartTimerData),
    Stop,
    Trigger(TriggerTimerData),
}

impl TimerCommand {
    pub fn verb(&self) -> TimerVerb {
        match self {
            TimerCommand::Start(_) => TimerVerb::Start,
            TimerCommand::Stop => TimerVerb::Stop,
            TimerCommand::Trigger(_) => TimerVerb::Trigger,
        }
    }
}

/// A command addressed to one chain's worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMessage {
    pub chain: Chain,
    pub command: TimerCommand,
}

impl WorkerMessage {
    pub fn start(chain: Chain, data: StartTimerData) -> Self {
        Self {
            chain,
            command: TimerCommand::Start(data),
        }
    }

    pub fn stop(chain: Chain) -> Self {
        Self {
            chain,
            command: TimerCommand::Stop,
        }
    }

    pub fn trigger(chain: Chain, data: TriggerTimerData) -> Self {
        Self {
            chain,
            command: TimerCommand::Trigger(data),
        }
    }

    pub fn tag(&self) -> String {
        timer_tag(self.command.verb(), self.chain)
    }

    pub fn to_envelope(&self) -> Result<Envelope, SyncError> {
        let data = match &self.command {
            TimerCommand::Start(data) => to_value(data)?,
            TimerCommand::Stop => Value::Null,
            TimerCommand::Trigger(data) => to_value(data)?,
        };
        Ok(Envelope {
            msg: self.tag(),
            data,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, SyncError> {
        let (verb, chain) = parse_timer_tag(&envelope.msg).ok_or_else(|| {
            SyncError::InvalidMessage(format!("unknown message tag '{}'", envelope.msg))
        })?;

        let command = match verb {
            TimerVerb::Start => TimerCommand::Start(from_value(&envelope.msg, envelope.data)?),
            TimerVerb::Stop => TimerCommand::Stop,
            TimerVerb::Trigger => TimerCommand::Trigger(from_value(&envelope.msg, envelope.data)?),
        };
        Ok(Self { chain, command })
    }
}

pub fn timer_tag(verb: TimerVerb, chain: Chain) -> String {
    format!("{}{}{}", verb.as_str(), chain.tag_prefix(), TIMER_SUFFIX)
}

/// Split `<verb><Chain>WalletTimer` into its parts
pub fn parse_timer_tag(tag: &str) -> Option<(TimerVerb, Chain)> {
    let body = tag.strip_suffix(TIMER_SUFFIX)?;
    TimerVerb::ALL.into_iter().find_map(|verb| {
        body.strip_prefix(verb.as_str())
            .and_then(Chain::from_tag_prefix)
            .map(|chain| (verb, chain))
    })
}

/// Why a worker could not do what it was asked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WorkerFailure {
    #[error("{0}")]
    Adapter(AdapterError),

    #[error("Rejected command: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StatusPayload {
    state: SyncStatus,
}

/// Something a worker reports back to its host
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Synced { chain: Chain, result: SyncResult },
    Failed { chain: Chain, error: WorkerFailure },
    Status { chain: Chain, status: SyncStatus },
}

impl WorkerEvent {
    pub fn chain(&self) -> Chain {
        match self {
            WorkerEvent::Synced { chain, .. }
            | WorkerEvent::Failed { chain, .. }
            | WorkerEvent::Status { chain, .. } => *chain,
        }
    }

    pub fn tag(&self) -> String {
        let suffix = match self {
            WorkerEvent::Synced { .. } => "Wallet",
            WorkerEvent::Failed { .. } => "WalletError",
            WorkerEvent::Status { .. } => "WalletStatus",
        };
        format!("{}{}{}", EVENT_PREFIX, self.chain().tag_prefix(), suffix)
    }

    pub fn to_envelope(&self) -> Result<Envelope, SyncError> {
        let data = match self {
            WorkerEvent::Synced { result, .. } => to_value(result)?,
            WorkerEvent::Failed { error, .. } => to_value(error)?,
            WorkerEvent::Status { status, .. } => to_value(&StatusPayload { state: *status })?,
        };
        Ok(Envelope {
            msg: self.tag(),
            data,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, SyncError> {
        let unknown =
            || SyncError::InvalidMessage(format!("unknown event tag '{}'", envelope.msg));
        let body = envelope.msg.strip_prefix(EVENT_PREFIX).ok_or_else(unknown)?;

        // Longest suffix first: every tag also ends in "Wallet".
        let parse_chain = |suffix: &str| body.strip_suffix(suffix).and_then(Chain::from_tag_prefix);

        if let Some(chain) = parse_chain("WalletError") {
            let error = from_value(&envelope.msg, envelope.data)?;
            Ok(WorkerEvent::Failed { chain, error })
        } else if let Some(chain) = parse_chain("WalletStatus") {
            let payload: StatusPayload = from_value(&envelope.msg, envelope.data)?;
            Ok(WorkerEvent::Status {
                chain,
                status: payload.state,
            })
        } else if let Some(chain) = parse_chain("Wallet") {
            let result = from_value(&envelope.msg, envelope.data)?;
            Ok(WorkerEvent::Synced { chain, result })
        } else {
            Err(unknown())
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::InvalidMessage(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(tag: &str, data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data)
        .map_err(|e| SyncError::InvalidMessage(format!("bad payload for '{}': {}", tag, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Balance, CertifiedData};
    use serde_json::json;

    fn btc_token() -> Token {
        Token::new("BTC-mainnet", "BTC", Chain::Btc, "mainnet", 8)
    }

    #[test]
    fn test_tags_cover_every_verb_and_chain() {
        for chain in Chain::ALL {
            for verb in TimerVerb::ALL {
                let tag = timer_tag(verb, chain);
                assert_eq!(parse_timer_tag(&tag), Some((verb, chain)), "tag {}", tag);
            }
        }
        assert_eq!(timer_tag(TimerVerb::Start, Chain::Btc), "startBtcWalletTimer");
        assert_eq!(timer_tag(TimerVerb::Trigger, Chain::CkEth), "triggerCkEthWalletTimer");
    }

    #[test]
    fn test_unknown_tags_are_rejected() {
        assert_eq!(parse_timer_tag("pauseBtcWalletTimer"), None);
        assert_eq!(parse_timer_tag("startDogeWalletTimer"), None);
        assert_eq!(parse_timer_tag("startBtcWallet"), None);

        let err = WorkerMessage::from_envelope(Envelope {
            msg: "startDogeWalletTimer".to_string(),
            data: Value::Null,
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }

    #[test]
    fn test_start_envelope_wire_shape() {
        let message = WorkerMessage::start(
            Chain::Btc,
            StartTimerData {
                address: Address::parse(Chain::Btc, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq")
                    .unwrap(),
                token: btc_token(),
                polling_interval_ms: Some(30_000),
            },
        );

        let envelope = message.to_envelope().unwrap();
        assert_eq!(envelope.msg, "startBtcWalletTimer");
        assert_eq!(envelope.data["pollingIntervalMs"], json!(30_000));
        assert_eq!(envelope.data["token"]["id"], json!("BTC-mainnet"));

        let parsed = WorkerMessage::from_envelope(envelope).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_stop_has_no_payload_and_trigger_ignores_interval() {
        let stop = WorkerMessage::stop(Chain::Sol).to_envelope().unwrap();
        assert_eq!(stop.to_json().unwrap(), r#"{"msg":"stopSolWalletTimer"}"#);

        let trigger = Envelope::from_json(
            r#"{"msg":"triggerBtcWalletTimer","data":{"address":"bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq","token":{"id":"BTC-mainnet","symbol":"BTC","chain":"Btc","network":"mainnet","decimals":8},"pollingIntervalMs":5}}"#,
        )
        .unwrap();
        let parsed = WorkerMessage::from_envelope(trigger).unwrap();
        assert!(matches!(parsed.command, TimerCommand::Trigger(_)));
        assert_eq!(parsed.chain, Chain::Btc);
    }

    #[test]
    fn test_event_tags_parse_back() {
        let events = vec![
            WorkerEvent::Synced {
                chain: Chain::CkBtc,
                result: SyncResult {
                    token: btc_token(),
                    balance: CertifiedData::certified(Balance(100_000_000)),
                    new_transactions: CertifiedData::certified(Vec::new()),
                },
            },
            WorkerEvent::Failed {
                chain: Chain::Eth,
                error: WorkerFailure::Adapter(AdapterError::Http {
                    status: 429,
                    body: "slow down".to_string(),
                }),
            },
            WorkerEvent::Status {
                chain: Chain::Kaspa,
                status: SyncStatus::InProgress,
            },
        ];

        let tags: Vec<String> = events.iter().map(WorkerEvent::tag).collect();
        assert_eq!(
            tags,
            vec!["syncCkBtcWallet", "syncEthWalletError", "syncKaspaWalletStatus"]
        );

        for event in events {
            let envelope = event.to_envelope().unwrap();
            assert_eq!(WorkerEvent::from_envelope(envelope).unwrap(), event);
        }
    }
}
