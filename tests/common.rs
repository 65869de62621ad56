//! Common test utilities for wallet sync integration tests
//!
//! This module provides shared test infrastructure including:
//! - Logger setup
//! - Token/address fixtures
//! - A scripted chain adapter that replays queued responses

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use wallet_sync::{
    Address, AdapterError, Balance, CertifiedData, Chain, ChainAdapter, Token, Transaction,
    TransactionPage, TransactionStatus, TransactionType,
};

pub const BTC_ADDRESS: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
pub const BTC_ADDRESS_2: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
pub const SOL_ADDRESS: &str = "7EYnhQoR9YM3N7UoaKRoA44Uy8JeaZV3qyouov87awMs";

pub fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

pub fn btc_token() -> Token {
    Token::new("BTC-mainnet", "BTC", Chain::Btc, "mainnet", 8)
}

pub fn btc_address() -> Address {
    Address::parse(Chain::Btc, BTC_ADDRESS).expect("fixture address is valid")
}

pub fn second_btc_address() -> Address {
    Address::parse(Chain::Btc, BTC_ADDRESS_2).expect("fixture address is valid")
}

pub fn sol_token() -> Token {
    Token::new("SOL-mainnet", "SOL", Chain::Sol, "mainnet", 9)
}

pub fn sol_address() -> Address {
    Address::parse(Chain::Sol, SOL_ADDRESS).expect("fixture address is valid")
}

pub fn tx(id: &str, status: TransactionStatus) -> Transaction {
    Transaction {
        id: id.to_string(),
        kind: TransactionType::Receive,
        status,
        value: 10_000,
        from: vec!["sender".to_string()],
        to: vec![BTC_ADDRESS.to_string()],
        timestamp: None,
    }
}

pub fn page(transactions: Vec<Transaction>, cursor: Option<&str>) -> TransactionPage {
    TransactionPage {
        transactions,
        cursor: cursor.map(String::from),
    }
}

/// Drain everything currently buffered on a channel
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

type Scripted<T> = Result<CertifiedData<T>, AdapterError>;

/// Chain adapter replaying queued responses.
///
/// Each call consumes the next queued response; the last one is repeated
/// once the queue runs dry. With nothing queued, balances are zero and pages
/// are empty.
#[derive(Default)]
pub struct ScriptedAdapter {
    balances: Mutex<VecDeque<Scripted<Balance>>>,
    pages: Mutex<VecDeque<Scripted<TransactionPage>>>,
    cursors: Mutex<Vec<Option<String>>>,
    balance_calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_balance(&self, response: Scripted<Balance>) {
        self.balances.lock().unwrap().push_back(response);
    }

    pub fn push_page(&self, response: Scripted<TransactionPage>) {
        self.pages.lock().unwrap().push_back(response);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    /// Cursor passed on every `fetch_transactions` call, in order
    pub fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }
}

fn next<T: Clone>(queue: &Mutex<VecDeque<Scripted<T>>>, empty: T) -> Scripted<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue
            .front()
            .cloned()
            .unwrap_or_else(|| Ok(CertifiedData::uncertified(empty)))
    }
}

impl ChainAdapter for ScriptedAdapter {
    async fn fetch_balance(&self, _address: &Address) -> Scripted<Balance> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        next(&self.balances, Balance(0))
    }

    async fn fetch_transactions(
        &self,
        _address: &Address,
        cursor: Option<&str>,
    ) -> Scripted<TransactionPage> {
        self.cursors.lock().unwrap().push(cursor.map(String::from));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        next(&self.pages, TransactionPage::default())
    }
}
