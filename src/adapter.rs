//! Chain client adapter contract
//!
//! One implementation per chain family. Adapters are bound to an identity and
//! network when they are built, so the calls below only take the address.

use std::future::Future;
use std::sync::Arc;

use crate::error::AdapterError;
use crate::model::{Address, Balance, CertifiedData, Transaction};

/// One page of transactions plus the cursor to hand back on the next call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub cursor: Option<String>,
}

/// Read-only access to a remote ledger or indexer.
///
/// Calls must be idempotent and safe to repeat. A failure is always an
/// `Err`, never an empty success. The `certified` flag on a response is set
/// only when the round-trip included a certification step.
pub trait ChainAdapter: Send + Sync + 'static {
    fn fetch_balance(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<CertifiedData<Balance>, AdapterError>> + Send;

    fn fetch_transactions(
        &self,
        address: &Address,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<CertifiedData<TransactionPage>, AdapterError>> + Send;
}

impl<A: ChainAdapter> ChainAdapter for Arc<A> {
    fn fetch_balance(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<CertifiedData<Balance>, AdapterError>> + Send {
        (**self).fetch_balance(address)
    }

    fn fetch_transactions(
        &self,
        address: &Address,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<CertifiedData<TransactionPage>, AdapterError>> + Send {
        (**self).fetch_transactions(address, cursor)
    }
}
