//! Bitcoin UTXO selection
//!
//! Largest-first greedy selection under a linear fee model. Predictable and
//! low on input count, though not fee-optimal in general.
//!
//! Running short is an ordinary outcome: it is reported in
//! [`UtxoSelection::error`] so send flows can branch on it. Only a request
//! that makes no sense (zero amount) is an `Err`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SelectionError;

/// Base transaction overhead in vbytes: version, locktime, counts, plus
/// recipient and change outputs (10 + 2 * 34).
pub const DEFAULT_BASE_OVERHEAD_VBYTES: u64 = 78;

/// Approximate vbytes added by one P2WPKH input
pub const DEFAULT_PER_INPUT_VBYTES: u64 = 68;

/// Change below this is not worth an output and goes to the miner instead.
pub const DEFAULT_DUST_THRESHOLD_SATS: u64 = 546;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub confirmations: u32,
}

/// `fee(n) = fee_rate * (base_overhead_vbytes + per_input_vbytes * n)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeModel {
    pub base_overhead_vbytes: u64,
    pub per_input_vbytes: u64,
    pub dust_threshold: u64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            base_overhead_vbytes: DEFAULT_BASE_OVERHEAD_VBYTES,
            per_input_vbytes: DEFAULT_PER_INPUT_VBYTES,
            dust_threshold: DEFAULT_DUST_THRESHOLD_SATS,
        }
    }
}

impl FeeModel {
    pub fn estimate_vbytes(&self, inputs: usize) -> u64 {
        self.per_input_vbytes
            .saturating_mul(inputs as u64)
            .saturating_add(self.base_overhead_vbytes)
    }

    pub fn fee(&self, fee_rate: u64, inputs: usize) -> u64 {
        fee_rate.saturating_mul(self.estimate_vbytes(inputs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Spend target in sats, fee excluded
    pub amount: u64,
    /// sat/vB
    pub fee_rate: u64,
    /// 0 and 1 are equivalent: the indexer does not tell mempool apart.
    pub min_confirmations: u32,
    /// Transactions whose outputs are already committed elsewhere
    pub exclude_txids: HashSet<String>,
}

impl SelectionRequest {
    pub fn new(amount: u64, fee_rate: u64) -> Self {
        Self {
            amount,
            fee_rate,
            min_confirmations: 1,
            exclude_txids: HashSet::new(),
        }
    }

    pub fn with_min_confirmations(mut self, min_confirmations: u32) -> Self {
        self.min_confirmations = min_confirmations;
        self
    }

    pub fn exclude(mut self, txid: impl Into<String>) -> Self {
        self.exclude_txids.insert(txid.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionFailure {
    /// The eligible UTXOs cannot cover the amount itself
    InsufficientBalance,
    /// The amount is covered but the amount plus fee is not
    InsufficientBalanceForFee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSelection {
    pub selected_utxos: Vec<Utxo>,
    pub total_input_value: u64,
    pub change_amount: u64,
    pub fee_satoshis: u64,
    /// Sub-dust change that was added to `fee_satoshis`
    pub folded_dust: u64,
    pub error: Option<SelectionFailure>,
}

impl UtxoSelection {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Select inputs covering `request.amount` plus fee.
///
/// Deterministic: equal values are ordered by txid, then vout. On failure
/// nothing is selected; `total_input_value` is the eligible total and
/// `fee_satoshis` the fee for spending all of it.
pub fn select_utxos(
    utxos: &[Utxo],
    request: &SelectionRequest,
    model: &FeeModel,
) -> Result<UtxoSelection, SelectionError> {
    if request.amount == 0 {
        return Err(SelectionError::ZeroAmount);
    }

    let min_confirmations = request.min_confirmations.max(1);
    let mut eligible: Vec<&Utxo> = utxos
        .iter()
        .filter(|u| u.confirmations >= min_confirmations)
        .filter(|u| !request.exclude_txids.contains(&u.txid))
        .collect();
    eligible.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });

    // Summed wide so no combination of values, amount and fee can overflow.
    let mut total: u128 = 0;
    for (index, utxo) in eligible.iter().enumerate() {
        total += u128::from(utxo.value);
        let inputs = index + 1;
        let fee = model.fee(request.fee_rate, inputs);
        let needed = u128::from(request.amount) + u128::from(fee);

        if let Some(change) = total.checked_sub(needed) {
            let (change_amount, folded_dust) = if change < u128::from(model.dust_threshold) {
                (0, to_sats(change))
            } else {
                (to_sats(change), 0)
            };
            let fee_satoshis = fee.saturating_add(folded_dust);

            log::debug!(
                "Selected {} of {} UTXO(s): input {} sats, fee {} sats, change {} sats",
                inputs,
                eligible.len(),
                total,
                fee_satoshis,
                change_amount
            );

            return Ok(UtxoSelection {
                selected_utxos: eligible[..inputs].iter().map(|u| (*u).clone()).collect(),
                total_input_value: to_sats(total),
                change_amount,
                fee_satoshis,
                folded_dust,
                error: None,
            });
        }
    }

    let error = if total < u128::from(request.amount) {
        SelectionFailure::InsufficientBalance
    } else {
        SelectionFailure::InsufficientBalanceForFee
    };
    log::debug!(
        "UTXO selection failed ({:?}): {} sats eligible across {} UTXO(s), {} sats requested",
        error,
        total,
        eligible.len(),
        request.amount
    );

    Ok(UtxoSelection {
        selected_utxos: Vec::new(),
        total_input_value: to_sats(total),
        change_amount: 0,
        fee_satoshis: model.fee(request.fee_rate, eligible.len()),
        folded_dust: 0,
        error: Some(error),
    })
}

fn to_sats(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
