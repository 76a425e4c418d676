//! Unsigned transaction drafts handed to the wallet for balancing, signing and
//! submission. Fees, change and collateral are the wallet's concern; a draft
//! only pins what the escrow validator inspects.

use serde::Serialize;

use super::address::Address;
use super::chain::{KeyHash, LockedOutput, ScriptHash};
use super::datum::{EscrowRecord, EscrowRedeemer};
use super::error::EscrowError;
use super::script::ScriptIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Lock,
    Release,
    Refund,
}

/// Output to create. A script output carries the datum inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: u64,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub inline_datum: Option<Vec<u8>>,
}

/// A script-locked output to consume, with the attached validator and redeemer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptInput {
    pub output: LockedOutput,
    pub redeemer: EscrowRedeemer,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub redeemer_cbor: Vec<u8>,
    pub script_hash: ScriptHash,
    #[serde(skip)]
    pub script_bytes: Vec<u8>,
}

/// Validity interval in unix seconds; `None` leaves a side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ValidityInterval {
    pub valid_from: Option<u64>,
    pub valid_to: Option<u64>,
}

impl ValidityInterval {
    pub fn contains(&self, now: u64) -> bool {
        self.valid_from.is_none_or(|from| now >= from) && self.valid_to.is_none_or(|to| now < to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxDraft {
    pub kind: TxKind,
    pub script_inputs: Vec<ScriptInput>,
    pub outputs: Vec<TxOutput>,
    pub validity: ValidityInterval,
    pub required_signers: Vec<KeyHash>,
    /// Where the wallet sends change after balancing.
    pub change_address: Address,
}

fn serialize_opt_hex<S: serde::Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(bytes) => s.serialize_some(&hex::encode(bytes)),
        None => s.serialize_none(),
    }
}

/// Lock: a single script output carrying the amount and the inline datum.
pub fn build_lock_tx(
    script: &ScriptIdentity,
    record: &EscrowRecord,
    change_address: &Address,
) -> Result<TxDraft, EscrowError> {
    if record.amount == 0 {
        return Err(EscrowError::InvalidInput("amount must be > 0".into()));
    }
    Ok(TxDraft {
        kind: TxKind::Lock,
        script_inputs: vec![],
        outputs: vec![TxOutput {
            address: script.derived_address.clone(),
            amount: record.amount,
            inline_datum: Some(record.to_cbor()),
        }],
        validity: ValidityInterval::default(),
        required_signers: vec![],
        change_address: change_address.clone(),
    })
}

fn spend_input(
    output: &LockedOutput,
    script: &ScriptIdentity,
    redeemer: EscrowRedeemer,
) -> ScriptInput {
    ScriptInput {
        output: output.clone(),
        redeemer,
        redeemer_cbor: redeemer.to_cbor(),
        script_hash: script.script_hash,
        script_bytes: script.script_bytes.clone(),
    }
}

/// Release: spend the escrow output, full value to the seller, buyer must sign.
pub fn build_release_tx(
    output: &LockedOutput,
    record: &EscrowRecord,
    script: &ScriptIdentity,
    seller: &Address,
    change_address: &Address,
) -> TxDraft {
    TxDraft {
        kind: TxKind::Release,
        script_inputs: vec![spend_input(output, script, EscrowRedeemer::Release)],
        outputs: vec![TxOutput {
            address: seller.clone(),
            amount: output.locked_amount,
            inline_datum: None,
        }],
        validity: ValidityInterval::default(),
        required_signers: vec![record.buyer_key_hash],
        change_address: change_address.clone(),
    }
}

/// Validity interval for a refund.
///
/// The validator requires the whole interval to lie after the deadline, so the
/// lower bound is always `deadline + offset`, even when `now` is still before
/// the deadline; such a draft only becomes valid once the deadline has passed.
pub fn refund_validity(deadline: u64, now: u64, offset: u64, window: u64) -> ValidityInterval {
    let offset = offset.max(1);
    let valid_from = deadline.saturating_add(offset);
    ValidityInterval {
        valid_from: Some(valid_from),
        valid_to: Some(valid_from.max(now).saturating_add(window.max(1))),
    }
}

/// Refund: spend the escrow output, full value back to the buyer, after the deadline.
pub fn build_refund_tx(
    output: &LockedOutput,
    record: &EscrowRecord,
    script: &ScriptIdentity,
    buyer: &Address,
    change_address: &Address,
    validity: ValidityInterval,
) -> Result<TxDraft, EscrowError> {
    match validity.valid_from {
        Some(from) if from > record.deadline => {}
        _ => {
            return Err(EscrowError::InvalidInput(format!(
                "refund validity must start after deadline {}",
                record.deadline
            )));
        }
    }
    Ok(TxDraft {
        kind: TxKind::Refund,
        script_inputs: vec![spend_input(output, script, EscrowRedeemer::Refund)],
        outputs: vec![TxOutput {
            address: buyer.clone(),
            amount: output.locked_amount,
            inline_datum: None,
        }],
        validity,
        required_signers: vec![],
        change_address: change_address.clone(),
    })
}
