use thiserror::Error;

use super::chain::TxId;

/// Failure to read a datum (or any CBOR-encoded structured value).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed CBOR at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
    #[error("{0} trailing bytes after structured value")]
    TrailingBytes(usize),
    #[error("expected {expected}, found {found}")]
    UnexpectedShape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected constructor {expected}, found {found}")]
    UnexpectedConstructor { expected: u64, found: u64 },
    #[error("datum has {found} fields, reading `{field}` needs at least {needed}")]
    MissingField {
        field: &'static str,
        needed: usize,
        found: usize,
    },
    #[error("field `{field}` is not {expected}")]
    FieldType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` is out of range")]
    OutOfRange { field: &'static str },
    #[error("output carries no inline datum")]
    NoDatum,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid bech32 address: {0}")]
    Bech32(String),
    #[error("unrecognized address prefix `{0}`")]
    UnknownPrefix(String),
    #[error("invalid hex address: {0}")]
    Hex(String),
    #[error("address is {0} bytes, too short for a payment credential")]
    TooShort(usize),
    #[error("address header type {0:#x} carries no payment credential")]
    NoPaymentCredential(u8),
}

/// The output being spent was not created by the script now in use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error(
        "script mismatch for output {tx_id}#{output_index}: locked under {}, current script is {current_script_hash}",
        .output_script_hash.as_deref().unwrap_or("<no script credential>")
    )]
    ScriptMismatch {
        tx_id: TxId,
        output_index: u32,
        output_script_hash: Option<String>,
        current_script_hash: String,
    },
}

/// Failure reported by the wallet collaborator.
///
/// `code` follows the CIP-30 convention when the wallet provides one
/// (`2` = user declined a signature, `-3` = refused, `-4` = account changed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wallet error{}: {info}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct WalletError {
    pub code: Option<i32>,
    pub info: String,
}

impl WalletError {
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            code: None,
            info: info.into(),
        }
    }

    pub fn with_code(code: i32, info: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            info: info.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain indexer error: {0}")]
pub struct IndexerError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("wallet session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("signing rejected: {0}")]
    SigningRejected(String),
    #[error(transparent)]
    ScriptMismatch(#[from] ConsistencyError),
    #[error("datum unavailable: {0}")]
    DatumDecodeFailure(#[from] DecodeError),
    #[error("submission failed: {0}")]
    SubmissionFailure(String),
    #[error("transaction {tx_id} not confirmed: {reason}")]
    ConfirmationTimeout { tx_id: TxId, reason: String },
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error("output {tx_id}#{output_index} is no longer at the script address")]
    OutputAlreadySpent { tx_id: TxId, output_index: u32 },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<AddressError> for EscrowError {
    fn from(e: AddressError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

const DECLINE_MARKERS: [&str; 5] = ["declin", "reject", "cancel", "refused", "denied"];
const FUNDS_MARKERS: [&str; 3] = ["insufficient", "not enough", "balance too low"];

impl EscrowError {
    /// Map a wallet failure onto the user-facing taxonomy.
    ///
    /// CIP-30 codes win. The info text is only consulted for errors without a
    /// recognised code, since wallets are inconsistent about setting one.
    pub fn from_wallet(e: WalletError) -> Self {
        match e.code {
            Some(2) | Some(-3) => return Self::SigningRejected(e.info),
            Some(-4) => return Self::SessionUnavailable(e.info),
            _ => {}
        }
        let info = e.info.to_lowercase();
        if FUNDS_MARKERS.iter().any(|m| info.contains(m)) {
            return Self::InsufficientFunds(e.info);
        }
        if info.contains("account changed") {
            return Self::SessionUnavailable(e.info);
        }
        if DECLINE_MARKERS.iter().any(|m| info.contains(m)) {
            return Self::SigningRejected(e.info);
        }
        Self::SubmissionFailure(e.to_string())
    }

    /// Whether the whole build-sign-submit sequence may be retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionUnavailable(_)
                | Self::SigningRejected(_)
                | Self::SubmissionFailure(_)
                | Self::ConfirmationTimeout { .. }
                | Self::Indexer(_)
        )
    }
}
