//! Escrow datum and redeemer codec.
//!
//! The datum is constructor 0 with five fields, in this order:
//!
//! ```text
//! Constr 0 [ order_id: bytes, buyer: bytes(28), seller: bytes(28), amount: int, deadline: int ]
//! ```
//!
//! The redeemer is `Release = Constr 0 []` or `Refund = Constr 1 []`. Both
//! layouts are fixed by the deployed validator.

use serde::{Deserialize, Serialize};

use super::chain::KeyHash;
use super::error::{DecodeError, EscrowError};
use super::plutus::PlutusData;

/// Deadlines above this are read as milliseconds under [`Deadline::Auto`].
pub const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

const DATUM_CONSTRUCTOR: u64 = 0;

/// Positions of the datum fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumField {
    OrderId,
    Buyer,
    Seller,
    Amount,
    Deadline,
}

impl DatumField {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OrderId => "order_id",
            Self::Buyer => "buyer_key_hash",
            Self::Seller => "seller_key_hash",
            Self::Amount => "amount",
            Self::Deadline => "deadline",
        }
    }
}

/// A deadline together with the unit the caller supplied it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "lowercase")]
pub enum Deadline {
    Seconds(u64),
    Millis(u64),
    /// Unit unknown: values above [`MILLIS_THRESHOLD`] are taken as milliseconds.
    Auto(u64),
}

impl Deadline {
    pub fn as_secs(self) -> u64 {
        match self {
            Self::Seconds(s) => s,
            Self::Millis(ms) => ms / 1000,
            Self::Auto(v) if v > MILLIS_THRESHOLD => v / 1000,
            Self::Auto(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineUnit {
    Seconds,
    Millis,
    #[default]
    Auto,
}

impl DeadlineUnit {
    pub fn wrap(self, value: u64) -> Deadline {
        match self {
            Self::Seconds => Deadline::Seconds(value),
            Self::Millis => Deadline::Millis(value),
            Self::Auto => Deadline::Auto(value),
        }
    }
}

/// The escrow datum. Built once at lock time; afterwards only ever read back
/// from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscrowRecord {
    #[serde(serialize_with = "hex::serde::serialize")]
    pub order_id: Vec<u8>,
    pub buyer_key_hash: KeyHash,
    pub seller_key_hash: KeyHash,
    pub amount: u64,
    /// Unix seconds.
    pub deadline: u64,
}

impl EscrowRecord {
    pub fn new(
        order_id: &str,
        buyer_key_hash: KeyHash,
        seller_key_hash: KeyHash,
        amount: u64,
        deadline: Deadline,
    ) -> Result<Self, EscrowError> {
        if order_id.is_empty() {
            return Err(EscrowError::InvalidInput("order id must not be empty".into()));
        }
        if amount == 0 {
            return Err(EscrowError::InvalidInput("amount must be > 0".into()));
        }
        Ok(Self {
            order_id: order_id.as_bytes().to_vec(),
            buyer_key_hash,
            seller_key_hash,
            amount,
            deadline: deadline.as_secs(),
        })
    }

    /// The order identifier as text, lossily if the datum holds non-UTF-8 bytes.
    pub fn order_id_lossy(&self) -> String {
        String::from_utf8_lossy(&self.order_id).into_owned()
    }

    pub fn matches_order(&self, order_id: &str) -> bool {
        self.order_id == order_id.as_bytes()
    }

    pub fn to_data(&self) -> PlutusData {
        PlutusData::constr(
            DATUM_CONSTRUCTOR,
            vec![
                PlutusData::Bytes(self.order_id.clone()),
                PlutusData::Bytes(self.buyer_key_hash.0.to_vec()),
                PlutusData::Bytes(self.seller_key_hash.0.to_vec()),
                PlutusData::Integer(i128::from(self.amount)),
                PlutusData::Integer(i128::from(self.deadline)),
            ],
        )
    }

    pub fn to_cbor(&self) -> Vec<u8> {
        self.to_data().to_cbor()
    }

    pub fn from_data(value: &PlutusData) -> Result<Self, DecodeError> {
        Ok(Self {
            order_id: read_bytes(value, DatumField::OrderId)?.to_vec(),
            buyer_key_hash: read_key_hash(value, DatumField::Buyer)?,
            seller_key_hash: read_key_hash(value, DatumField::Seller)?,
            amount: read_u64(value, DatumField::Amount)?,
            deadline: read_u64(value, DatumField::Deadline)?,
        })
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_data(&PlutusData::from_cbor(bytes)?)
    }

    pub fn read_order_id(value: &PlutusData) -> Result<Vec<u8>, DecodeError> {
        read_bytes(value, DatumField::OrderId).map(<[u8]>::to_vec)
    }

    pub fn read_buyer(value: &PlutusData) -> Result<KeyHash, DecodeError> {
        read_key_hash(value, DatumField::Buyer)
    }

    pub fn read_deadline(value: &PlutusData) -> Result<u64, DecodeError> {
        read_u64(value, DatumField::Deadline)
    }
}

/// Fetch one field, rejecting values too short to contain it.
pub fn read_field(value: &PlutusData, field: DatumField) -> Result<&PlutusData, DecodeError> {
    let PlutusData::Constr {
        alternative,
        fields,
    } = value
    else {
        return Err(DecodeError::UnexpectedShape {
            expected: "constructor",
            found: value.kind(),
        });
    };
    if *alternative != DATUM_CONSTRUCTOR {
        return Err(DecodeError::UnexpectedConstructor {
            expected: DATUM_CONSTRUCTOR,
            found: *alternative,
        });
    }
    fields.get(field.index()).ok_or(DecodeError::MissingField {
        field: field.name(),
        needed: field.index() + 1,
        found: fields.len(),
    })
}

fn read_bytes(value: &PlutusData, field: DatumField) -> Result<&[u8], DecodeError> {
    read_field(value, field)?
        .as_bytes()
        .ok_or(DecodeError::FieldType {
            field: field.name(),
            expected: "a byte string",
        })
}

fn read_key_hash(value: &PlutusData, field: DatumField) -> Result<KeyHash, DecodeError> {
    KeyHash::from_slice(read_bytes(value, field)?).ok_or(DecodeError::FieldType {
        field: field.name(),
        expected: "a 28-byte key hash",
    })
}

fn read_u64(value: &PlutusData, field: DatumField) -> Result<u64, DecodeError> {
    let int = read_field(value, field)?
        .as_integer()
        .ok_or(DecodeError::FieldType {
            field: field.name(),
            expected: "an integer",
        })?;
    u64::try_from(int).map_err(|_| DecodeError::OutOfRange {
        field: field.name(),
    })
}

/// Spending branch selector passed to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowRedeemer {
    Release,
    Refund,
}

impl EscrowRedeemer {
    pub fn constructor(self) -> u64 {
        match self {
            Self::Release => 0,
            Self::Refund => 1,
        }
    }

    pub fn to_data(self) -> PlutusData {
        PlutusData::constr(self.constructor(), vec![])
    }

    pub fn to_cbor(self) -> Vec<u8> {
        self.to_data().to_cbor()
    }

    pub fn from_data(value: &PlutusData) -> Result<Self, DecodeError> {
        match value {
            PlutusData::Constr {
                alternative: 0,
                fields,
            } if fields.is_empty() => Ok(Self::Release),
            PlutusData::Constr {
                alternative: 1,
                fields,
            } if fields.is_empty() => Ok(Self::Refund),
            PlutusData::Constr { alternative, .. } => Err(DecodeError::UnexpectedConstructor {
                expected: 1,
                found: *alternative,
            }),
            other => Err(DecodeError::UnexpectedShape {
                expected: "constructor",
                found: other.kind(),
            }),
        }
    }
}
