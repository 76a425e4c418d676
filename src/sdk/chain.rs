//! Ledger-facing types and the chain indexer / clock seams.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use super::address::{Address, Credential};
use super::datum::EscrowRecord;
use super::error::{DecodeError, IndexerError};
use super::plutus::PlutusData;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    format!("expected {} bytes, got {}", $len, bytes.len())
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let text = String::deserialize(d)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hash_newtype!(
    /// Blake2b-224 hash of a verification key.
    KeyHash,
    28
);
hash_newtype!(
    /// Blake2b-224 hash of a language-tagged script.
    ScriptHash,
    28
);
hash_newtype!(TxId, 32);

/// An unspent output as reported by the chain indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub tx_id: TxId,
    pub output_index: u32,
    pub address: Address,
    pub amount: u64,
    /// CBOR of the inline datum, exactly as stored on chain.
    pub inline_datum: Option<Vec<u8>>,
}

/// An output sitting at the escrow script address, with its datum decoded
/// when the datum has the escrow shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockedOutput {
    pub tx_id: TxId,
    pub output_index: u32,
    pub address: Address,
    pub locked_amount: u64,
    pub datum: Option<EscrowRecord>,
    pub owning_script_hash: Option<ScriptHash>,
    #[serde(skip)]
    pub datum_cbor: Option<Vec<u8>>,
}

impl LockedOutput {
    pub fn from_utxo(utxo: Utxo) -> Self {
        let datum = utxo.inline_datum.as_deref().and_then(|cbor| {
            EscrowRecord::from_cbor(cbor)
                .inspect_err(|e| {
                    debug!(
                        tx_id = %utxo.tx_id,
                        output_index = utxo.output_index,
                        "datum is not an escrow record: {e}"
                    )
                })
                .ok()
        });
        let owning_script_hash = match utxo.address.payment_credential() {
            Ok(Credential::Script(hash)) => Some(ScriptHash(hash)),
            _ => None,
        };
        Self {
            tx_id: utxo.tx_id,
            output_index: utxo.output_index,
            address: utxo.address,
            locked_amount: utxo.amount,
            datum,
            owning_script_hash,
            datum_cbor: utxo.inline_datum,
        }
    }

    /// Decode the escrow record from the chain-observed datum bytes.
    pub fn decode_datum(&self) -> Result<EscrowRecord, DecodeError> {
        let cbor = self.datum_cbor.as_deref().ok_or(DecodeError::NoDatum)?;
        EscrowRecord::from_cbor(cbor)
    }

    /// Read only the deadline, which needs the full five-field shape.
    pub fn decode_deadline(&self) -> Result<u64, DecodeError> {
        let cbor = self.datum_cbor.as_deref().ok_or(DecodeError::NoDatum)?;
        EscrowRecord::read_deadline(&PlutusData::from_cbor(cbor)?)
    }

    pub fn same_outpoint(&self, tx_id: &TxId, output_index: u32) -> bool {
        self.tx_id == *tx_id && self.output_index == output_index
    }
}

/// Read access to the ledger, as offered by a chain indexer.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, IndexerError>;

    /// Block until the transaction is observed on chain. `Ok(false)` means the
    /// indexer gave up waiting.
    async fn await_confirmation(&self, tx_id: &TxId) -> Result<bool, IndexerError>;
}

/// Wall-clock source in unix seconds.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
