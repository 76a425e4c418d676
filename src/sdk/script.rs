use blake2::digest::consts::U28;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use super::address::{self, Address, Credential, Network};
use super::chain::{LockedOutput, ScriptHash};
use super::error::{ConsistencyError, EscrowError};

type Blake2b224 = Blake2b<U28>;

/// Plutus language version; its tag prefixes the script bytes when hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlutusVersion {
    V1,
    #[default]
    V2,
    V3,
}

impl PlutusVersion {
    pub fn tag(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }
}

/// blake2b-224 over `language tag || script bytes`.
pub fn script_hash(version: PlutusVersion, script_bytes: &[u8]) -> ScriptHash {
    let mut hasher = Blake2b224::new();
    hasher.update([version.tag()]);
    hasher.update(script_bytes);
    ScriptHash(hasher.finalize().into())
}

/// The validator currently configured for new spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIdentity {
    pub version: PlutusVersion,
    /// Serialized script, exactly as the ledger hashes it.
    pub script_bytes: Vec<u8>,
    pub script_hash: ScriptHash,
    pub derived_address: Address,
}

impl ScriptIdentity {
    pub fn new(script_bytes: Vec<u8>, version: PlutusVersion, network: Network) -> Self {
        let script_hash = script_hash(version, &script_bytes);
        let derived_address = address::script_address(&script_hash.0, network);
        Self {
            version,
            script_bytes,
            script_hash,
            derived_address,
        }
    }

    pub fn from_hex(
        script_hex: &str,
        version: PlutusVersion,
        network: Network,
    ) -> Result<Self, EscrowError> {
        let bytes = hex::decode(script_hex.trim())
            .map_err(|e| EscrowError::InvalidConfig(format!("script is not valid hex: {e}")))?;
        if bytes.is_empty() {
            return Err(EscrowError::InvalidConfig("script is empty".into()));
        }
        Ok(Self::new(bytes, version, network))
    }

    pub fn network(&self) -> Network {
        self.derived_address.network()
    }

    /// Recompute the address from the script bytes rather than trusting the
    /// cached `derived_address`.
    pub fn recompute_address(&self) -> Address {
        let hash = script_hash(self.version, &self.script_bytes);
        address::script_address(&hash.0, self.network())
    }
}

/// Refuse to spend an output that was locked under a different script version.
pub fn verify(output: &LockedOutput, current: &ScriptIdentity) -> Result<(), ConsistencyError> {
    let expected = current.recompute_address();
    if expected.to_bytes() == output.address.to_bytes() {
        return Ok(());
    }
    let output_script_hash = match output.address.payment_credential() {
        Ok(Credential::Script(hash)) => Some(hex::encode(hash)),
        _ => None,
    };
    Err(ConsistencyError::ScriptMismatch {
        tx_id: output.tx_id,
        output_index: output.output_index,
        output_script_hash,
        current_script_hash: current.script_hash.to_string(),
    })
}
