//! Bech32 address codec with network-prefix disambiguation.
//!
//! Raw addresses are the ledger's byte form: a one-byte header (address type in
//! the high nibble, network id in the low nibble) followed by 28-byte
//! credentials. The text form is bech32 under `addr_test` or `addr`.

use std::fmt;

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Checksum, Hrp};
use serde::{Deserialize, Serialize};

use super::error::AddressError;

pub const TESTNET_PREFIX: &str = "addr_test";
pub const MAINNET_PREFIX: &str = "addr";

/// Width of key hashes and script hashes.
pub const CREDENTIAL_LEN: usize = 28;

/// BIP-173 checksum without the 90-character cap: base addresses with a
/// stake part encode to over 100 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressChecksum {}

impl Checksum for AddressChecksum {
    type MidstateRepr = u32;
    const CODE_LENGTH: usize = 1023;
    const CHECKSUM_LENGTH: usize = 6;
    const GENERATOR_SH: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
    const TARGET_RESIDUE: u32 = 1;
}

/// Header type of an enterprise address whose payment part is a script.
const ENTERPRISE_SCRIPT_HEADER: u8 = 0b0111_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    /// Network id as reported by wallets and stored in address headers.
    pub fn id(self) -> u8 {
        match self {
            Self::Testnet => 0,
            Self::Mainnet => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Testnet),
            1 => Some(Self::Mainnet),
            _ => None,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Testnet => TESTNET_PREFIX,
            Self::Mainnet => MAINNET_PREFIX,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            TESTNET_PREFIX => Some(Self::Testnet),
            MAINNET_PREFIX => Some(Self::Mainnet),
            _ => None,
        }
    }

    /// Guess the network from the leading raw byte.
    ///
    /// `0x00` and `0x01` are always read as testnet; other headers use their
    /// network nibble. Empty input is treated as testnet.
    pub fn infer(raw: &[u8]) -> Self {
        match raw.first() {
            None | Some(0x00) | Some(0x01) => Self::Testnet,
            Some(header) if header & 0x0f == 0 => Self::Testnet,
            Some(_) => Self::Mainnet,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Testnet => write!(f, "testnet"),
            Self::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// A checksummed, human-readable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn network(&self) -> Network {
        // Constructors only admit the two known prefixes.
        if self.0.starts_with(TESTNET_PREFIX) {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        decode(self).expect("addresses are validated on construction")
    }

    pub fn payment_credential(&self) -> Result<Credential, AddressError> {
        payment_credential(&self.to_bytes())
    }

    /// The payment key hash, if this address is paid to a key.
    pub fn key_hash(&self) -> Option<[u8; CREDENTIAL_LEN]> {
        match self.payment_credential().ok()? {
            Credential::Key(hash) => Some(hash),
            Credential::Script(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_bech32(s).map(|_| Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

/// Payment part of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Key([u8; CREDENTIAL_LEN]),
    Script([u8; CREDENTIAL_LEN]),
}

impl Credential {
    pub fn hash(&self) -> &[u8; CREDENTIAL_LEN] {
        match self {
            Self::Key(h) | Self::Script(h) => h,
        }
    }
}

/// Encode raw address bytes. `network` overrides inference from the header.
pub fn encode(raw: &[u8], network: Option<Network>) -> Result<Address, AddressError> {
    let network = network.unwrap_or_else(|| Network::infer(raw));
    let hrp = Hrp::parse(network.prefix()).map_err(|e| AddressError::Bech32(e.to_string()))?;
    let text =
        bech32::encode::<AddressChecksum>(hrp, raw).map_err(|e| AddressError::Bech32(e.to_string()))?;
    Ok(Address(text))
}

/// Exact inverse of [`encode`].
pub fn decode(address: &Address) -> Result<Vec<u8>, AddressError> {
    parse_bech32(address.as_str()).map(|(_, bytes)| bytes)
}

/// Accept either hex-encoded raw bytes or an already-encoded address.
///
/// Text that carries a recognized prefix is validated and passed through
/// unchanged instead of being encoded a second time.
pub fn normalize(text: &str, network: Option<Network>) -> Result<Address, AddressError> {
    let text = text.trim();
    if has_known_prefix(text) {
        return text.parse();
    }
    let raw = hex::decode(text).map_err(|e| AddressError::Hex(e.to_string()))?;
    encode(&raw, network)
}

fn has_known_prefix(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    [TESTNET_PREFIX, MAINNET_PREFIX]
        .iter()
        .any(|p| lower.strip_prefix(p).is_some_and(|rest| rest.starts_with('1')))
}

fn parse_bech32(text: &str) -> Result<(Network, Vec<u8>), AddressError> {
    let checked =
        CheckedHrpstring::new::<AddressChecksum>(text).map_err(|e| AddressError::Bech32(e.to_string()))?;
    let prefix = checked.hrp().to_lowercase();
    let network =
        Network::from_prefix(&prefix).ok_or_else(|| AddressError::UnknownPrefix(prefix.clone()))?;
    Ok((network, checked.byte_iter().collect()))
}

/// Extract the payment credential from raw address bytes.
pub fn payment_credential(raw: &[u8]) -> Result<Credential, AddressError> {
    let header = *raw.first().ok_or(AddressError::TooShort(0))?;
    let kind = header >> 4;
    // Types 0-7 carry a payment credential; odd types pay to a script.
    if kind > 7 {
        return Err(AddressError::NoPaymentCredential(kind));
    }
    let hash: [u8; CREDENTIAL_LEN] = raw
        .get(1..1 + CREDENTIAL_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(AddressError::TooShort(raw.len()))?;
    Ok(if kind & 1 == 1 {
        Credential::Script(hash)
    } else {
        Credential::Key(hash)
    })
}

/// Enterprise address paying to a script hash.
pub fn script_address(script_hash: &[u8; CREDENTIAL_LEN], network: Network) -> Address {
    let mut raw = Vec::with_capacity(1 + CREDENTIAL_LEN);
    raw.push(ENTERPRISE_SCRIPT_HEADER | network.id());
    raw.extend_from_slice(script_hash);
    encode(&raw, Some(network)).expect("29 bytes under a known prefix always encode")
}

/// Enterprise address paying to a key hash.
pub fn key_address(key_hash: &[u8; CREDENTIAL_LEN], network: Network) -> Address {
    let mut raw = Vec::with_capacity(1 + CREDENTIAL_LEN);
    raw.push(0b0110_0000 | network.id());
    raw.extend_from_slice(key_hash);
    encode(&raw, Some(network)).expect("29 bytes under a known prefix always encode")
}
