//! Settings loaded from the environment at startup.

use std::env;
use std::net::SocketAddr;

use crate::sdk::{DeadlineUnit, EscrowError, Network, OrchestratorSettings, PlutusVersion, ScriptIdentity};

#[derive(Debug, Clone)]
pub struct EscrowSettings {
    pub network: Network,
    pub script: ScriptIdentity,
    pub orchestrator: OrchestratorSettings,
    pub listen_addr: SocketAddr,
}

impl EscrowSettings {
    pub fn from_env() -> Result<Self, EscrowError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EscrowError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let network = match get("ESCROW_NETWORK").as_deref() {
            None | Some("testnet") | Some("preprod") | Some("preview") => Network::Testnet,
            Some("mainnet") => Network::Mainnet,
            Some(other) => return Err(invalid("ESCROW_NETWORK", other)),
        };
        let version = match get("ESCROW_PLUTUS_VERSION").as_deref() {
            Some("v1") => PlutusVersion::V1,
            None | Some("v2") => PlutusVersion::V2,
            Some("v3") => PlutusVersion::V3,
            Some(other) => return Err(invalid("ESCROW_PLUTUS_VERSION", other)),
        };
        let deadline_unit = match get("ESCROW_DEADLINE_UNIT").as_deref() {
            Some("seconds") => DeadlineUnit::Seconds,
            Some("millis") => DeadlineUnit::Millis,
            None | Some("auto") => DeadlineUnit::Auto,
            Some(other) => return Err(invalid("ESCROW_DEADLINE_UNIT", other)),
        };

        let script_hex = get("ESCROW_SCRIPT_CBOR")
            .ok_or_else(|| EscrowError::InvalidConfig("ESCROW_SCRIPT_CBOR is not set".into()))?;
        let script = ScriptIdentity::from_hex(&script_hex, version, network)?;

        let defaults = OrchestratorSettings::default();
        let orchestrator = OrchestratorSettings {
            deadline_unit,
            default_deadline_secs: parse_u64(
                &get,
                "ESCROW_DEFAULT_DEADLINE_SECS",
                defaults.default_deadline_secs,
            )?,
            refund_offset_secs: parse_u64(&get, "ESCROW_REFUND_OFFSET_SECS", defaults.refund_offset_secs)?,
            validity_window_secs: parse_u64(
                &get,
                "ESCROW_VALIDITY_WINDOW_SECS",
                defaults.validity_window_secs,
            )?,
        };
        if orchestrator.refund_offset_secs == 0 {
            return Err(invalid("ESCROW_REFUND_OFFSET_SECS", "0"));
        }
        if orchestrator.validity_window_secs == 0 {
            return Err(invalid("ESCROW_VALIDITY_WINDOW_SECS", "0"));
        }

        let listen_addr = match get("ESCROW_LISTEN_ADDR") {
            Some(v) => v.parse().map_err(|_| invalid("ESCROW_LISTEN_ADDR", &v))?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        Ok(Self {
            network,
            script,
            orchestrator,
            listen_addr,
        })
    }
}

fn invalid(key: &str, value: &str) -> EscrowError {
    EscrowError::InvalidConfig(format!("{key}={value:?} is not a valid value"))
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, EscrowError> {
    match get(key) {
        Some(v) => v.parse().map_err(|_| invalid(key, &v)),
        None => Ok(default),
    }
}
