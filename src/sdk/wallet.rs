//! Wallet collaborator seams and the session guard.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use super::address::{self, Address, Credential, Network};
use super::balance::decode_balance;
use super::chain::TxId;
use super::error::{EscrowError, WalletError};
use super::tx::TxDraft;

/// Entry point of an external wallet: asks the user to grant access.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    async fn enable(&self) -> Result<Arc<dyn SigningHandle>, WalletError>;
}

/// An enabled wallet. Addresses come back either hex-encoded or already in
/// bech32 form; balances come back as CBOR.
#[async_trait]
pub trait SigningHandle: Send + Sync {
    async fn used_addresses(&self) -> Result<Vec<String>, WalletError>;
    async fn unused_addresses(&self) -> Result<Vec<String>, WalletError>;
    async fn balance(&self) -> Result<Vec<u8>, WalletError>;
    async fn network_id(&self) -> Result<u8, WalletError>;
    /// Balance, sign and submit. May prompt the user and wait indefinitely.
    async fn sign_and_submit(&self, tx: &TxDraft) -> Result<TxId, WalletError>;
}

pub struct WalletSession {
    pub account_address: Address,
    pub network: Network,
    pub signing_handle: Arc<dyn SigningHandle>,
}

impl std::fmt::Debug for WalletSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSession")
            .field("account_address", &self.account_address)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// What to do when the connected account is not the one an operation expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPolicy {
    Require,
    /// Log and continue: some flows sign with a key other than the nominal one.
    Warn,
}

/// Holds at most one active session.
///
/// Connect and disconnect swap the whole session atomically. Operations take
/// a snapshot with [`WalletSessionGuard::current`] and keep using it even if a
/// reconnect happens meanwhile; the next operation sees the new session.
#[derive(Default)]
pub struct WalletSessionGuard {
    current: RwLock<Option<Arc<WalletSession>>>,
}

impl WalletSessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<WalletSession>> {
        self.current.read().map(|s| s.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    fn replace(&self, session: Option<Arc<WalletSession>>) {
        match self.current.write() {
            Ok(mut slot) => *slot = session,
            Err(p) => *p.into_inner() = session,
        }
    }

    pub async fn connect(
        &self,
        connector: &dyn WalletConnector,
        network: Network,
    ) -> Result<Arc<WalletSession>, EscrowError> {
        let handle = connector.enable().await.map_err(EscrowError::from_wallet)?;

        let wallet_network = handle
            .network_id()
            .await
            .map_err(EscrowError::from_wallet)?;
        if Network::from_id(wallet_network) != Some(network) {
            return Err(EscrowError::SessionUnavailable(format!(
                "wallet is on network id {wallet_network}, expected {network}"
            )));
        }

        let mut candidates = handle
            .used_addresses()
            .await
            .map_err(EscrowError::from_wallet)?;
        if candidates.is_empty() {
            candidates = handle
                .unused_addresses()
                .await
                .map_err(EscrowError::from_wallet)?;
        }
        let first = candidates
            .first()
            .ok_or_else(|| EscrowError::SessionUnavailable("wallet exposes no addresses".into()))?;
        let account_address = address::normalize(first, Some(network))?;

        let session = Arc::new(WalletSession {
            account_address,
            network,
            signing_handle: handle,
        });
        self.replace(Some(session.clone()));
        info!(account = %session.account_address, %network, "wallet session connected");
        Ok(session)
    }

    pub fn disconnect(&self) {
        if let Some(old) = self.current() {
            info!(account = %old.account_address, "wallet session disconnected");
        }
        self.replace(None);
    }

    /// Check that a session exists, is on the expected network and account, and
    /// can cover `required` lovelace.
    pub async fn validate(
        &self,
        expected_account: Option<&Address>,
        required: u64,
        policy: AccountPolicy,
    ) -> Result<Arc<WalletSession>, EscrowError> {
        let session = self
            .current()
            .ok_or_else(|| EscrowError::SessionUnavailable("no wallet connected".into()))?;

        let wallet_network = session
            .signing_handle
            .network_id()
            .await
            .map_err(EscrowError::from_wallet)?;
        if Network::from_id(wallet_network) != Some(session.network) {
            return Err(EscrowError::SessionUnavailable(format!(
                "wallet switched to network id {wallet_network}; reconnect"
            )));
        }

        if let Some(expected) = expected_account
            && !same_payment_credential(&session.account_address, expected)
        {
            match policy {
                AccountPolicy::Require => {
                    return Err(EscrowError::SessionUnavailable(format!(
                        "connected account {} is not {expected}",
                        session.account_address
                    )));
                }
                AccountPolicy::Warn => warn!(
                    connected = %session.account_address,
                    %expected,
                    "connected account differs from expected account"
                ),
            }
        }

        if required > 0 {
            let raw = session
                .signing_handle
                .balance()
                .await
                .map_err(EscrowError::from_wallet)?;
            match decode_balance(&raw) {
                0 => warn!("wallet balance unreadable; leaving coin selection to the wallet"),
                available if available < required => {
                    return Err(EscrowError::InsufficientFunds(format!(
                        "need {required} lovelace, wallet holds {available}"
                    )));
                }
                _ => {}
            }
        }

        Ok(session)
    }
}

/// Addresses can differ in their stake part while sharing the payment key.
fn same_payment_credential(a: &Address, b: &Address) -> bool {
    if a == b {
        return true;
    }
    match (a.payment_credential(), b.payment_credential()) {
        (Ok(Credential::Key(x)), Ok(Credential::Key(y))) => x == y,
        _ => false,
    }
}
