//! In-process ledger simulator implementing the wallet, indexer and clock seams.
//!
//! Submissions are applied immediately and count as confirmed. The simulator
//! enforces what the escrow flow depends on: double-spend protection, validity
//! intervals, the attached validator matching the spent output, required
//! signers, and the escrow validator's release / refund rules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use tracing::debug;

use super::address::{self, Address, Credential, Network};
use super::cbor::{self, MAJOR_UNSIGNED};
use super::chain::{ChainIndexer, Clock, KeyHash, ScriptHash, TxId, Utxo};
use super::datum::{EscrowRecord, EscrowRedeemer};
use super::error::{IndexerError, WalletError};
use super::script::{PlutusVersion, script_hash};
use super::tx::{TxDraft, TxKind};
use super::wallet::{SigningHandle, WalletConnector};

type Blake2b256 = Blake2b<U32>;

/// Flat fee charged to the signing wallet per transaction.
pub const DEFAULT_FEE: u64 = 200_000;

/// A transaction accepted by the simulator.
#[derive(Debug, Clone)]
pub struct Submission {
    pub tx_id: TxId,
    pub signer: KeyHash,
    pub draft: TxDraft,
    pub submitted_at: u64,
}

struct WalletState {
    key_hash: KeyHash,
    address: Address,
    decline_next: bool,
}

struct LedgerState {
    network: Network,
    now: u64,
    tx_counter: u64,
    utxos: BTreeMap<(TxId, u32), Utxo>,
    wallets: HashMap<String, WalletState>,
    confirmed: HashSet<TxId>,
    stall_confirmations: bool,
    submissions: Vec<Submission>,
}

/// Cheap to clone; clones share one ledger.
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new(network: Network, now: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                network,
                now,
                tx_counter: 0,
                utxos: BTreeMap::new(),
                wallets: HashMap::new(),
                confirmed: HashSet::new(),
                stall_confirmations: false,
                submissions: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn network(&self) -> Network {
        self.state().network
    }

    /// Register a wallet funded with one output of `funds` lovelace.
    pub fn add_wallet(&self, label: &str, key_hash: KeyHash, funds: u64) -> Address {
        let mut st = self.state();
        let address = address::key_address(&key_hash.0, st.network);
        st.wallets.insert(
            label.to_string(),
            WalletState {
                key_hash,
                address: address.clone(),
                decline_next: false,
            },
        );
        if funds > 0 {
            let tx_id = st.next_tx_id();
            st.insert(Utxo {
                tx_id,
                output_index: 0,
                address: address.clone(),
                amount: funds,
                inline_datum: None,
            });
            st.confirmed.insert(tx_id);
        }
        address
    }

    /// Connector for a registered wallet.
    pub fn connector(&self, label: &str) -> MemoryWallet {
        MemoryWallet {
            ledger: self.clone(),
            label: label.to_string(),
        }
    }

    pub fn set_time(&self, now: u64) {
        self.state().now = now;
    }

    /// Put an arbitrary output on the ledger, e.g. one left by an older script.
    pub fn insert_utxo(&self, address: Address, amount: u64, inline_datum: Option<Vec<u8>>) -> Utxo {
        let mut st = self.state();
        let tx_id = st.next_tx_id();
        let utxo = Utxo {
            tx_id,
            output_index: 0,
            address,
            amount,
            inline_datum,
        };
        st.insert(utxo.clone());
        st.confirmed.insert(tx_id);
        utxo
    }

    /// The next signing prompt of this wallet is declined by the user.
    pub fn decline_next_signature(&self, label: &str) {
        if let Some(w) = self.state().wallets.get_mut(label) {
            w.decline_next = true;
        }
    }

    /// Make `await_confirmation` give up instead of reporting success.
    pub fn stall_confirmations(&self, stall: bool) {
        self.state().stall_confirmations = stall;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.state().balance_of(address)
    }
}

impl LedgerState {
    fn next_tx_id(&mut self) -> TxId {
        self.tx_counter += 1;
        let digest = Blake2b256::digest(self.tx_counter.to_be_bytes());
        TxId(digest.into())
    }

    fn insert(&mut self, utxo: Utxo) {
        self.utxos.insert((utxo.tx_id, utxo.output_index), utxo);
    }

    fn balance_of(&self, address: &Address) -> u64 {
        self.utxos
            .values()
            .filter(|u| &u.address == address)
            .map(|u| u.amount)
            .sum()
    }

    /// Validate and apply a draft signed by `label`.
    fn apply(&mut self, label: &str, draft: &TxDraft) -> Result<TxId, WalletError> {
        let wallet = self
            .wallets
            .get(label)
            .ok_or_else(|| WalletError::new(format!("unknown wallet {label}")))?;
        let signer = wallet.key_hash;
        let wallet_address = wallet.address.clone();

        if !draft.validity.contains(self.now) {
            return Err(WalletError::new(format!(
                "ledger: slot {} outside validity interval {:?}",
                self.now, draft.validity
            )));
        }
        for required in &draft.required_signers {
            if *required != signer {
                return Err(WalletError::new(format!(
                    "ledger: missing required signer {required}"
                )));
            }
        }

        let mut script_value = 0u64;
        for input in &draft.script_inputs {
            let key = (input.output.tx_id, input.output.output_index);
            let utxo = self.utxos.get(&key).ok_or_else(|| {
                WalletError::new(format!(
                    "ledger: input {}#{} already consumed or unknown",
                    key.0, key.1
                ))
            })?;
            check_validator(utxo, input.script_hash, &input.script_bytes)?;
            check_escrow_rule(utxo, input.redeemer, draft, signer)?;
            script_value += utxo.amount;
        }

        let outputs_total: u64 = draft.outputs.iter().map(|o| o.amount).sum();
        let wallet_funds = self.balance_of(&wallet_address);
        let needed = (outputs_total + DEFAULT_FEE).saturating_sub(script_value);
        if wallet_funds < needed {
            return Err(WalletError::new(format!(
                "insufficient funds: transaction needs {needed} lovelace from the wallet, it holds {wallet_funds}"
            )));
        }

        for input in &draft.script_inputs {
            self.utxos
                .remove(&(input.output.tx_id, input.output.output_index));
        }
        self.utxos.retain(|_, u| u.address != wallet_address);

        let tx_id = self.next_tx_id();
        let mut index = 0u32;
        for out in &draft.outputs {
            self.insert(Utxo {
                tx_id,
                output_index: index,
                address: out.address.clone(),
                amount: out.amount,
                inline_datum: out.inline_datum.clone(),
            });
            index += 1;
        }
        let change = wallet_funds + script_value - outputs_total - DEFAULT_FEE;
        if change > 0 {
            self.insert(Utxo {
                tx_id,
                output_index: index,
                address: draft.change_address.clone(),
                amount: change,
                inline_datum: None,
            });
        }

        self.confirmed.insert(tx_id);
        self.submissions.push(Submission {
            tx_id,
            signer,
            draft: draft.clone(),
            submitted_at: self.now,
        });
        debug!(%tx_id, kind = ?draft.kind, "memory ledger applied transaction");
        Ok(tx_id)
    }
}

/// The attached script must hash to the credential the output is locked under.
fn check_validator(
    utxo: &Utxo,
    claimed: ScriptHash,
    script_bytes: &[u8],
) -> Result<(), WalletError> {
    let locked_under = match utxo.address.payment_credential() {
        Ok(Credential::Script(hash)) => hash,
        _ => {
            return Err(WalletError::new(format!(
                "ledger: output {}#{} is not locked by a script",
                utxo.tx_id, utxo.output_index
            )));
        }
    };
    let hashes_match = [PlutusVersion::V1, PlutusVersion::V2, PlutusVersion::V3]
        .into_iter()
        .any(|v| script_hash(v, script_bytes) == claimed);
    if !hashes_match || claimed.0 != locked_under {
        return Err(WalletError::new(format!(
            "ledger: attached script {claimed} cannot spend output locked by {}",
            hex::encode(locked_under)
        )));
    }
    Ok(())
}

/// What the escrow validator checks on chain.
fn check_escrow_rule(
    utxo: &Utxo,
    redeemer: EscrowRedeemer,
    draft: &TxDraft,
    signer: KeyHash,
) -> Result<(), WalletError> {
    let record = utxo
        .inline_datum
        .as_deref()
        .ok_or_else(|| WalletError::new("script: output has no datum"))
        .and_then(|cbor| {
            EscrowRecord::from_cbor(cbor).map_err(|e| WalletError::new(format!("script: {e}")))
        })?;
    let pays = |key: &KeyHash| {
        draft.outputs.iter().any(|o| {
            o.address.key_hash() == Some(key.0) && o.amount >= utxo.amount
        })
    };
    match (redeemer, draft.kind) {
        (EscrowRedeemer::Release, TxKind::Release) => {
            if signer != record.buyer_key_hash {
                return Err(WalletError::new("script: release must be signed by the buyer"));
            }
            if !pays(&record.seller_key_hash) {
                return Err(WalletError::new("script: release must pay the seller in full"));
            }
        }
        (EscrowRedeemer::Refund, TxKind::Refund) => {
            match draft.validity.valid_from {
                Some(from) if from > record.deadline => {}
                _ => {
                    return Err(WalletError::new(format!(
                        "script: validity must start after deadline {}",
                        record.deadline
                    )));
                }
            }
            if !pays(&record.buyer_key_hash) {
                return Err(WalletError::new("script: refund must pay the buyer in full"));
            }
        }
        (r, k) => {
            return Err(WalletError::new(format!(
                "script: redeemer {r:?} does not fit a {k:?} transaction"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ChainIndexer for MemoryLedger {
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, IndexerError> {
        Ok(self
            .state()
            .utxos
            .values()
            .filter(|u| &u.address == address)
            .cloned()
            .collect())
    }

    async fn await_confirmation(&self, tx_id: &TxId) -> Result<bool, IndexerError> {
        let st = self.state();
        Ok(!st.stall_confirmations && st.confirmed.contains(tx_id))
    }
}

impl Clock for MemoryLedger {
    fn now_secs(&self) -> u64 {
        self.state().now
    }
}

/// A wallet held by the simulator.
#[derive(Clone)]
pub struct MemoryWallet {
    ledger: MemoryLedger,
    label: String,
}

impl MemoryWallet {
    fn address(&self) -> Result<Address, WalletError> {
        self.ledger
            .state()
            .wallets
            .get(&self.label)
            .map(|w| w.address.clone())
            .ok_or_else(|| WalletError::with_code(-3, format!("wallet {} refused access", self.label)))
    }
}

#[async_trait]
impl WalletConnector for MemoryWallet {
    async fn enable(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        self.address()?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl SigningHandle for MemoryWallet {
    /// Raw address bytes in hex, as browser wallets hand them out.
    async fn used_addresses(&self) -> Result<Vec<String>, WalletError> {
        let address = self.address()?;
        if self.ledger.balance_of(&address) == 0 {
            return Ok(vec![]);
        }
        Ok(vec![hex::encode(address.to_bytes())])
    }

    async fn unused_addresses(&self) -> Result<Vec<String>, WalletError> {
        let address = self.address()?;
        if self.ledger.balance_of(&address) == 0 {
            Ok(vec![hex::encode(address.to_bytes())])
        } else {
            Ok(vec![])
        }
    }

    async fn balance(&self) -> Result<Vec<u8>, WalletError> {
        let address = self.address()?;
        let mut out = Vec::new();
        cbor::write_head(&mut out, MAJOR_UNSIGNED, self.ledger.balance_of(&address));
        Ok(out)
    }

    async fn network_id(&self) -> Result<u8, WalletError> {
        Ok(self.ledger.network().id())
    }

    async fn sign_and_submit(&self, tx: &TxDraft) -> Result<TxId, WalletError> {
        let mut st = self.ledger.state();
        let wallet = st
            .wallets
            .get_mut(&self.label)
            .ok_or_else(|| WalletError::with_code(-3, format!("wallet {} refused access", self.label)))?;
        if wallet.decline_next {
            wallet.decline_next = false;
            return Err(WalletError::with_code(2, "user declined to sign the transaction"));
        }
        st.apply(&self.label, tx)
    }
}
