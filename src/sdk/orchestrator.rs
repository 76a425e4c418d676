//! Escrow lifecycle: lock, release and refund against the configured validator.
//!
//! ```text
//! Uninitialized -> Locking -> Locked -> Releasing -> Released
//!                     |          |  \-> Refunding -> Refunded
//!                     v          v
//!                 LockFailed  SpendFailed (retry from Locked)
//! ```
//!
//! The chain is the source of truth. The per-order [`OrderStatus`] kept here is
//! a local mirror for callers and is never read back to build a transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use super::address::Address;
use super::chain::{ChainIndexer, Clock, KeyHash, LockedOutput, TxId};
use super::datum::{Deadline, DeadlineUnit, EscrowRecord};
use super::error::EscrowError;
use super::script::{self, ScriptIdentity};
use super::tx::{self, TxDraft};
use super::wallet::{AccountPolicy, WalletSession, WalletSessionGuard};

// ─── Order state ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowPhase {
    #[default]
    Uninitialized,
    Locking,
    Locked,
    Releasing,
    Released,
    Refunding,
    Refunded,
    LockFailed,
    SpendFailed,
}

impl EscrowPhase {
    /// An attempt is running or an output is believed to be locked.
    fn blocks_new_lock(self) -> bool {
        matches!(
            self,
            Self::Locking | Self::Locked | Self::Releasing | Self::Refunding
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStatus {
    pub phase: EscrowPhase,
    pub last_tx_id: Option<TxId>,
    pub locked_output: Option<LockedOutput>,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<EscrowError>,
}

fn serialize_error<S: Serializer>(e: &Option<EscrowError>, s: S) -> Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

// ─── Settings / requests / results ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Unit assumed for raw deadlines arriving from callers.
    pub deadline_unit: DeadlineUnit,
    /// Deadline used when a lock request omits one, relative to now.
    pub default_deadline_secs: u64,
    pub refund_offset_secs: u64,
    pub validity_window_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            deadline_unit: DeadlineUnit::Auto,
            default_deadline_secs: 7 * 24 * 60 * 60,
            refund_offset_secs: 1,
            validity_window_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub order_id: String,
    /// Lovelace.
    pub amount: u64,
    pub buyer: Address,
    pub seller: Address,
    pub deadline: Option<Deadline>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockReceipt {
    pub tx_id: TxId,
    pub script_address: Address,
    pub locked_output: LockedOutput,
}

/// Which lookup stage produced the outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Datums decoded and matched the order id.
    Exact,
    /// Nothing matched; every output at the script address is returned.
    Unfiltered,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputLookup {
    pub outputs: Vec<LockedOutput>,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowStatus {
    pub exists: bool,
    pub output: Option<LockedOutput>,
    pub deadline: Option<u64>,
    /// False when something is locked but its datum could not be tied to the order.
    pub details_available: bool,
}

// ─── Orchestrator ────────────────────────────────────────────

pub struct EscrowOrchestrator {
    script: ScriptIdentity,
    indexer: Arc<dyn ChainIndexer>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    orders: Mutex<HashMap<String, OrderStatus>>,
    spend_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EscrowOrchestrator {
    pub fn new(
        script: ScriptIdentity,
        indexer: Arc<dyn ChainIndexer>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            script,
            indexer,
            clock,
            settings,
            orders: Mutex::new(HashMap::new()),
            spend_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self) -> &ScriptIdentity {
        &self.script
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn order_status(&self, order_id: &str) -> OrderStatus {
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    fn update_order(&self, order_id: &str, f: impl FnOnce(&mut OrderStatus)) {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        f(orders.entry(order_id.to_string()).or_default());
    }

    fn record_failure(
        &self,
        order_id: &str,
        phase: EscrowPhase,
        tx_id: Option<TxId>,
        error: &EscrowError,
    ) {
        warn!(order_id, ?phase, "escrow attempt failed: {error}");
        self.update_order(order_id, |s| {
            s.phase = phase;
            if tx_id.is_some() {
                s.last_tx_id = tx_id;
            }
            s.last_error = Some(error.clone());
        });
    }

    /// Serialize spends of one order. The map entry is dropped with the last
    /// permit.
    async fn acquire_spend_lock(&self, order_id: &str) -> SpendPermit<'_> {
        let lock = self
            .spend_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(order_id.to_string())
            .or_default()
            .clone();
        SpendPermit {
            orchestrator: self,
            order_id: order_id.to_string(),
            held: Some(lock.lock_owned().await),
        }
    }

    async fn confirm(&self, tx_id: TxId) -> Result<(), EscrowError> {
        match self.indexer.await_confirmation(&tx_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(EscrowError::ConfirmationTimeout {
                tx_id,
                reason: "indexer stopped waiting".into(),
            }),
            Err(e) => Err(EscrowError::ConfirmationTimeout {
                tx_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Sign and submit through the session snapshot, then wait for the ledger.
    async fn sign_submit_confirm(
        &self,
        session: &WalletSession,
        draft: &TxDraft,
    ) -> Result<TxId, (Option<TxId>, EscrowError)> {
        let tx_id = session
            .signing_handle
            .sign_and_submit(draft)
            .await
            .map_err(|e| (None, EscrowError::from_wallet(e)))?;
        info!(kind = ?draft.kind, %tx_id, "transaction submitted");
        self.confirm(tx_id).await.map_err(|e| (Some(tx_id), e))?;
        Ok(tx_id)
    }

    // ─── Lock ────────────────────────────────────────────────

    pub async fn lock(
        &self,
        guard: &WalletSessionGuard,
        req: LockRequest,
    ) -> Result<LockReceipt, EscrowError> {
        if req.order_id.is_empty() {
            return Err(EscrowError::InvalidInput("order id must not be empty".into()));
        }
        if req.amount == 0 {
            return Err(EscrowError::InvalidInput("amount must be > 0".into()));
        }
        let buyer_key_hash = self.resolve_key_hash(&req.buyer, "buyer")?;
        let seller_key_hash = self.resolve_key_hash(&req.seller, "seller")?;

        let now = self.clock.now_secs();
        let deadline = req.deadline.unwrap_or(Deadline::Seconds(
            now.saturating_add(self.settings.default_deadline_secs),
        ));
        let record = EscrowRecord::new(
            &req.order_id,
            buyer_key_hash,
            seller_key_hash,
            req.amount,
            deadline,
        )?;
        if record.deadline <= now {
            warn!(order_id = %req.order_id, deadline = record.deadline, "locking with a deadline already in the past");
        }

        let session = guard
            .validate(Some(&req.buyer), req.amount, AccountPolicy::Warn)
            .await?;
        let draft = tx::build_lock_tx(&self.script, &record, &session.account_address)?;

        {
            let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
            let status = orders.entry(req.order_id.clone()).or_default();
            if status.phase.blocks_new_lock() {
                return Err(EscrowError::InvalidInput(format!(
                    "order {} is already {:?}",
                    req.order_id, status.phase
                )));
            }
            status.phase = EscrowPhase::Locking;
            status.last_error = None;
        }
        let attempt = Attempt::start(self, &req.order_id, EscrowPhase::LockFailed);

        let tx_id = match self.sign_submit_confirm(&session, &draft).await {
            Ok(tx_id) => tx_id,
            Err((tx_id, e)) => {
                attempt.finish();
                self.record_failure(&req.order_id, EscrowPhase::LockFailed, tx_id, &e);
                return Err(e);
            }
        };

        self.update_order(&req.order_id, |s| {
            s.phase = EscrowPhase::Locked;
            s.last_tx_id = Some(tx_id);
        });
        attempt.finish();
        info!(
            order_id = %req.order_id,
            %tx_id,
            script_hash = %self.script.script_hash,
            amount = record.amount,
            "escrow locked"
        );

        let locked_output = self.observe_locked_output(tx_id, &record).await;
        self.update_order(&req.order_id, |s| {
            s.locked_output = Some(locked_output.clone());
        });

        Ok(LockReceipt {
            tx_id,
            script_address: self.script.derived_address.clone(),
            locked_output,
        })
    }

    fn resolve_key_hash(&self, address: &Address, role: &str) -> Result<KeyHash, EscrowError> {
        if address.network() != self.script.network() {
            return Err(EscrowError::InvalidInput(format!(
                "{role} address is on {}, escrow runs on {}",
                address.network(),
                self.script.network()
            )));
        }
        address.key_hash().map(KeyHash).ok_or_else(|| {
            EscrowError::InvalidInput(format!("{role} address has no payment key hash"))
        })
    }

    /// The output as the chain reports it after confirmation.
    async fn observe_locked_output(&self, tx_id: TxId, record: &EscrowRecord) -> LockedOutput {
        match self.indexer.utxos_at(&self.script.derived_address).await {
            Ok(utxos) => {
                if let Some(utxo) = utxos.into_iter().find(|u| u.tx_id == tx_id) {
                    return LockedOutput::from_utxo(utxo);
                }
                warn!(%tx_id, "confirmed lock output not visible at script address; assuming index 0");
            }
            Err(e) => warn!(%tx_id, "could not re-read script address: {e}; assuming index 0"),
        }
        LockedOutput {
            tx_id,
            output_index: 0,
            address: self.script.derived_address.clone(),
            locked_amount: record.amount,
            datum: Some(record.clone()),
            owning_script_hash: Some(self.script.script_hash),
            datum_cbor: Some(record.to_cbor()),
        }
    }

    // ─── Release / refund ────────────────────────────────────

    pub async fn release(
        &self,
        guard: &WalletSessionGuard,
        output: &LockedOutput,
        seller: &Address,
        buyer: Option<&Address>,
    ) -> Result<TxId, EscrowError> {
        let record = output.decode_datum()?;
        let order_id = record.order_id_lossy();
        if let Err(e) = script::verify(output, &self.script) {
            let e = EscrowError::from(e);
            self.record_failure(&order_id, EscrowPhase::SpendFailed, None, &e);
            return Err(e);
        }
        require_credential(seller, &record.seller_key_hash, "seller")?;
        if let Some(buyer) = buyer {
            require_credential(buyer, &record.buyer_key_hash, "buyer")?;
        }

        let session = guard.validate(buyer, 0, AccountPolicy::Require).await?;
        if session.account_address.key_hash() != Some(record.buyer_key_hash.0) {
            return Err(EscrowError::SessionUnavailable(format!(
                "release must be signed by the buyer {}; connected account is {}",
                record.buyer_key_hash, session.account_address
            )));
        }

        let _permit = self.acquire_spend_lock(&order_id).await;
        self.ensure_unspent(output).await?;

        let draft = tx::build_release_tx(
            output,
            &record,
            &self.script,
            seller,
            &session.account_address,
        );
        self.spend(&order_id, &session, &draft, EscrowPhase::Releasing, EscrowPhase::Released)
            .await
    }

    pub async fn refund(
        &self,
        guard: &WalletSessionGuard,
        output: &LockedOutput,
        buyer: &Address,
    ) -> Result<TxId, EscrowError> {
        let deadline = output.decode_deadline()?;
        let record = output.decode_datum()?;
        let order_id = record.order_id_lossy();
        if let Err(e) = script::verify(output, &self.script) {
            let e = EscrowError::from(e);
            self.record_failure(&order_id, EscrowPhase::SpendFailed, None, &e);
            return Err(e);
        }
        require_credential(buyer, &record.buyer_key_hash, "buyer")?;

        let session = guard.validate(Some(buyer), 0, AccountPolicy::Warn).await?;

        let _permit = self.acquire_spend_lock(&order_id).await;
        self.ensure_unspent(output).await?;

        let now = self.clock.now_secs();
        if now <= deadline {
            warn!(%order_id, now, deadline, "refund requested before the deadline; tx is only valid after it");
        }
        let validity = tx::refund_validity(
            deadline,
            now,
            self.settings.refund_offset_secs,
            self.settings.validity_window_secs,
        );
        let draft = tx::build_refund_tx(
            output,
            &record,
            &self.script,
            buyer,
            &session.account_address,
            validity,
        )?;
        self.spend(&order_id, &session, &draft, EscrowPhase::Refunding, EscrowPhase::Refunded)
            .await
    }

    async fn spend(
        &self,
        order_id: &str,
        session: &WalletSession,
        draft: &TxDraft,
        running: EscrowPhase,
        done: EscrowPhase,
    ) -> Result<TxId, EscrowError> {
        self.update_order(order_id, |s| {
            s.phase = running;
            s.last_error = None;
        });
        let attempt = Attempt::start(self, order_id, EscrowPhase::SpendFailed);
        let outcome = self.sign_submit_confirm(session, draft).await;
        attempt.finish();
        match outcome {
            Ok(tx_id) => {
                info!(order_id, %tx_id, phase = ?done, "escrow output spent");
                self.update_order(order_id, |s| {
                    s.phase = done;
                    s.last_tx_id = Some(tx_id);
                    s.locked_output = None;
                });
                Ok(tx_id)
            }
            Err((tx_id, e)) => {
                self.record_failure(order_id, EscrowPhase::SpendFailed, tx_id, &e);
                Err(e)
            }
        }
    }

    /// Runs under the spend lock: a queued attempt must not prompt for a
    /// signature over an output the previous attempt already consumed.
    async fn ensure_unspent(&self, output: &LockedOutput) -> Result<(), EscrowError> {
        let utxos = self.indexer.utxos_at(&output.address).await?;
        if utxos
            .iter()
            .any(|u| output.same_outpoint(&u.tx_id, u.output_index))
        {
            Ok(())
        } else {
            Err(EscrowError::OutputAlreadySpent {
                tx_id: output.tx_id,
                output_index: output.output_index,
            })
        }
    }

    // ─── Queries ─────────────────────────────────────────────

    /// Every output at the script address, datum decoded where possible.
    pub async fn find_all(&self) -> Result<Vec<LockedOutput>, EscrowError> {
        let utxos = self.indexer.utxos_at(&self.script.derived_address).await?;
        Ok(utxos.into_iter().map(LockedOutput::from_utxo).collect())
    }

    pub async fn find_exact(&self, order_id: &str) -> Result<Vec<LockedOutput>, EscrowError> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .filter(|o| o.datum.as_ref().is_some_and(|d| d.matches_order(order_id)))
            .collect())
    }

    pub async fn find_locked_outputs(&self, order_id: &str) -> Result<OutputLookup, EscrowError> {
        let all = self.find_all().await?;
        let (exact, rest): (Vec<_>, Vec<_>) = all
            .into_iter()
            .partition(|o| o.datum.as_ref().is_some_and(|d| d.matches_order(order_id)));
        if !exact.is_empty() || rest.is_empty() {
            return Ok(OutputLookup {
                outputs: exact,
                match_kind: MatchKind::Exact,
            });
        }
        warn!(
            order_id,
            outputs = rest.len(),
            "no datum matched the order; returning every output at the script address"
        );
        Ok(OutputLookup {
            outputs: rest,
            match_kind: MatchKind::Unfiltered,
        })
    }

    pub async fn check_status(&self, order_id: &str) -> Result<EscrowStatus, EscrowError> {
        let lookup = self.find_locked_outputs(order_id).await?;
        let output = lookup.outputs.into_iter().next();
        Ok(match (lookup.match_kind, output) {
            (_, None) => EscrowStatus {
                exists: false,
                output: None,
                deadline: None,
                details_available: false,
            },
            (MatchKind::Exact, Some(output)) => EscrowStatus {
                exists: true,
                deadline: output.datum.as_ref().map(|d| d.deadline),
                output: Some(output),
                details_available: true,
            },
            (MatchKind::Unfiltered, Some(output)) => EscrowStatus {
                exists: true,
                output: Some(output),
                deadline: None,
                details_available: false,
            },
        })
    }
}

/// Marks the order failed if an attempt is dropped before it finishes, e.g.
/// when the caller times out a signing prompt.
struct Attempt<'a> {
    orchestrator: &'a EscrowOrchestrator,
    order_id: &'a str,
    failed: EscrowPhase,
    armed: bool,
}

impl<'a> Attempt<'a> {
    fn start(orchestrator: &'a EscrowOrchestrator, order_id: &'a str, failed: EscrowPhase) -> Self {
        Self {
            orchestrator,
            order_id,
            failed,
            armed: true,
        }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            let error = EscrowError::SubmissionFailure(
                "attempt cancelled before confirmation; check the chain before retrying".into(),
            );
            self.orchestrator
                .record_failure(self.order_id, self.failed, None, &error);
        }
    }
}

struct SpendPermit<'a> {
    orchestrator: &'a EscrowOrchestrator,
    order_id: String,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SpendPermit<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self
            .orchestrator
            .spend_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.order_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.order_id);
        }
    }
}

/// The address must pay to the key hash recorded in the datum.
fn require_credential(address: &Address, expected: &KeyHash, role: &str) -> Result<(), EscrowError> {
    match address.key_hash() {
        Some(hash) if hash == expected.0 => Ok(()),
        _ => Err(EscrowError::InvalidInput(format!(
            "{role} address {address} does not match the {role} key hash {expected} in the datum"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::address::Network;
    use crate::sdk::memory::MemoryLedger;
    use crate::sdk::script::PlutusVersion;

    fn orchestrator() -> EscrowOrchestrator {
        let ledger = MemoryLedger::new(Network::Testnet, 1_000);
        let script =
            ScriptIdentity::from_hex("4e4d01000033222220051200120011", PlutusVersion::V2, Network::Testnet)
                .unwrap();
        EscrowOrchestrator::new(
            script,
            Arc::new(ledger.clone()),
            Arc::new(ledger),
            OrchestratorSettings::default(),
        )
    }

    fn spend_lock_entries(orch: &EscrowOrchestrator) -> usize {
        orch.spend_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn spend_lock_entries_go_away_with_their_permits() {
        let orch = orchestrator();
        let first = orch.acquire_spend_lock("ord-1").await;
        let second = orch.acquire_spend_lock("ord-2").await;
        assert_eq!(spend_lock_entries(&orch), 2);

        drop(first);
        assert_eq!(spend_lock_entries(&orch), 1);
        drop(second);
        assert_eq!(spend_lock_entries(&orch), 0);
    }

    #[tokio::test]
    async fn queued_spend_keeps_the_entry() {
        let orch = orchestrator();
        let held = orch.acquire_spend_lock("ord-1").await;
        let (_, queued_len) = tokio::join!(
            async move {
                tokio::task::yield_now().await;
                drop(held);
            },
            async {
                let _permit = orch.acquire_spend_lock("ord-1").await;
                spend_lock_entries(&orch)
            },
        );
        assert_eq!(queued_len, 1);
        assert_eq!(spend_lock_entries(&orch), 0);
    }

    #[test]
    fn cancelled_attempt_records_failure() {
        let orch = orchestrator();
        orch.update_order("ord-1", |s| s.phase = EscrowPhase::Locking);
        drop(Attempt::start(&orch, "ord-1", EscrowPhase::LockFailed));
        let status = orch.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::LockFailed);
        assert!(status.last_error.is_some());

        orch.update_order("ord-2", |s| s.phase = EscrowPhase::Locking);
        Attempt::start(&orch, "ord-2", EscrowPhase::LockFailed).finish();
        assert_eq!(orch.order_status("ord-2").phase, EscrowPhase::Locking);
    }
}
