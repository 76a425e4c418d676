//! End-to-end escrow flows against the in-memory ledger.
//!
//! Each module drives the orchestrator and the session guard through a full
//! build -> sign -> submit -> confirm sequence; the ledger enforces double
//! spends, validity intervals, required signers and the validator's rules.

use cardano_escrow_lab::sdk::address::{self, Address, Network};
use async_trait::async_trait;
use cardano_escrow_lab::sdk::chain::{Clock, KeyHash, TxId};
use cardano_escrow_lab::sdk::datum::{Deadline, EscrowRecord};
use cardano_escrow_lab::sdk::error::{DecodeError, EscrowError, WalletError};
use cardano_escrow_lab::sdk::memory::{DEFAULT_FEE, MemoryLedger, MemoryWallet};
use cardano_escrow_lab::sdk::orchestrator::{
    EscrowOrchestrator, EscrowPhase, LockReceipt, LockRequest, MatchKind, OrchestratorSettings,
};
use cardano_escrow_lab::sdk::plutus::PlutusData;
use cardano_escrow_lab::sdk::script::{PlutusVersion, ScriptIdentity};
use cardano_escrow_lab::sdk::tx::{TxDraft, TxKind};
use cardano_escrow_lab::sdk::wallet::{
    AccountPolicy, SigningHandle, WalletConnector, WalletSessionGuard,
};
use std::sync::Arc;
use std::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};

const SCRIPT_V1: &str = "4e4d01000033222220051200120011";
const SCRIPT_V2: &str = "4e4d0100003322222005120012001100";
const T: u64 = 1_700_000_000;
const BUYER_FUNDS: u64 = 100_000_000;
const SELLER_FUNDS: u64 = 5_000_000;
const AMOUNT: u64 = 10_000_000;

// ─── Test helpers ───────────────────────────────────────────

struct ManualClock(AtomicU64);

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Env {
    ledger: MemoryLedger,
    clock: Arc<ManualClock>,
    guard: WalletSessionGuard,
    orchestrator: EscrowOrchestrator,
    buyer: Address,
    seller: Address,
}

fn script(hex: &str) -> ScriptIdentity {
    ScriptIdentity::from_hex(hex, PlutusVersion::V2, Network::Testnet).unwrap()
}

fn setup() -> Env {
    let ledger = MemoryLedger::new(Network::Testnet, T - 1_000);
    let buyer = ledger.add_wallet("buyer", KeyHash([0x11; 28]), BUYER_FUNDS);
    let seller = ledger.add_wallet("seller", KeyHash([0x22; 28]), SELLER_FUNDS);
    let clock = Arc::new(ManualClock(AtomicU64::new(T - 1_000)));
    let orchestrator = orchestrator_for(&ledger, &clock, SCRIPT_V1);
    Env {
        ledger,
        clock,
        guard: WalletSessionGuard::new(),
        orchestrator,
        buyer,
        seller,
    }
}

fn orchestrator_for(ledger: &MemoryLedger, clock: &Arc<ManualClock>, hex: &str) -> EscrowOrchestrator {
    EscrowOrchestrator::new(
        script(hex),
        Arc::new(ledger.clone()),
        clock.clone(),
        OrchestratorSettings::default(),
    )
}

impl Env {
    /// Move both the ledger and the orchestrator's clock.
    fn set_time(&self, now: u64) {
        self.ledger.set_time(now);
        self.clock.0.store(now, Ordering::SeqCst);
    }

    async fn connect(&self, label: &str) {
        self.guard
            .connect(&self.ledger.connector(label), Network::Testnet)
            .await
            .unwrap();
    }

    fn lock_request(&self, order_id: &str, deadline: Option<Deadline>) -> LockRequest {
        LockRequest {
            order_id: order_id.to_string(),
            amount: AMOUNT,
            buyer: self.buyer.clone(),
            seller: self.seller.clone(),
            deadline,
        }
    }

    async fn lock(&self, order_id: &str) -> LockReceipt {
        self.orchestrator
            .lock(&self.guard, self.lock_request(order_id, Some(Deadline::Seconds(T))))
            .await
            .unwrap()
    }
}

// ─── Lock then release ──────────────────────────────────────

mod lock_and_release {
    use super::*;

    #[tokio::test]
    async fn release_pays_seller_and_consumes_output() {
        let env = setup();
        env.connect("buyer").await;

        let receipt = env.lock("ord-1").await;
        assert_eq!(receipt.script_address, env.orchestrator.script().derived_address);
        assert_eq!(receipt.locked_output.locked_amount, AMOUNT);
        assert_eq!(receipt.locked_output.output_index, 0);
        assert_eq!(receipt.locked_output.tx_id, receipt.tx_id);
        let datum = receipt.locked_output.datum.clone().unwrap();
        assert!(datum.matches_order("ord-1"));
        assert_eq!(datum.buyer_key_hash, KeyHash([0x11; 28]));
        assert_eq!(datum.seller_key_hash, KeyHash([0x22; 28]));
        assert_eq!(datum.deadline, T);
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Locked);
        assert_eq!(env.ledger.balance_of(&env.buyer), BUYER_FUNDS - AMOUNT - DEFAULT_FEE);

        let tx_id = env
            .orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, Some(&env.buyer))
            .await
            .unwrap();

        assert_eq!(env.ledger.balance_of(&env.seller), SELLER_FUNDS + AMOUNT);
        assert!(env.orchestrator.find_all().await.unwrap().is_empty());
        let status = env.orchestrator.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::Released);
        assert_eq!(status.last_tx_id, Some(tx_id));
        assert!(!env.orchestrator.check_status("ord-1").await.unwrap().exists);

        let submissions = env.ledger.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[1].draft.kind, TxKind::Release);
        assert_eq!(submissions[1].signer, KeyHash([0x11; 28]));
    }

    #[tokio::test]
    async fn second_release_finds_output_spent() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        env.orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, None)
            .await
            .unwrap();
        let err = env
            .orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::OutputAlreadySpent { .. }), "{err}");
        assert_eq!(env.ledger.submissions().len(), 2, "no second signing prompt");
    }

    #[tokio::test]
    async fn concurrent_spends_of_one_order_are_serialized() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;
        env.set_time(T + 10);

        let (release, refund) = tokio::join!(
            env.orchestrator
                .release(&env.guard, &receipt.locked_output, &env.seller, None),
            env.orchestrator
                .refund(&env.guard, &receipt.locked_output, &env.buyer),
        );
        let outcomes = [release.is_ok(), refund.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one spend wins");
        let loser = release.err().or(refund.err()).unwrap();
        assert!(matches!(loser, EscrowError::OutputAlreadySpent { .. }), "{loser}");
        assert_eq!(env.ledger.submissions().len(), 2);
    }

    #[tokio::test]
    async fn release_by_seller_session_is_refused_when_buyer_given() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        env.connect("seller").await;
        let err = env
            .orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, Some(&env.buyer))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)), "{err}");
        assert_eq!(env.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn release_without_buyer_address_still_checks_datum_buyer() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        env.connect("seller").await;
        let err = env
            .orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)), "{err}");
        assert!(err.to_string().contains(&KeyHash([0x11; 28]).to_string()));
        assert_eq!(env.ledger.submissions().len(), 1, "no signing prompt");
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Locked);
        assert_eq!(env.orchestrator.find_all().await.unwrap().len(), 1, "still locked");

        // Retry from the locked output with the right session.
        env.connect("buyer").await;
        env.orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, Some(&env.buyer))
            .await
            .unwrap();
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Released);
    }

    #[tokio::test]
    async fn release_to_address_not_in_datum_is_invalid() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;
        let stranger = address::key_address(&[0x99; 28], Network::Testnet);

        let err = env
            .orchestrator
            .release(&env.guard, &receipt.locked_output, &stranger, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");
    }
}

// ─── Refund ─────────────────────────────────────────────────

mod refund {
    use super::*;

    #[tokio::test]
    async fn refund_one_second_before_deadline_starts_after_it() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        // The orchestrator builds at T - 1; the ledger has moved past the deadline
        // by the time the transaction lands.
        env.clock.0.store(T - 1, Ordering::SeqCst);
        env.ledger.set_time(T + 5);

        env.orchestrator
            .refund(&env.guard, &receipt.locked_output, &env.buyer)
            .await
            .unwrap();
        let refund = env.ledger.submissions().pop().unwrap();
        assert_eq!(refund.draft.kind, TxKind::Refund);
        assert_eq!(refund.draft.validity.valid_from, Some(T + 1));
        assert!(refund.draft.validity.valid_from.unwrap() > T);
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Refunded);
    }

    #[tokio::test]
    async fn early_refund_fails_and_can_be_retried_after_deadline() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;
        env.set_time(T - 1);

        let err = env
            .orchestrator
            .refund(&env.guard, &receipt.locked_output, &env.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SubmissionFailure(_)), "{err}");
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::SpendFailed);
        assert_eq!(env.orchestrator.find_all().await.unwrap().len(), 1);

        env.set_time(T + 2);
        env.orchestrator
            .refund(&env.guard, &receipt.locked_output, &env.buyer)
            .await
            .unwrap();
        let refund = env.ledger.submissions().pop().unwrap();
        assert_eq!(refund.draft.validity.valid_from, Some(T + 1));
        assert!(refund.draft.validity.contains(T + 2));
        assert_eq!(
            env.ledger.balance_of(&env.buyer),
            BUYER_FUNDS - 2 * DEFAULT_FEE,
            "locked amount returned, two fees paid"
        );
    }

    #[tokio::test]
    async fn refund_reads_deadline_from_chain_datum() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        // A stale local copy claiming an earlier deadline must not matter.
        let mut stale = receipt.locked_output.clone();
        if let Some(d) = stale.datum.as_mut() {
            d.deadline = T - 500;
        }
        env.set_time(T + 100);
        env.orchestrator
            .refund(&env.guard, &stale, &env.buyer)
            .await
            .unwrap();
        let refund = env.ledger.submissions().pop().unwrap();
        assert_eq!(refund.draft.validity.valid_from, Some(T + 1));
    }

    #[tokio::test]
    async fn three_field_datum_is_a_decode_failure() {
        let env = setup();
        env.connect("buyer").await;
        let short = PlutusData::constr(
            0,
            vec![
                PlutusData::Bytes(b"ord-9".to_vec()),
                PlutusData::Bytes(vec![0x11; 28]),
                PlutusData::Bytes(vec![0x22; 28]),
            ],
        );
        env.ledger.insert_utxo(
            env.orchestrator.script().derived_address.clone(),
            AMOUNT,
            Some(short.to_cbor()),
        );

        let outputs = env.orchestrator.find_all().await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].datum.is_none());

        let err = env
            .orchestrator
            .refund(&env.guard, &outputs[0], &env.buyer)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EscrowError::DatumDecodeFailure(DecodeError::MissingField {
                field: "deadline",
                needed: 5,
                found: 3
            })
        );
        assert!(env.ledger.submissions().is_empty());
    }
}

// ─── Script redeployment ────────────────────────────────────

mod script_redeployment {
    use super::*;

    #[tokio::test]
    async fn spend_with_new_script_is_a_mismatch_before_submission() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        let redeployed = orchestrator_for(&env.ledger, &env.clock, SCRIPT_V2);
        assert_ne!(
            redeployed.script().derived_address,
            env.orchestrator.script().derived_address
        );

        let err = redeployed
            .release(&env.guard, &receipt.locked_output, &env.seller, Some(&env.buyer))
            .await
            .unwrap_err();
        let EscrowError::ScriptMismatch(mismatch) = &err else {
            panic!("expected script mismatch, got {err}");
        };
        assert!(mismatch.to_string().contains(&env.orchestrator.script().script_hash.to_string()));
        assert!(!err.is_retryable());
        assert_eq!(env.ledger.submissions().len(), 1, "only the lock was submitted");
        assert_eq!(redeployed.order_status("ord-1").phase, EscrowPhase::SpendFailed);

        env.set_time(T + 10);
        let err = redeployed
            .refund(&env.guard, &receipt.locked_output, &env.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::ScriptMismatch(_)));
        assert_eq!(env.ledger.submissions().len(), 1);

        // The original script still spends it.
        env.orchestrator
            .refund(&env.guard, &receipt.locked_output, &env.buyer)
            .await
            .unwrap();
    }
}

// ─── Lock preconditions and failures ────────────────────────

mod lock_failures {
    use super::*;

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_wallet_call() {
        let env = setup();

        let mut zero = env.lock_request("ord-1", None);
        zero.amount = 0;
        let err = env.orchestrator.lock(&env.guard, zero).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");

        let mut script_seller = env.lock_request("ord-1", None);
        script_seller.seller = env.orchestrator.script().derived_address.clone();
        let err = env.orchestrator.lock(&env.guard, script_seller).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");

        let mut mainnet_buyer = env.lock_request("ord-1", None);
        mainnet_buyer.buyer = address::key_address(&[0x11; 28], Network::Mainnet);
        let err = env.orchestrator.lock(&env.guard, mainnet_buyer).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");

        let empty_id = env.lock_request("", None);
        let err = env.orchestrator.lock(&env.guard, empty_id).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");

        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Uninitialized);
    }

    #[tokio::test]
    async fn lock_without_session_is_unavailable() {
        let env = setup();
        let err = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)), "{err}");
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Uninitialized);
    }

    #[tokio::test]
    async fn declined_signature_records_lock_failure_and_allows_retry() {
        let env = setup();
        env.connect("buyer").await;
        env.ledger.decline_next_signature("buyer");

        let err = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", Some(Deadline::Seconds(T))))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SigningRejected(_)), "{err}");
        let status = env.orchestrator.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::LockFailed);
        assert_eq!(status.last_error, Some(err));
        assert!(status.last_tx_id.is_none());
        assert!(env.ledger.submissions().is_empty());
        assert_eq!(env.ledger.balance_of(&env.buyer), BUYER_FUNDS);

        env.lock("ord-1").await;
        let status = env.orchestrator.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::Locked);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn amount_above_balance_is_insufficient_funds() {
        let env = setup();
        env.connect("buyer").await;
        let mut big = env.lock_request("ord-1", None);
        big.amount = BUYER_FUNDS + 1;
        let err = env.orchestrator.lock(&env.guard, big).await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds(_)), "{err}");
    }

    #[tokio::test]
    async fn fee_shortfall_reported_by_wallet_is_insufficient_funds() {
        let env = setup();
        env.connect("buyer").await;
        let mut all_in = env.lock_request("ord-1", None);
        all_in.amount = BUYER_FUNDS;
        let err = env.orchestrator.lock(&env.guard, all_in).await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds(_)), "{err}");
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::LockFailed);
    }

    #[tokio::test]
    async fn relock_of_a_locked_order_is_refused() {
        let env = setup();
        env.connect("buyer").await;
        env.lock("ord-1").await;
        let err = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput(_)), "{err}");
        assert_eq!(env.orchestrator.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_confirmation_is_a_timeout() {
        let env = setup();
        env.connect("buyer").await;
        env.ledger.stall_confirmations(true);
        let err = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", None))
            .await
            .unwrap_err();
        let EscrowError::ConfirmationTimeout { tx_id, .. } = &err else {
            panic!("expected confirmation timeout, got {err}");
        };
        let status = env.orchestrator.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::LockFailed);
        assert_eq!(status.last_tx_id, Some(*tx_id));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn buyer_mismatch_is_only_a_warning_at_lock() {
        let env = setup();
        env.connect("seller").await;
        let mut req = env.lock_request("ord-1", None);
        req.amount = 1_000_000;
        let receipt = env.orchestrator.lock(&env.guard, req).await.unwrap();
        let datum = receipt.locked_output.datum.unwrap();
        assert_eq!(datum.buyer_key_hash, KeyHash([0x11; 28]));
        assert_eq!(env.ledger.submissions()[0].signer, KeyHash([0x22; 28]));
    }
}

// ─── Deadlines ──────────────────────────────────────────────

mod deadlines {
    use super::*;

    #[tokio::test]
    async fn missing_deadline_uses_default_offset() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", None))
            .await
            .unwrap();
        let expected = T - 1_000 + OrchestratorSettings::default().default_deadline_secs;
        assert_eq!(receipt.locked_output.datum.unwrap().deadline, expected);
    }

    #[tokio::test]
    async fn millisecond_deadline_is_stored_in_seconds() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env
            .orchestrator
            .lock(&env.guard, env.lock_request("ord-1", Some(Deadline::Auto(T * 1000 + 999))))
            .await
            .unwrap();
        let cbor = receipt.locked_output.datum_cbor.unwrap();
        assert_eq!(EscrowRecord::from_cbor(&cbor).unwrap().deadline, T);
    }
}

// ─── Queries ────────────────────────────────────────────────

mod queries {
    use super::*;

    #[tokio::test]
    async fn exact_lookup_filters_by_order_id() {
        let env = setup();
        env.connect("buyer").await;
        let first = env.lock("ord-1").await;
        env.lock("ord-2").await;

        let lookup = env.orchestrator.find_locked_outputs("ord-1").await.unwrap();
        assert_eq!(lookup.match_kind, MatchKind::Exact);
        assert_eq!(lookup.outputs, vec![first.locked_output.clone()]);

        let status = env.orchestrator.check_status("ord-1").await.unwrap();
        assert!(status.exists);
        assert!(status.details_available);
        assert_eq!(status.deadline, Some(T));
        assert_eq!(status.output, Some(first.locked_output));
    }

    #[tokio::test]
    async fn unmatched_order_falls_back_to_all_outputs() {
        let env = setup();
        env.connect("buyer").await;
        env.lock("ord-1").await;
        env.ledger.insert_utxo(
            env.orchestrator.script().derived_address.clone(),
            3_000_000,
            Some(PlutusData::Integer(42).to_cbor()),
        );

        let lookup = env.orchestrator.find_locked_outputs("ord-404").await.unwrap();
        assert_eq!(lookup.match_kind, MatchKind::Unfiltered);
        assert_eq!(lookup.outputs.len(), 2);
        assert!(env.orchestrator.find_exact("ord-404").await.unwrap().is_empty());

        let status = env.orchestrator.check_status("ord-404").await.unwrap();
        assert!(status.exists, "something is locked; do not report no escrow");
        assert!(!status.details_available);
        assert_eq!(status.deadline, None);
    }

    #[tokio::test]
    async fn empty_script_address_is_no_escrow() {
        let env = setup();
        let lookup = env.orchestrator.find_locked_outputs("ord-1").await.unwrap();
        assert_eq!(lookup.match_kind, MatchKind::Exact);
        assert!(lookup.outputs.is_empty());
        let status = env.orchestrator.check_status("ord-1").await.unwrap();
        assert!(!status.exists);
        assert!(status.output.is_none());
    }
}

// ─── Session guard ──────────────────────────────────────────

mod session_guard {
    use super::*;

    #[tokio::test]
    async fn connect_normalizes_wallet_address() {
        let env = setup();
        let session = env
            .guard
            .connect(&env.ledger.connector("buyer"), Network::Testnet)
            .await
            .unwrap();
        assert_eq!(session.account_address, env.buyer);
        assert_eq!(session.network, Network::Testnet);
    }

    #[tokio::test]
    async fn unfunded_wallet_falls_back_to_unused_address() {
        let env = setup();
        let fresh = env.ledger.add_wallet("fresh", KeyHash([0x44; 28]), 0);
        env.connect("fresh").await;
        assert_eq!(env.guard.current().unwrap().account_address, fresh);
        // Zero balance defers to the wallet instead of blocking.
        assert!(env.guard.validate(None, AMOUNT, AccountPolicy::Warn).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_network_is_refused() {
        let env = setup();
        let err = env
            .guard
            .connect(&env.ledger.connector("buyer"), Network::Mainnet)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)), "{err}");
        assert!(env.guard.current().is_none());
    }

    #[tokio::test]
    async fn unknown_wallet_refuses_access() {
        let env = setup();
        let err = env
            .guard
            .connect(&env.ledger.connector("ghost"), Network::Testnet)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SigningRejected(_)), "{err}");
    }

    #[tokio::test]
    async fn reconnect_swaps_session_but_keeps_old_snapshot() {
        let env = setup();
        env.connect("buyer").await;
        let before = env.guard.current().unwrap();

        env.connect("seller").await;
        assert_eq!(before.account_address, env.buyer, "in-flight snapshot unchanged");
        assert_eq!(env.guard.current().unwrap().account_address, env.seller);

        env.guard.disconnect();
        assert!(env.guard.current().is_none());
        let err = env.guard.validate(None, 0, AccountPolicy::Warn).await.unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn account_policy_controls_mismatch_handling() {
        let env = setup();
        env.connect("seller").await;
        let err = env
            .guard
            .validate(Some(&env.buyer), 0, AccountPolicy::Require)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SessionUnavailable(_)));
        assert!(env.guard.validate(Some(&env.buyer), 0, AccountPolicy::Warn).await.is_ok());
    }

    #[tokio::test]
    async fn base_address_matches_by_payment_key() {
        let env = setup();
        env.connect("buyer").await;
        let mut base = vec![0x00];
        base.extend_from_slice(&[0x11; 28]);
        base.extend_from_slice(&[0x33; 28]);
        let base = address::encode(&base, Some(Network::Testnet)).unwrap();
        assert!(
            env.guard
                .validate(Some(&base), 0, AccountPolicy::Require)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn balance_below_requirement_is_insufficient() {
        let env = setup();
        env.connect("seller").await;
        let err = env
            .guard
            .validate(None, SELLER_FUNDS + 1, AccountPolicy::Warn)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds(_)), "{err}");
        assert!(env.guard.validate(None, SELLER_FUNDS, AccountPolicy::Warn).await.is_ok());
    }
}

// ─── Abandoned attempts ─────────────────────────────────────

mod cancellation {
    use super::*;

    /// Grants access like the wrapped wallet but never answers a signing prompt.
    struct SilentSigner(MemoryWallet);

    struct SilentHandle(Arc<dyn SigningHandle>);

    #[async_trait]
    impl WalletConnector for SilentSigner {
        async fn enable(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
            Ok(Arc::new(SilentHandle(self.0.enable().await?)))
        }
    }

    #[async_trait]
    impl SigningHandle for SilentHandle {
        async fn used_addresses(&self) -> Result<Vec<String>, WalletError> {
            self.0.used_addresses().await
        }
        async fn unused_addresses(&self) -> Result<Vec<String>, WalletError> {
            self.0.unused_addresses().await
        }
        async fn balance(&self) -> Result<Vec<u8>, WalletError> {
            self.0.balance().await
        }
        async fn network_id(&self) -> Result<u8, WalletError> {
            self.0.network_id().await
        }
        async fn sign_and_submit(&self, _tx: &TxDraft) -> Result<TxId, WalletError> {
            std::future::pending().await
        }
    }

    async fn connect_silent(env: &Env, label: &str) {
        env.guard
            .connect(&SilentSigner(env.ledger.connector(label)), Network::Testnet)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timed_out_lock_can_be_retried() {
        let env = setup();
        connect_silent(&env, "buyer").await;

        let request = env.lock_request("ord-1", Some(Deadline::Seconds(T)));
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            env.orchestrator.lock(&env.guard, request),
        )
        .await;
        assert!(outcome.is_err(), "signing prompt never answers");

        let status = env.orchestrator.order_status("ord-1");
        assert_eq!(status.phase, EscrowPhase::LockFailed);
        assert!(status.last_error.unwrap().is_retryable());
        assert!(env.ledger.submissions().is_empty());

        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Locked);
        assert_eq!(
            env.orchestrator.order_status("ord-1").locked_output,
            Some(receipt.locked_output)
        );
    }

    #[tokio::test]
    async fn timed_out_release_can_be_retried() {
        let env = setup();
        env.connect("buyer").await;
        let receipt = env.lock("ord-1").await;

        connect_silent(&env, "buyer").await;
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            env.orchestrator
                .release(&env.guard, &receipt.locked_output, &env.seller, None),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::SpendFailed);
        assert_eq!(env.orchestrator.find_all().await.unwrap().len(), 1, "still locked");

        env.connect("buyer").await;
        env.orchestrator
            .release(&env.guard, &receipt.locked_output, &env.seller, None)
            .await
            .unwrap();
        assert_eq!(env.orchestrator.order_status("ord-1").phase, EscrowPhase::Released);
    }
}
