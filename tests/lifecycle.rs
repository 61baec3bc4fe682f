//! End-to-end lifecycle tests against fake chain clients
//!
//! Drives the real intake handler, watcher, dispatcher, and engine over
//! the in-memory ledger, with the chain boundary faked.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use conduit_bridge::bridge::{DepositWatcher, LifecycleEngine, SettlementDispatcher};
use conduit_bridge::chain::{
    DepositLocusIssuer, DestinationChainClient, PaymentSighting, SourceChainClient,
};
use conduit_bridge::chat::{ChatOutbound, TextFormat};
use conduit_bridge::config::{BridgeConfig, DispatcherConfig, IntakeConfig, WatcherConfig};
use conduit_bridge::error::{BridgeError, BridgeResult};
use conduit_bridge::intake::IntakeHandler;
use conduit_bridge::ledger::{
    BridgeStatus, BridgeTransaction, Ledger, MemoryLedger, TransitionUpdate,
};
use conduit_bridge::session::{RequestType, SessionStore};

const DEST_ADDR: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

#[derive(Default)]
struct FakeSource {
    payments: Mutex<HashMap<String, Vec<PaymentSighting>>>,
}

impl FakeSource {
    async fn deposit(&self, locus: &str, amount: Decimal, confirmations: u64) {
        let mut payments = self.payments.lock().await;
        let entries = payments.entry(locus.to_string()).or_default();
        let tx_ref = format!("0xdep{:04x}", entries.len());
        entries.push(PaymentSighting {
            amount,
            confirmations,
            tx_ref,
        });
    }

    async fn set_confirmations(&self, locus: &str, confirmations: u64) {
        if let Some(entries) = self.payments.lock().await.get_mut(locus) {
            for entry in entries {
                entry.confirmations = confirmations;
            }
        }
    }
}

#[async_trait]
impl SourceChainClient for FakeSource {
    async fn payments_to(&self, locus: &str) -> BridgeResult<Vec<PaymentSighting>> {
        Ok(self
            .payments
            .lock()
            .await
            .get(locus)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeDestination {
    /// token -> tx_ref, releases visible on the fake chain
    releases: Mutex<HashMap<String, String>>,
    /// (address, amount, token) per submit_release call
    submitted: Mutex<Vec<(String, Decimal, String)>>,
    confirmations: Mutex<HashMap<String, u64>>,
    fail_permanently: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl FakeDestination {
    async fn submission_count(&self) -> usize {
        self.submitted.lock().await.len()
    }

    async fn confirm(&self, tx_ref: &str, confirmations: u64) {
        self.confirmations
            .lock()
            .await
            .insert(tx_ref.to_string(), confirmations);
    }

    async fn preload_release(&self, token: &str, tx_ref: &str) {
        self.releases
            .lock()
            .await
            .insert(token.to_string(), tx_ref.to_string());
    }

    async fn reject_permanently(&self, reason: &str) {
        *self.fail_permanently.lock().await = Some(reason.to_string());
    }
}

#[async_trait]
impl DestinationChainClient for FakeDestination {
    async fn submit_release(
        &self,
        address: &str,
        amount: Decimal,
        token: &str,
    ) -> BridgeResult<String> {
        if let Some(reason) = self.fail_permanently.lock().await.clone() {
            return Err(BridgeError::PermanentSettlement {
                id: String::new(),
                reason,
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let tx_ref = format!("0xrel{:04x}", n);
        self.releases
            .lock()
            .await
            .insert(token.to_string(), tx_ref.clone());
        self.submitted
            .lock()
            .await
            .push((address.to_string(), amount, token.to_string()));
        Ok(tx_ref)
    }

    async fn confirmations(&self, tx_ref: &str) -> BridgeResult<u64> {
        Ok(*self.confirmations.lock().await.get(tx_ref).unwrap_or(&0))
    }

    async fn find_release(&self, token: &str) -> BridgeResult<Option<String>> {
        Ok(self.releases.lock().await.get(token).cloned())
    }
}

#[derive(Default)]
struct FakeIssuer {
    counter: AtomicU64,
}

#[async_trait]
impl DepositLocusIssuer for FakeIssuer {
    async fn issue_deposit_locus(&self) -> BridgeResult<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("0x{:040x}", 0xaa00 + n))
    }
}

#[derive(Default)]
struct RecordingOutbound {
    messages: Mutex<Vec<(i64, String)>>,
}

impl RecordingOutbound {
    async fn messages_to(&self, chat_id: i64) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatOutbound for RecordingOutbound {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _format: TextFormat,
    ) -> BridgeResult<()> {
        self.messages
            .lock()
            .await
            .push((chat_id, text.to_string()));
        Ok(())
    }
}

struct World {
    ledger: Arc<MemoryLedger>,
    source: Arc<FakeSource>,
    destination: Arc<FakeDestination>,
    outbound: Arc<RecordingOutbound>,
    sessions: Arc<SessionStore>,
    intake: Arc<IntakeHandler>,
    engine: Arc<LifecycleEngine>,
    watcher: DepositWatcher,
    dispatcher: SettlementDispatcher,
}

fn world(confirmation_depth: u64, expiry_window_secs: u64) -> World {
    let ledger = Arc::new(MemoryLedger::new());
    let dyn_ledger: Arc<dyn Ledger> = ledger.clone();

    let source = Arc::new(FakeSource::default());
    let destination = Arc::new(FakeDestination::default());
    let outbound = Arc::new(RecordingOutbound::default());
    let issuer: Arc<dyn DepositLocusIssuer> = Arc::new(FakeIssuer::default());

    let engine = Arc::new(LifecycleEngine::new(
        dyn_ledger.clone(),
        issuer,
        outbound.clone(),
        BridgeConfig {
            instance_id: "test".to_string(),
            expiry_window_secs,
            expiry_sweep_interval_secs: 60,
            session_idle_timeout_secs: 900,
            session_sweep_interval_secs: 60,
            health_check_interval_secs: 30,
        },
    ));

    let sessions = Arc::new(SessionStore::new(900));
    let intake = Arc::new(IntakeHandler::new(
        sessions.clone(),
        engine.clone(),
        IntakeConfig {
            min_amount: Decimal::new(1, 3),
            max_amount: Decimal::ONE,
        },
    ));

    let watcher = DepositWatcher::new(
        dyn_ledger.clone(),
        source.clone(),
        WatcherConfig {
            poll_interval_secs: 1,
            confirmation_depth,
            rpc_timeout_secs: 5,
            max_concurrent: 4,
        },
    );
    let dispatcher = SettlementDispatcher::new(
        dyn_ledger,
        destination.clone(),
        outbound.clone(),
        DispatcherConfig {
            poll_interval_secs: 1,
            confirmation_depth,
            rpc_timeout_secs: 5,
            max_retries: 3,
            retry_delay_ms: 10,
            max_concurrent: 4,
        },
    );

    World {
        ledger,
        source,
        destination,
        outbound,
        sessions,
        intake,
        engine,
        watcher,
        dispatcher,
    }
}

impl World {
    async fn status_of(&self, id: &str) -> BridgeStatus {
        self.ledger.get(id).await.unwrap().unwrap().status
    }

    async fn record(&self, id: &str) -> BridgeTransaction {
        self.ledger.get(id).await.unwrap().unwrap()
    }

    /// Walk a fresh transaction to Confirming via the real watcher
    async fn open_confirmed(&self, amount: Decimal) -> BridgeTransaction {
        let tx = self
            .engine
            .open_transaction(1, 10, amount, DEST_ADDR.to_string())
            .await
            .unwrap();
        self.source.deposit(&tx.deposit_locus, amount, 99).await;
        self.watcher.poll_once().await.unwrap();
        assert_eq!(self.status_of(&tx.id).await, BridgeStatus::Confirming);
        self.record(&tx.id).await
    }
}

#[tokio::test]
async fn intake_to_completed_settlement() {
    let w = world(2, 3600);
    let amount = Decimal::new(1, 1); // 0.1

    // Conversational intake
    w.intake.start(7, 70, RequestType::Bridge).await;
    let prompt = w.intake.handle_text(7, 70, "0.1").await.unwrap().unwrap();
    assert!(prompt.contains("destination"));

    let receipt = w.intake.handle_text(7, 70, DEST_ADDR).await.unwrap().unwrap();
    assert!(receipt.contains("0.0999"), "net amount shown: {}", receipt);
    assert!(w.sessions.current(7).is_none(), "session cleared");

    let pending = w
        .ledger
        .list_by_status(&[BridgeStatus::Pending])
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let tx = pending[0].clone();
    assert_eq!(tx.net_amount, Decimal::new(999, 4));
    assert_eq!(tx.source_amount, amount);

    // Exact deposit appears unconfirmed
    w.source.deposit(&tx.deposit_locus, amount, 0).await;
    w.watcher.poll_once().await.unwrap();
    let detected = w.record(&tx.id).await;
    assert_eq!(detected.status, BridgeStatus::Detected);
    assert!(detected.source_tx_ref.is_some());
    assert!(detected.detected_at.is_some());

    // Deposit reaches confirmation depth
    w.source.set_confirmations(&tx.deposit_locus, 2).await;
    w.watcher.poll_once().await.unwrap();
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Confirming);

    // Dispatcher submits the release exactly once
    w.dispatcher.poll_once().await.unwrap();
    let settling = w.record(&tx.id).await;
    assert_eq!(settling.status, BridgeStatus::Settling);
    assert_eq!(w.destination.submission_count().await, 1);

    let submitted = w.destination.submitted.lock().await.clone();
    assert_eq!(submitted[0].0, DEST_ADDR);
    assert_eq!(submitted[0].1, Decimal::new(999, 4)); // net, not gross

    // Release confirms on the destination chain
    let tx_ref = settling.settlement_tx_ref.unwrap();
    w.destination.confirm(&tx_ref, 2).await;
    w.dispatcher.poll_once().await.unwrap();

    let completed = w.record(&tx.id).await;
    assert_eq!(completed.status, BridgeStatus::Completed);
    assert!(completed.completed_at.is_some());

    // Further cycles are no-ops
    w.watcher.poll_once().await.unwrap();
    w.dispatcher.poll_once().await.unwrap();
    assert_eq!(w.destination.submission_count().await, 1);
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Completed);

    let notices = w.outbound.messages_to(10).await;
    assert!(notices.iter().any(|m| m.contains("complete")));
}

#[tokio::test]
async fn mismatched_deposit_holds_pending_and_never_settles() {
    let w = world(2, 3600);
    let tx = w
        .engine
        .open_transaction(1, 10, Decimal::new(1, 1), DEST_ADDR.to_string())
        .await
        .unwrap();

    // 0.05 arrives where 0.1 was expected
    w.source
        .deposit(&tx.deposit_locus, Decimal::new(5, 2), 10)
        .await;
    w.watcher.poll_once().await.unwrap();

    let held = w.record(&tx.id).await;
    assert_eq!(held.status, BridgeStatus::Pending);
    let reason = held.hold_reason.expect("flagged for review");
    assert!(reason.contains("mismatch"));

    w.dispatcher.poll_once().await.unwrap();
    assert_eq!(w.destination.submission_count().await, 0);
}

#[tokio::test]
async fn repeated_dispatch_submits_at_most_once() {
    let w = world(2, 3600);
    let tx = w.open_confirmed(Decimal::new(2, 1)).await;

    for _ in 0..5 {
        w.dispatcher.poll_once().await.unwrap();
    }

    assert_eq!(w.destination.submission_count().await, 1);
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Settling);
}

#[tokio::test]
async fn restart_recovers_submission_by_token() {
    let w = world(2, 3600);
    let tx = w.open_confirmed(Decimal::new(3, 1)).await;

    // Simulate a crash after entering Settling but before the submission
    // reference was recorded - while the release did land on chain.
    let entered = w
        .ledger
        .transition(
            &tx.id,
            BridgeStatus::Confirming,
            BridgeStatus::Settling,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();
    assert!(entered);
    w.destination
        .preload_release(&tx.settlement_token, "0xpriorrun")
        .await;

    w.dispatcher.poll_once().await.unwrap();

    let recovered = w.record(&tx.id).await;
    assert_eq!(recovered.settlement_tx_ref.as_deref(), Some("0xpriorrun"));
    assert_eq!(w.destination.submission_count().await, 0, "no double pay");

    // And it still completes normally
    w.destination.confirm("0xpriorrun", 2).await;
    w.dispatcher.poll_once().await.unwrap();
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Completed);
}

#[tokio::test]
async fn permanent_rejection_fails_with_refund_hold() {
    let w = world(2, 3600);
    let tx = w.open_confirmed(Decimal::new(1, 1)).await;
    w.destination.reject_permanently("insufficient liquidity").await;

    w.dispatcher.poll_once().await.unwrap();

    let failed = w.record(&tx.id).await;
    assert_eq!(failed.status, BridgeStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(failed.hold_reason.unwrap().contains("refund"));

    let notices = w.outbound.messages_to(10).await;
    assert!(notices.iter().any(|m| m.contains(&tx.id)), "reference id sent");
}

#[tokio::test]
async fn reorg_reverts_confirming_until_depth_returns() {
    let w = world(2, 3600);
    let tx = w.open_confirmed(Decimal::new(1, 1)).await;

    // Reorg drops the deposit below depth
    w.source.set_confirmations(&tx.deposit_locus, 1).await;
    w.watcher.poll_once().await.unwrap();
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Detected);

    // Chain recovers
    w.source.set_confirmations(&tx.deposit_locus, 3).await;
    w.watcher.poll_once().await.unwrap();
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Confirming);
}

#[tokio::test]
async fn expired_transaction_cannot_be_resurrected() {
    let w = world(2, 0); // everything expires immediately
    let amount = Decimal::new(1, 1);
    let tx = w
        .engine
        .open_transaction(1, 10, amount, DEST_ADDR.to_string())
        .await
        .unwrap();

    let expired = w.engine.expire_stale().await.unwrap();
    assert_eq!(expired, 1);
    let record = w.record(&tx.id).await;
    assert_eq!(record.status, BridgeStatus::Expired);
    assert!(record.completed_at.is_some());

    // A late deposit must not bring it back
    w.source.deposit(&tx.deposit_locus, amount, 10).await;
    w.watcher.poll_once().await.unwrap();
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Expired);

    let notices = w.outbound.messages_to(10).await;
    assert!(notices.iter().any(|m| m.contains("expired")));
}

#[tokio::test]
async fn status_query_for_unknown_id_is_not_found() {
    let w = world(2, 3600);
    let err = w.engine.status("BR-doesnotexist").await.unwrap_err();
    assert!(matches!(err, BridgeError::NotFound { .. }));
}

#[tokio::test]
async fn expiry_sweep_leaves_fresh_transactions_alone() {
    let w = world(2, 3600);
    let tx = w
        .engine
        .open_transaction(1, 10, Decimal::new(1, 1), DEST_ADDR.to_string())
        .await
        .unwrap();

    assert_eq!(w.engine.expire_stale().await.unwrap(), 0);
    assert_eq!(w.status_of(&tx.id).await, BridgeStatus::Pending);
}
