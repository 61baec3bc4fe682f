//! Bridge lifecycle engine

use crate::chain::DepositLocusIssuer;
use crate::chat::{ChatOutbound, TextFormat};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{
    net_amount, BridgeStatus, BridgeTransaction, Ledger, TransitionUpdate, FEE_RATE,
};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Mint a collision-resistant transaction id
pub fn mint_transaction_id() -> String {
    format!("BR-{}", Uuid::new_v4().simple())
}

/// Orchestrates transaction creation, status queries, and expiry
pub struct LifecycleEngine {
    ledger: Arc<dyn Ledger>,
    issuer: Arc<dyn DepositLocusIssuer>,
    outbound: Arc<dyn ChatOutbound>,
    config: BridgeConfig,
    shutdown: Arc<RwLock<bool>>,
}

impl LifecycleEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        issuer: Arc<dyn DepositLocusIssuer>,
        outbound: Arc<dyn ChatOutbound>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            ledger,
            issuer,
            outbound,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Open a new bridge transaction from a completed intake.
    ///
    /// Issues a fresh deposit locus, mints the id and the settlement
    /// idempotency token, computes the net payout once, and records the
    /// transaction as Pending.
    pub async fn open_transaction(
        &self,
        user_id: i64,
        chat_id: i64,
        source_amount: Decimal,
        destination_address: String,
    ) -> BridgeResult<BridgeTransaction> {
        let deposit_locus = self.issuer.issue_deposit_locus().await?;

        let tx = BridgeTransaction {
            id: mint_transaction_id(),
            user_id,
            chat_id,
            source_amount,
            fee_rate: FEE_RATE,
            net_amount: net_amount(source_amount),
            destination_address,
            deposit_locus,
            settlement_token: Uuid::new_v4().simple().to_string(),
            status: BridgeStatus::Pending,
            hold_reason: None,
            source_tx_ref: None,
            settlement_tx_ref: None,
            created_at: Utc::now(),
            detected_at: None,
            completed_at: None,
        };

        self.ledger.insert(tx.clone()).await?;
        crate::metrics::record_transaction_opened();

        info!(
            "Opened transaction {} for user {}: {} to {}",
            tx.id, user_id, tx.source_amount, tx.destination_address
        );

        Ok(tx)
    }

    /// Status snapshot for a transaction id. Never mutates.
    pub async fn status(&self, id: &str) -> BridgeResult<BridgeTransaction> {
        self.ledger
            .get(id)
            .await?
            .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })
    }

    /// Expire Pending transactions with no observed deposit inside the
    /// window. Safe against in-flight watcher work: the compare-and-set
    /// from Pending means a record that was detected meanwhile is left
    /// alone, and a late sighting cannot resurrect an expired record.
    pub async fn expire_stale(&self) -> BridgeResult<usize> {
        let window = Duration::seconds(self.config.expiry_window_secs as i64);
        let cutoff = Utc::now() - window;

        let pending = self.ledger.list_by_status(&[BridgeStatus::Pending]).await?;
        let mut expired = 0;

        for tx in pending {
            if tx.created_at >= cutoff {
                continue;
            }

            let applied = self
                .ledger
                .transition(
                    &tx.id,
                    BridgeStatus::Pending,
                    BridgeStatus::Expired,
                    TransitionUpdate {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;

            if applied {
                expired += 1;
                crate::metrics::record_transaction_expired();
                warn!("Transaction {} expired with no deposit", tx.id);
                self.notify(
                    tx.chat_id,
                    &format!(
                        "Transaction {} expired: no deposit was observed in time. \
                         Start over with /bridge.",
                        tx.id
                    ),
                )
                .await;
            }
        }

        Ok(expired)
    }

    /// Periodic expiry sweep
    pub async fn run(&self) -> BridgeResult<()> {
        let mut sweep = interval(std::time::Duration::from_secs(
            self.config.expiry_sweep_interval_secs,
        ));

        info!("Lifecycle engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            sweep.tick().await;

            if let Err(e) = self.expire_stale().await {
                error!("Expiry sweep failed: {}", e);
            }
        }

        info!("Lifecycle engine stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(e) = self
            .outbound
            .send_message(chat_id, text, TextFormat::Plain)
            .await
        {
            warn!("Failed to notify chat {}: {}", chat_id, e);
        }
    }
}
