//! Settlement dispatcher
//!
//! Moves confirmed deposits to settled releases on the destination chain,
//! exactly once per transaction. The record is durably in Settling before
//! any submission leaves the process, every release carries the record's
//! idempotency token, and recovery after a crash checks the destination
//! chain for that token before ever resubmitting.

use crate::chain::DestinationChainClient;
use crate::chat::{ChatOutbound, TextFormat};
use crate::config::DispatcherConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{BridgeStatus, BridgeTransaction, Ledger, TransitionUpdate};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

pub struct SettlementDispatcher {
    ledger: Arc<dyn Ledger>,
    destination: Arc<dyn DestinationChainClient>,
    outbound: Arc<dyn ChatOutbound>,
    config: DispatcherConfig,
    shutdown: Arc<RwLock<bool>>,
}

impl SettlementDispatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        destination: Arc<dyn DestinationChainClient>,
        outbound: Arc<dyn ChatOutbound>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            destination,
            outbound,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main dispatch loop
    pub async fn run(&self) -> BridgeResult<()> {
        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs));

        info!("Settlement dispatcher started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            poll.tick().await;

            if let Err(e) = self.poll_once().await {
                error!("Dispatcher cycle failed: {}", e);
            }
        }

        info!("Settlement dispatcher stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// One dispatch pass: enter settlement for newly confirmed records,
    /// then advance records already settling.
    pub async fn poll_once(&self) -> BridgeResult<()> {
        let concurrency = self.config.max_concurrent.max(1);

        let confirming = self
            .ledger
            .list_by_status(&[BridgeStatus::Confirming])
            .await?;
        let mut entering = stream::iter(confirming.into_iter().map(|tx| self.begin_settlement(tx)))
            .buffer_unordered(concurrency);
        while let Some(result) = entering.next().await {
            if let Err(e) = result {
                warn!("Dispatcher record error: {}", e);
            }
        }

        let settling = self.ledger.list_by_status(&[BridgeStatus::Settling]).await?;
        let mut advancing = stream::iter(settling.into_iter().map(|tx| self.advance_settlement(tx)))
            .buffer_unordered(concurrency);
        while let Some(result) = advancing.next().await {
            if let Err(e) = result {
                warn!("Dispatcher record error: {}", e);
            }
        }

        Ok(())
    }

    /// Durably record Settling, then submit. The compare-and-set means a
    /// concurrent dispatcher (or one racing a crash-restart) takes this
    /// record at most once.
    async fn begin_settlement(&self, tx: BridgeTransaction) -> BridgeResult<()> {
        let applied = self
            .ledger
            .transition(
                &tx.id,
                BridgeStatus::Confirming,
                BridgeStatus::Settling,
                TransitionUpdate::default(),
            )
            .await?;

        if !applied {
            return Ok(());
        }

        debug!("Entering settlement for {}", tx.id);
        self.ensure_submitted(&tx).await
    }

    async fn advance_settlement(&self, tx: BridgeTransaction) -> BridgeResult<()> {
        let rpc_timeout = Duration::from_secs(self.config.rpc_timeout_secs);

        let Some(tx_ref) = tx.settlement_tx_ref.clone() else {
            // Interrupted before the submission was recorded
            return self.ensure_submitted(&tx).await;
        };

        let confirmations = match timeout(rpc_timeout, self.destination.confirmations(&tx_ref)).await
        {
            Ok(Ok(confirmations)) => confirmations,
            Ok(Err(e)) if e.is_retryable() => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Release confirmation poll timed out for {}", tx.id);
                return Ok(());
            }
        };

        if confirmations < self.config.confirmation_depth {
            return Ok(());
        }

        let applied = self
            .ledger
            .transition(
                &tx.id,
                BridgeStatus::Settling,
                BridgeStatus::Completed,
                TransitionUpdate {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if applied {
            info!("Transaction {} completed: release {}", tx.id, tx_ref);
            crate::metrics::record_settlement_completed();
            self.notify(
                tx.chat_id,
                &format!(
                    "Transaction {} complete. {} released to {}.",
                    tx.id, tx.net_amount, tx.destination_address
                ),
            )
            .await;
        }

        Ok(())
    }

    /// Submit the release unless one already exists for this record's
    /// idempotency token.
    async fn ensure_submitted(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        let rpc_timeout = Duration::from_secs(self.config.rpc_timeout_secs);

        // Recovery: a prior run may have submitted and died before
        // recording the reference.
        match timeout(rpc_timeout, self.destination.find_release(&tx.settlement_token)).await {
            Ok(Ok(Some(existing))) => {
                info!("Recovered release {} for {}", existing, tx.id);
                self.ledger.record_settlement_ref(&tx.id, &existing).await?;
                return Ok(());
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) if e.is_retryable() => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        }

        let mut attempt = 0;
        while attempt < self.config.max_retries {
            attempt += 1;

            let submitted = timeout(
                rpc_timeout,
                self.destination.submit_release(
                    &tx.destination_address,
                    tx.net_amount,
                    &tx.settlement_token,
                ),
            )
            .await;

            match submitted {
                Ok(Ok(tx_ref)) => {
                    info!(
                        "Release submitted for {}: {} (attempt {}/{})",
                        tx.id, tx_ref, attempt, self.config.max_retries
                    );
                    self.ledger.record_settlement_ref(&tx.id, &tx_ref).await?;
                    crate::metrics::record_settlement_submitted();
                    return Ok(());
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("Retryable submission error for {}: {}", tx.id, e);
                }
                Ok(Err(e)) => {
                    return self.fail_settlement(tx, e).await;
                }
                Err(_) => {
                    warn!(
                        "Release submission timed out for {} (attempt {})",
                        tx.id, attempt
                    );
                }
            }

            if attempt < self.config.max_retries {
                sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        // Stay in Settling; the next cycle runs the token check again
        warn!("Submission attempts exhausted for {}, retrying next cycle", tx.id);
        Ok(())
    }

    /// Permanent rejection: terminal Failed, flagged for the refund
    /// workflow, user told with the reference id.
    async fn fail_settlement(&self, tx: &BridgeTransaction, cause: BridgeError) -> BridgeResult<()> {
        error!("Settlement permanently failed for {}: {}", tx.id, cause);

        let applied = self
            .ledger
            .transition(
                &tx.id,
                BridgeStatus::Settling,
                BridgeStatus::Failed,
                TransitionUpdate {
                    completed_at: Some(Utc::now()),
                    hold_reason: Some(format!("refund review: {}", cause)),
                    ..Default::default()
                },
            )
            .await?;

        if applied {
            crate::metrics::record_settlement_failed();
            self.notify(
                tx.chat_id,
                &format!(
                    "Transaction {} failed during settlement. Your deposit is held \
                     for refund review. Reference: {}",
                    tx.id, tx.id
                ),
            )
            .await;
        }

        Ok(())
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
