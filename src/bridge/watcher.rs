//! Deposit watcher
//!
//! Periodically scans the source chain for payments into the deposit loci
//! of open transactions. Only exact-amount matches advance a record; a
//! mismatched deposit parks it for manual review. Confirmation depth is
//! re-validated every cycle so a reorg walks Confirming back to Detected.

use crate::chain::SourceChainClient;
use crate::config::WatcherConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{BridgeStatus, BridgeTransaction, Ledger, TransitionUpdate};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

pub struct DepositWatcher {
    ledger: Arc<dyn Ledger>,
    source: Arc<dyn SourceChainClient>,
    config: WatcherConfig,
    shutdown: Arc<RwLock<bool>>,
}

impl DepositWatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        source: Arc<dyn SourceChainClient>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            ledger,
            source,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main polling loop
    pub async fn run(&self) -> BridgeResult<()> {
        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs));

        info!("Deposit watcher started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            poll.tick().await;

            if let Err(e) = self.poll_once().await {
                error!("Watcher cycle failed: {}", e);
            }
        }

        info!("Deposit watcher stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// One scan over all open records. Per-record work runs with bounded
    /// concurrency so a stuck RPC call cannot stall the batch.
    pub async fn poll_once(&self) -> BridgeResult<()> {
        let timer = crate::metrics::WATCH_CYCLE_SECONDS.start_timer();

        let open = self
            .ledger
            .list_by_status(&[
                BridgeStatus::Pending,
                BridgeStatus::Detected,
                BridgeStatus::Confirming,
            ])
            .await?;

        let mut results = stream::iter(open.into_iter().map(|tx| self.check_record(tx)))
            .buffer_unordered(self.config.max_concurrent.max(1));

        while let Some(result) = results.next().await {
            if let Err(e) = result {
                warn!("Watcher record error: {}", e);
            }
        }

        timer.observe_duration();
        Ok(())
    }

    async fn check_record(&self, tx: BridgeTransaction) -> BridgeResult<()> {
        let rpc_timeout = Duration::from_secs(self.config.rpc_timeout_secs);

        let sightings = match timeout(rpc_timeout, self.source.payments_to(&tx.deposit_locus)).await
        {
            Ok(Ok(sightings)) => sightings,
            Ok(Err(e)) if e.is_retryable() => {
                debug!("Transient scan error for {}: {}", tx.id, e);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Deposit scan timed out for {}", tx.id);
                return Ok(());
            }
        };

        let exact = sightings.iter().find(|s| s.amount == tx.source_amount);

        match (tx.status, exact) {
            (BridgeStatus::Pending, Some(sighting)) => {
                let applied = self
                    .ledger
                    .transition(
                        &tx.id,
                        BridgeStatus::Pending,
                        BridgeStatus::Detected,
                        TransitionUpdate {
                            source_tx_ref: Some(sighting.tx_ref.clone()),
                            detected_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;

                if applied {
                    info!(
                        "Deposit detected for {}: {} ({} confirmations)",
                        tx.id, sighting.tx_ref, sighting.confirmations
                    );
                    crate::metrics::record_deposit_detected();

                    if sighting.confirmations >= self.config.confirmation_depth {
                        self.promote_to_confirming(&tx.id).await?;
                    }
                }
            }

            (BridgeStatus::Pending, None) => {
                // A deposit of the wrong amount never advances the record;
                // it parks it for manual review instead.
                if let Some(stray) = sightings.first() {
                    if tx.hold_reason.is_none() {
                        let mismatch = BridgeError::AmountMismatch {
                            id: tx.id.clone(),
                            expected: tx.source_amount,
                            actual: stray.amount,
                        };
                        warn!("{}", mismatch);
                        self.ledger
                            .set_hold_reason(&tx.id, Some(mismatch.to_string()))
                            .await?;
                        crate::metrics::record_amount_mismatch();
                    }
                }
            }

            (BridgeStatus::Detected, Some(sighting)) => {
                if sighting.confirmations >= self.config.confirmation_depth {
                    self.promote_to_confirming(&tx.id).await?;
                }
            }

            (BridgeStatus::Confirming, Some(sighting))
                if sighting.confirmations < self.config.confirmation_depth =>
            {
                self.revert_to_detected(&tx).await?;
            }

            (BridgeStatus::Confirming, None) => {
                // The deposit vanished from our view entirely
                self.revert_to_detected(&tx).await?;
            }

            // Re-scanning an already up-to-date record is a no-op
            _ => {}
        }

        Ok(())
    }

    async fn promote_to_confirming(&self, id: &str) -> BridgeResult<()> {
        let applied = self
            .ledger
            .transition(
                id,
                BridgeStatus::Detected,
                BridgeStatus::Confirming,
                TransitionUpdate::default(),
            )
            .await?;

        if applied {
            info!("Deposit confirmed for {}", id);
            crate::metrics::record_deposit_confirmed();
        }
        Ok(())
    }

    async fn revert_to_detected(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        let applied = self
            .ledger
            .transition(
                &tx.id,
                BridgeStatus::Confirming,
                BridgeStatus::Detected,
                TransitionUpdate::default(),
            )
            .await?;

        if applied {
            warn!(
                "Reorg: deposit for {} fell below confirmation depth, reverting",
                tx.id
            );
            crate::metrics::record_reorg_revert();
        }
        Ok(())
    }
}
