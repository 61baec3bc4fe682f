//! In-memory ledger backend
//!
//! Used by tests and single-node development runs. The `DashMap` entry
//! guard serializes all mutation per transaction id, which is what gives
//! the compare-and-set transition its atomicity here.

use super::{BridgeStatus, BridgeTransaction, Ledger, LedgerStats, TransitionUpdate};
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryLedger {
    records: DashMap<String, BridgeTransaction>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert(&self, tx: BridgeTransaction) -> BridgeResult<()> {
        let id = tx.id.clone();
        match self.records.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BridgeError::DuplicateId { id })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn transition(
        &self,
        id: &str,
        expected: BridgeStatus,
        next: BridgeStatus,
        update: TransitionUpdate,
    ) -> BridgeResult<bool> {
        if !expected.can_transition_to(next) {
            return Err(BridgeError::InvalidStateTransition {
                from: expected,
                to: next,
            });
        }

        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })?;

        if record.status != expected {
            return Ok(false);
        }

        record.status = next;
        if let Some(tx_ref) = update.source_tx_ref {
            record.source_tx_ref = Some(tx_ref);
        }
        if let Some(tx_ref) = update.settlement_tx_ref {
            record.settlement_tx_ref = Some(tx_ref);
        }
        if let Some(at) = update.detected_at {
            record.detected_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            record.completed_at = Some(at);
        }
        if let Some(reason) = update.hold_reason {
            record.hold_reason = Some(reason);
        }

        Ok(true)
    }

    async fn set_hold_reason(&self, id: &str, reason: Option<String>) -> BridgeResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })?;
        record.hold_reason = reason;
        Ok(())
    }

    async fn record_settlement_ref(&self, id: &str, tx_ref: &str) -> BridgeResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })?;
        record.settlement_tx_ref = Some(tx_ref.to_string());
        Ok(())
    }

    async fn list_by_status(
        &self,
        statuses: &[BridgeStatus],
    ) -> BridgeResult<Vec<BridgeTransaction>> {
        Ok(self
            .records
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .map(|r| r.clone())
            .collect())
    }

    async fn stats(&self) -> BridgeResult<LedgerStats> {
        let mut stats = LedgerStats::default();
        for record in self.records.iter() {
            match record.status {
                BridgeStatus::Pending => stats.pending += 1,
                BridgeStatus::Detected => stats.detected += 1,
                BridgeStatus::Confirming => stats.confirming += 1,
                BridgeStatus::Settling => stats.settling += 1,
                BridgeStatus::Completed => stats.completed += 1,
                BridgeStatus::Failed => stats.failed += 1,
                BridgeStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> BridgeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::net_amount;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn sample(id: &str) -> BridgeTransaction {
        let amount = Decimal::new(1, 1);
        BridgeTransaction {
            id: id.to_string(),
            user_id: 7,
            chat_id: 7,
            source_amount: amount,
            fee_rate: crate::ledger::FEE_RATE,
            net_amount: net_amount(amount),
            destination_address: "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".to_string(),
            deposit_locus: "0x00000000000000000000000000000000000000aa".to_string(),
            settlement_token: "token".to_string(),
            status: BridgeStatus::Pending,
            hold_reason: None,
            source_tx_ref: None,
            settlement_tx_ref: None,
            created_at: Utc::now(),
            detected_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let ledger = MemoryLedger::new();
        ledger.insert(sample("a")).await.unwrap();
        let err = ledger.insert(sample("a")).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateId { .. }));
    }

    #[tokio::test]
    async fn transition_applies_update_fields() {
        let ledger = MemoryLedger::new();
        ledger.insert(sample("a")).await.unwrap();

        let now = Utc::now();
        let applied = ledger
            .transition(
                "a",
                BridgeStatus::Pending,
                BridgeStatus::Detected,
                TransitionUpdate {
                    source_tx_ref: Some("0xdead".to_string()),
                    detected_at: Some(now),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let record = ledger.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, BridgeStatus::Detected);
        assert_eq!(record.source_tx_ref.as_deref(), Some("0xdead"));
        assert_eq!(record.detected_at, Some(now));
    }

    #[tokio::test]
    async fn stale_transition_is_a_noop() {
        let ledger = MemoryLedger::new();
        ledger.insert(sample("a")).await.unwrap();

        ledger
            .transition(
                "a",
                BridgeStatus::Pending,
                BridgeStatus::Expired,
                TransitionUpdate {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A late deposit sighting must not resurrect the expired record
        let applied = ledger
            .transition(
                "a",
                BridgeStatus::Pending,
                BridgeStatus::Detected,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        assert!(!applied);
        let record = ledger.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, BridgeStatus::Expired);
    }

    #[tokio::test]
    async fn illegal_edge_is_rejected() {
        let ledger = MemoryLedger::new();
        ledger.insert(sample("a")).await.unwrap();

        let err = ledger
            .transition(
                "a",
                BridgeStatus::Pending,
                BridgeStatus::Settling,
                TransitionUpdate::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let ledger = MemoryLedger::new();
        ledger.insert(sample("a")).await.unwrap();
        ledger.insert(sample("b")).await.unwrap();
        ledger
            .transition(
                "b",
                BridgeStatus::Pending,
                BridgeStatus::Detected,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        let pending = ledger.list_by_status(&[BridgeStatus::Pending]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "a");

        let open = ledger
            .list_by_status(&[BridgeStatus::Pending, BridgeStatus::Detected])
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
    }
}
