//! Transaction ledger - the single source of truth for lifecycle state
//!
//! Every bridge transaction lives here from creation to terminal state.
//! Backends implement the [`Ledger`] trait: an in-memory store for tests
//! and development, and PostgreSQL for production. All state transitions
//! go through compare-and-set on the prior status so concurrent watcher
//! and dispatcher tasks cannot interleave on a stale record.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use crate::error::BridgeResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flat fee retained by the bridge, fixed at 0.1%
pub const FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Net payout after the bridge fee. Computed once at creation and stored;
/// never recomputed after settlement begins.
pub fn net_amount(source_amount: Decimal) -> Decimal {
    source_amount * (Decimal::ONE - FEE_RATE)
}

/// Lifecycle states of a bridge transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    /// Ledger entry exists, deposit locus published, nothing observed yet
    Pending,
    /// A matching payment was sighted below the confirmation threshold
    Detected,
    /// The deposit reached the configured source-chain confirmation depth
    Confirming,
    /// Destination release submitted or being retried
    Settling,
    /// Destination release confirmed; terminal
    Completed,
    /// Unrecoverable error; terminal
    Failed,
    /// No deposit observed within the expiry window; terminal
    Expired,
}

impl BridgeStatus {
    pub const ALL: [BridgeStatus; 7] = [
        BridgeStatus::Pending,
        BridgeStatus::Detected,
        BridgeStatus::Confirming,
        BridgeStatus::Settling,
        BridgeStatus::Completed,
        BridgeStatus::Failed,
        BridgeStatus::Expired,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BridgeStatus::Completed | BridgeStatus::Failed | BridgeStatus::Expired
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Forward-only along Pending -> Detected -> Confirming -> Settling ->
    /// Completed. Failed and Expired are reachable from any non-terminal
    /// state. The single permitted backward edge is the reorg revert
    /// Confirming -> Detected.
    pub fn can_transition_to(self, next: BridgeStatus) -> bool {
        use BridgeStatus::*;
        match (self, next) {
            (Pending, Detected) => true,
            (Detected, Confirming) => true,
            (Confirming, Settling) => true,
            (Settling, Completed) => true,
            // Reorg dropped the deposit below the confirmation threshold
            (Confirming, Detected) => true,
            (from, Failed | Expired) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStatus::Pending => "pending",
            BridgeStatus::Detected => "detected",
            BridgeStatus::Confirming => "confirming",
            BridgeStatus::Settling => "settling",
            BridgeStatus::Completed => "completed",
            BridgeStatus::Failed => "failed",
            BridgeStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BridgeStatus::Pending),
            "detected" => Ok(BridgeStatus::Detected),
            "confirming" => Ok(BridgeStatus::Confirming),
            "settling" => Ok(BridgeStatus::Settling),
            "completed" => Ok(BridgeStatus::Completed),
            "failed" => Ok(BridgeStatus::Failed),
            "expired" => Ok(BridgeStatus::Expired),
            other => Err(format!("unknown bridge status: {}", other)),
        }
    }
}

/// A durable bridge transaction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub source_amount: Decimal,
    pub fee_rate: Decimal,
    pub net_amount: Decimal,
    pub destination_address: String,
    pub deposit_locus: String,
    /// Idempotency token carried by the destination release
    pub settlement_token: String,
    pub status: BridgeStatus,
    /// Set when the record needs manual review (amount mismatch, refund)
    pub hold_reason: Option<String>,
    pub source_tx_ref: Option<String>,
    pub settlement_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub detected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields optionally stamped alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub source_tx_ref: Option<String>,
    pub settlement_tx_ref: Option<String>,
    pub detected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub hold_reason: Option<String>,
}

/// Per-status record counts, for the stats endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub pending: u64,
    pub detected: u64,
    pub confirming: u64,
    pub settling: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
}

/// Storage abstraction over bridge transaction records
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a freshly created record. Fails on duplicate id.
    async fn insert(&self, tx: BridgeTransaction) -> BridgeResult<()>;

    /// Fetch a record by id
    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>>;

    /// Compare-and-set status transition.
    ///
    /// Returns `Ok(true)` if the record was in `expected` and moved to
    /// `next` with `update` applied; `Ok(false)` if the record has since
    /// moved on (the caller's view was stale - a no-op, never an error).
    /// An edge the state machine forbids is rejected outright.
    async fn transition(
        &self,
        id: &str,
        expected: BridgeStatus,
        next: BridgeStatus,
        update: TransitionUpdate,
    ) -> BridgeResult<bool>;

    /// Flag or clear the manual-review hold on a record
    async fn set_hold_reason(&self, id: &str, reason: Option<String>) -> BridgeResult<()>;

    /// Record the destination-chain reference of a submitted release
    async fn record_settlement_ref(&self, id: &str, tx_ref: &str) -> BridgeResult<()>;

    /// All records currently in one of the given states
    async fn list_by_status(
        &self,
        statuses: &[BridgeStatus],
    ) -> BridgeResult<Vec<BridgeTransaction>>;

    /// Per-status record counts
    async fn stats(&self) -> BridgeResult<LedgerStats>;

    /// Health check
    async fn health_check(&self) -> BridgeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_math_is_exact() {
        let amount = Decimal::new(1, 1); // 0.1
        assert_eq!(net_amount(amount), Decimal::new(999, 4)); // 0.0999
        assert_eq!(amount * FEE_RATE, Decimal::new(1, 4)); // 0.0001
    }

    #[test]
    fn forward_transitions_allowed() {
        use BridgeStatus::*;
        assert!(Pending.can_transition_to(Detected));
        assert!(Detected.can_transition_to(Confirming));
        assert!(Confirming.can_transition_to(Settling));
        assert!(Settling.can_transition_to(Completed));
    }

    #[test]
    fn backward_transitions_rejected_except_reorg_revert() {
        use BridgeStatus::*;
        assert!(Confirming.can_transition_to(Detected));
        assert!(!Detected.can_transition_to(Pending));
        assert!(!Settling.can_transition_to(Confirming));
        assert!(!Completed.can_transition_to(Settling));
        assert!(!Pending.can_transition_to(Confirming)); // no skipping
    }

    #[test]
    fn terminal_states_are_absorbing() {
        use BridgeStatus::*;
        for terminal in [Completed, Failed, Expired] {
            for next in BridgeStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn failure_and_expiry_reachable_from_any_open_state() {
        use BridgeStatus::*;
        for open in [Pending, Detected, Confirming, Settling] {
            assert!(open.can_transition_to(Failed));
            assert!(open.can_transition_to(Expired));
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in BridgeStatus::ALL {
            assert_eq!(status.as_str().parse::<BridgeStatus>().unwrap(), status);
        }
    }
}
