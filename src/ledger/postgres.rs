//! PostgreSQL ledger backend

use super::{BridgeStatus, BridgeTransaction, Ledger, LedgerStats, TransitionUpdate};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect to the database
    pub async fn connect(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(BridgeError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transactions (
                id TEXT PRIMARY KEY,
                user_id BIGINT NOT NULL,
                chat_id BIGINT NOT NULL,
                source_amount NUMERIC NOT NULL,
                fee_rate NUMERIC NOT NULL,
                net_amount NUMERIC NOT NULL,
                destination_address TEXT NOT NULL,
                deposit_locus TEXT NOT NULL,
                settlement_token TEXT NOT NULL,
                status VARCHAR(20) NOT NULL,
                hold_reason TEXT,
                source_tx_ref TEXT,
                settlement_tx_ref TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                detected_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_transactions_status
            ON bridge_transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_transactions_user
            ON bridge_transactions (user_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn map_row(row: PgRow) -> BridgeResult<BridgeTransaction> {
        let status_str: String = row.get("status");
        let status = status_str
            .parse::<BridgeStatus>()
            .map_err(BridgeError::Internal)?;

        Ok(BridgeTransaction {
            id: row.get("id"),
            user_id: row.get("user_id"),
            chat_id: row.get("chat_id"),
            source_amount: row.get::<Decimal, _>("source_amount"),
            fee_rate: row.get::<Decimal, _>("fee_rate"),
            net_amount: row.get::<Decimal, _>("net_amount"),
            destination_address: row.get("destination_address"),
            deposit_locus: row.get("deposit_locus"),
            settlement_token: row.get("settlement_token"),
            status,
            hold_reason: row.get("hold_reason"),
            source_tx_ref: row.get("source_tx_ref"),
            settlement_tx_ref: row.get("settlement_tx_ref"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            detected_at: row.get::<Option<DateTime<Utc>>, _>("detected_at"),
            completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
        })
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert(&self, tx: BridgeTransaction) -> BridgeResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO bridge_transactions
                (id, user_id, chat_id, source_amount, fee_rate, net_amount,
                 destination_address, deposit_locus, settlement_token, status,
                 hold_reason, source_tx_ref, settlement_tx_ref,
                 created_at, detected_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&tx.id)
        .bind(tx.user_id)
        .bind(tx.chat_id)
        .bind(tx.source_amount)
        .bind(tx.fee_rate)
        .bind(tx.net_amount)
        .bind(&tx.destination_address)
        .bind(&tx.deposit_locus)
        .bind(&tx.settlement_token)
        .bind(tx.status.as_str())
        .bind(&tx.hold_reason)
        .bind(&tx.source_tx_ref)
        .bind(&tx.settlement_tx_ref)
        .bind(tx.created_at)
        .bind(tx.detected_at)
        .bind(tx.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::DuplicateId { id: tx.id });
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>> {
        let row = sqlx::query("SELECT * FROM bridge_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::map_row).transpose()
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

        // The status guard in the WHERE clause is the compare-and-set:
        // a stale caller updates zero rows.
        let result = sqlx::query(
            r#"
            UPDATE bridge_transactions
            SET status = $3,
                source_tx_ref = COALESCE($4, source_tx_ref),
                settlement_tx_ref = COALESCE($5, settlement_tx_ref),
                detected_at = COALESCE($6, detected_at),
                completed_at = COALESCE($7, completed_at),
                hold_reason = COALESCE($8, hold_reason)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(&update.source_tx_ref)
        .bind(&update.settlement_tx_ref)
        .bind(update.detected_at)
        .bind(update.completed_at)
        .bind(&update.hold_reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish stale-status from missing record
            let exists = sqlx::query("SELECT 1 FROM bridge_transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(BridgeError::NotFound { id: id.to_string() });
            }
            debug!("Stale transition for {}: {} -> {}", id, expected, next);
            return Ok(false);
        }

        Ok(true)
    }

    async fn set_hold_reason(&self, id: &str, reason: Option<String>) -> BridgeResult<()> {
        let result = sqlx::query("UPDATE bridge_transactions SET hold_reason = $2 WHERE id = $1")
            .bind(id)
            .bind(&reason)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn record_settlement_ref(&self, id: &str, tx_ref: &str) -> BridgeResult<()> {
        let result =
            sqlx::query("UPDATE bridge_transactions SET settlement_tx_ref = $2 WHERE id = $1")
                .bind(id)
                .bind(tx_ref)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn list_by_status(
        &self,
        statuses: &[BridgeStatus],
    ) -> BridgeResult<Vec<BridgeTransaction>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_transactions
            WHERE status = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn stats(&self) -> BridgeResult<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'detected') as detected,
                COUNT(*) FILTER (WHERE status = 'confirming') as confirming,
                COUNT(*) FILTER (WHERE status = 'settling') as settling,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'expired') as expired
            FROM bridge_transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            pending: row.get::<i64, _>("pending") as u64,
            detected: row.get::<i64, _>("detected") as u64,
            confirming: row.get::<i64, _>("confirming") as u64,
            settling: row.get::<i64, _>("settling") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            expired: row.get::<i64, _>("expired") as u64,
        })
    }

    async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(BridgeError::Database)?;
        Ok(())
    }
}
