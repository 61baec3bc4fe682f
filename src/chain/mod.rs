//! Chain boundary - the traits the bridge drives chains through
//!
//! The lifecycle engine, deposit watcher, and settlement dispatcher only
//! ever see these traits. EVM-backed implementations live in [`evm`];
//! tests substitute in-memory fakes.

pub mod evm;

pub use evm::{EvmDestinationClient, EvmLocusIssuer, EvmProvider, EvmSourceClient};

use crate::error::BridgeResult;

use async_trait::async_trait;
use rust_decimal::Decimal;

/// A payment observed at a deposit locus
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSighting {
    pub amount: Decimal,
    pub confirmations: u64,
    pub tx_ref: String,
}

/// Read side of the source chain
#[async_trait]
pub trait SourceChainClient: Send + Sync {
    /// All payments currently visible at the given deposit locus
    async fn payments_to(&self, locus: &str) -> BridgeResult<Vec<PaymentSighting>>;
}

/// Write side of the destination chain
#[async_trait]
pub trait DestinationChainClient: Send + Sync {
    /// Submit a release of `amount` to `address`, tagged with the caller's
    /// idempotency `token`. Returns the chain reference of the submission.
    async fn submit_release(
        &self,
        address: &str,
        amount: Decimal,
        token: &str,
    ) -> BridgeResult<String>;

    /// Confirmation depth of a previously submitted release
    async fn confirmations(&self, tx_ref: &str) -> BridgeResult<u64>;

    /// Look up a release previously submitted with `token`, if any.
    /// Lets a restarted dispatcher recover instead of double-paying.
    async fn find_release(&self, token: &str) -> BridgeResult<Option<String>>;
}

/// Issues a fresh, unused deposit locus per transaction
#[async_trait]
pub trait DepositLocusIssuer: Send + Sync {
    async fn issue_deposit_locus(&self) -> BridgeResult<String>;
}
