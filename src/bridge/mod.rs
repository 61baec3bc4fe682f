//! Bridge lifecycle orchestration
//!
//! The engine owns transaction creation, status queries, and expiry; the
//! watcher drives Pending -> Detected -> Confirming off source-chain
//! observations; the dispatcher drives Confirming -> Settling ->
//! Completed | Failed on the destination chain. All three mutate records
//! only through compare-and-set ledger transitions.

pub mod dispatcher;
pub mod engine;
pub mod watcher;

pub use dispatcher::SettlementDispatcher;
pub use engine::{mint_transaction_id, LifecycleEngine};
pub use watcher::DepositWatcher;
