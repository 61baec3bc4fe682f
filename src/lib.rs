//! Conduit - cross-chain value-transfer coordinator
//!
//! Accepts a user's request to move value between chains through a
//! conversational intake flow, issues a per-transaction deposit locus,
//! watches the source chain for the matching payment, and settles the net
//! amount on the destination chain exactly once.

pub mod api;
pub mod bridge;
pub mod chain;
pub mod chat;
pub mod config;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod metrics;
pub mod session;
