//! Intake conversation handler
//!
//! Turns raw user text into validated request fields, one step per
//! message, and hands completed requests to the lifecycle engine.

use crate::bridge::LifecycleEngine;
use crate::config::IntakeConfig;
use crate::error::{BridgeResult, ValidationError};
use crate::ledger::FEE_RATE;
use crate::session::{BridgeRequest, IntakeStep, RequestType, SessionStore};

use ethers::types::Address;
use ethers::utils::to_checksum;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// Parse and range-check an amount answer
pub fn validate_amount(input: &str, limits: &IntakeConfig) -> Result<Decimal, ValidationError> {
    let amount: Decimal = input
        .trim()
        .parse()
        .map_err(|_| ValidationError::ParseError)?;

    if amount < limits.min_amount || amount > limits.max_amount {
        return Err(ValidationError::OutOfRange {
            min: limits.min_amount,
            max: limits.max_amount,
        });
    }

    Ok(amount)
}

/// Structural and checksum validation of a destination address.
/// All-lowercase and all-uppercase forms carry no checksum and pass on
/// structure alone; mixed case must match EIP-55 exactly.
pub fn validate_destination(input: &str) -> Result<String, ValidationError> {
    let raw = input.trim();
    let parsed: Address = raw.parse().map_err(|_| ValidationError::InvalidAddress)?;

    let body = raw.strip_prefix("0x").unwrap_or(raw);
    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        let checksummed = to_checksum(&parsed, None);
        let normalized = if raw.starts_with("0x") {
            raw.to_string()
        } else {
            format!("0x{}", raw)
        };
        if checksummed != normalized {
            return Err(ValidationError::InvalidAddress);
        }
    }

    Ok(to_checksum(&parsed, None))
}

pub struct IntakeHandler {
    sessions: Arc<SessionStore>,
    engine: Arc<LifecycleEngine>,
    limits: IntakeConfig,
}

impl IntakeHandler {
    pub fn new(
        sessions: Arc<SessionStore>,
        engine: Arc<LifecycleEngine>,
        limits: IntakeConfig,
    ) -> Self {
        Self {
            sessions,
            engine,
            limits,
        }
    }

    /// Open a fresh intake session and return the opening prompt
    pub async fn start(&self, user_id: i64, chat_id: i64, request_type: RequestType) -> String {
        let _guard = self.sessions.lock_user(user_id).await;
        self.sessions.begin(user_id, chat_id, request_type);

        format!(
            "{} initiated.\n\nEnter the amount to {}:\n\
             minimum {}, maximum {}, fee {}%\n\nExample: 0.1",
            match request_type {
                RequestType::Bridge => "Bridge",
                RequestType::Swap => "Swap",
            },
            request_type.verb(),
            self.limits.min_amount,
            self.limits.max_amount,
            (FEE_RATE * Decimal::ONE_HUNDRED).normalize(),
        )
    }

    /// Abandon the open session, if any
    pub async fn cancel(&self, user_id: i64) -> String {
        let _guard = self.sessions.lock_user(user_id).await;
        if self.sessions.current(user_id).is_some() {
            self.sessions.clear(user_id);
            "Request cancelled.".to_string()
        } else {
            "Nothing to cancel.".to_string()
        }
    }

    /// Advance the open session with one message. Returns `None` when the
    /// user has no session (plain text outside intake is ignored).
    pub async fn handle_text(
        &self,
        user_id: i64,
        chat_id: i64,
        text: &str,
    ) -> BridgeResult<Option<String>> {
        let _guard = self.sessions.lock_user(user_id).await;

        let Some(mut request) = self.sessions.current(user_id) else {
            return Ok(None);
        };

        match request.step {
            IntakeStep::AwaitingAmount => match validate_amount(text, &self.limits) {
                Ok(amount) => {
                    request.amount = Some(amount);
                    request.step = IntakeStep::AwaitingDestination;
                    self.sessions.update(request);
                    Ok(Some(
                        "Enter your destination address:".to_string(),
                    ))
                }
                Err(e) => Ok(Some(format!("Invalid amount: {}. Try again.", e))),
            },
            IntakeStep::AwaitingDestination => match validate_destination(text) {
                Ok(destination) => {
                    let amount = request.amount.ok_or_else(|| {
                        crate::error::BridgeError::Internal(
                            "destination step without amount".to_string(),
                        )
                    })?;

                    let tx = self
                        .engine
                        .open_transaction(user_id, chat_id, amount, destination)
                        .await?;
                    self.sessions.clear(user_id);

                    info!("Intake complete for user {}: {}", user_id, tx.id);

                    Ok(Some(format!(
                        "Ready for deposit.\n\nSend exactly {} to:\n{}\n\n\
                         Amount: {}\nFee: {}\nYou receive: {}\nTransaction ID: {}\n\n\
                         Processing starts once your deposit is observed.\n\
                         Check progress with /status {}",
                        tx.source_amount,
                        tx.deposit_locus,
                        tx.source_amount,
                        tx.source_amount * tx.fee_rate,
                        tx.net_amount,
                        tx.id,
                        tx.id,
                    )))
                }
                Err(e) => Ok(Some(format!("{}. Try again.", e))),
            },
        }
    }
}
