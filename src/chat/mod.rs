//! Chat transport boundary and command routing
//!
//! The bridge never talks to a concrete messaging platform. Inbound
//! messages arrive through [`ChatTransport`], replies and notifications
//! leave through [`ChatOutbound`], and commands are dispatched through a
//! typed registry rather than pattern-matched text.

pub mod console;

pub use console::ConsoleTransport;

use crate::bridge::LifecycleEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::intake::IntakeHandler;
use crate::ledger::FEE_RATE;
use crate::session::RequestType;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, warn};

/// An inbound message tagged with user and chat identity
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: i64,
    pub chat_id: i64,
    pub text: String,
}

/// Formatting hint for outbound text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

/// Outbound half of the transport; also used by background tasks to
/// notify users of terminal transitions
#[async_trait]
pub trait ChatOutbound: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str, format: TextFormat)
        -> BridgeResult<()>;
}

/// Full transport: a stream of inbound messages plus the outbound half
#[async_trait]
pub trait ChatTransport: ChatOutbound {
    /// Next inbound message; `None` when the transport has closed
    async fn next_message(&self) -> Option<InboundMessage>;
}

/// The commands the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Bridge,
    Swap,
    Status,
    Rates,
    Help,
    Cancel,
}

impl Command {
    /// Parse a leading slash-command and its argument, if any
    pub fn parse(text: &str) -> Option<(Command, Option<&str>)> {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let name = parts.next()?;
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        let command = match name {
            "/start" => Command::Start,
            "/bridge" => Command::Bridge,
            "/swap" => Command::Swap,
            "/status" => Command::Status,
            "/rates" => Command::Rates,
            "/help" => Command::Help,
            "/cancel" => Command::Cancel,
            _ => return None,
        };
        Some((command, arg))
    }
}

/// Routes inbound messages to the intake flow and status queries
pub struct ChatRouter {
    intake: Arc<IntakeHandler>,
    engine: Arc<LifecycleEngine>,
    outbound: Arc<dyn ChatOutbound>,
}

impl ChatRouter {
    pub fn new(
        intake: Arc<IntakeHandler>,
        engine: Arc<LifecycleEngine>,
        outbound: Arc<dyn ChatOutbound>,
    ) -> Self {
        Self {
            intake,
            engine,
            outbound,
        }
    }

    /// Consume the transport until it closes
    pub async fn run<T: ChatTransport>(&self, transport: Arc<T>) {
        while let Some(message) = transport.next_message().await {
            if let Err(e) = self.dispatch(message).await {
                error!("Error dispatching chat message: {}", e);
            }
        }
    }

    pub async fn dispatch(&self, message: InboundMessage) -> BridgeResult<()> {
        let reply = match Command::parse(&message.text) {
            Some((command, arg)) => Some(self.handle_command(&message, command, arg).await?),
            None if message.text.trim_start().starts_with('/') => {
                // Unknown command
                Some("Unknown command. Try /help.".to_string())
            }
            None => {
                self.intake
                    .handle_text(message.user_id, message.chat_id, &message.text)
                    .await?
            }
        };

        if let Some(text) = reply {
            self.outbound
                .send_message(message.chat_id, &text, TextFormat::Plain)
                .await?;
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        message: &InboundMessage,
        command: Command,
        arg: Option<&str>,
    ) -> BridgeResult<String> {
        match command {
            Command::Start | Command::Help => Ok(help_text()),
            Command::Rates => Ok(rates_text()),
            Command::Bridge => {
                Ok(self
                    .intake
                    .start(message.user_id, message.chat_id, RequestType::Bridge)
                    .await)
            }
            Command::Swap => {
                Ok(self
                    .intake
                    .start(message.user_id, message.chat_id, RequestType::Swap)
                    .await)
            }
            Command::Cancel => Ok(self.intake.cancel(message.user_id).await),
            Command::Status => {
                let Some(id) = arg else {
                    return Ok("Usage: /status <transaction id>".to_string());
                };
                match self.engine.status(id).await {
                    Ok(tx) => Ok(format_status(&tx)),
                    Err(BridgeError::NotFound { .. }) => {
                        Ok("Transaction not found.".to_string())
                    }
                    Err(e) => {
                        warn!("Status query failed for {}: {}", id, e);
                        Err(e)
                    }
                }
            }
        }
    }
}

fn help_text() -> String {
    "Welcome to the Conduit bridge.\n\n\
     Commands:\n\
     /bridge - move value to the destination chain\n\
     /swap - swap instantly\n\
     /status <id> - check a transaction\n\
     /rates - current fee\n\
     /cancel - abandon the current request\n\
     /help - show this menu"
        .to_string()
}

fn rates_text() -> String {
    format!(
        "Flat fee: {}% of the bridged amount. No other charges.",
        (FEE_RATE * Decimal::ONE_HUNDRED).normalize()
    )
}

fn format_status(tx: &crate::ledger::BridgeTransaction) -> String {
    let mut lines = vec![
        "Transaction status".to_string(),
        format!("ID: {}", tx.id),
        format!("Status: {}", tx.status),
        format!("Amount: {}", tx.source_amount),
        format!("You receive: {}", tx.net_amount),
        format!("Started: {}", tx.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
    ];
    if let Some(at) = tx.detected_at {
        lines.push(format!("Deposit seen: {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if let Some(at) = tx.completed_at {
        lines.push(format!("Finished: {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if let Some(reason) = &tx.hold_reason {
        lines.push(format!("On hold: {}", reason));
    }
    lines.join("\n")
}
