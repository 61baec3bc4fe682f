//! Console transport for local operation
//!
//! Reads inbound messages line-by-line from stdin and prints replies to
//! stdout. Every line is attributed to a single operator identity.

use super::{ChatOutbound, ChatTransport, InboundMessage, TextFormat};
use crate::error::BridgeResult;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

const OPERATOR_ID: i64 = 0;

pub struct ConsoleTransport {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatOutbound for ConsoleTransport {
    async fn send_message(
        &self,
        _chat_id: i64,
        text: &str,
        _format: TextFormat,
    ) -> BridgeResult<()> {
        println!("{}\n", text);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn next_message(&self) -> Option<InboundMessage> {
        let mut lines = self.lines.lock().await;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(InboundMessage {
                        user_id: OPERATOR_ID,
                        chat_id: OPERATOR_ID,
                        text: line,
                    });
                }
                Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }
}
