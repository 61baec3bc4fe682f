//! Session store for in-progress intake conversations
//!
//! One open session per user, last-write-wins. Concurrent messages from
//! the same user serialize through a per-user lock so two rapid replies
//! cannot race a transaction into existence twice. Idle sessions expire.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Which answer the intake flow is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeStep {
    AwaitingAmount,
    AwaitingDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Bridge,
    Swap,
}

impl RequestType {
    pub fn verb(self) -> &'static str {
        match self {
            RequestType::Bridge => "bridge",
            RequestType::Swap => "swap",
        }
    }
}

/// A user's in-progress bridge request
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub user_id: i64,
    pub chat_id: i64,
    pub request_type: RequestType,
    pub step: IntakeStep,
    pub amount: Option<Decimal>,
}

struct Session {
    request: BridgeRequest,
    last_activity: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: DashMap<i64, Session>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: DashMap::new(),
            idle_timeout: Duration::seconds(idle_timeout_secs as i64),
        }
    }

    /// Serialize intake handling per user. Hold the guard across the whole
    /// read-validate-write of one message.
    pub async fn lock_user(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Open a fresh session, replacing any prior one for this user
    pub fn begin(&self, user_id: i64, chat_id: i64, request_type: RequestType) {
        self.sessions.insert(
            user_id,
            Session {
                request: BridgeRequest {
                    user_id,
                    chat_id,
                    request_type,
                    step: IntakeStep::AwaitingAmount,
                    amount: None,
                },
                last_activity: Utc::now(),
            },
        );
    }

    /// The user's open request, if any. Expired sessions are dropped here
    /// so a stale conversation cannot resume mid-flow.
    pub fn current(&self, user_id: i64) -> Option<BridgeRequest> {
        let expired = match self.sessions.get(&user_id) {
            Some(session) => Utc::now() - session.last_activity > self.idle_timeout,
            None => return None,
        };
        if expired {
            self.sessions.remove(&user_id);
            return None;
        }
        self.sessions.get(&user_id).map(|s| s.request.clone())
    }

    /// Store the advanced request and refresh the activity clock
    pub fn update(&self, request: BridgeRequest) {
        self.sessions.insert(
            request.user_id,
            Session {
                request,
                last_activity: Utc::now(),
            },
        );
    }

    pub fn clear(&self, user_id: i64) {
        self.sessions.remove(&user_id);
    }

    /// Drop idle sessions; returns how many were removed
    pub fn sweep_idle(&self) -> usize {
        let cutoff = Utc::now() - self.idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_activity >= cutoff);
        before - self.sessions.len()
    }

    pub fn open_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_overwrites_prior_session() {
        let store = SessionStore::new(900);
        store.begin(1, 10, RequestType::Bridge);

        let mut request = store.current(1).unwrap();
        request.step = IntakeStep::AwaitingDestination;
        request.amount = Some(Decimal::new(1, 1));
        store.update(request);

        store.begin(1, 10, RequestType::Swap);
        let fresh = store.current(1).unwrap();
        assert_eq!(fresh.step, IntakeStep::AwaitingAmount);
        assert_eq!(fresh.amount, None);
        assert_eq!(fresh.request_type, RequestType::Swap);
    }

    #[test]
    fn clear_removes_session() {
        let store = SessionStore::new(900);
        store.begin(1, 10, RequestType::Bridge);
        store.clear(1);
        assert!(store.current(1).is_none());
    }

    #[test]
    fn idle_sessions_expire() {
        // Zero timeout: everything is instantly stale
        let store = SessionStore::new(0);
        store.begin(1, 10, RequestType::Bridge);
        assert!(store.current(1).is_none());

        store.begin(2, 20, RequestType::Bridge);
        let swept = store.sweep_idle();
        assert!(swept >= 1);
        assert_eq!(store.open_count(), 0);
    }

    #[test]
    fn sessions_are_per_user() {
        let store = SessionStore::new(900);
        store.begin(1, 10, RequestType::Bridge);
        store.begin(2, 20, RequestType::Swap);
        assert_eq!(store.open_count(), 2);
        store.clear(1);
        assert!(store.current(2).is_some());
    }
}
