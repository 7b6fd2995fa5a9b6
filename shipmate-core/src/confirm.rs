//! Confirmation broker — pending-action tokens with TTL and redeem-once
//! semantics.
//!
//! Side-effectful actions (deploys, rollbacks, whitelisted commands flagged
//! for confirmation) park their payload here and hand the user a short
//! token. Execution proceeds only when the token is redeemed before expiry.
//! Tokens are single-use: the first redeem consumes them.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ConfirmError;

/// Chat-safe token alphabet: no vowels, so tokens never spell words, and
/// no characters that chat clients linkify or split on. 32 symbols gives
/// 5 bits per character.
const TOKEN_ALPHABET: &[u8] = b"23456789bcdfghjkmnpqrstvwxzBCDFG";

/// Token length. 10 characters x 5 bits = 50 bits of entropy.
const TOKEN_LEN: usize = 10;

/// A parked action awaiting confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub token: String,
    /// Discriminator for the redeemer, e.g. "deploy", "rollback", "command".
    pub kind: String,
    /// Opaque payload the creator stashes and the redeemer interprets.
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub created_by: String,
}

/// Broker holding pending confirmations. Thread-safe.
#[derive(Debug, Default)]
pub struct ConfirmationBroker {
    pending: Mutex<HashMap<String, PendingConfirmation>>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a payload and return its token.
    pub fn create_pending(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
        expires_in: Duration,
        created_by: impl Into<String>,
    ) -> String {
        let token = generate_token();
        let pending = PendingConfirmation {
            token: token.clone(),
            kind: kind.into(),
            payload,
            expires_at: Utc::now() + expires_in,
            created_by: created_by.into(),
        };
        self.pending
            .lock()
            .expect("confirmation lock poisoned")
            .insert(token.clone(), pending);
        token
    }

    /// Redeem a token, consuming it.
    ///
    /// Returns the parked confirmation on success. A token that was never
    /// issued (or already redeemed) yields [`ConfirmError::NotFound`]; a
    /// token past its TTL yields [`ConfirmError::Expired`] and is discarded.
    pub fn redeem(&self, token: &str, actor: &str) -> Result<PendingConfirmation, ConfirmError> {
        let mut pending = self.pending.lock().expect("confirmation lock poisoned");
        let confirmation = pending.remove(token).ok_or(ConfirmError::NotFound)?;
        if confirmation.expires_at <= Utc::now() {
            tracing::debug!(token, actor, "redeem attempt on expired token");
            return Err(ConfirmError::Expired);
        }
        tracing::debug!(token, actor, kind = %confirmation.kind, "confirmation redeemed");
        Ok(confirmation)
    }

    /// Cancel a pending token. Returns the parked confirmation if it existed.
    pub fn cancel(&self, token: &str) -> Option<PendingConfirmation> {
        self.pending
            .lock()
            .expect("confirmation lock poisoned")
            .remove(token)
    }

    /// Discard every expired token. Returns how many were swept.
    pub fn sweep(&self) -> usize {
        let mut pending = self.pending.lock().expect("confirmation lock poisoned");
        let now = Utc::now();
        let before = pending.len();
        pending.retain(|_, c| c.expires_at > now);
        before - pending.len()
    }

    /// Number of live pending confirmations.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("confirmation lock poisoned").len()
    }
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_token(ttl: Duration) -> (ConfirmationBroker, String) {
        let broker = ConfirmationBroker::new();
        let token = broker.create_pending(
            "deploy",
            serde_json::json!({"target": "aws-clawd-bot"}),
            ttl,
            "u1",
        );
        (broker, token)
    }

    #[test]
    fn test_redeem_once() {
        let (broker, token) = broker_with_token(Duration::minutes(5));

        let first = broker.redeem(&token, "u1").unwrap();
        assert_eq!(first.kind, "deploy");
        assert_eq!(first.payload["target"], "aws-clawd-bot");

        // Second redeem must see NotFound, not the payload again.
        assert!(matches!(
            broker.redeem(&token, "u1"),
            Err(ConfirmError::NotFound)
        ));
    }

    #[test]
    fn test_expired_token() {
        let (broker, token) = broker_with_token(Duration::milliseconds(-1));
        assert!(matches!(
            broker.redeem(&token, "u1"),
            Err(ConfirmError::Expired)
        ));
        // Consumed either way.
        assert!(matches!(
            broker.redeem(&token, "u1"),
            Err(ConfirmError::NotFound)
        ));
    }

    #[test]
    fn test_unknown_token() {
        let broker = ConfirmationBroker::new();
        assert!(matches!(
            broker.redeem("nope", "u1"),
            Err(ConfirmError::NotFound)
        ));
    }

    #[test]
    fn test_cancel() {
        let (broker, token) = broker_with_token(Duration::minutes(5));
        assert!(broker.cancel(&token).is_some());
        assert!(matches!(
            broker.redeem(&token, "u1"),
            Err(ConfirmError::NotFound)
        ));
    }

    #[test]
    fn test_sweep_discards_only_expired() {
        let broker = ConfirmationBroker::new();
        broker.create_pending("a", serde_json::Value::Null, Duration::minutes(5), "u");
        broker.create_pending("b", serde_json::Value::Null, Duration::milliseconds(-1), "u");
        assert_eq!(broker.pending_count(), 2);
        assert_eq!(broker.sweep(), 1);
        assert_eq!(broker.pending_count(), 1);
    }

    #[test]
    fn test_tokens_are_chat_safe_and_distinct() {
        let broker = ConfirmationBroker::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let t = broker.create_pending("k", serde_json::Value::Null, Duration::minutes(1), "u");
            assert_eq!(t.len(), TOKEN_LEN);
            assert!(t.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
            seen.insert(t);
        }
        assert_eq!(seen.len(), 64);
    }
}
