//! Request/response correlation for the engine control channel.
//!
//! Every request sent to the engine carries a fresh [`TransactionId`]. The
//! caller parks on a oneshot receiver registered in [`PendingTransactions`];
//! the connection reader resolves exactly that entry when a response with the
//! same id arrives, in whatever order responses come back.

use crate::errors::EngineError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Length of generated transaction identifiers.
pub const TRANSACTION_ID_LEN: usize = 24;

/// Result delivered to a parked request.
pub type TransactionResult = Result<Value, EngineError>;

/// Correlation identifier for one engine request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a random alphanumeric identifier.
    #[must_use]
    pub fn new() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TRANSACTION_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table of outstanding requests awaiting a response.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    inner: Mutex<HashMap<TransactionId, oneshot::Sender<TransactionResult>>>,
}

impl PendingTransactions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transaction and return the receiver its response lands on.
    pub async fn register(&self, id: TransactionId) -> oneshot::Receiver<TransactionResult> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id, tx);
        rx
    }

    /// Resolve a transaction. Returns false when no such transaction is pending
    /// (late response after a timeout, or an id we never issued).
    pub async fn resolve(&self, id: &TransactionId, result: TransactionResult) -> bool {
        let sender = self.inner.lock().await.remove(id);
        match sender {
            Some(tx) => {
                // Receiver may have been dropped by a cancelled caller.
                let _ = tx.send(result);
                true
            }
            None => {
                debug!(
                    target: "relay.engine.connection",
                    transaction_id = %id,
                    "Discarding response for unknown transaction"
                );
                false
            }
        }
    }

    /// Forget a transaction without resolving it.
    pub async fn cancel(&self, id: &TransactionId) {
        self.inner.lock().await.remove(id);
    }

    /// Fail every outstanding transaction with the same error.
    pub async fn fail_all(&self, err: &EngineError) -> usize {
        let drained: Vec<_> = self.inner.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    /// Number of outstanding transactions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
