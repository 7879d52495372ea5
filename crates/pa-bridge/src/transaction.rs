//! Transaction registry
//!
//! Correlates outgoing helper requests with their responses by id.
//! The registry never times anything out itself; callers race
//! `PendingTransaction::wait` against their own deadline and call
//! `expire` when it fires.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Diagnostic tag describing what a transaction is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    Message,
    Chat,
    Handle,
    Attachment,
    FindMy,
    Other,
}

/// Completion state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionState {
    Pending,
    Resolved,
    Rejected,
    TimedOut,
}

/// A request awaiting exactly one response
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub created_at: DateTime<Utc>,
    pub state: TransactionState,
}

impl Transaction {
    /// Create a pending transaction with a fresh id
    pub fn new(kind: TransactionKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    /// Create a pending transaction with a known id
    pub fn with_id(id: impl Into<String>, kind: TransactionKind) -> Self {
        Self {
            id: id.into(),
            kind,
            created_at: Utc::now(),
            state: TransactionState::Pending,
        }
    }

    fn age_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }
}

type Outcome = std::result::Result<Value, String>;

struct Entry {
    transaction: Transaction,
    tx: oneshot::Sender<Outcome>,
}

/// Caller-side handle for a registered transaction
#[derive(Debug)]
pub struct PendingTransaction {
    id: String,
    kind: TransactionKind,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingTransaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Wait for the helper's response
    ///
    /// Resolves with the response payload, or fails with the helper's error
    /// message. If the entry is expired or discarded the wait ends with
    /// `TransactionDropped`.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(message)) => Err(BridgeError::Remote(message)),
            Err(_) => Err(BridgeError::TransactionDropped(self.id)),
        }
    }
}

/// Pending transactions, keyed by id
///
/// Holds a handful of entries at a time, so lookups are linear.
#[derive(Default)]
pub struct TransactionRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending transaction
    ///
    /// Returns `None` (and logs) if a transaction with the same id is
    /// already registered.
    pub fn add(&self, transaction: Transaction) -> Option<PendingTransaction> {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.transaction.id == transaction.id) {
            warn!("Refusing duplicate transaction id: {}", transaction.id);
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingTransaction {
            id: transaction.id.clone(),
            kind: transaction.kind,
            rx,
        };
        debug!(
            "Registered {:?} transaction {}",
            transaction.kind, transaction.id
        );
        entries.push(Entry { transaction, tx });
        Some(pending)
    }

    /// Position of a pending transaction
    pub fn find_index(&self, id: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.transaction.id == id)
    }

    /// Complete a transaction with the helper's payload
    ///
    /// Returns `false` if the transaction already completed.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        self.complete(id, TransactionState::Resolved, Some(Ok(payload)))
    }

    /// Fail a transaction with an error message
    pub fn reject(&self, id: &str, error: impl Into<String>) -> bool {
        self.complete(id, TransactionState::Rejected, Some(Err(error.into())))
    }

    /// Mark a transaction timed out; later responses are ignored
    pub fn expire(&self, id: &str) -> bool {
        self.complete(id, TransactionState::TimedOut, None)
    }

    /// Drop a transaction whose request never reached the helper
    pub fn discard(&self, id: &str) -> bool {
        let mut entries = self.entries();
        match entries.iter().position(|e| e.transaction.id == id) {
            Some(index) => {
                entries.remove(index);
                debug!("Discarded transaction {}", id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn complete(&self, id: &str, state: TransactionState, outcome: Option<Outcome>) -> bool {
        let entry = {
            let mut entries = self.entries();
            match entries.iter().position(|e| e.transaction.id == id) {
                Some(index) => entries.remove(index),
                None => {
                    debug!("No pending transaction {} (ignoring {:?})", id, state);
                    return false;
                }
            }
        };

        let Entry {
            mut transaction,
            tx,
        } = entry;
        transaction.state = state;
        debug!(
            "{:?} transaction {} {:?} after {}ms",
            transaction.kind,
            transaction.id,
            transaction.state,
            transaction.age_ms()
        );

        if let Some(outcome) = outcome {
            if tx.send(outcome).is_err() {
                debug!("Caller for transaction {} is no longer waiting", id);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_wakes_caller() {
        let registry = TransactionRegistry::new();
        let pending = registry
            .add(Transaction::with_id("abc", TransactionKind::Message))
            .unwrap();

        assert!(registry.resolve("abc", json!({"guid": "m1"})));
        assert_eq!(pending.wait().await.unwrap(), json!({"guid": "m1"}));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reject_wakes_caller_with_error() {
        let registry = TransactionRegistry::new();
        let pending = registry
            .add(Transaction::with_id("abc", TransactionKind::Chat))
            .unwrap();

        assert!(registry.reject("abc", "boom"));
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let registry = TransactionRegistry::new();
        let pending = registry
            .add(Transaction::with_id("abc", TransactionKind::Handle))
            .unwrap();

        assert!(registry.resolve("abc", json!(1)));
        assert!(!registry.resolve("abc", json!(2)));
        assert!(!registry.reject("abc", "late"));
        assert_eq!(pending.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_resolve_after_expire_is_noop() {
        let registry = TransactionRegistry::new();
        let pending = registry
            .add(Transaction::with_id("abc", TransactionKind::FindMy))
            .unwrap();

        assert!(registry.expire("abc"));
        assert!(!registry.resolve("abc", json!({})));
        assert!(matches!(
            pending.wait().await,
            Err(BridgeError::TransactionDropped(_))
        ));
    }

    #[test]
    fn test_duplicate_id_refused() {
        let registry = TransactionRegistry::new();
        let _first = registry
            .add(Transaction::with_id("dup", TransactionKind::Other))
            .unwrap();

        assert!(registry.add(Transaction::with_id("dup", TransactionKind::Other)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_index() {
        let registry = TransactionRegistry::new();
        let _a = registry.add(Transaction::with_id("a", TransactionKind::Other));
        let _b = registry.add(Transaction::with_id("b", TransactionKind::Other));

        assert_eq!(registry.find_index("a"), Some(0));
        assert_eq!(registry.find_index("b"), Some(1));
        assert_eq!(registry.find_index("c"), None);
    }

    #[test]
    fn test_resolve_after_caller_gave_up() {
        let registry = TransactionRegistry::new();
        let pending = registry
            .add(Transaction::new(TransactionKind::Attachment))
            .unwrap();
        let id = pending.id().to_string();
        drop(pending);

        assert!(registry.resolve(&id, json!({})));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discard() {
        let registry = TransactionRegistry::new();
        let _pending = registry.add(Transaction::with_id("x", TransactionKind::Chat));

        assert!(registry.discard("x"));
        assert!(!registry.discard("x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolution_from_sync_context() {
        let registry = TransactionRegistry::new();
        let ok = registry.add(Transaction::with_id("ok", TransactionKind::Message)).unwrap();
        let failed = registry.add(Transaction::with_id("err", TransactionKind::Message)).unwrap();

        registry.resolve("ok", json!({"guid": "m2"}));
        registry.reject("err", "Chat not found");

        let value = tokio_test::assert_ok!(tokio_test::block_on(ok.wait()));
        assert_eq!(value["guid"], "m2");
        tokio_test::assert_err!(tokio_test::block_on(failed.wait()));
    }

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = Transaction::new(TransactionKind::Message);
        let b = Transaction::new(TransactionKind::Message);
        assert_ne!(a.id, b.id);
        assert_eq!(a.state, TransactionState::Pending);
    }
}
