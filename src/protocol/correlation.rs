//! # Correlation Table
//!
//! Matches response envelopes back to the requests that are waiting for them.
//!
//! A caller registers the request `id` before sending, which yields a
//! [`PendingResponse`]. When a response with a matching `correlationId`
//! arrives, [`CorrelationTable::resolve`] removes the entry and completes the
//! waiter. Because the entry is removed first, a second response for the same
//! id finds nothing and is ignored.
//!
//! A pending request ends in exactly one of three ways: resolved, timed out
//! (`RESPONSE_TIMEOUT`), or cancelled. Dropping the [`PendingResponse`] also
//! removes its entry, so late responses for abandoned requests are no-ops.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::pipeline::result::ErrorCode;

use super::message::Envelope;

type Completion = oneshot::Sender<CorrelationResult<Envelope>>;

#[derive(Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<DashMap<String, Completion>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id as awaiting a response.
    ///
    /// # Errors
    ///
    /// * `CorrelationError::DuplicateId` - another request with this id is
    ///   still pending
    pub fn register(&self, id: &str) -> CorrelationResult<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(CorrelationError::DuplicateId { id: id.to_string() });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        Ok(PendingResponse {
            id: id.to_string(),
            receiver: rx,
            pending: self.pending.clone(),
        })
    }

    /// Completes the request named by the envelope's `correlationId`.
    ///
    /// Returns `false` when nothing was waiting: unknown id, already resolved,
    /// timed out, cancelled, or the envelope is not a response.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
            return false;
        };
        match self.pending.remove(&correlation_id) {
            Some((_, completion)) => {
                // The waiter may have just given up; that is fine.
                let _ = completion.send(Ok(envelope));
                true
            }
            None => {
                debug!(
                    "ignoring {} for unknown or settled request {}",
                    envelope.kind(),
                    correlation_id
                );
                false
            }
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some((_, completion)) => {
                let _ = completion.send(Err(CorrelationError::Cancelled { id: id.to_string() }));
                true
            }
            None => false,
        }
    }

    /// Fails every pending request with `Shutdown`. Returns how many there were.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, completion)) = self.pending.remove(&id) {
                let _ = completion.send(Err(CorrelationError::Shutdown {
                    reason: reason.to_string(),
                }));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("cancelled {} pending requests: {}", cancelled, reason);
        }
        cancelled
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Waiter half of a registered request.
pub struct PendingResponse {
    id: String,
    receiver: oneshot::Receiver<CorrelationResult<Envelope>>,
    pending: Arc<DashMap<String, Completion>>,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }

    #[instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub async fn wait(mut self, timeout: Duration) -> CorrelationResult<Envelope> {
        tokio::select! {
            received = &mut self.receiver => match received {
                Ok(outcome) => outcome,
                Err(_) => Err(CorrelationError::Cancelled { id: self.id.clone() }),
            },
            _ = tokio::time::sleep(timeout) => {
                debug!("request {} timed out after {:?}", self.id, timeout);
                Err(CorrelationError::Timeout {
                    id: self.id.clone(),
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorrelationError {
    #[error("no response to {id} within {after:?}")]
    Timeout { id: String, after: Duration },
    #[error("request {id} was cancelled")]
    Cancelled { id: String },
    #[error("bridge shut down: {reason}")]
    Shutdown { reason: String },
    #[error("request id already pending: {id}")]
    DuplicateId { id: String },
}

impl CorrelationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CorrelationError::Timeout { .. } => ErrorCode::ResponseTimeout,
            CorrelationError::Shutdown { .. } => ErrorCode::NotInitialized,
            CorrelationError::Cancelled { .. } | CorrelationError::DuplicateId { .. } => {
                ErrorCode::ExecutionError
            }
        }
    }
}

pub type CorrelationResult<T> = Result<T, CorrelationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::result::{CallMeta, CallResult};
    use crate::protocol::message::ResultMessage;
    use serde_json::json;

    fn response(correlation_id: &str, data: i64) -> Envelope {
        Envelope::FunctionResult(ResultMessage::new(
            correlation_id,
            CallResult::ok(json!(data), CallMeta::instant()),
        ))
    }

    #[tokio::test]
    async fn test_resolve_completes_waiter() {
        let table = CorrelationTable::new();
        let pending = table.register("r1").unwrap();
        assert!(table.resolve(response("r1", 1)));
        let envelope = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(envelope.correlation_id(), Some("r1"));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let table = CorrelationTable::new();
        let pending = table.register("r1").unwrap();
        assert!(table.resolve(response("r1", 1)));
        assert!(!table.resolve(response("r1", 2)));

        let envelope = pending.wait(Duration::from_secs(1)).await.unwrap();
        let data = envelope.into_call_result().unwrap().data;
        assert_eq!(data, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let table = CorrelationTable::new();
        let first = table.register("first").unwrap();
        let second = table.register("second").unwrap();
        assert!(table.resolve(response("second", 2)));
        assert!(table.resolve(response("first", 1)));

        let a = first.wait(Duration::from_secs(1)).await.unwrap();
        let b = second.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.into_call_result().unwrap().data, Some(json!(1)));
        assert_eq!(b.into_call_result().unwrap().data, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = CorrelationTable::new();
        let pending = table.register("slow").unwrap();
        let err = pending.wait(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResponseTimeout);
        assert!(!table.is_pending("slow"));
        // Late arrival is harmless.
        assert!(!table.resolve(response("slow", 1)));
    }

    #[tokio::test]
    async fn test_drop_removes_entry() {
        let table = CorrelationTable::new();
        let pending = table.register("gone").unwrap();
        assert!(table.is_pending("gone"));
        drop(pending);
        assert!(!table.is_pending("gone"));
        assert!(!table.resolve(response("gone", 1)));
    }

    #[tokio::test]
    async fn test_cancel_and_cancel_all() {
        let table = CorrelationTable::new();
        let a = table.register("a").unwrap();
        let b = table.register("b").unwrap();
        let c = table.register("c").unwrap();

        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(CorrelationError::Cancelled { .. })
        ));

        assert_eq!(table.cancel_all("bridge shut down"), 2);
        for pending in [b, c] {
            let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::NotInitialized);
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = CorrelationTable::new();
        let _pending = table.register("dup").unwrap();
        assert!(matches!(
            table.register("dup"),
            Err(CorrelationError::DuplicateId { .. })
        ));
    }
}
