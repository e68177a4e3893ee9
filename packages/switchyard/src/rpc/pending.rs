//! Calls awaiting a reply, keyed by correlation id.
//!
//! An entry leaves the map exactly once:
//! - a reply arrives ([`PendingRequests::complete`])
//! - the caller times out or drops its future ([`PendingGuard`] drop)
//! - the reply queue shuts down ([`PendingRequests::cancel_all`])
//!
//! Whoever removes the entry owns the sender, so a reply delivered twice
//! resolves the call only once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RpcError;
use crate::headers::CorrelationId;
use crate::transport::Delivery;

struct Pending {
    tx: oneshot::Sender<Result<Delivery, RpcError>>,
    deadline: Instant,
}

/// The pending-request map.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<CorrelationId, Pending>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a reply to `id`.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateCorrelation`] when `id` is already pending.
    pub fn register(self: &Arc<Self>, id: CorrelationId, timeout: Duration) -> Result<PendingGuard, RpcError> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateCorrelation { correlation_id: id }),
            Entry::Vacant(slot) => {
                slot.insert(Pending { tx, deadline });
            }
        }
        Ok(PendingGuard {
            id,
            pending: self.clone(),
            rx: Some(rx),
            timeout,
            deadline,
        })
    }

    /// Resolve `id` with a reply. False when nothing was waiting.
    pub fn complete(&self, id: &CorrelationId, reply: Delivery) -> bool {
        self.resolve(id, Ok(reply))
    }

    /// Fail `id`. False when nothing was waiting.
    pub fn fail(&self, id: &CorrelationId, error: RpcError) -> bool {
        self.resolve(id, Err(error))
    }

    fn resolve(&self, id: &CorrelationId, outcome: Result<Delivery, RpcError>) -> bool {
        match self.entries.remove(id) {
            // The caller may have given up between our remove and this send.
            Some((_, pending)) => pending.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Cancel every outstanding call. Returns how many were canceled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let canceled = ids
            .iter()
            .filter(|id| self.fail(id, RpcError::Canceled))
            .count();
        if canceled > 0 {
            debug!(canceled, "pending rpc calls canceled");
        }
        canceled
    }

    /// Drop entries past their deadline whose callers never cleaned up.
    /// The reply queue sweeps on every delivery.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, p| p.deadline > now && !p.tx.is_closed());
        before - self.entries.len()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One registered call. Removes its entry when dropped.
pub struct PendingGuard {
    id: CorrelationId,
    pending: Arc<PendingRequests>,
    rx: Option<oneshot::Receiver<Result<Delivery, RpcError>>>,
    timeout: Duration,
    deadline: Instant,
}

impl PendingGuard {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Fixed at registration. Everything the call does must finish by then.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The error a call gets when its deadline passes.
    pub fn timed_out(&self) -> RpcError {
        RpcError::Timeout {
            timeout: self.timeout,
        }
    }

    /// Wait for the reply until the registered deadline.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] when the deadline passes first
    /// - [`RpcError::Canceled`] when the entry was canceled or dropped
    /// - whatever error the entry was failed with
    pub async fn wait(mut self) -> Result<Delivery, RpcError> {
        let Some(rx) = self.rx.take() else {
            return Err(RpcError::Canceled);
        };
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // A sweep that beat the timer to an expired entry still reads as a timeout.
            Ok(Err(_)) if Instant::now() >= self.deadline => Err(self.timed_out()),
            Ok(Err(_)) => Err(RpcError::Canceled),
            Err(_) => Err(self.timed_out()),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.entries.remove(&self.id);
    }
}
