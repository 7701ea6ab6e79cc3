//! Watch subscriptions
//!
//! A subscription is one caller's revision-gated view of the store's change
//! stream. It is drained with [`WatchSubscription::recv`] under an explicit
//! deadline and can be canceled from another task through its token.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventBatch, Revision, StoreError, StoreResult, StoreStatus, WatchEvent};

/// Which keys a subscription observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    Exact(String),
    Prefix(String),
}

impl KeyFilter {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Cancellable, revision-gated change subscription
pub struct WatchSubscription {
    filter: KeyFilter,
    start_revision: Revision,
    backlog: VecDeque<WatchEvent>,
    receiver: broadcast::Receiver<Arc<EventBatch>>,
    cancel: CancellationToken,
    compacted: bool,
}

impl WatchSubscription {
    /// Build a subscription over a live receiver.
    ///
    /// `backlog` holds already-committed events at or after `start_revision`;
    /// the receiver must have been subscribed before the backlog was read so
    /// that nothing falls between them.
    pub fn new(
        filter: KeyFilter,
        start_revision: Revision,
        backlog: Vec<WatchEvent>,
        receiver: broadcast::Receiver<Arc<EventBatch>>,
    ) -> Self {
        Self {
            filter,
            start_revision,
            backlog: backlog.into(),
            receiver,
            cancel: CancellationToken::new(),
            compacted: false,
        }
    }

    /// A subscription whose start revision has been compacted away
    pub fn compacted(
        filter: KeyFilter,
        start_revision: Revision,
        receiver: broadcast::Receiver<Arc<EventBatch>>,
    ) -> Self {
        let mut sub = Self::new(filter, start_revision, Vec::new(), receiver);
        sub.compacted = true;
        sub
    }

    /// Token that cancels a pending or future `recv`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    /// Wait for the next events matching the filter.
    ///
    /// Returns every backlog event at once, otherwise the matching part of
    /// the next committed batch. Fails with `DeadlineExceeded` once `timeout`
    /// elapses, `Canceled` when the token fires and `Compacted` when the
    /// start revision is gone or the subscriber fell behind the live stream.
    pub async fn recv(&mut self, timeout: Duration) -> StoreResult<Vec<WatchEvent>> {
        if self.compacted {
            return Err(StoreError::new(
                StoreStatus::Compacted,
                format!("revision {} has been compacted", self.start_revision),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(StoreError::new(StoreStatus::Canceled, "watch canceled"));
        }
        if !self.backlog.is_empty() {
            return Ok(self.backlog.drain(..).collect());
        }

        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(timeout, self.next_matching()) => Some(outcome),
        };

        match outcome {
            None => Err(StoreError::new(StoreStatus::Canceled, "watch canceled")),
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                debug!(filter = ?self.filter, "watch deadline reached");
                Err(StoreError::new(StoreStatus::DeadlineExceeded, "watch timed out"))
            }
        }
    }

    async fn next_matching(&mut self) -> StoreResult<Vec<WatchEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(batch) => {
                    let events: Vec<WatchEvent> = batch
                        .events
                        .iter()
                        .filter(|e| {
                            e.kv.mod_revision >= self.start_revision && self.filter.matches(&e.kv.key)
                        })
                        .cloned()
                        .collect();
                    if !events.is_empty() {
                        return Ok(events);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.compacted = true;
                    return Err(StoreError::new(
                        StoreStatus::Compacted,
                        format!("watcher fell behind by {} batches", skipped),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(StoreError::new(StoreStatus::Unavailable, "store closed"));
                }
            }
        }
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("filter", &self.filter)
            .field("start_revision", &self.start_revision)
            .field("backlog", &self.backlog.len())
            .field("compacted", &self.compacted)
            .finish()
    }
}
