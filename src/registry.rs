//! In-flight request bookkeeping.
//!
//! Replies to host requests are keyed by request id; the handful of waits
//! that are not tied to an id (the initialization handshake) register a
//! predicate instead. A waiter leaves the registry exactly once: whoever
//! removes its entry (dispatch, timeout, cancel or drop) owns the outcome.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{sync::oneshot, time::timeout};

use crate::protocol::Envelope;

type Matcher = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

struct PredicateWaiter {
    matches: Matcher,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterKey {
    Reply(i64),
    Predicate(u64),
}

#[derive(Default)]
struct RegistryInner {
    replies: DashMap<i64, oneshot::Sender<Envelope>>,
    predicates: DashMap<u64, PredicateWaiter>,
    next_predicate_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, key: WaiterKey) -> bool {
        match key {
            WaiterKey::Reply(id) => self.replies.remove(&id).is_some(),
            WaiterKey::Predicate(id) => self.predicates.remove(&id).is_some(),
        }
    }
}

#[derive(Clone, Default)]
pub struct PendingRequestRegistry {
    inner: Arc<RegistryInner>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the `...Response` envelope carrying `id`.
    pub fn register_reply(&self, id: i64, limit: Option<Duration>) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.inner.replies.insert(id, tx).is_some() {
            tracing::warn!(id, "replaced an existing waiter for request id");
        }
        self.pending(WaiterKey::Reply(id), rx, limit)
    }

    /// Waits for the first envelope accepted by `predicate`.
    pub fn register<F>(&self, predicate: F, limit: Option<Duration>) -> PendingReply
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let key = self.inner.next_predicate_id.fetch_add(1, Ordering::Relaxed);
        self.inner.predicates.insert(
            key,
            PredicateWaiter {
                matches: Box::new(predicate),
                tx,
            },
        );
        self.pending(WaiterKey::Predicate(key), rx, limit)
    }

    fn pending(
        &self,
        key: WaiterKey,
        rx: oneshot::Receiver<Envelope>,
        limit: Option<Duration>,
    ) -> PendingReply {
        PendingReply {
            key,
            rx,
            limit: limit.filter(|limit| !limit.is_zero()),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Offers one inbound envelope to the active waiters. Returns whether a
    /// waiter took it.
    pub fn dispatch(&self, envelope: &Envelope) -> bool {
        if envelope.is_response() {
            if let Some((_, tx)) = self.inner.replies.remove(&envelope.id) {
                let _ = tx.send(envelope.clone());
                return true;
            }
        }

        let candidates = self
            .inner
            .predicates
            .iter()
            .filter(|entry| (entry.value().matches)(envelope))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        for key in candidates {
            if let Some((_, waiter)) = self.inner.predicates.remove(&key) {
                let _ = waiter.tx.send(envelope.clone());
                return true;
            }
        }

        false
    }

    /// Resolves every active waiter with a `Cancelled` envelope.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let reply_ids = self
            .inner
            .replies
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        let predicate_ids = self
            .inner
            .predicates
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        let mut cancelled = 0;
        for id in reply_ids {
            if let Some((_, tx)) = self.inner.replies.remove(&id) {
                let _ = tx.send(Envelope::cancelled(reason));
                cancelled += 1;
            }
        }
        for id in predicate_ids {
            if let Some((_, waiter)) = self.inner.predicates.remove(&id) {
                let _ = waiter.tx.send(Envelope::cancelled(reason));
                cancelled += 1;
            }
        }

        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.inner.replies.len() + self.inner.predicates.len()
    }
}

/// One registered expectation. Dropping it before it resolves removes the
/// waiter from the registry.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    key: WaiterKey,
    rx: oneshot::Receiver<Envelope>,
    limit: Option<Duration>,
    inner: Arc<RegistryInner>,
}

impl PendingReply {
    pub async fn wait(mut self) -> Envelope {
        let outcome = match self.limit {
            Some(limit) => timeout(limit, &mut self.rx).await.ok(),
            None => Some((&mut self.rx).await),
        };

        match outcome {
            Some(Ok(envelope)) => envelope,
            Some(Err(_)) => Envelope::cancelled("waiter released without a reply"),
            None => {
                if self.inner.remove(self.key) {
                    tracing::debug!(key = ?self.key, "request timed out");
                    return Envelope::timed_out();
                }
                // A dispatch claimed the entry as the timer fired; its send is
                // already under way.
                (&mut self.rx).await.unwrap_or_else(|_| Envelope::timed_out())
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.remove(self.key);
    }
}
