use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, RwLock};

use crate::{
    protocol::{Envelope, UserData},
    session::UiOperation,
};

/// Notifications the session raises towards the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Every decoded peer envelope, before any side effect runs.
    MessageReceived(Envelope),
    UserUpdated(UserData),
    SurfaceError(String),
    /// A navigation the surface intercepted; the host should open it outside
    /// the embedded view.
    OpenExternalUrl(String),
    OperationFailed {
        operation: UiOperation,
        message: String,
    },
}

pub struct EventHub {
    next_subscriber_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::UnboundedSender<SessionEvent>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_subscriber_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, subscriber_id: u64) {
        self.subscribers.write().await.remove(&subscriber_id);
    }

    pub async fn emit(&self, event: SessionEvent) {
        let closed = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, tx)| tx.send(event.clone()).is_err())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
