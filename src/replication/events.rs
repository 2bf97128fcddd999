//! Notifications
//!
//! Asynchronous notifications for the outer application's event layer.
//! Listeners register per notification kind and can be removed again, so
//! tests observe exactly the notifications of the manager under test.

use crate::domain::entities::EntityKey;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A notification emitted by the sync core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// A snapshot was served to or installed from a peer.
    SyncCompleted { at_ms: u64 },
    /// An entity changed; `quantity` is `None` after a delete.
    StockUpdated {
        entity: EntityKey,
        quantity: Option<f64>,
        version: u64,
    },
    /// The satellite is about to retry its master link.
    Reconnecting { attempt: u32 },
    /// Human-readable runtime error.
    Error { message: String },
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::SyncCompleted { .. } => NotificationKind::SyncCompleted,
            Notification::StockUpdated { .. } => NotificationKind::StockUpdated,
            Notification::Reconnecting { .. } => NotificationKind::Reconnecting,
            Notification::Error { .. } => NotificationKind::Error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Notification::Error {
            message: message.into(),
        }
    }
}

/// Kind used to register a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SyncCompleted,
    StockUpdated,
    Reconnecting,
    Error,
}

impl NotificationKind {
    /// Event name as seen by the UI layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SyncCompleted => "sync-completed",
            NotificationKind::StockUpdated => "stock-updated",
            NotificationKind::Reconnecting => "reconnecting",
            NotificationKind::Error => "error",
        }
    }

    pub const ALL: [NotificationKind; 4] = [
        NotificationKind::SyncCompleted,
        NotificationKind::StockUpdated,
        NotificationKind::Reconnecting,
        NotificationKind::Error,
    ];
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Per-kind listener registry.
#[derive(Default)]
pub struct NotificationHub {
    listeners: RwLock<HashMap<NotificationKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for one notification kind.
    pub fn subscribe(
        &self,
        kind: NotificationKind,
        listener: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Register a channel that receives every notification of `kind`.
    pub fn subscribe_channel(
        &self,
        kind: NotificationKind,
    ) -> (ListenerId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(kind, move |n| {
            let _ = tx.send(n.clone());
        });
        (id, rx)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(i, _)| *i != id);
            removed |= entries.len() != before;
        }
        removed
    }

    pub fn listener_count(&self, kind: NotificationKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, |l| l.len())
    }

    /// Deliver a notification to the listeners of its kind.
    pub fn emit(&self, notification: Notification) {
        // Listeners run outside the lock so they may (un)subscribe.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&notification.kind())
            .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        tracing::trace!("emit {} to {} listeners", notification.kind().as_str(), listeners.len());
        for listener in listeners {
            listener(&notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_receives_only_its_kind() {
        let hub = NotificationHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hub.subscribe(NotificationKind::Reconnecting, move |n| {
            assert_eq!(n, &Notification::Reconnecting { attempt: 3 });
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(Notification::Reconnecting { attempt: 3 });
        hub.emit(Notification::SyncCompleted { at_ms: 1 });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = NotificationHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = hub.subscribe(NotificationKind::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hub.listener_count(NotificationKind::Error), 1);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(Notification::error("boom"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(hub.listener_count(NotificationKind::Error), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let hub = NotificationHub::new();
        let (_, mut rx) = hub.subscribe_channel(NotificationKind::StockUpdated);

        hub.emit(Notification::StockUpdated {
            entity: EntityKey::stock("sku-1"),
            quantity: Some(4.0),
            version: 6,
        });

        match rx.recv().await.unwrap() {
            Notification::StockUpdated { entity, quantity, version } => {
                assert_eq!(entity.to_string(), "stock:sku-1");
                assert_eq!(quantity, Some(4.0));
                assert_eq!(version, 6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let hub = NotificationHub::new();
        let hub_clone = hub.clone();
        let slot: Arc<parking_lot::Mutex<Option<ListenerId>>> = Arc::default();
        let slot_clone = slot.clone();

        let id = hub.subscribe(NotificationKind::Error, move |_| {
            if let Some(id) = *slot_clone.lock() {
                hub_clone.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        hub.emit(Notification::error("once"));
        assert_eq!(hub.listener_count(NotificationKind::Error), 0);
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<_> = NotificationKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["sync-completed", "stock-updated", "reconnecting", "error"]);
    }

    #[test]
    fn test_notification_serializes_with_tag() {
        let json = serde_json::to_string(&Notification::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json, r#"{"type":"reconnecting","attempt":2}"#);
    }
}
