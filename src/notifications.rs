use crate::types::{Notification, NotificationKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NOTIFICATION_TTL: Duration = Duration::from_secs(5);

struct Entries {
    next_id: u64,
    items: Vec<Notification>,
    timers: HashMap<u64, JoinHandle<()>>,
}

struct Shared {
    entries: Mutex<Entries>,
    tx: watch::Sender<Vec<Notification>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, items: &[Notification]) {
        self.tx.send_replace(items.to_vec());
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.lock();
        let before = entries.items.len();
        entries.items.retain(|n| n.id != id);
        if let Some(timer) = entries.timers.remove(&id) {
            timer.abort();
        }
        let removed = entries.items.len() != before;
        if removed {
            self.publish(&entries.items);
        }
        removed
    }
}

/// Transient user-facing messages, displayed in insertion order. Each one
/// disappears after the queue's TTL unless dismissed first.
#[derive(Clone)]
pub struct NotificationQueue {
    shared: Arc<Shared>,
    ttl: Duration,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::with_ttl(NOTIFICATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries {
                    next_id: 1,
                    items: Vec::new(),
                    timers: HashMap::new(),
                }),
                tx,
            }),
            ttl,
        }
    }

    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) -> u64 {
        let message = message.into();
        let created_at = OffsetDateTime::now_utc();
        let mut entries = self.shared.lock();
        let id = entries.next_id;
        entries.next_id += 1;
        entries.items.push(Notification {
            id,
            kind,
            message,
            created_at,
            expires_at: created_at + self.ttl,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.shared);
                let ttl = self.ttl;
                let timer = handle.spawn(expire_later(weak, id, ttl));
                entries.timers.insert(id, timer);
            }
            Err(_) => {
                tracing::warn!(id, "no async runtime, notification will not expire on its own");
            }
        }

        self.shared.publish(&entries.items);
        id
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.notify(NotificationKind::Success, message)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.notify(NotificationKind::Error, message)
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.notify(NotificationKind::Info, message)
    }

    /// No-op for unknown or already removed ids.
    pub fn dismiss(&self, id: u64) {
        if self.shared.remove(id) {
            tracing::trace!(id, "notification dismissed");
        }
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.shared.lock().items.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.shared.tx.subscribe()
    }
}

async fn expire_later(shared: Weak<Shared>, id: u64, ttl: Duration) {
    tokio::time::sleep(ttl).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut entries = shared.lock();
    // Drop our own handle without aborting the task we are running in.
    entries.timers.remove(&id);
    let before = entries.items.len();
    entries.items.retain(|n| n.id != id);
    if entries.items.len() != before {
        shared.publish(&entries.items);
        tracing::trace!(id, "notification expired");
    }
}
