use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::AbortHandle};
use uuid::Uuid;

pub const DEFAULT_DURATION: Duration = Duration::from_millis(4000);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub message: String,
    pub severity: Severity,
    /// Zero means the entry stays until dismissed.
    pub duration_ms: u64,
}

/// Ephemeral user-facing messages, each with its own expiry timer.
///
/// Timers run on the ambient tokio runtime, so `push` must be called from
/// within one.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    list: watch::Sender<Vec<Notification>>,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                list: watch::Sender::new(Vec::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.inner.list.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.inner.list.borrow().clone()
    }

    pub fn notify(&self, message: impl Into<String>, severity: Severity) -> String {
        self.push(message, severity, DEFAULT_DURATION)
    }

    pub fn push(&self, message: impl Into<String>, severity: Severity, duration: Duration) -> String {
        let id = Uuid::new_v4().to_string();
        let notification = Notification {
            id: id.clone(),
            message: message.into(),
            severity,
            duration_ms: duration.as_millis() as u64,
        };
        self.inner.list.send_modify(|list| list.push(notification));

        if !duration.is_zero() {
            // Hold the timer table while spawning so the expiry cannot run before
            // its handle is registered.
            let mut timers = self.inner.timers.lock();
            let weak: Weak<NotifierInner> = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(inner) = weak.upgrade() {
                    inner.remove(&timer_id);
                }
            });
            timers.insert(id.clone(), handle.abort_handle());
        }
        id
    }

    /// Removes one entry now. A no-op if it already expired.
    pub fn dismiss(&self, id: &str) -> bool {
        self.inner.remove(id)
    }

    /// Removes every entry and cancels their timers.
    pub fn dismiss_all(&self) {
        self.clear_all();
        self.inner.list.send_if_modified(|list| {
            let had_entries = !list.is_empty();
            list.clear();
            had_entries
        });
    }

    /// Cancels every pending expiry. Entries stay listed until dismissed.
    pub fn clear_all(&self) {
        let mut timers = self.inner.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

impl NotifierInner {
    fn remove(&self, id: &str) -> bool {
        if let Some(handle) = self.timers.lock().remove(id) {
            handle.abort();
        }
        self.list.send_if_modified(|list| {
            let before = list.len();
            list.retain(|n| n.id != id);
            list.len() != before
        })
    }
}
