use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, task::AbortHandle};
use tracing::debug;

use crate::prefs::PreferenceStore;

pub const SELECTED_APP_KEY: &str = "fwdash:selected-app";
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(150);

/// Picks the current item: the primary value, then the persisted one, then the
/// fallback, as long as each is still available. With nothing matching it takes
/// the first available item, and with nothing available it returns the fallback.
pub fn resolve_selection<S: AsRef<str>>(
    primary: Option<&str>,
    persisted: Option<&str>,
    available: &[S],
    fallback: Option<&str>,
) -> Option<String> {
    let is_available = |value: &str| available.iter().any(|item| item.as_ref() == value);

    [primary, persisted, fallback]
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty() && is_available(value))
        .or_else(|| available.first().map(|item| item.as_ref()))
        .or(fallback)
        .map(str::to_string)
}

/// The selected build target, persisted through a short debounce.
#[derive(Clone)]
pub struct AppSelection {
    inner: Arc<SelectionInner>,
}

struct SelectionInner {
    selected: watch::Sender<Option<String>>,
    prefs: Arc<dyn PreferenceStore>,
    pending: Mutex<Option<AbortHandle>>,
}

impl AppSelection {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            inner: Arc::new(SelectionInner {
                selected: watch::Sender::new(None),
                prefs,
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.selected.subscribe()
    }

    pub fn selected(&self) -> Option<String> {
        self.inner.selected.borrow().clone()
    }

    pub fn stored(&self) -> Option<String> {
        self.inner.prefs.get(SELECTED_APP_KEY)
    }

    pub fn select(&self, app_name: Option<&str>) {
        let value = app_name.map(str::to_string);
        self.inner.selected.send_replace(value.clone());
        self.schedule_persist(value);
    }

    /// Re-resolves the selection against a freshly discovered app list.
    pub fn reconcile<S: AsRef<str>>(&self, available: &[S]) -> Option<String> {
        let current = self.selected();
        let stored = self.stored();
        let first = available.first().map(|item| item.as_ref());
        let next = resolve_selection(current.as_deref(), stored.as_deref(), available, first);
        self.select(next.as_deref());
        next
    }

    /// Writes the current value immediately and drops any pending write.
    pub fn flush(&self) {
        self.teardown();
        let value = self.selected();
        self.inner.prefs.set(SELECTED_APP_KEY, value.as_deref());
    }

    /// Cancels a pending write without persisting it.
    pub fn teardown(&self) {
        if let Some(handle) = self.inner.pending.lock().take() {
            handle.abort();
        }
    }

    fn schedule_persist(&self, value: Option<String>) {
        let mut pending = self.inner.pending.lock();
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let prefs = Arc::clone(&self.inner.prefs);
        let task = tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            debug!("persisting selected app {value:?}");
            prefs.set(SELECTED_APP_KEY, value.as_deref());
        });
        *pending = Some(task.abort_handle());
    }
}
