use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use crate::types::Operation;

/// Notification emitted after a decorated call has been reconciled with the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub operation: Operation,
    pub entity:    String,
    pub api_fn:    String,
    /// Values affected by the call. A `NO_OPERATION` call affects none and reports an empty list. A null READ or
    /// COMMAND response is reported as `[null]`.
    pub values:    Vec<Value>,
    pub args:      Vec<Value>,
}

pub type ChangeListener = Arc<dyn Fn(&Change) + Send + Sync>;

/// Registry of change listeners. Listeners are called synchronously, in registration order.
#[derive(Default)]
pub struct ChangeFeed {
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_id:   AtomicU64,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            feed: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn notify(&self, change: Change) {
        // Snapshot so a listener may subscribe or unsubscribe from within its callback.
        let listeners = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect::<Vec<_>>();
        log::trace!(
            "{} {}.{}: notifying {} listener(s)",
            change.operation,
            change.entity,
            change.api_fn,
            listeners.len()
        );
        for listener in listeners {
            listener(&change);
        }
    }

    fn remove(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }
}

/// Handle of a registered listener.
///
/// Dropping the handle keeps the listener registered; call [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    feed: Weak<ChangeFeed>,
    id:   u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(api_fn: &str) -> Change {
        Change {
            operation: Operation::Create,
            entity:    "user".to_string(),
            api_fn:    api_fn.to_string(),
            values:    vec![json!({"id": 1})],
            args:      vec![],
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let feed = Arc::new(ChangeFeed::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            feed.add_listener(move |c| seen.lock().push(format!("first:{}", c.api_fn)))
        };
        let _second = {
            let seen = seen.clone();
            feed.add_listener(move |c| seen.lock().push(format!("second:{}", c.api_fn)))
        };

        feed.notify(change("createUser"));
        first.unsubscribe();
        feed.notify(change("createOther"));

        assert_eq!(
            *seen.lock(),
            vec!["first:createUser", "second:createUser", "second:createOther"]
        );
        assert_eq!(feed.listener_count(), 1);
    }
}
