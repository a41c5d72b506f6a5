//! Subscriptions and their callbacks.
//!
//! A [`Subscription`] pairs a REQ id and its filters with an event callback
//! and an optional completion callback. Callbacks run synchronously on the
//! connection's reader task, so they should hand work off (e.g. into a
//! channel) rather than block.

use crate::message::Filter;
use nostr::Event;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Called for every event delivered to a subscription.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Called once when a subscription (or an aggregate of them) completes.
pub type CompleteCallback = Box<dyn FnOnce() + Send>;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// A take-once callback slot.
///
/// `fire` runs the callback on the first call only; later calls are no-ops,
/// which is what makes "last relay finished" and "timer expired" race-free.
pub struct CompletionLatch {
    callback: Mutex<Option<CompleteCallback>>,
}

impl CompletionLatch {
    pub fn new(callback: CompleteCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Run the callback if it has not run yet. Returns whether it ran.
    pub fn fire(&self) -> bool {
        let callback = match self.callback.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // The lock is released before user code runs.
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        match self.callback.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl std::fmt::Debug for CompletionLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// An active subscription on one relay connection.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    on_event: EventCallback,
    on_complete: Option<Arc<CompletionLatch>>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>, on_event: EventCallback) -> Self {
        Self {
            id: id.into(),
            filters,
            on_event,
            on_complete: None,
        }
    }

    /// Attach a callback fired at most once, on the relay's EOSE.
    pub fn on_complete(mut self, callback: CompleteCallback) -> Self {
        self.on_complete = Some(Arc::new(CompletionLatch::new(callback)));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Deliver an event to the callback.
    pub fn handle_event(&self, event: Event) {
        (self.on_event)(event);
    }

    /// Mark end of stored events. Only the first call fires the callback.
    pub fn mark_eose(&self) -> bool {
        self.on_complete
            .as_ref()
            .is_some_and(|latch| latch.fire())
    }

    pub fn has_eose(&self) -> bool {
        self.on_complete
            .as_ref()
            .is_some_and(|latch| latch.is_settled())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_generate_subscription_id() {
        let a = generate_subscription_id();
        let b = generate_subscription_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_latch_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let latch = {
            let count = count.clone();
            CompletionLatch::new(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };

        assert!(!latch.is_settled());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_settled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_callbacks() {
        let events = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));

        let sub = {
            let events = events.clone();
            let completions = completions.clone();
            Subscription::new(
                "sub",
                vec![Filter::new().kinds(vec![1])],
                Arc::new(move |_| {
                    events.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .on_complete(Box::new(move || {
                completions.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let event = Event {
            id: "1".into(),
            pubkey: "2".into(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "3".into(),
        };
        sub.handle_event(event.clone());
        sub.handle_event(event);
        assert_eq!(events.load(Ordering::SeqCst), 2);

        // Clones share the completion latch.
        let clone = sub.clone();
        assert!(clone.mark_eose());
        assert!(!sub.mark_eose());
        assert!(sub.has_eose());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_without_completion() {
        let sub = Subscription::new("s", vec![], Arc::new(|_| {}));
        assert!(!sub.mark_eose());
        assert!(!sub.has_eose());
    }
}
