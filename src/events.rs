//! In-process publish/subscribe registry
//!
//! Delivery is synchronous on the publisher's task: subscribers must be
//! cheap and re-dispatch to their own context if they need to. A panicking
//! subscriber is caught and logged; the remaining subscribers still run.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::catalog::{Catalog, Media};

/// Why a `profile:update` was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    ManualRefresh,
    ProfileAdded,
    ImportDone,
    DirChanged,
    WindowClose,
}

/// Event payloads. Catalog data always travels as a snapshot, never as a
/// live reference into the store.
#[derive(Clone)]
pub enum Event {
    ProfileUpdate {
        reason: UpdateReason,
        no_sort: Option<bool>,
        profile_key: Option<String>,
    },
    CatalogChanged {
        profile_key: String,
        catalog: Arc<Catalog>,
    },
    MediaProgress {
        profile_key: String,
        media: Media,
    },
}

/// Topic for profile-level updates.
pub const TOPIC_PROFILE_UPDATE: &str = "profile:update";

/// Topic for per-profile catalog changes.
pub fn topic_update(profile_key: &str) -> String {
    format!("update:{}", profile_key)
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// String-topic event bus shared by the engine and its observers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers
            .entry(topic.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Deliver `event` to every subscriber of `topic`.
    ///
    /// Iterates a snapshot of the handler list so subscribers may
    /// subscribe/unsubscribe from within a callback without deadlocking.
    pub fn publish(&self, topic: &str, event: &Event) {
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
            match subscribers.get(topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                error!(topic, "event subscriber panicked; continuing with the rest");
            }
        }
    }

    /// Number of subscribers currently attached to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.get(topic).map_or(0, |list| list.len())
    }

    /// Drop all subscribers of `topic`.
    pub fn clear(&self, topic: &str) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        if subscribers.remove(topic).is_some() {
            warn!(topic, "cleared event subscribers");
        }
    }
}
