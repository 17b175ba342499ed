use std::collections::HashMap;
use std::sync::{Arc, Weak};

use cloudide_protocol::InboundEnvelope;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_tag: HashMap<String, Vec<(u64, Callback)>>,
}

impl Registry {
    fn contains(&self, tag: &str, id: u64) -> bool {
        self.by_tag
            .get(tag)
            .is_some_and(|subs| subs.iter().any(|(sub_id, _)| *sub_id == id))
    }
}

/// Fans inbound workspace events out to subscribers by `message` tag.
///
/// Cloning shares the registry. Callbacks run on the dispatching task with
/// the registry unlocked, so they may subscribe or unsubscribe.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

/// Token for one registration. Dropping it leaves the registration in place.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    tag: String,
    id: u64,
}

impl Subscription {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Remove this registration and no other. Repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(subs) = registry.by_tag.get_mut(&self.tag) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                registry.by_tag.remove(&self.tag);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.lock().contains(&self.tag, self.id))
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, tag: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let id = self.insert(&tag, Arc::new(callback));
        self.token(tag, id)
    }

    /// Register a callback that unsubscribes itself before its first run.
    pub fn subscribe_once<F>(&self, tag: impl Into<String>, callback: F) -> Subscription
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        let tag = tag.into();
        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            registry.next_id
        };
        let token = self.token(tag.clone(), id);
        let own = token.clone();
        let slot = Mutex::new(Some(callback));
        let callback: Callback = Arc::new(move |payload| {
            own.unsubscribe();
            if let Some(callback) = slot.lock().take() {
                callback(payload);
            }
        });
        self.registry
            .lock()
            .by_tag
            .entry(tag)
            .or_default()
            .push((id, callback));
        token
    }

    /// Invoke every subscriber of `envelope.message` in registration order.
    /// Returns how many callbacks ran.
    pub fn dispatch(&self, envelope: &InboundEnvelope) -> usize {
        let tag = envelope.message.as_str();
        let snapshot: Vec<(u64, Callback)> = match self.registry.lock().by_tag.get(tag) {
            Some(subs) => subs.clone(),
            None => Vec::new(),
        };
        if snapshot.is_empty() {
            debug!(tag, "no subscribers for event");
            return 0;
        }

        let mut invoked = 0;
        for (id, callback) in snapshot {
            // Skip registrations removed by an earlier callback in this dispatch.
            if !self.registry.lock().contains(tag, id) {
                continue;
            }
            callback(&envelope.payload);
            invoked += 1;
        }
        invoked
    }

    /// Parse a raw text frame and dispatch it. Malformed frames are logged
    /// and dropped.
    pub fn dispatch_raw(&self, text: &str) -> usize {
        match InboundEnvelope::parse(text) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                warn!("dropping inbound frame: {e}");
                0
            }
        }
    }

    pub fn subscriber_count(&self, tag: &str) -> usize {
        self.registry.lock().by_tag.get(tag).map_or(0, Vec::len)
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.registry.lock().by_tag.clear();
    }

    fn insert(&self, tag: &str, callback: Callback) -> u64 {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_tag
            .entry(tag.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    fn token(&self, tag: String, id: u64) -> Subscription {
        Subscription {
            registry: Arc::downgrade(&self.registry),
            tag,
            id,
        }
    }
}
