use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub properties: serde_json::Value,
}

pub struct BusEventDef {
    pub event_type: &'static str,
}

impl BusEventDef {
    pub const fn new(event_type: &'static str) -> Self {
        Self { event_type }
    }
}

type BoxedCallback = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: BoxedCallback,
}

/// In-process fan-out for workspace and dispatch lifecycle events.
///
/// Publishing never blocks: callbacks run inline on the publishing thread and
/// channel subscribers that fall behind lose the oldest events.
pub struct Bus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    wildcard_subscribers: RwLock<Vec<Subscription>>,
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            wildcard_subscribers: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn publish(&self, def: &BusEventDef, properties: serde_json::Value) {
        tracing::debug!(event_type = def.event_type, "publishing event");

        if let Some(subs) = self.subscribers.read().get(def.event_type) {
            for sub in subs {
                (sub.callback)(def.event_type, &properties);
            }
        }
        for sub in self.wildcard_subscribers.read().iter() {
            (sub.callback)(def.event_type, &properties);
        }

        // No receivers is fine.
        let _ = self.tx.send(BusEvent {
            event_type: def.event_type.to_string(),
            properties,
        });
    }

    pub fn subscribe<F>(&self, def: &BusEventDef, callback: F) -> u64
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .write()
            .entry(def.event_type.to_string())
            .or_default()
            .push(Subscription {
                id,
                callback: Box::new(callback),
            });
        id
    }

    pub fn subscribe_all<F>(&self, callback: F) -> u64
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.wildcard_subscribers.write().push(Subscription {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a subscription created by either `subscribe` or `subscribe_all`.
    pub fn unsubscribe(&self, id: u64) {
        for subs in self.subscribers.write().values_mut() {
            subs.retain(|s| s.id != id);
        }
        self.wildcard_subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    static PING: BusEventDef = BusEventDef::new("test.ping");
    static PONG: BusEventDef = BusEventDef::new("test.pong");

    #[test]
    fn typed_subscribers_only_see_their_event() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(&PING, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&PING, serde_json::json!({}));
        bus.publish(&PONG, serde_json::json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe_all(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&PING, serde_json::json!({}));
        bus.unsubscribe(id);
        bus.publish(&PING, serde_json::json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_subscribers_receive_properties() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_channel();

        bus.publish(&PONG, serde_json::json!({ "workspaceID": 7 }));

        let event = rx.recv().await.expect("event should be delivered");
        assert_eq!(event.event_type, "test.pong");
        assert_eq!(event.properties["workspaceID"], 7);
    }
}
