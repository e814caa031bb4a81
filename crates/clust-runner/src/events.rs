use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    Replaced(String),
    Removed(String),
}

impl ConfigEvent {
    pub fn config_id(&self) -> &str {
        match self {
            ConfigEvent::Replaced(id) | ConfigEvent::Removed(id) => id,
        }
    }
}

type Callback = Arc<dyn Fn(&ConfigEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    by_config: HashMap<String, Vec<(u64, Callback)>>,
}

#[derive(Default)]
pub struct ConfigEvents {
    next_id: AtomicU64,
    inner: Arc<Mutex<Subscribers>>,
}

impl ConfigEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, config_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ConfigEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .by_config
            .entry(config_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            config_id: config_id.to_string(),
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: ConfigEvent) -> usize {
        let callbacks: Vec<Callback> = self
            .inner
            .lock()
            .by_config
            .get(event.config_id())
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        debug!(config = event.config_id(), subscribers = callbacks.len(), "config event");
        for cb in &callbacks {
            cb(&event);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, config_id: &str) -> usize {
        self.inner
            .lock()
            .by_config
            .get(config_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

pub struct Subscription {
    id: u64,
    config_id: String,
    bus: Weak<Mutex<Subscribers>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut subs = bus.lock();
            if let Some(list) = subs.by_config.get_mut(&self.config_id) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    subs.by_config.remove(&self.config_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dropping_subscription_stops_delivery() {
        let bus = ConfigEvents::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = bus.subscribe("data:iris", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.publish(ConfigEvent::Replaced("data:iris".into())), 1);
        assert_eq!(bus.publish(ConfigEvent::Removed("data:wine".into())), 0);
        drop(sub);
        assert_eq!(bus.subscriber_count("data:iris"), 0);
        assert_eq!(bus.publish(ConfigEvent::Removed("data:iris".into())), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
