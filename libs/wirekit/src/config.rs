//! Configuration plumbing.
//!
//! Components look up configuration by persistent id (pid). The runtime
//! reads from a [`ConfigSource`] and pushes changes into the affected
//! component managers; factory components get one configuration entry per
//! declared instance. [`MemoryConfigSource`] is the in-process
//! implementation used by the host and by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::registry::PropertyMap;

/// A configuration change. `properties = None` means the entry was deleted.
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub pid: String,
    /// Set for factory-instance entries; `pid` is then the instance id.
    pub factory_pid: Option<String>,
    pub properties: Option<Arc<PropertyMap>>,
}

pub trait ConfigListener: Send + Sync {
    fn on_config_event(&self, event: &ConfigEvent);
}

/// Where configuration comes from. Implementations must deliver change
/// events synchronously on the mutating thread.
pub trait ConfigSource: Send + Sync {
    /// The configuration stored under a singleton pid, if any.
    fn get(&self, pid: &str) -> Option<Arc<PropertyMap>>;

    /// All instance entries under a factory pid, in stable id order.
    fn factory_entries(&self, factory_pid: &str) -> Vec<(String, Arc<PropertyMap>)>;

    fn subscribe(&self, listener: Arc<dyn ConfigListener>) -> u64;

    fn unsubscribe(&self, token: u64);
}

/// In-memory configuration store.
#[derive(Default)]
pub struct MemoryConfigSource {
    singletons: DashMap<String, Arc<PropertyMap>>,
    factories: RwLock<BTreeMap<String, BTreeMap<String, Arc<PropertyMap>>>>,
    listeners: RwLock<Vec<(u64, Arc<dyn ConfigListener>)>>,
    next_token: AtomicU64,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a singleton configuration.
    pub fn put(&self, pid: impl Into<String>, properties: PropertyMap) {
        let pid = pid.into();
        let properties = Arc::new(properties);
        self.singletons.insert(pid.clone(), Arc::clone(&properties));
        self.dispatch(&ConfigEvent {
            pid,
            factory_pid: None,
            properties: Some(properties),
        });
    }

    /// Delete a singleton configuration.
    pub fn remove(&self, pid: &str) {
        if self.singletons.remove(pid).is_some() {
            self.dispatch(&ConfigEvent {
                pid: pid.to_string(),
                factory_pid: None,
                properties: None,
            });
        }
    }

    /// Store (or replace) one instance entry under a factory pid.
    pub fn put_factory(
        &self,
        factory_pid: impl Into<String>,
        instance: impl Into<String>,
        properties: PropertyMap,
    ) {
        let factory_pid = factory_pid.into();
        let instance = instance.into();
        let properties = Arc::new(properties);
        self.factories
            .write()
            .entry(factory_pid.clone())
            .or_default()
            .insert(instance.clone(), Arc::clone(&properties));
        self.dispatch(&ConfigEvent {
            pid: instance,
            factory_pid: Some(factory_pid),
            properties: Some(properties),
        });
    }

    /// Delete one instance entry under a factory pid.
    pub fn remove_factory(&self, factory_pid: &str, instance: &str) {
        let removed = {
            let mut factories = self.factories.write();
            match factories.get_mut(factory_pid) {
                Some(entries) => entries.remove(instance).is_some(),
                None => false,
            }
        };
        if removed {
            self.dispatch(&ConfigEvent {
                pid: instance.to_string(),
                factory_pid: Some(factory_pid.to_string()),
                properties: None,
            });
        }
    }

    fn dispatch(&self, event: &ConfigEvent) {
        let listeners: Vec<Arc<dyn ConfigListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_config_event(event);
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn get(&self, pid: &str) -> Option<Arc<PropertyMap>> {
        self.singletons.get(pid).map(|e| Arc::clone(e.value()))
    }

    fn factory_entries(&self, factory_pid: &str) -> Vec<(String, Arc<PropertyMap>)> {
        self.factories
            .read()
            .get(factory_pid)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, props)| (id.clone(), Arc::clone(props)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn subscribe(&self, listener: Arc<dyn ConfigListener>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((token, listener));
        token
    }

    fn unsubscribe(&self, token: u64) {
        self.listeners.write().retain(|(t, _)| *t != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording(Mutex<Vec<ConfigEvent>>);

    impl ConfigListener for Recording {
        fn on_config_event(&self, event: &ConfigEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn put_and_remove_fire_events() {
        let source = MemoryConfigSource::new();
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        source.subscribe(recorder.clone() as Arc<dyn ConfigListener>);

        let mut props = PropertyMap::new();
        props.insert("port".to_string(), 8080i64.into());
        source.put("db", props);
        assert!(source.get("db").is_some());

        source.remove("db");
        assert!(source.get("db").is_none());
        // removing again is silent
        source.remove("db");

        let events = recorder.0.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].properties.is_some());
        assert!(events[1].properties.is_none());
    }

    #[test]
    fn factory_entries_are_ordered_by_instance_id() {
        let source = MemoryConfigSource::new();
        source.put_factory("pool", "b", PropertyMap::new());
        source.put_factory("pool", "a", PropertyMap::new());

        let entries = source.factory_entries("pool");
        let ids: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        source.remove_factory("pool", "a");
        assert_eq!(source.factory_entries("pool").len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let source = MemoryConfigSource::new();
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        let token = source.subscribe(recorder.clone() as Arc<dyn ConfigListener>);
        source.unsubscribe(token);
        source.put("x", PropertyMap::new());
        assert!(recorder.0.lock().is_empty());
    }
}
