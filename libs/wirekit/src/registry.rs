//! Capability registry: the dynamic provider directory the runtime wires
//! components against.
//!
//! Providers register an object (or a factory) under a capability name with
//! a property map and a ranking. Consumers look providers up by capability
//! and filter, subscribe to add/remove/modify events, and resolve handles to
//! objects on demand. Resolution is use-counted so a provider can tell when
//! it is no longer held by anyone.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::filter::TargetFilter;

/// Properties attached to a provider registration. Ordered map so snapshots
/// and DTOs are deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl PropertyValue {
    /// Filter comparison: every value kind compares through its text form;
    /// list values match if any element matches.
    pub fn matches_text(&self, want: &str) -> bool {
        match self {
            PropertyValue::Str(s) => s == want,
            PropertyValue::Int(i) => i.to_string() == want,
            PropertyValue::Float(f) => f.to_string() == want,
            PropertyValue::Bool(b) => b.to_string() == want,
            PropertyValue::List(items) => items.iter().any(|s| s == want),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Best-effort conversion from a JSON value; nested objects and
    /// non-string list elements are rendered through their JSON form.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => PropertyValue::Str(s.clone()),
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::Array(items) => PropertyValue::List(
                items
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => PropertyValue::Str(other.to_string()),
        }
    }
}

/// Flatten a JSON object into a property map. Non-objects yield an empty
/// map.
pub fn property_map_from_json(value: &serde_json::Value) -> PropertyMap {
    match value {
        serde_json::Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
            .collect(),
        _ => PropertyMap::new(),
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// The object a provider handle resolves to.
pub type ProviderObject = Arc<dyn Any + Send + Sync>;

/// Opaque, rankable reference to a registered provider. Cheap to clone;
/// resolvable to the provider object through the registry.
#[derive(Clone)]
pub struct ProviderHandle {
    id: u64,
    ranking: i32,
    capability: Arc<str>,
    properties: Arc<PropertyMap>,
}

impl ProviderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ranking(&self) -> i32 {
        self.ranking
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn properties(&self) -> &Arc<PropertyMap> {
        &self.properties
    }

    /// Ranking order: higher ranking wins, ties broken by lower id
    /// (stable, deterministic across re-evaluations).
    pub fn outranks(&self, other: &ProviderHandle) -> bool {
        match self.ranking.cmp(&other.ranking) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }
}

impl PartialEq for ProviderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProviderHandle {}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("ranking", &self.ranking)
            .finish()
    }
}

/// Sort handles into ranking order: highest ranking first, then lowest id.
pub(crate) fn sort_by_ranking(handles: &mut [ProviderHandle]) {
    handles.sort_by(|a, b| {
        b.ranking
            .cmp(&a.ranking)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Added,
    Removed,
    Modified,
}

/// A registry change, delivered synchronously on the mutating thread.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub handle: ProviderHandle,
}

/// Subscriber to registry changes.
pub trait RegistryListener: Send + Sync {
    fn on_registry_event(&self, event: &RegistryEvent);
}

enum ProviderSource {
    Instance(ProviderObject),
    /// Deferred resolution; may return `None` (e.g. the backing component
    /// could not be activated).
    Factory(Arc<dyn Fn() -> Option<ProviderObject> + Send + Sync>),
}

struct ProviderEntry {
    handle: ProviderHandle,
    source: ProviderSource,
    use_count: AtomicUsize,
}

/// In-memory capability registry.
///
/// Lookup and mutation are lock-free via [`DashMap`]; listener dispatch
/// copies the subscriber list before invoking callbacks so a listener may
/// re-enter the registry without deadlocking.
pub struct ServiceRegistry {
    providers: DashMap<u64, ProviderEntry>,
    listeners: RwLock<Vec<(u64, Arc<dyn RegistryListener>)>>,
    next_provider_id: AtomicU64,
    next_listener_id: AtomicU64,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("providers", &self.providers.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_provider_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Register a concrete provider object.
    pub fn register(
        self: &Arc<Self>,
        capability: &str,
        ranking: i32,
        properties: PropertyMap,
        object: ProviderObject,
    ) -> ProviderRegistration {
        self.register_source(capability, ranking, properties, ProviderSource::Instance(object))
    }

    /// Register a lazily-resolved provider. The factory runs on the first
    /// (and every) resolve call for the handle; returning `None` means the
    /// provider is currently unavailable.
    pub fn register_factory(
        self: &Arc<Self>,
        capability: &str,
        ranking: i32,
        properties: PropertyMap,
        factory: impl Fn() -> Option<ProviderObject> + Send + Sync + 'static,
    ) -> ProviderRegistration {
        self.register_source(
            capability,
            ranking,
            properties,
            ProviderSource::Factory(Arc::new(factory)),
        )
    }

    fn register_source(
        self: &Arc<Self>,
        capability: &str,
        ranking: i32,
        properties: PropertyMap,
        source: ProviderSource,
    ) -> ProviderRegistration {
        let id = self.next_provider_id.fetch_add(1, Ordering::Relaxed);
        let handle = ProviderHandle {
            id,
            ranking,
            capability: capability.into(),
            properties: Arc::new(properties),
        };
        self.providers.insert(
            id,
            ProviderEntry {
                handle: handle.clone(),
                source,
                use_count: AtomicUsize::new(0),
            },
        );
        tracing::debug!(capability, id, ranking, "provider registered");
        self.dispatch(RegistryEvent {
            kind: EventKind::Added,
            handle: handle.clone(),
        });
        ProviderRegistration {
            registry: Arc::clone(self),
            handle,
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// All currently registered handles of a capability that pass the
    /// filter, in ranking order.
    pub fn find_matching(
        &self,
        capability: &str,
        filter: Option<&TargetFilter>,
    ) -> Vec<ProviderHandle> {
        let mut out: Vec<ProviderHandle> = self
            .providers
            .iter()
            .filter(|e| e.handle.capability() == capability)
            .filter(|e| {
                filter
                    .map(|f| f.matches(&e.handle.properties))
                    .unwrap_or(true)
            })
            .map(|e| e.handle.clone())
            .collect();
        sort_by_ranking(&mut out);
        out
    }

    /// Resolve a handle to its provider object, bumping its use count.
    /// Returns `None` if the handle was unregistered concurrently or the
    /// provider's factory declined.
    pub fn resolve(&self, handle: &ProviderHandle) -> Option<ProviderObject> {
        // Factories run arbitrary code; keep the shard lock out of the call.
        enum Resolved {
            Object(ProviderObject),
            Deferred(Arc<dyn Fn() -> Option<ProviderObject> + Send + Sync>),
        }
        let step = {
            let entry = self.providers.get(&handle.id())?;
            match &entry.source {
                ProviderSource::Instance(obj) => {
                    entry.use_count.fetch_add(1, Ordering::Relaxed);
                    Resolved::Object(Arc::clone(obj))
                }
                ProviderSource::Factory(f) => Resolved::Deferred(Arc::clone(f)),
            }
        };
        match step {
            Resolved::Object(obj) => Some(obj),
            Resolved::Deferred(factory) => {
                let obj = factory()?;
                if let Some(entry) = self.providers.get(&handle.id()) {
                    entry.use_count.fetch_add(1, Ordering::Relaxed);
                }
                Some(obj)
            }
        }
    }

    /// Release one use of a resolved handle. When the count drops to zero
    /// the provider is no longer held by any consumer.
    pub fn release(&self, handle: &ProviderHandle) {
        if let Some(entry) = self.providers.get(&handle.id()) {
            match entry
                .use_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            {
                Ok(1) => {
                    tracing::trace!(
                        capability = handle.capability(),
                        id = handle.id(),
                        "provider no longer in use"
                    );
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        capability = handle.capability(),
                        id = handle.id(),
                        "unbalanced release ignored"
                    );
                }
            }
        }
    }

    pub fn is_registered(&self, handle: &ProviderHandle) -> bool {
        self.providers.contains_key(&handle.id())
    }

    pub fn use_count(&self, handle: &ProviderHandle) -> usize {
        self.providers
            .get(&handle.id())
            .map(|e| e.use_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Subscribe to registry events. The returned token unsubscribes via
    /// [`ServiceRegistry::unsubscribe`].
    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, token: u64) {
        self.listeners.write().retain(|(id, _)| *id != token);
    }

    fn unregister(&self, handle: &ProviderHandle) {
        if let Some((_, entry)) = self.providers.remove(&handle.id()) {
            tracing::debug!(
                capability = handle.capability(),
                id = handle.id(),
                "provider unregistered"
            );
            self.dispatch(RegistryEvent {
                kind: EventKind::Removed,
                handle: entry.handle,
            });
        }
    }

    fn update_properties(&self, handle: &ProviderHandle, properties: PropertyMap) -> Option<ProviderHandle> {
        let updated = {
            let mut entry = self.providers.get_mut(&handle.id())?;
            let new_handle = ProviderHandle {
                id: handle.id(),
                ranking: handle.ranking(),
                capability: Arc::clone(&handle.capability),
                properties: Arc::new(properties),
            };
            entry.handle = new_handle.clone();
            new_handle
        };
        self.dispatch(RegistryEvent {
            kind: EventKind::Modified,
            handle: updated.clone(),
        });
        Some(updated)
    }

    fn dispatch(&self, event: RegistryEvent) {
        // Snapshot the listener list; callbacks may subscribe/unsubscribe or
        // register providers themselves.
        let listeners: Vec<Arc<dyn RegistryListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_registry_event(&event);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-side handle for a registration. Unregisters on drop.
pub struct ProviderRegistration {
    registry: Arc<ServiceRegistry>,
    handle: ProviderHandle,
    active: std::sync::atomic::AtomicBool,
}

impl ProviderRegistration {
    pub fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    /// Replace the registration's properties, firing a `Modified` event.
    pub fn set_properties(&mut self, properties: PropertyMap) {
        if let Some(updated) = self.registry.update_properties(&self.handle, properties) {
            self.handle = updated;
        }
    }

    pub fn unregister(&self) {
        if self
            .active
            .swap(false, Ordering::AcqRel)
        {
            self.registry.unregister(&self.handle);
        }
    }
}

impl Drop for ProviderRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropertyValue::from(*v)))
            .collect()
    }

    #[test]
    fn register_find_resolve() {
        let reg = Arc::new(ServiceRegistry::new());
        let _r = reg.register("clock", 0, props(&[]), Arc::new(42u32));

        let found = reg.find_matching("clock", None);
        assert_eq!(found.len(), 1);

        let obj = reg.resolve(&found[0]).unwrap();
        assert_eq!(*obj.downcast::<u32>().unwrap(), 42);
        assert_eq!(reg.use_count(&found[0]), 1);
        reg.release(&found[0]);
        assert_eq!(reg.use_count(&found[0]), 0);
    }

    #[test]
    fn unbalanced_release_does_not_underflow_use_count() {
        let reg = Arc::new(ServiceRegistry::new());
        let _r = reg.register("clock", 0, props(&[]), Arc::new(42u32));
        let handle = reg.find_matching("clock", None).remove(0);

        // release without a matching resolve is ignored
        reg.release(&handle);
        assert_eq!(reg.use_count(&handle), 0);

        let _obj = reg.resolve(&handle).unwrap();
        reg.release(&handle);
        reg.release(&handle);
        assert_eq!(reg.use_count(&handle), 0);
    }

    #[test]
    fn find_matching_honors_filter_and_ranking_order() {
        let reg = Arc::new(ServiceRegistry::new());
        let _a = reg.register("t", 0, props(&[("zone", "a")]), Arc::new(1u8));
        let _b = reg.register("t", 10, props(&[("zone", "b")]), Arc::new(2u8));
        let _c = reg.register("t", 10, props(&[("zone", "c")]), Arc::new(3u8));

        let all = reg.find_matching("t", None);
        assert_eq!(all.len(), 3);
        // rank 10 first; ties by registration order (lower id)
        assert_eq!(all[0].ranking(), 10);
        assert!(all[0].id() < all[1].id());
        assert_eq!(all[2].ranking(), 0);

        let filter = TargetFilter::parse("(zone=a)").unwrap();
        let filtered = reg.find_matching("t", Some(&filter));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].ranking(), 0);
    }

    #[test]
    fn unregister_fires_removed_and_invalidates_resolution() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<EventKind>>);
        impl RegistryListener for Capture {
            fn on_registry_event(&self, event: &RegistryEvent) {
                self.0.lock().push(event.kind);
            }
        }

        let reg = Arc::new(ServiceRegistry::new());
        let capture = Arc::new(Capture::default());
        reg.subscribe(capture.clone());

        let r = reg.register("t", 0, props(&[]), Arc::new(()));
        let handle = r.handle().clone();
        r.unregister();

        assert!(!reg.is_registered(&handle));
        assert!(reg.resolve(&handle).is_none());
        assert_eq!(&*capture.0.lock(), &[EventKind::Added, EventKind::Removed]);
    }

    #[test]
    fn dropping_registration_unregisters() {
        let reg = Arc::new(ServiceRegistry::new());
        {
            let _r = reg.register("t", 0, props(&[]), Arc::new(()));
            assert_eq!(reg.find_matching("t", None).len(), 1);
        }
        assert!(reg.find_matching("t", None).is_empty());
    }

    #[test]
    fn set_properties_fires_modified_with_new_snapshot() {
        struct Capture(Mutex<Vec<RegistryEvent>>);
        impl RegistryListener for Capture {
            fn on_registry_event(&self, event: &RegistryEvent) {
                self.0.lock().push(event.clone());
            }
        }

        let reg = Arc::new(ServiceRegistry::new());
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        reg.subscribe(capture.clone());

        let mut r = reg.register("t", 0, props(&[("zone", "a")]), Arc::new(()));
        r.set_properties(props(&[("zone", "b")]));

        let events = capture.0.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Modified);
        assert_eq!(
            events[1].handle.properties().get("zone"),
            Some(&PropertyValue::Str("b".into()))
        );
    }

    #[test]
    fn factory_provider_resolves_lazily_and_may_decline() {
        let reg = Arc::new(ServiceRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let _r = reg.register_factory("t", 0, props(&[]), move || {
            if calls2.fetch_add(1, Ordering::Relaxed) == 0 {
                None
            } else {
                Some(Arc::new(7u8) as ProviderObject)
            }
        });
        let handle = reg.find_matching("t", None).remove(0);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert!(reg.resolve(&handle).is_none());
        let obj = reg.resolve(&handle).unwrap();
        assert_eq!(*obj.downcast::<u8>().unwrap(), 7);
    }
}
