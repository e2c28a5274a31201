//! The component runtime facade.
//!
//! Modules declare components here; the runtime owns one
//! [`ComponentManager`] per declared component (one per configuration entry
//! for factory components), routes configuration changes to the affected
//! managers, and answers introspection queries with deep snapshots that are
//! safe to serialize.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::component::{
    ComponentFactory, ComponentManager, ComponentState, ReferenceSnapshot,
};
use crate::config::{ConfigEvent, ConfigListener, ConfigSource};
use crate::error::RuntimeError;
use crate::metadata::{
    BindingPolicy, Cardinality, ComponentMetadata, ConfigurationPolicy, PolicyOption,
};
use crate::registry::{PropertyMap, ProviderHandle, ServiceRegistry};

/// One registered component: either a single manager, or a factory holder
/// spawning one child manager per configuration entry.
enum Holder {
    Singleton(Arc<ComponentManager>),
    Factory(Arc<FactoryHolder>),
}

struct FactoryHolder {
    metadata: Arc<ComponentMetadata>,
    factory: Arc<dyn ComponentFactory>,
    enabled: Mutex<bool>,
    children: Mutex<BTreeMap<String, Arc<ComponentManager>>>,
}

struct Registered {
    module: String,
    holder: Holder,
}

pub struct ComponentRuntime {
    registry: Arc<ServiceRegistry>,
    config: Arc<dyn ConfigSource>,
    components: DashMap<String, Registered>,
    by_module: DashMap<String, Vec<String>>,
    config_token: Mutex<Option<u64>>,
}

struct RuntimeConfigListener(Weak<ComponentRuntime>);

impl ConfigListener for RuntimeConfigListener {
    fn on_config_event(&self, event: &ConfigEvent) {
        if let Some(runtime) = self.0.upgrade() {
            runtime.route_config_event(event);
        }
    }
}

impl ComponentRuntime {
    pub fn new(registry: Arc<ServiceRegistry>, config: Arc<dyn ConfigSource>) -> Arc<Self> {
        let runtime = Arc::new(Self {
            registry,
            config,
            components: DashMap::new(),
            by_module: DashMap::new(),
            config_token: Mutex::new(None),
        });
        let token = runtime
            .config
            .subscribe(Arc::new(RuntimeConfigListener(Arc::downgrade(&runtime))));
        *runtime.config_token.lock() = Some(token);
        runtime
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Declare a component on behalf of a module. Default-enabled
    /// components come up immediately.
    pub async fn register_component(
        self: &Arc<Self>,
        module: &str,
        metadata: Arc<ComponentMetadata>,
        factory: Arc<dyn ComponentFactory>,
    ) -> Result<(), RuntimeError> {
        let name = metadata.name().to_string();
        let holder = if metadata.is_factory() {
            Holder::Factory(Arc::new(FactoryHolder {
                metadata: Arc::clone(&metadata),
                factory,
                enabled: Mutex::new(false),
                children: Mutex::new(BTreeMap::new()),
            }))
        } else {
            Holder::Singleton(ComponentManager::new(
                Arc::clone(&metadata),
                factory,
                Arc::clone(&self.registry),
            ))
        };
        match self.components.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(RuntimeError::ComponentAlreadyRegistered(name));
            }
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    module: module.to_string(),
                    holder,
                });
            }
        }
        self.by_module
            .entry(module.to_string())
            .or_default()
            .push(name.clone());
        info!(component = %name, module, "component registered");

        if metadata.is_default_enabled() {
            self.enable_component(&name).await?;
        }
        Ok(())
    }

    pub async fn enable_component(self: &Arc<Self>, name: &str) -> Result<(), RuntimeError> {
        match self.holder_of(name)? {
            Holder::Singleton(manager) => {
                manager.submit_configuration(self.lookup_config(&manager));
                manager.enable().await;
            }
            Holder::Factory(factory) => {
                *factory.enabled.lock() = true;
                self.sync_factory_children(&factory);
            }
        }
        Ok(())
    }

    pub async fn disable_component(self: &Arc<Self>, name: &str) -> Result<(), RuntimeError> {
        match self.holder_of(name)? {
            Holder::Singleton(manager) => manager.disable().await,
            Holder::Factory(factory) => {
                *factory.enabled.lock() = false;
                let children: Vec<Arc<ComponentManager>> =
                    factory.children.lock().values().cloned().collect();
                for child in children {
                    child.disable().await;
                }
            }
        }
        Ok(())
    }

    pub fn is_component_enabled(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.holder_of(name)? {
            Holder::Singleton(manager) => Ok(manager.is_enabled()),
            Holder::Factory(factory) => Ok(*factory.enabled.lock()),
        }
    }

    /// Tear down every component a stopping module declared, in reverse
    /// declaration order.
    pub fn on_module_stopping(&self, module: &str) {
        let names = self
            .by_module
            .remove(module)
            .map(|(_, names)| names)
            .unwrap_or_default();
        for name in names.into_iter().rev() {
            if let Some((_, registered)) = self.components.remove(&name) {
                debug!(component = %name, module, "disposing component");
                match registered.holder {
                    Holder::Singleton(manager) => manager.dispose(),
                    Holder::Factory(factory) => {
                        let children = std::mem::take(&mut *factory.children.lock());
                        for (_, child) in children {
                            child.dispose();
                        }
                    }
                }
            }
        }
    }

    /// Shut everything down (host exit).
    pub fn dispose_all(&self) {
        let modules: Vec<String> = self.by_module.iter().map(|e| e.key().clone()).collect();
        for module in modules {
            self.on_module_stopping(&module);
        }
    }

    // ---- configuration routing ------------------------------------------

    fn lookup_config(&self, manager: &Arc<ComponentManager>) -> Option<Arc<PropertyMap>> {
        if manager.metadata().configuration_policy() == ConfigurationPolicy::Ignore {
            return None;
        }
        self.config.get(manager.metadata().configuration_pid())
    }

    fn route_config_event(self: &Arc<Self>, event: &ConfigEvent) {
        match &event.factory_pid {
            Some(factory_pid) => {
                let holders: Vec<Arc<FactoryHolder>> = self
                    .components
                    .iter()
                    .filter_map(|entry| match &entry.holder {
                        Holder::Factory(f)
                            if f.metadata.configuration_pid() == factory_pid =>
                        {
                            Some(Arc::clone(f))
                        }
                        _ => None,
                    })
                    .collect();
                for holder in holders {
                    self.sync_factory_children(&holder);
                }
            }
            None => {
                let managers: Vec<Arc<ComponentManager>> = self
                    .components
                    .iter()
                    .filter_map(|entry| match &entry.holder {
                        Holder::Singleton(m)
                            if m.metadata().configuration_pid() == event.pid
                                && m.metadata().configuration_policy()
                                    != ConfigurationPolicy::Ignore =>
                        {
                            Some(Arc::clone(m))
                        }
                        _ => None,
                    })
                    .collect();
                for manager in managers {
                    manager.submit_configuration(event.properties.clone());
                }
            }
        }
    }

    /// Bring a factory holder's children in line with the configuration
    /// entries under its pid: one child per entry, children for deleted
    /// entries disposed.
    fn sync_factory_children(self: &Arc<Self>, holder: &Arc<FactoryHolder>) {
        let entries = self
            .config
            .factory_entries(holder.metadata.configuration_pid());
        let enabled = *holder.enabled.lock();

        // mutate the map under the lock, defer manager calls past it
        let mut to_dispose: Vec<Arc<ComponentManager>> = Vec::new();
        let mut to_apply: Vec<(Arc<ComponentManager>, Arc<PropertyMap>)> = Vec::new();
        {
            let mut children = holder.children.lock();
            let live: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
            let gone: Vec<String> = children
                .keys()
                .filter(|id| !live.contains(id))
                .cloned()
                .collect();
            for id in gone {
                if let Some(child) = children.remove(&id) {
                    to_dispose.push(child);
                }
            }
            for (id, properties) in entries {
                let child = children.entry(id).or_insert_with(|| {
                    ComponentManager::new(
                        Arc::clone(&holder.metadata),
                        Arc::clone(&holder.factory),
                        Arc::clone(&self.registry),
                    )
                });
                to_apply.push((Arc::clone(child), properties));
            }
        }
        for child in to_dispose {
            child.dispose();
        }
        for (child, properties) in to_apply {
            child.submit_configuration(Some(properties));
            if enabled {
                child.enable_nowait();
            } else {
                child.disable_nowait();
            }
        }
    }

    fn holder_of(&self, name: &str) -> Result<Holder, RuntimeError> {
        let entry = self
            .components
            .get(name)
            .ok_or_else(|| RuntimeError::ComponentNotFound(name.to_string()))?;
        Ok(match &entry.holder {
            Holder::Singleton(m) => Holder::Singleton(Arc::clone(m)),
            Holder::Factory(f) => Holder::Factory(Arc::clone(f)),
        })
    }

    // ---- introspection --------------------------------------------------

    pub fn description(&self, name: &str) -> Option<ComponentDescriptionDto> {
        let entry = self.components.get(name)?;
        Some(Self::describe(name, &entry))
    }

    pub fn descriptions(&self) -> Vec<ComponentDescriptionDto> {
        let mut all: Vec<ComponentDescriptionDto> = self
            .components
            .iter()
            .map(|entry| Self::describe(entry.key(), &entry))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn descriptions_for_module(&self, module: &str) -> Vec<ComponentDescriptionDto> {
        let names = self
            .by_module
            .get(module)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        names
            .iter()
            .filter_map(|name| self.description(name))
            .collect()
    }

    fn describe(name: &str, registered: &Registered) -> ComponentDescriptionDto {
        let (metadata, instances) = match &registered.holder {
            Holder::Singleton(manager) => (
                Arc::clone(manager.metadata()),
                vec![Self::describe_instance(None, manager)],
            ),
            Holder::Factory(factory) => {
                let children = factory.children.lock();
                let instances = children
                    .iter()
                    .map(|(id, child)| Self::describe_instance(Some(id.clone()), child))
                    .collect();
                (Arc::clone(&factory.metadata), instances)
            }
        };
        ComponentDescriptionDto {
            name: name.to_string(),
            module: registered.module.clone(),
            implementation: metadata.implementation().to_string(),
            configuration_policy: metadata.configuration_policy(),
            configuration_pid: metadata.configuration_pid().to_string(),
            factory: metadata.is_factory(),
            immediate: metadata.is_immediate(),
            default_enabled: metadata.is_default_enabled(),
            activate: metadata.activate_name().map(str::to_string),
            deactivate: metadata.deactivate_name().map(str::to_string),
            modified: metadata.modified_name().map(str::to_string),
            provides: metadata.provides().to_vec(),
            instances,
        }
    }

    fn describe_instance(
        id: Option<String>,
        manager: &Arc<ComponentManager>,
    ) -> ComponentInstanceDto {
        ComponentInstanceDto {
            id,
            state: manager.state(),
            failure: manager.last_failure(),
            configuration: manager.configuration().map(|c| (*c).clone()),
            references: manager
                .reference_snapshots()
                .into_iter()
                .map(ReferenceDto::from)
                .collect(),
        }
    }
}

impl Drop for ComponentRuntime {
    fn drop(&mut self) {
        if let Some(token) = self.config_token.lock().take() {
            self.config.unsubscribe(token);
        }
        if !self.components.is_empty() {
            warn!("component runtime dropped with live components");
        }
    }
}

// ---- introspection DTOs -------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ComponentDescriptionDto {
    pub name: String,
    pub module: String,
    pub implementation: String,
    pub configuration_policy: ConfigurationPolicy,
    pub configuration_pid: String,
    pub factory: bool,
    pub immediate: bool,
    pub default_enabled: bool,
    /// Declared lifecycle callback names, when they differ from the
    /// conventional ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    pub provides: Vec<String>,
    pub instances: Vec<ComponentInstanceDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentInstanceDto {
    /// Factory-instance id; absent for singleton components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub state: ComponentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PropertyMap>,
    pub references: Vec<ReferenceDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceDto {
    pub name: String,
    pub capability: String,
    pub cardinality: Cardinality,
    pub policy: BindingPolicy,
    pub policy_option: PolicyOption,
    pub satisfied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub bound: Vec<BoundProviderDto>,
    /// Providers matching the effective filter but not bound, typically
    /// the interesting part of an unsatisfied or reluctant reference.
    pub candidates: Vec<BoundProviderDto>,
}

impl From<ReferenceSnapshot> for ReferenceDto {
    fn from(snapshot: ReferenceSnapshot) -> Self {
        Self {
            name: snapshot.name,
            capability: snapshot.capability,
            cardinality: snapshot.cardinality,
            policy: snapshot.policy,
            policy_option: snapshot.policy_option,
            satisfied: snapshot.satisfied,
            target: snapshot.target,
            bound: snapshot.bound.iter().map(BoundProviderDto::from).collect(),
            candidates: snapshot
                .candidates
                .iter()
                .map(BoundProviderDto::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundProviderDto {
    pub id: u64,
    pub capability: String,
    pub ranking: i32,
}

impl From<&ProviderHandle> for BoundProviderDto {
    fn from(handle: &ProviderHandle) -> Self {
        Self {
            id: handle.id(),
            capability: handle.capability().to_string(),
            ranking: handle.ranking(),
        }
    }
}
