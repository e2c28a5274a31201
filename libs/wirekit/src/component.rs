//! Component lifecycle management.
//!
//! A [`ComponentManager`] owns one declared component: its state machine,
//! its reference managers, and (while active) the constructed instance.
//! Everything that can mutate a manager goes through its task queue; whoever
//! submits a task and finds the queue idle becomes the drainer and processes
//! tasks inline until the queue is empty. That gives strict serialization
//! per component without a dedicated thread, and lets lifecycle callbacks
//! run with no locks held.
//!
//! Components that provide capabilities are *delayed*: reaching `Satisfied`
//! registers the provided capabilities, but the instance is only constructed
//! when a consumer first resolves one of them. Components providing nothing
//! (or declared immediate) activate as soon as they are satisfied.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::binding::InjectionPoint;
use crate::filter::TargetFilter;
use crate::metadata::{
    BindingPolicy, Cardinality, ComponentMetadata, ConfigurationPolicy, PolicyOption,
};
use crate::reference::{RefOutcome, RefPair, ReferenceManager};
use crate::registry::{
    EventKind, PropertyMap, PropertyValue, ProviderHandle, ProviderObject,
    ProviderRegistration, RegistryEvent, RegistryListener, ServiceRegistry,
};
use crate::values::{resolve_element, resolve_shape, BoundValue};

/// How long an on-demand activation waits for another thread's task loop
/// before giving up and reporting the provider as absent.
const ON_DEMAND_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Disabled,
    UnsatisfiedConfiguration,
    UnsatisfiedReference,
    Satisfied,
    Active,
    Deactivating,
    FailedActivation,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::Disabled => "disabled",
            ComponentState::UnsatisfiedConfiguration => "unsatisfied_configuration",
            ComponentState::UnsatisfiedReference => "unsatisfied_reference",
            ComponentState::Satisfied => "satisfied",
            ComponentState::Active => "active",
            ComponentState::Deactivating => "deactivating",
            ComponentState::FailedActivation => "failed_activation",
        };
        f.write_str(s)
    }
}

/// What an activating component sees: its merged properties and a snapshot
/// of every reference's resolved value.
pub struct ActivationContext {
    properties: Arc<PropertyMap>,
    bindings: BTreeMap<String, BoundValue>,
}

impl ActivationContext {
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// The value bound for a declared reference, by reference name.
    pub fn binding(&self, reference: &str) -> Option<&BoundValue> {
        self.bindings.get(reference)
    }
}

/// Callbacks a component implementation may receive. All default to no-ops
/// so implementations only override what they declare in metadata.
///
/// Callbacks are serialized per component and invoked with no runtime locks
/// held; they may resolve other capabilities (which can trigger on-demand
/// activations) but must not block indefinitely.
pub trait ComponentLifecycle: Send + Sync {
    fn activate(&self, _ctx: &ActivationContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn deactivate(&self) {}

    /// Configuration changed while active. Only called when the component
    /// declares a modified callback; otherwise a change reactivates.
    fn modified(&self, _properties: &PropertyMap) -> anyhow::Result<()> {
        Ok(())
    }

    fn bind(&self, _reference: &str, _value: BoundValue) -> anyhow::Result<()> {
        Ok(())
    }

    fn unbind(&self, _reference: &str, _value: BoundValue) {}

    /// A bound provider's properties changed (declared updated callback).
    fn updated(&self, _reference: &str, _value: BoundValue) {}
}

/// A constructed component: the lifecycle receiver plus the object handed
/// out for its provided capabilities.
pub struct ComponentInstance {
    lifecycle: Arc<dyn ComponentLifecycle>,
    service: ProviderObject,
}

impl ComponentInstance {
    /// The common case: the component object is also the provided service.
    pub fn new<T: ComponentLifecycle + 'static>(component: Arc<T>) -> Self {
        Self {
            service: Arc::clone(&component) as ProviderObject,
            lifecycle: component,
        }
    }

    /// Provide a service object distinct from the lifecycle receiver.
    pub fn with_service<T: ComponentLifecycle + 'static>(
        component: Arc<T>,
        service: ProviderObject,
    ) -> Self {
        Self {
            lifecycle: component,
            service,
        }
    }
}

/// Inputs to instance construction: merged properties plus the resolved
/// value for every constructor-injected reference, by parameter index.
pub struct ConstructorArgs {
    properties: Arc<PropertyMap>,
    values: Vec<BoundValue>,
}

impl ConstructorArgs {
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Take the value for constructor parameter `index`, leaving `Absent`.
    pub fn take(&mut self, index: usize) -> BoundValue {
        self.values
            .get_mut(index)
            .map(|v| std::mem::replace(v, BoundValue::Absent))
            .unwrap_or(BoundValue::Absent)
    }
}

/// Constructs component instances. Implemented for plain closures.
pub trait ComponentFactory: Send + Sync {
    fn construct(&self, args: ConstructorArgs) -> anyhow::Result<ComponentInstance>;
}

impl<F> ComponentFactory for F
where
    F: Fn(ConstructorArgs) -> anyhow::Result<ComponentInstance> + Send + Sync,
{
    fn construct(&self, args: ConstructorArgs) -> anyhow::Result<ComponentInstance> {
        self(args)
    }
}

/// Introspection snapshot of one reference.
#[derive(Debug, Clone)]
pub struct ReferenceSnapshot {
    pub name: String,
    pub capability: String,
    pub cardinality: Cardinality,
    pub policy: BindingPolicy,
    pub policy_option: PolicyOption,
    pub satisfied: bool,
    pub target: Option<String>,
    pub bound: Vec<ProviderHandle>,
    /// Providers visible through the effective filter but not currently
    /// bound.
    pub candidates: Vec<ProviderHandle>,
}

enum Task {
    Enable(Option<tokio::sync::oneshot::Sender<()>>),
    Disable(Option<tokio::sync::oneshot::Sender<()>>),
    Dispose(Option<tokio::sync::oneshot::Sender<()>>),
    Registry(RegistryEvent),
    Configuration(Option<Arc<PropertyMap>>),
    Activate(Option<mpsc::Sender<()>>),
}

struct Inner {
    state: ComponentState,
    enabled: bool,
    disposed: bool,
    /// Guards against re-entrant activation while callbacks are running.
    activating: bool,
    configuration: Option<Arc<PropertyMap>>,
    references: Vec<ReferenceManager>,
    instance: Option<ComponentInstance>,
    /// Pairs in the order their bind callbacks fired; unbinds run in reverse.
    bind_order: Vec<(usize, Arc<RefPair>)>,
    provided: Vec<ProviderRegistration>,
    last_failure: Option<String>,
}

pub struct ComponentManager {
    metadata: Arc<ComponentMetadata>,
    factory: Arc<dyn ComponentFactory>,
    registry: Arc<ServiceRegistry>,
    inner: Mutex<Inner>,
    tasks: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    drainer: Mutex<Option<ThreadId>>,
    listener_token: Mutex<Option<u64>>,
}

struct ManagerListener {
    manager: Weak<ComponentManager>,
    capabilities: HashSet<String>,
}

impl RegistryListener for ManagerListener {
    fn on_registry_event(&self, event: &RegistryEvent) {
        if !self.capabilities.contains(event.handle.capability()) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.submit(Task::Registry(event.clone()));
        }
    }
}

impl ComponentManager {
    pub(crate) fn new(
        metadata: Arc<ComponentMetadata>,
        factory: Arc<dyn ComponentFactory>,
        registry: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        let references = metadata
            .references()
            .iter()
            .cloned()
            .map(ReferenceManager::new)
            .collect();
        let manager = Arc::new(Self {
            metadata: Arc::clone(&metadata),
            factory,
            registry: Arc::clone(&registry),
            inner: Mutex::new(Inner {
                state: ComponentState::Disabled,
                enabled: false,
                disposed: false,
                activating: false,
                configuration: None,
                references,
                instance: None,
                bind_order: Vec::new(),
                provided: Vec::new(),
                last_failure: None,
            }),
            tasks: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            drainer: Mutex::new(None),
            listener_token: Mutex::new(None),
        });
        let capabilities: HashSet<String> = metadata
            .references()
            .iter()
            .map(|r| r.capability().to_string())
            .collect();
        if !capabilities.is_empty() {
            let token = registry.subscribe(Arc::new(ManagerListener {
                manager: Arc::downgrade(&manager),
                capabilities,
            }));
            *manager.listener_token.lock() = Some(token);
        }
        manager
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn metadata(&self) -> &Arc<ComponentMetadata> {
        &self.metadata
    }

    pub fn state(&self) -> ComponentState {
        self.inner.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn last_failure(&self) -> Option<String> {
        self.inner.lock().last_failure.clone()
    }

    pub fn configuration(&self) -> Option<Arc<PropertyMap>> {
        self.inner.lock().configuration.clone()
    }

    pub fn reference_snapshots(&self) -> Vec<ReferenceSnapshot> {
        let inner = self.inner.lock();
        inner
            .references
            .iter()
            .map(|rm| {
                let bound: Vec<ProviderHandle> =
                    rm.bound().iter().map(|p| p.handle().clone()).collect();
                let candidates = rm
                    .tracked()
                    .iter()
                    .filter(|h| !bound.contains(*h))
                    .cloned()
                    .collect();
                ReferenceSnapshot {
                    name: rm.meta().name().to_string(),
                    capability: rm.meta().capability().to_string(),
                    cardinality: rm.meta().cardinality(),
                    policy: rm.meta().policy(),
                    policy_option: rm.meta().policy_option(),
                    satisfied: rm.is_satisfied(),
                    target: rm.meta().target().map(str::to_string),
                    bound,
                    candidates,
                }
            })
            .collect()
    }

    /// Enable the component, resolving once the state machine has settled.
    pub async fn enable(self: &Arc<Self>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(Task::Enable(Some(tx)));
        let _ = rx.await;
    }

    /// Disable the component, resolving once any live instance has been
    /// deactivated.
    pub async fn disable(self: &Arc<Self>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(Task::Disable(Some(tx)));
        let _ = rx.await;
    }

    /// Disable permanently and detach from the registry. Fire-and-forget;
    /// the teardown runs inline when the manager is idle.
    pub fn dispose(self: &Arc<Self>) {
        self.submit(Task::Dispose(None));
    }

    pub(crate) fn submit_configuration(self: &Arc<Self>, config: Option<Arc<PropertyMap>>) {
        self.submit(Task::Configuration(config));
    }

    /// Enable without waiting for the state machine to settle; used on
    /// synchronous paths (configuration callbacks) where awaiting is not an
    /// option. The work still runs inline when the manager is idle.
    pub(crate) fn enable_nowait(self: &Arc<Self>) {
        self.submit(Task::Enable(None));
    }

    pub(crate) fn disable_nowait(self: &Arc<Self>) {
        self.submit(Task::Disable(None));
    }

    // ---- task queue -----------------------------------------------------

    fn submit(self: &Arc<Self>, task: Task) {
        self.tasks.lock().push_back(task);
        self.drain();
    }

    fn drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.drainer.lock() = Some(std::thread::current().id());
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => self.run_task(task),
                None => {
                    *self.drainer.lock() = None;
                    self.draining.store(false, Ordering::Release);
                    // a task may have been queued between the pop and the
                    // flag reset; re-acquire or leave it to the enqueuer
                    if self.tasks.lock().is_empty()
                        || self.draining.swap(true, Ordering::AcqRel)
                    {
                        return;
                    }
                    *self.drainer.lock() = Some(std::thread::current().id());
                }
            }
        }
    }

    fn is_current_thread_draining(&self) -> bool {
        *self.drainer.lock() == Some(std::thread::current().id())
    }

    fn run_task(self: &Arc<Self>, task: Task) {
        match task {
            Task::Enable(done) => {
                self.do_enable();
                if let Some(tx) = done {
                    let _ = tx.send(());
                }
            }
            Task::Disable(done) => {
                self.do_disable();
                if let Some(tx) = done {
                    let _ = tx.send(());
                }
            }
            Task::Dispose(done) => {
                self.do_dispose();
                if let Some(tx) = done {
                    let _ = tx.send(());
                }
            }
            Task::Registry(event) => self.do_registry_event(event),
            Task::Configuration(config) => self.do_configuration(config),
            Task::Activate(done) => {
                self.do_activate();
                if let Some(tx) = done {
                    let _ = tx.send(());
                }
            }
        }
    }

    // ---- state transitions ----------------------------------------------

    fn do_enable(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed || inner.enabled {
                return;
            }
            inner.enabled = true;
            inner.last_failure = None;
            let Inner {
                references,
                configuration,
                ..
            } = &mut *inner;
            for rm in references.iter_mut() {
                rm.init(&self.registry);
            }
            Self::apply_target_overrides(references, configuration, &self.registry);
        }
        info!(component = %self.metadata.name(), "component enabled");
        self.reevaluate();
    }

    fn do_disable(self: &Arc<Self>) {
        let was_active = {
            let mut inner = self.inner.lock();
            if !inner.enabled {
                return;
            }
            inner.enabled = false;
            inner.state == ComponentState::Active
        };
        if was_active {
            self.deactivate_instance(ComponentState::Disabled);
        } else {
            self.inner.lock().state = ComponentState::Disabled;
        }
        self.sync_provided();
        let mut inner = self.inner.lock();
        for rm in &mut inner.references {
            rm.reset();
        }
        drop(inner);
        info!(component = %self.metadata.name(), "component disabled");
    }

    fn do_dispose(self: &Arc<Self>) {
        self.do_disable();
        self.inner.lock().disposed = true;
        if let Some(token) = self.listener_token.lock().take() {
            self.registry.unsubscribe(token);
        }
        debug!(component = %self.metadata.name(), "component disposed");
    }

    /// The state an enabled-but-inactive component should be in right now.
    fn unactive_state(&self, inner: &Inner) -> ComponentState {
        if !inner.enabled {
            return ComponentState::Disabled;
        }
        if self.metadata.configuration_policy() == ConfigurationPolicy::Require
            && inner.configuration.is_none()
        {
            return ComponentState::UnsatisfiedConfiguration;
        }
        if inner.references.iter().any(|rm| !rm.is_satisfied()) {
            return ComponentState::UnsatisfiedReference;
        }
        ComponentState::Satisfied
    }

    /// Recompute the state from current satisfaction and follow through:
    /// deactivate a no-longer-satisfiable instance, (un)register provided
    /// capabilities, activate immediate components.
    fn reevaluate(self: &Arc<Self>) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            let target = self.unactive_state(&inner);
            let old = inner.state;
            if old == ComponentState::Active {
                if target == ComponentState::Satisfied {
                    return;
                }
                Some((old, target))
            } else if old == target {
                None
            } else {
                inner.state = target;
                Some((old, target))
            }
        };
        let Some((old, new)) = transition else { return };
        debug!(
            component = %self.metadata.name(),
            from = %old,
            to = %new,
            "component state change"
        );
        if old == ComponentState::Active {
            self.deactivate_instance(new);
            self.sync_provided();
            return;
        }
        self.sync_provided();
        if new == ComponentState::Satisfied && self.metadata.is_immediate() {
            self.do_activate();
        }
    }

    /// Keep the provided-capability registrations in step with the state:
    /// registered while Satisfied or Active, gone otherwise.
    fn sync_provided(self: &Arc<Self>) {
        if self.metadata.provides().is_empty() {
            return;
        }
        let (should_register, is_registered) = {
            let inner = self.inner.lock();
            let should = matches!(
                inner.state,
                ComponentState::Satisfied | ComponentState::Active
            );
            (should, !inner.provided.is_empty())
        };
        if should_register && !is_registered {
            let mut props = PropertyMap::new();
            props.insert(
                "component.name".to_string(),
                PropertyValue::Str(self.metadata.name().to_string()),
            );
            let registrations: Vec<ProviderRegistration> = self
                .metadata
                .provides()
                .iter()
                .map(|capability| {
                    let weak = Arc::downgrade(self);
                    self.registry.register_factory(
                        capability,
                        0,
                        props.clone(),
                        move || weak.upgrade().and_then(|m| m.resolve_on_demand()),
                    )
                })
                .collect();
            self.inner.lock().provided = registrations;
        } else if !should_register && is_registered {
            // dropping the registrations unregisters them
            let registrations = std::mem::take(&mut self.inner.lock().provided);
            drop(registrations);
        }
    }

    /// Entry point for delayed activation: a consumer resolved one of our
    /// provided capabilities.
    fn resolve_on_demand(self: &Arc<Self>) -> Option<ProviderObject> {
        {
            let inner = self.inner.lock();
            if inner.disposed {
                return None;
            }
            match inner.state {
                ComponentState::Active => {
                    return inner.instance.as_ref().map(|i| i.service.clone());
                }
                ComponentState::Satisfied => {}
                _ => return None,
            }
            if inner.activating {
                // resolution cycle through our own activation
                warn!(
                    component = %self.metadata.name(),
                    "circular on-demand activation, reporting absent"
                );
                return None;
            }
        }
        if self.is_current_thread_draining() {
            // re-entrant resolution from one of our own callbacks; we hold
            // the serialization already, so run the activation inline
            self.do_activate();
        } else {
            let (tx, rx) = mpsc::channel();
            self.submit(Task::Activate(Some(tx)));
            if rx.recv_timeout(ON_DEMAND_WAIT).is_err() {
                warn!(
                    component = %self.metadata.name(),
                    "timed out waiting for on-demand activation"
                );
                return None;
            }
        }
        let inner = self.inner.lock();
        if inner.state == ComponentState::Active {
            inner.instance.as_ref().map(|i| i.service.clone())
        } else {
            None
        }
    }

    fn effective_properties(&self) -> Arc<PropertyMap> {
        let inner = self.inner.lock();
        let mut props = inner
            .configuration
            .as_deref()
            .cloned()
            .unwrap_or_default();
        props.insert(
            "component.name".to_string(),
            PropertyValue::Str(self.metadata.name().to_string()),
        );
        Arc::new(props)
    }

    fn do_activate(self: &Arc<Self>) {
        let pair_sets: Vec<Vec<Arc<RefPair>>> = {
            let mut inner = self.inner.lock();
            if inner.state != ComponentState::Satisfied || inner.activating {
                return;
            }
            inner.activating = true;
            inner
                .references
                .iter_mut()
                .map(|rm| rm.bind_initial())
                .collect()
        };
        let properties = self.effective_properties();

        // resolve constructor-injected values; a vanished mandatory provider
        // aborts (the pending removal event will fix the state)
        let mut ctor_values = vec![BoundValue::Absent; self.metadata.constructor_params()];
        for (idx, rmeta) in self.metadata.references().iter().enumerate() {
            let InjectionPoint::Constructor { index } = rmeta.injection() else {
                continue;
            };
            match resolve_shape(rmeta.shape(), &pair_sets[idx], &self.registry) {
                Some(value) => ctor_values[*index] = value,
                None => {
                    warn!(
                        component = %self.metadata.name(),
                        reference = rmeta.name(),
                        "provider vanished during activation"
                    );
                    self.abort_activation();
                    return;
                }
            }
        }

        let instance = match self.factory.construct(ConstructorArgs {
            properties: Arc::clone(&properties),
            values: ctor_values,
        }) {
            Ok(instance) => instance,
            Err(err) => {
                error!(
                    component = %self.metadata.name(),
                    error = %format!("{err:#}"),
                    "instance construction failed"
                );
                self.fail_activation(format!("construction failed: {err:#}"));
                return;
            }
        };

        // bind callbacks in declaration order; a mandatory unary provider
        // that can no longer resolve aborts the whole activation, same as
        // the constructor path
        let mut bind_order: Vec<(usize, Arc<RefPair>)> = Vec::new();
        let mut bindings = BTreeMap::new();
        for (idx, rmeta) in self.metadata.references().iter().enumerate() {
            let pairs = &pair_sets[idx];
            match rmeta.injection() {
                InjectionPoint::Constructor { .. } => {
                    for pair in pairs {
                        bind_order.push((idx, Arc::clone(pair)));
                    }
                }
                InjectionPoint::Method { .. } => {
                    for pair in pairs {
                        let value = match rmeta.element_shape() {
                            Some(shape) => {
                                match resolve_element(&shape, pair, &self.registry) {
                                    Some(value) => value,
                                    None if rmeta.cardinality().is_mandatory()
                                        && !rmeta.cardinality().is_multiple() =>
                                    {
                                        warn!(
                                            component = %self.metadata.name(),
                                            reference = rmeta.name(),
                                            "provider vanished during activation"
                                        );
                                        self.unwind_binds(&instance, &bind_order);
                                        self.abort_activation();
                                        return;
                                    }
                                    None => BoundValue::Absent,
                                }
                            }
                            None => BoundValue::Absent,
                        };
                        if let Err(err) = instance.lifecycle.bind(rmeta.name(), value) {
                            warn!(
                                component = %self.metadata.name(),
                                reference = rmeta.name(),
                                error = %format!("{err:#}"),
                                "bind callback failed"
                            );
                        }
                        bind_order.push((idx, Arc::clone(pair)));
                    }
                }
                InjectionPoint::Field { .. } => {
                    let value = match resolve_shape(rmeta.shape(), pairs, &self.registry) {
                        Some(value) => value,
                        None if rmeta.cardinality().is_mandatory() => {
                            warn!(
                                component = %self.metadata.name(),
                                reference = rmeta.name(),
                                "provider vanished during activation"
                            );
                            self.unwind_binds(&instance, &bind_order);
                            self.abort_activation();
                            return;
                        }
                        None => BoundValue::Absent,
                    };
                    if let Err(err) = instance.lifecycle.bind(rmeta.name(), value) {
                        warn!(
                            component = %self.metadata.name(),
                            reference = rmeta.name(),
                            error = %format!("{err:#}"),
                            "field injection failed"
                        );
                    }
                    for pair in pairs {
                        bind_order.push((idx, Arc::clone(pair)));
                    }
                }
            }
            bindings.insert(
                rmeta.name().to_string(),
                resolve_shape(rmeta.shape(), pairs, &self.registry)
                    .unwrap_or(BoundValue::Absent),
            );
        }

        let ctx = ActivationContext {
            properties,
            bindings,
        };
        match instance.lifecycle.activate(&ctx) {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.instance = Some(instance);
                inner.bind_order = bind_order;
                inner.activating = false;
                inner.state = ComponentState::Active;
                inner.last_failure = None;
                drop(inner);
                info!(component = %self.metadata.name(), "component activated");
            }
            Err(err) => {
                error!(
                    component = %self.metadata.name(),
                    error = %format!("{err:#}"),
                    "activate callback failed"
                );
                self.unwind_binds(&instance, &bind_order);
                self.fail_activation(format!("activate failed: {err:#}"));
            }
        }
    }

    /// Fire unbind callbacks for already-delivered binds, newest first.
    fn unwind_binds(&self, instance: &ComponentInstance, bind_order: &[(usize, Arc<RefPair>)]) {
        for (idx, pair) in bind_order.iter().rev() {
            let rmeta = &self.metadata.references()[*idx];
            if matches!(rmeta.injection(), InjectionPoint::Constructor { .. }) {
                continue;
            }
            let value = rmeta
                .element_shape()
                .and_then(|shape| resolve_element(&shape, pair, &self.registry))
                .unwrap_or(BoundValue::Absent);
            instance.lifecycle.unbind(rmeta.name(), value);
        }
    }

    /// Roll back a started activation without recording a failure.
    fn abort_activation(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        for rm in &mut inner.references {
            for pair in rm.take_bound() {
                pair.release(&self.registry);
            }
        }
        inner.activating = false;
    }

    fn fail_activation(self: &Arc<Self>, failure: String) {
        {
            let mut inner = self.inner.lock();
            for rm in &mut inner.references {
                for pair in rm.take_bound() {
                    pair.release(&self.registry);
                }
            }
            inner.bind_order.clear();
            inner.activating = false;
            inner.state = ComponentState::FailedActivation;
            inner.last_failure = Some(failure);
        }
        self.sync_provided();
    }

    fn deactivate_instance(self: &Arc<Self>, target: ComponentState) {
        let (instance, bind_order) = {
            let mut inner = self.inner.lock();
            if inner.state != ComponentState::Active {
                inner.state = target;
                return;
            }
            inner.state = ComponentState::Deactivating;
            (inner.instance.take(), std::mem::take(&mut inner.bind_order))
        };
        if let Some(instance) = instance {
            self.unwind_binds(&instance, &bind_order);
            instance.lifecycle.deactivate();
        }
        let mut inner = self.inner.lock();
        for rm in &mut inner.references {
            for pair in rm.take_bound() {
                pair.release(&self.registry);
            }
        }
        inner.state = target;
        drop(inner);
        info!(component = %self.metadata.name(), state = %target, "component deactivated");
    }

    fn do_reactivate(self: &Arc<Self>) {
        if self.inner.lock().state == ComponentState::Active {
            self.deactivate_instance(ComponentState::Satisfied);
        }
        self.reevaluate();
        // a delayed component stays Satisfied; the next resolve activates it
        if self.metadata.is_immediate() && self.inner.lock().state == ComponentState::Satisfied {
            self.do_activate();
        }
    }

    fn do_registry_event(self: &Arc<Self>, event: RegistryEvent) {
        enum Plan {
            Rebind {
                idx: usize,
                bind: Option<Arc<RefPair>>,
                unbind: Option<Arc<RefPair>>,
            },
            Updated {
                idx: usize,
                pair: Arc<RefPair>,
            },
        }

        let mut plans: Vec<Plan> = Vec::new();
        let mut needs_reevaluate = false;
        let mut reactivate = false;
        {
            let mut inner = self.inner.lock();
            if inner.disposed || !inner.enabled {
                return;
            }
            let active = inner.state == ComponentState::Active;
            for (idx, rm) in inner.references.iter_mut().enumerate() {
                let outcome = match event.kind {
                    EventKind::Added => rm.on_provider_added(event.handle.clone(), active),
                    EventKind::Removed => rm.on_provider_removed(&event.handle, active),
                    EventKind::Modified => rm.on_provider_modified(event.handle.clone(), active),
                };
                match outcome {
                    RefOutcome::Ignored => {}
                    RefOutcome::SatisfactionChanged => needs_reevaluate = true,
                    RefOutcome::Rebind { bind, unbind } => {
                        plans.push(Plan::Rebind { idx, bind, unbind });
                        needs_reevaluate = true;
                    }
                    RefOutcome::Updated(pair) => plans.push(Plan::Updated { idx, pair }),
                    RefOutcome::Reactivate => reactivate = true,
                }
            }
        }

        if reactivate {
            self.do_reactivate();
            return;
        }

        let lifecycle = self
            .inner
            .lock()
            .instance
            .as_ref()
            .map(|i| Arc::clone(&i.lifecycle));
        if let Some(lifecycle) = &lifecycle {
            for plan in plans {
                match plan {
                    Plan::Rebind { idx, bind, unbind } => {
                        self.apply_rebind(lifecycle, idx, bind, unbind);
                    }
                    Plan::Updated { idx, pair } => {
                        let rmeta = &self.metadata.references()[idx];
                        let value = rmeta
                            .element_shape()
                            .and_then(|shape| resolve_element(&shape, &pair, &self.registry))
                            .unwrap_or(BoundValue::Absent);
                        lifecycle.updated(rmeta.name(), value);
                    }
                }
            }
        }

        if needs_reevaluate {
            self.reevaluate();
        }
    }

    /// Deliver a dynamic rebind to a live instance: bind the newcomer, then
    /// unbind and release the outgoing pair.
    fn apply_rebind(
        self: &Arc<Self>,
        lifecycle: &Arc<dyn ComponentLifecycle>,
        idx: usize,
        bind: Option<Arc<RefPair>>,
        unbind: Option<Arc<RefPair>>,
    ) {
        let rmeta = &self.metadata.references()[idx];
        let is_field = matches!(rmeta.injection(), InjectionPoint::Field { .. });

        if let Some(pair) = &bind {
            if is_field {
                // field injection gets the refreshed aggregate, not elements
                let pairs = self.inner.lock().references[idx].bound_in_ranking_order();
                let value = resolve_shape(rmeta.shape(), &pairs, &self.registry)
                    .unwrap_or(BoundValue::Absent);
                if let Err(err) = lifecycle.bind(rmeta.name(), value) {
                    warn!(
                        component = %self.metadata.name(),
                        reference = rmeta.name(),
                        error = %format!("{err:#}"),
                        "field injection failed"
                    );
                }
            } else {
                let value = rmeta
                    .element_shape()
                    .and_then(|shape| resolve_element(&shape, pair, &self.registry))
                    .unwrap_or(BoundValue::Absent);
                if let Err(err) = lifecycle.bind(rmeta.name(), value) {
                    warn!(
                        component = %self.metadata.name(),
                        reference = rmeta.name(),
                        error = %format!("{err:#}"),
                        "bind callback failed"
                    );
                }
            }
            self.inner.lock().bind_order.push((idx, Arc::clone(pair)));
        }

        if let Some(pair) = unbind {
            if is_field {
                if bind.is_none() {
                    // removal without replacement still refreshes the field
                    let pairs = self.inner.lock().references[idx].bound_in_ranking_order();
                    let value = resolve_shape(rmeta.shape(), &pairs, &self.registry)
                        .unwrap_or(BoundValue::Absent);
                    if let Err(err) = lifecycle.bind(rmeta.name(), value) {
                        warn!(
                            component = %self.metadata.name(),
                            reference = rmeta.name(),
                            error = %format!("{err:#}"),
                            "field injection failed"
                        );
                    }
                }
            } else {
                let value = rmeta
                    .element_shape()
                    .and_then(|shape| resolve_element(&shape, &pair, &self.registry))
                    .unwrap_or(BoundValue::Absent);
                lifecycle.unbind(rmeta.name(), value);
            }
            pair.release(&self.registry);
            self.inner
                .lock()
                .bind_order
                .retain(|(_, p)| !Arc::ptr_eq(p, &pair));
        }
    }

    fn do_configuration(self: &Arc<Self>, config: Option<Arc<PropertyMap>>) {
        let (content_changed, overrides_changed, was_active) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            let content_changed = inner.configuration != config;
            inner.configuration = config;
            let enabled = inner.enabled;
            let was_active = inner.state == ComponentState::Active;
            let Inner {
                references,
                configuration,
                ..
            } = &mut *inner;
            let overrides_changed = if enabled {
                Self::apply_target_overrides(references, configuration, &self.registry)
            } else {
                false
            };
            (content_changed, overrides_changed, was_active)
        };
        if !content_changed && !overrides_changed {
            return;
        }

        if was_active {
            let config_gone = self.metadata.configuration_policy()
                == ConfigurationPolicy::Require
                && self.inner.lock().configuration.is_none();
            if config_gone {
                self.deactivate_instance(ComponentState::UnsatisfiedConfiguration);
                self.sync_provided();
                return;
            }
            if overrides_changed {
                // the captured selection may no longer match the new targets
                self.do_reactivate();
                return;
            }
            if self.metadata.has_modified_callback() {
                let properties = self.effective_properties();
                let lifecycle = self
                    .inner
                    .lock()
                    .instance
                    .as_ref()
                    .map(|i| Arc::clone(&i.lifecycle));
                if let Some(lifecycle) = lifecycle {
                    if let Err(err) = lifecycle.modified(&properties) {
                        warn!(
                            component = %self.metadata.name(),
                            error = %format!("{err:#}"),
                            "modified callback failed, reactivating"
                        );
                        self.do_reactivate();
                    }
                }
                return;
            }
            // no modified callback declared: the instance cannot absorb the
            // change in place
            self.do_reactivate();
            return;
        }
        self.reevaluate();
    }

    /// Re-derive per-reference target overrides from `<name>.target`
    /// configuration keys. Returns true if any candidate set changed.
    fn apply_target_overrides(
        references: &mut [ReferenceManager],
        configuration: &Option<Arc<PropertyMap>>,
        registry: &Arc<ServiceRegistry>,
    ) -> bool {
        let mut changed = false;
        for rm in references.iter_mut() {
            let key = rm.meta().target_property_name();
            let filter = configuration
                .as_ref()
                .and_then(|c| c.get(&key))
                .and_then(|v| v.as_str())
                .and_then(|raw| match TargetFilter::parse(raw) {
                    Ok(f) => Some(f),
                    Err(err) => {
                        warn!(key, error = %err, "invalid target override, ignoring");
                        None
                    }
                });
            if rm.set_target_override(filter, registry) {
                changed = true;
            }
        }
        changed
    }
}

impl Drop for ComponentManager {
    fn drop(&mut self) {
        if let Some(token) = self.listener_token.lock().take() {
            self.registry.unsubscribe(token);
        }
    }
}
