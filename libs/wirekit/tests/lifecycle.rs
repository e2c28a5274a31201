//! End-to-end lifecycle behavior through the public runtime API.

use std::sync::Arc;

use parking_lot::Mutex;
use wirekit::{
    ActivationContext, BindingPolicy, BoundValue, ComponentFactory, ComponentInstance,
    ComponentLifecycle, ComponentMetadata, ComponentRuntime, ComponentState, ConfigSource,
    ConfigurationPolicy, ConstructorArgs, MemoryConfigSource, PolicyOption, PropertyMap,
    ReferenceMetadata, ServiceRegistry,
};

type CallLog = Arc<Mutex<Vec<String>>>;

struct Recorder {
    log: CallLog,
}

impl Recorder {
    fn describe(value: &BoundValue) -> String {
        value
            .downcast::<i32>()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "absent".to_string())
    }
}

impl ComponentLifecycle for Recorder {
    fn activate(&self, _ctx: &ActivationContext) -> anyhow::Result<()> {
        self.log.lock().push("activate".to_string());
        Ok(())
    }

    fn deactivate(&self) {
        self.log.lock().push("deactivate".to_string());
    }

    fn modified(&self, properties: &PropertyMap) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("modified:{}", properties.len()));
        Ok(())
    }

    fn bind(&self, reference: &str, value: BoundValue) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("bind:{reference}={}", Self::describe(&value)));
        Ok(())
    }

    fn unbind(&self, reference: &str, value: BoundValue) {
        self.log
            .lock()
            .push(format!("unbind:{reference}={}", Self::describe(&value)));
    }
}

fn recorder_factory(log: CallLog) -> Arc<dyn ComponentFactory> {
    Arc::new(move |_args: ConstructorArgs| {
        Ok(ComponentInstance::new(Arc::new(Recorder {
            log: Arc::clone(&log),
        })))
    })
}

fn runtime() -> (Arc<ComponentRuntime>, Arc<MemoryConfigSource>) {
    let registry = Arc::new(ServiceRegistry::new());
    let config = Arc::new(MemoryConfigSource::new());
    let runtime = ComponentRuntime::new(registry, Arc::clone(&config) as Arc<dyn ConfigSource>);
    (runtime, config)
}

fn state_of(rt: &ComponentRuntime, name: &str) -> ComponentState {
    rt.description(name).unwrap().instances[0].state
}

#[tokio::test]
async fn dynamic_reference_survives_provider_churn() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(ReferenceMetadata::new("dep", "cap").with_policy(BindingPolicy::Dynamic))
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();
    assert_eq!(state_of(&rt, "consumer"), ComponentState::UnsatisfiedReference);

    let p1 = rt
        .registry()
        .register("cap", 0, PropertyMap::new(), Arc::new(1i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);

    // a second provider arrives; p1 disappears; the instance stays up
    let _p2 = rt
        .registry()
        .register("cap", 0, PropertyMap::new(), Arc::new(2i32));
    p1.unregister();
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);
    assert_eq!(
        *log.lock(),
        vec!["bind:dep=1", "activate", "bind:dep=2", "unbind:dep=1"]
    );

    // and stays up through the whole churn without reactivating
    assert_eq!(
        log.lock().iter().filter(|c| *c == "activate").count(),
        1
    );
}

#[tokio::test]
async fn dynamic_reference_deactivates_when_last_provider_leaves() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(ReferenceMetadata::new("dep", "cap").with_policy(BindingPolicy::Dynamic))
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    let p = rt
        .registry()
        .register("cap", 0, PropertyMap::new(), Arc::new(1i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);

    p.unregister();
    assert_eq!(state_of(&rt, "consumer"), ComponentState::UnsatisfiedReference);
    assert_eq!(
        *log.lock(),
        vec!["bind:dep=1", "activate", "unbind:dep=1", "deactivate"]
    );
}

#[tokio::test]
async fn static_greedy_reference_reactivates_onto_better_provider() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(
            ReferenceMetadata::new("dep", "cap").with_policy_option(PolicyOption::Greedy),
        )
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    let _p1 = rt
        .registry()
        .register("cap", 0, PropertyMap::new(), Arc::new(1i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);

    let _p2 = rt
        .registry()
        .register("cap", 10, PropertyMap::new(), Arc::new(2i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);
    assert_eq!(
        *log.lock(),
        vec![
            "bind:dep=1",
            "activate",
            "unbind:dep=1",
            "deactivate",
            "bind:dep=2",
            "activate"
        ]
    );
}

#[tokio::test]
async fn static_reluctant_reference_keeps_its_binding() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(ReferenceMetadata::new("dep", "cap"))
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    let _p1 = rt
        .registry()
        .register("cap", 0, PropertyMap::new(), Arc::new(1i32));
    let _p2 = rt
        .registry()
        .register("cap", 10, PropertyMap::new(), Arc::new(2i32));
    assert_eq!(*log.lock(), vec!["bind:dep=1", "activate"]);
}

#[tokio::test]
async fn required_configuration_controls_the_lifecycle() {
    let (rt, config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("db", "db.Impl")
        .configuration_policy(ConfigurationPolicy::Require)
        .modified("modified")
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();
    assert_eq!(state_of(&rt, "db"), ComponentState::UnsatisfiedConfiguration);

    config.put("db", PropertyMap::new());
    assert_eq!(state_of(&rt, "db"), ComponentState::Active);

    // content change goes through the modified callback, no restart
    let mut props = PropertyMap::new();
    props.insert("url".to_string(), "postgres://x".into());
    config.put("db", props);
    assert_eq!(state_of(&rt, "db"), ComponentState::Active);

    config.remove("db");
    assert_eq!(state_of(&rt, "db"), ComponentState::UnsatisfiedConfiguration);
    assert_eq!(
        *log.lock(),
        vec!["activate", "modified:2", "deactivate"]
    );
}

#[tokio::test]
async fn enable_and_disable_are_idempotent() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("c", "c.Impl").validate().unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    rt.enable_component("c").await.unwrap();
    rt.enable_component("c").await.unwrap();
    rt.disable_component("c").await.unwrap();
    rt.disable_component("c").await.unwrap();
    assert_eq!(*log.lock(), vec!["activate", "deactivate"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enables_activate_once() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("c", "c.Impl")
        .default_enabled(false)
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rt = Arc::clone(&rt);
        handles.push(tokio::spawn(async move {
            rt.enable_component("c").await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        log.lock().iter().filter(|c| *c == "activate").count(),
        1
    );
}

#[tokio::test]
async fn delayed_provider_activates_only_when_consumed() {
    let (rt, _config) = runtime();
    let provider_log: CallLog = Arc::default();
    let provider = ComponentMetadata::builder("provider", "provider.Impl")
        .provides("svc")
        .validate()
        .unwrap();
    rt.register_component("mod", provider, recorder_factory(Arc::clone(&provider_log)))
        .await
        .unwrap();

    // satisfied and published, but not constructed
    assert_eq!(state_of(&rt, "provider"), ComponentState::Satisfied);
    assert!(provider_log.lock().is_empty());

    let consumer_log: CallLog = Arc::default();
    let consumer = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(ReferenceMetadata::new("svc", "svc"))
        .validate()
        .unwrap();
    rt.register_component("mod", consumer, recorder_factory(Arc::clone(&consumer_log)))
        .await
        .unwrap();

    // the consumer's bind pulled the provider up
    assert_eq!(state_of(&rt, "provider"), ComponentState::Active);
    assert_eq!(*provider_log.lock(), vec!["activate"]);
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);
}

#[tokio::test]
async fn target_filters_select_providers_by_property() {
    let (rt, _config) = runtime();
    let log: CallLog = Arc::default();
    let metadata = ComponentMetadata::builder("consumer", "consumer.Impl")
        .reference(ReferenceMetadata::new("dep", "cap").with_target("(zone=east)"))
        .validate()
        .unwrap();
    rt.register_component("mod", metadata, recorder_factory(Arc::clone(&log)))
        .await
        .unwrap();

    let mut west = PropertyMap::new();
    west.insert("zone".to_string(), "west".into());
    let _w = rt
        .registry()
        .register("cap", 0, west, Arc::new(1i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::UnsatisfiedReference);

    let mut east = PropertyMap::new();
    east.insert("zone".to_string(), "east".into());
    let _e = rt
        .registry()
        .register("cap", 0, east, Arc::new(2i32));
    assert_eq!(state_of(&rt, "consumer"), ComponentState::Active);
    assert_eq!(*log.lock(), vec!["bind:dep=2", "activate"]);
}
