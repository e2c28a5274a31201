//! Built-in demonstration components: a clock provider and a greeter that
//! consumes it. They exercise delayed activation, references, and
//! configuration without needing any external module.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use wirekit::{
    ActivationContext, ComponentFactory, ComponentInstance, ComponentLifecycle,
    ComponentMetadata, ComponentRuntime, ConstructorArgs, ProviderObject, ReferenceMetadata,
};

/// The service object the clock component publishes under `demo.clock`.
pub struct Clock;

impl Clock {
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

struct ClockComponent;

impl ComponentLifecycle for ClockComponent {
    fn activate(&self, _ctx: &ActivationContext) -> Result<()> {
        info!("clock service is up");
        Ok(())
    }

    fn deactivate(&self) {
        info!("clock service stopped");
    }
}

struct Greeter;

impl ComponentLifecycle for Greeter {
    fn activate(&self, ctx: &ActivationContext) -> Result<()> {
        let greeting = ctx
            .properties()
            .get("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or("hello");
        let stamp = ctx
            .binding("clock")
            .and_then(|v| v.downcast::<Clock>())
            .map(|clock| clock.now().to_rfc3339())
            .unwrap_or_else(|| "<no clock>".to_string());
        info!(greeting, time = %stamp, "greeter activated");
        Ok(())
    }

    fn deactivate(&self) {
        info!("greeter deactivated");
    }
}

pub fn clock_metadata() -> Result<Arc<ComponentMetadata>> {
    Ok(ComponentMetadata::builder("demo.clock", "wirekit_host::demo::ClockComponent")
        .provides("demo.clock")
        .validate()?)
}

pub fn greeter_metadata() -> Result<Arc<ComponentMetadata>> {
    Ok(
        ComponentMetadata::builder("demo.greeter", "wirekit_host::demo::Greeter")
            .reference(ReferenceMetadata::new("clock", "demo.clock"))
            .validate()?,
    )
}

pub async fn register(runtime: &Arc<ComponentRuntime>) -> Result<()> {
    let clock_factory: Arc<dyn ComponentFactory> = Arc::new(|_args: ConstructorArgs| {
        Ok(ComponentInstance::with_service(
            Arc::new(ClockComponent),
            Arc::new(Clock) as ProviderObject,
        ))
    });
    runtime
        .register_component("demo", clock_metadata()?, clock_factory)
        .await?;

    let greeter_factory: Arc<dyn ComponentFactory> = Arc::new(|_args: ConstructorArgs| {
        Ok(ComponentInstance::new(Arc::new(Greeter)))
    });
    runtime
        .register_component("demo", greeter_metadata()?, greeter_factory)
        .await?;
    Ok(())
}
