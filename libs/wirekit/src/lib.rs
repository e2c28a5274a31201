//! wirekit — a declarative component runtime.
//!
//! Modules declare components as metadata: an implementation, the
//! capabilities it provides, and the capabilities it references (with
//! cardinality, binding policy, and target filters). The runtime wires
//! everything together at run time against a concurrent capability
//! registry, walking each component through a satisfaction state machine
//! and delivering lifecycle callbacks as providers come and go.
//!
//! The pieces:
//! - [`registry`]: the capability registry (register, rank, resolve, listen)
//! - [`metadata`]: component and reference declarations plus validation
//! - [`component`]: per-component lifecycle manager and callback traits
//! - [`runtime`]: the facade modules talk to, plus introspection DTOs
//! - [`config`]: configuration sources keyed by persistent id
//! - [`filter`]: LDAP-style target filters over provider properties

pub mod binding;
pub mod component;
pub mod config;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod values;

pub use binding::{select_signature, FieldStrategy, InjectionPoint, MethodSignature};
pub use component::{
    ActivationContext, ComponentFactory, ComponentInstance, ComponentLifecycle,
    ComponentManager, ComponentState, ConstructorArgs, ReferenceSnapshot,
};
pub use config::{ConfigEvent, ConfigListener, ConfigSource, MemoryConfigSource};
pub use error::{MetadataError, RuntimeError};
pub use filter::{FilterError, TargetFilter};
pub use metadata::{
    BindingPolicy, Cardinality, ComponentMetadata, ComponentMetadataBuilder,
    ConfigurationPolicy, PolicyOption, ReferenceMetadata,
};
pub use reference::RefPair;
pub use registry::{
    property_map_from_json, EventKind, PropertyMap, PropertyValue, ProviderHandle,
    ProviderObject, ProviderRegistration, RegistryEvent, RegistryListener, ServiceRegistry,
};
pub use runtime::{
    BoundProviderDto, ComponentDescriptionDto, ComponentInstanceDto, ComponentRuntime,
    ReferenceDto,
};
pub use values::{BoundValue, LazyFactory, ValueShape};
