//! Component metadata: the immutable description of a component declaration.
//!
//! Metadata is assembled with builder-style constructors and frozen by
//! [`ComponentMetadataBuilder::validate`], which checks the declaration as a
//! whole and either returns an immutable `Arc<ComponentMetadata>` shared by
//! every instance of the declaration, or rejects it entirely. There is no
//! partially-accepted state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::binding::{select_signature, FieldStrategy, InjectionPoint, MethodSignature};
use crate::error::MetadataError;
use crate::filter::TargetFilter;
use crate::values::ValueShape;

/// How the component relates to its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationPolicy {
    /// Configuration is never consulted.
    Ignore,
    /// Used when present, absence is fine.
    #[default]
    Optional,
    /// The component stays unsatisfied until configuration exists.
    Require,
}

/// Lower/upper bound on how many providers a reference binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Cardinality {
    #[serde(rename = "0..1")]
    ZeroToOne,
    #[serde(rename = "1..1")]
    #[default]
    OneToOne,
    #[serde(rename = "0..n")]
    ZeroToMany,
    #[serde(rename = "1..n")]
    OneToMany,
}

impl Cardinality {
    pub fn is_multiple(&self) -> bool {
        matches!(self, Cardinality::ZeroToMany | Cardinality::OneToMany)
    }

    /// The lower bound: 1 for mandatory references, 0 for optional ones.
    pub fn floor(&self) -> usize {
        match self {
            Cardinality::OneToOne | Cardinality::OneToMany => 1,
            Cardinality::ZeroToOne | Cardinality::ZeroToMany => 0,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        self.floor() > 0
    }
}

impl FromStr for Cardinality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0..1" => Ok(Cardinality::ZeroToOne),
            "1..1" => Ok(Cardinality::OneToOne),
            "0..n" => Ok(Cardinality::ZeroToMany),
            "1..n" => Ok(Cardinality::OneToMany),
            other => Err(format!("invalid cardinality '{other}'")),
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cardinality::ZeroToOne => "0..1",
            Cardinality::OneToOne => "1..1",
            Cardinality::ZeroToMany => "0..n",
            Cardinality::OneToMany => "1..n",
        };
        f.write_str(s)
    }
}

/// Whether a binding is fixed for the instance's lifetime or swappable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BindingPolicy {
    #[default]
    Static,
    Dynamic,
}

/// Replacement appetite: keep the current binding, or chase the best one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOption {
    #[default]
    Reluctant,
    Greedy,
}

/// One declared dependency of a component.
#[derive(Debug, Clone)]
pub struct ReferenceMetadata {
    name: String,
    capability: String,
    cardinality: Cardinality,
    policy: BindingPolicy,
    policy_option: PolicyOption,
    target: Option<String>,
    filter: Option<TargetFilter>,
    injection: InjectionPoint,
    shape: ValueShape,
    signature: MethodSignature,
}

impl ReferenceMetadata {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            injection: InjectionPoint::Method {
                bind: name.clone(),
                unbind: None,
                updated: None,
                signatures: vec![MethodSignature::SingleValue],
            },
            name,
            capability: capability.into(),
            cardinality: Cardinality::default(),
            policy: BindingPolicy::default(),
            policy_option: PolicyOption::default(),
            target: None,
            filter: None,
            shape: ValueShape::Object,
            signature: MethodSignature::SingleValue,
        }
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_policy(mut self, policy: BindingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_policy_option(mut self, option: PolicyOption) -> Self {
        self.policy_option = option;
        self
    }

    /// Declared target filter, LDAP-style. Parsed and checked at validation.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_injection(mut self, injection: InjectionPoint) -> Self {
        self.injection = injection;
        self
    }

    pub fn with_shape(mut self, shape: ValueShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn policy(&self) -> BindingPolicy {
        self.policy
    }

    pub fn policy_option(&self) -> PolicyOption {
        self.policy_option
    }

    pub fn is_static(&self) -> bool {
        self.policy == BindingPolicy::Static
    }

    pub fn is_greedy(&self) -> bool {
        self.policy_option == PolicyOption::Greedy
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Validated filter, `None` when the reference matches every provider of
    /// its capability.
    pub fn filter(&self) -> Option<&TargetFilter> {
        self.filter.as_ref()
    }

    pub fn injection(&self) -> &InjectionPoint {
        &self.injection
    }

    pub fn shape(&self) -> &ValueShape {
        &self.shape
    }

    /// Callback form selected at validation time from the declared
    /// candidates. Meaningful for method injection only.
    pub fn bind_signature(&self) -> MethodSignature {
        self.signature
    }

    /// Shape of the value delivered for a single bound provider: the
    /// selected signature's payload for method injection, the declared
    /// element shape otherwise. `None` for a no-argument callback.
    pub fn element_shape(&self) -> Option<ValueShape> {
        match &self.injection {
            InjectionPoint::Method { .. } => self.signature.payload_shape(),
            _ => Some(self.shape.element().clone()),
        }
    }

    /// Name of the component property that overrides this reference's
    /// target filter at configuration time.
    pub fn target_property_name(&self) -> String {
        format!("{}.target", self.name)
    }

    pub fn has_updated_callback(&self) -> bool {
        matches!(
            &self.injection,
            InjectionPoint::Method { updated: Some(_), .. }
        )
    }

    fn validate(&mut self, component: &str) -> Result<(), MetadataError> {
        if self.capability.is_empty() {
            return Err(MetadataError::MissingCapability {
                component: component.to_string(),
                reference: self.name.clone(),
            });
        }
        if self.cardinality.is_multiple() && !self.shape.is_collection() {
            return Err(MetadataError::NonCollectionShape {
                component: component.to_string(),
                reference: self.name.clone(),
            });
        }
        if !self.cardinality.is_multiple() && self.shape.is_collection() {
            return Err(MetadataError::CollectionShapeOnUnary {
                component: component.to_string(),
                reference: self.name.clone(),
            });
        }
        if let InjectionPoint::Field { strategy, .. } = &self.injection {
            if *strategy == FieldStrategy::Update {
                if self.policy == BindingPolicy::Static {
                    return Err(MetadataError::StaticFieldUpdate {
                        component: component.to_string(),
                        reference: self.name.clone(),
                    });
                }
                if !self.cardinality.is_multiple() {
                    return Err(MetadataError::UnaryFieldUpdate {
                        component: component.to_string(),
                        reference: self.name.clone(),
                    });
                }
            }
        }
        if let InjectionPoint::Method { signatures, .. } = &self.injection {
            self.signature =
                select_signature(signatures).unwrap_or(MethodSignature::SingleValue);
        }
        if let Some(target) = &self.target {
            self.filter = Some(TargetFilter::parse(target).map_err(|source| {
                MetadataError::InvalidTarget {
                    component: component.to_string(),
                    reference: self.name.clone(),
                    source,
                }
            })?);
        }
        Ok(())
    }
}

/// Immutable, validated component declaration.
#[derive(Debug)]
pub struct ComponentMetadata {
    name: String,
    implementation: String,
    configuration_policy: ConfigurationPolicy,
    configuration_pid: String,
    activate: Option<String>,
    deactivate: Option<String>,
    modified: Option<String>,
    references: Vec<ReferenceMetadata>,
    provides: Vec<String>,
    factory: bool,
    immediate: bool,
    default_enabled: bool,
    constructor_params: usize,
}

impl ComponentMetadata {
    pub fn builder(
        name: impl Into<String>,
        implementation: impl Into<String>,
    ) -> ComponentMetadataBuilder {
        ComponentMetadataBuilder {
            name: name.into(),
            implementation: implementation.into(),
            configuration_policy: ConfigurationPolicy::default(),
            configuration_pid: None,
            activate: Some("activate".to_string()),
            deactivate: Some("deactivate".to_string()),
            modified: None,
            references: Vec::new(),
            provides: Vec::new(),
            factory: false,
            immediate: None,
            default_enabled: true,
            constructor_params: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn configuration_policy(&self) -> ConfigurationPolicy {
        self.configuration_policy
    }

    /// Persistent identity under which configuration is looked up;
    /// defaults to the component name.
    pub fn configuration_pid(&self) -> &str {
        &self.configuration_pid
    }

    pub fn activate_name(&self) -> Option<&str> {
        self.activate.as_deref()
    }

    pub fn deactivate_name(&self) -> Option<&str> {
        self.deactivate.as_deref()
    }

    pub fn modified_name(&self) -> Option<&str> {
        self.modified.as_deref()
    }

    pub fn has_modified_callback(&self) -> bool {
        self.modified.is_some()
    }

    pub fn references(&self) -> &[ReferenceMetadata] {
        &self.references
    }

    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    pub fn is_factory(&self) -> bool {
        self.factory
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_default_enabled(&self) -> bool {
        self.default_enabled
    }

    pub fn constructor_params(&self) -> usize {
        self.constructor_params
    }
}

/// Mutable collector for a component declaration; [`validate`] freezes it.
///
/// [`validate`]: ComponentMetadataBuilder::validate
pub struct ComponentMetadataBuilder {
    name: String,
    implementation: String,
    configuration_policy: ConfigurationPolicy,
    configuration_pid: Option<String>,
    activate: Option<String>,
    deactivate: Option<String>,
    modified: Option<String>,
    references: Vec<ReferenceMetadata>,
    provides: Vec<String>,
    factory: bool,
    immediate: Option<bool>,
    default_enabled: bool,
    constructor_params: usize,
}

impl ComponentMetadataBuilder {
    pub fn configuration_policy(mut self, policy: ConfigurationPolicy) -> Self {
        self.configuration_policy = policy;
        self
    }

    pub fn configuration_pid(mut self, pid: impl Into<String>) -> Self {
        self.configuration_pid = Some(pid.into());
        self
    }

    pub fn activate(mut self, name: impl Into<String>) -> Self {
        self.activate = Some(name.into());
        self
    }

    pub fn deactivate(mut self, name: impl Into<String>) -> Self {
        self.deactivate = Some(name.into());
        self
    }

    /// Declare a modified entry point. Components without one are
    /// deactivated and reactivated on configuration changes.
    pub fn modified(mut self, name: impl Into<String>) -> Self {
        self.modified = Some(name.into());
        self
    }

    pub fn reference(mut self, reference: ReferenceMetadata) -> Self {
        self.references.push(reference);
        self
    }

    /// Declare a provided capability type.
    pub fn provides(mut self, capability: impl Into<String>) -> Self {
        self.provides.push(capability.into());
        self
    }

    pub fn factory(mut self, factory: bool) -> Self {
        self.factory = factory;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn default_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    pub fn constructor_params(mut self, count: usize) -> Self {
        self.constructor_params = count;
        self
    }

    /// Check the declaration as a whole and freeze it. Any failure rejects
    /// the entire declaration.
    pub fn validate(mut self) -> Result<Arc<ComponentMetadata>, MetadataError> {
        if self.name.is_empty() {
            return Err(MetadataError::MissingName);
        }
        if self.implementation.is_empty() {
            return Err(MetadataError::MissingImplementation {
                component: self.name,
            });
        }

        let mut seen_names = std::collections::HashSet::new();
        let mut seen_indexes = std::collections::HashSet::new();
        for reference in &mut self.references {
            if !seen_names.insert(reference.name.clone()) {
                return Err(MetadataError::DuplicateReference {
                    component: self.name.clone(),
                    reference: reference.name.clone(),
                });
            }
            reference.validate(&self.name)?;
            if let InjectionPoint::Constructor { index } = reference.injection {
                if index >= self.constructor_params {
                    return Err(MetadataError::ConstructorIndexOutOfRange {
                        component: self.name.clone(),
                        reference: reference.name.clone(),
                        index,
                        params: self.constructor_params,
                    });
                }
                if !seen_indexes.insert(index) {
                    return Err(MetadataError::DuplicateConstructorIndex {
                        component: self.name.clone(),
                        index,
                    });
                }
            }
        }

        // A component that offers no capability has nobody to request it, so
        // it activates immediately unless declared otherwise.
        let immediate = self.immediate.unwrap_or(self.provides.is_empty());

        Ok(Arc::new(ComponentMetadata {
            configuration_pid: self.configuration_pid.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            implementation: self.implementation,
            configuration_policy: self.configuration_policy,
            activate: self.activate,
            deactivate: self.deactivate,
            modified: self.modified,
            references: self.references,
            provides: self.provides,
            factory: self.factory,
            immediate,
            default_enabled: self.default_enabled,
            constructor_params: self.constructor_params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ComponentMetadataBuilder {
        ComponentMetadata::builder("comp", "example.Impl")
    }

    #[test]
    fn defaults_are_applied() {
        let meta = base()
            .reference(ReferenceMetadata::new("log", "logger"))
            .validate()
            .unwrap();

        assert_eq!(meta.configuration_policy(), ConfigurationPolicy::Optional);
        assert_eq!(meta.configuration_pid(), "comp");
        assert!(meta.is_immediate());
        assert!(meta.is_default_enabled());

        let r = &meta.references()[0];
        assert_eq!(r.cardinality(), Cardinality::OneToOne);
        assert_eq!(r.policy(), BindingPolicy::Static);
        assert_eq!(r.policy_option(), PolicyOption::Reluctant);
        assert!(r.filter().is_none());
    }

    #[test]
    fn validation_selects_most_specific_bind_signature() {
        let meta = base()
            .reference(
                ReferenceMetadata::new("log", "logger").with_injection(InjectionPoint::Method {
                    bind: "set_logger".into(),
                    unbind: None,
                    updated: None,
                    signatures: vec![
                        MethodSignature::NoArgs,
                        MethodSignature::SingleMap,
                        MethodSignature::SingleHandle,
                    ],
                }),
            )
            .validate()
            .unwrap();

        let r = &meta.references()[0];
        assert_eq!(r.bind_signature(), MethodSignature::SingleHandle);
        assert_eq!(r.element_shape(), Some(ValueShape::Handle));
    }

    #[test]
    fn providing_components_default_to_delayed() {
        let meta = base().provides("greeter").validate().unwrap();
        assert!(!meta.is_immediate());

        let meta = base()
            .provides("greeter")
            .immediate(true)
            .validate()
            .unwrap();
        assert!(meta.is_immediate());
    }

    #[test]
    fn duplicate_reference_names_rejected() {
        let err = base()
            .reference(ReferenceMetadata::new("log", "logger"))
            .reference(ReferenceMetadata::new("log", "audit"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateReference { .. }));
    }

    #[test]
    fn multi_cardinality_requires_collection_shape() {
        let err = base()
            .reference(
                ReferenceMetadata::new("handlers", "handler")
                    .with_cardinality(Cardinality::ZeroToMany),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::NonCollectionShape { .. }));

        let ok = base()
            .reference(
                ReferenceMetadata::new("handlers", "handler")
                    .with_cardinality(Cardinality::ZeroToMany)
                    .with_shape(ValueShape::Collection(Box::new(ValueShape::Object))),
            )
            .validate();
        assert!(ok.is_ok());
    }

    #[test]
    fn collection_shape_on_unary_reference_rejected() {
        let err = base()
            .reference(
                ReferenceMetadata::new("log", "logger")
                    .with_shape(ValueShape::Collection(Box::new(ValueShape::Object))),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::CollectionShapeOnUnary { .. }));
    }

    #[test]
    fn static_field_with_update_strategy_rejected() {
        let err = base()
            .reference(
                ReferenceMetadata::new("handlers", "handler")
                    .with_cardinality(Cardinality::ZeroToMany)
                    .with_shape(ValueShape::Collection(Box::new(ValueShape::Object)))
                    .with_injection(InjectionPoint::Field {
                        name: "handlers".into(),
                        strategy: FieldStrategy::Update,
                    }),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::StaticFieldUpdate { .. }));
    }

    #[test]
    fn update_strategy_on_unary_field_rejected() {
        let err = base()
            .reference(
                ReferenceMetadata::new("log", "logger")
                    .with_policy(BindingPolicy::Dynamic)
                    .with_injection(InjectionPoint::Field {
                        name: "log".into(),
                        strategy: FieldStrategy::Update,
                    }),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnaryFieldUpdate { .. }));
    }

    #[test]
    fn constructor_index_out_of_range_rejected() {
        let err = base()
            .constructor_params(1)
            .reference(
                ReferenceMetadata::new("log", "logger")
                    .with_injection(InjectionPoint::Constructor { index: 1 }),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ConstructorIndexOutOfRange { index: 1, params: 1, .. }
        ));
    }

    #[test]
    fn duplicate_constructor_index_rejected() {
        let err = base()
            .constructor_params(1)
            .reference(
                ReferenceMetadata::new("a", "cap.a")
                    .with_injection(InjectionPoint::Constructor { index: 0 }),
            )
            .reference(
                ReferenceMetadata::new("b", "cap.b")
                    .with_injection(InjectionPoint::Constructor { index: 0 }),
            )
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateConstructorIndex { index: 0, .. }));
    }

    #[test]
    fn invalid_target_filter_rejected() {
        let err = base()
            .reference(ReferenceMetadata::new("log", "logger").with_target("(broken"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidTarget { .. }));
    }

    #[test]
    fn cardinality_string_round_trip() {
        for s in ["0..1", "1..1", "0..n", "1..n"] {
            assert_eq!(s.parse::<Cardinality>().unwrap().to_string(), s);
        }
        assert!("2..3".parse::<Cardinality>().is_err());
    }
}
