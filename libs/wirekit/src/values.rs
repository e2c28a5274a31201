//! Value resolution: turning a reference's bound provider set into the
//! concrete value delivered to the component.
//!
//! The injection shape is a closed tagged variant fixed at metadata
//! validation time; resolution is a pure function of the bound set. A
//! provider that fails to resolve (unregistered between match and use)
//! degrades to absence for optional shapes and to exclusion for collection
//! shapes; the caller decides whether the cardinality floor is still met.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::reference::RefPair;
use crate::registry::{PropertyMap, ProviderHandle, ProviderObject, ServiceRegistry};

/// Declared shape of an injected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ValueShape {
    /// The resolved provider object (resolve-and-cache on first access).
    Object,
    /// The provider handle only; no resolution happens.
    Handle,
    /// A deferred resolver: every call resolves anew.
    LazyFactory,
    /// Read-only view of the provider's property snapshot.
    Properties,
    /// Handle plus resolved object, comparable by handle ranking.
    Tuple,
    /// Absence becomes an explicit empty value rather than an error.
    Optional(Box<ValueShape>),
    /// Ordered collection of any of the above, for multi-cardinality.
    Collection(Box<ValueShape>),
}

impl ValueShape {
    pub fn is_collection(&self) -> bool {
        matches!(self, ValueShape::Collection(_))
    }

    /// The per-provider element shape (identity for unary shapes).
    pub fn element(&self) -> &ValueShape {
        match self {
            ValueShape::Collection(inner) => inner.element(),
            other => other,
        }
    }
}

/// Deferred per-call resolver for one provider.
#[derive(Clone)]
pub struct LazyFactory {
    registry: Arc<ServiceRegistry>,
    handle: ProviderHandle,
}

impl LazyFactory {
    pub(crate) fn new(registry: Arc<ServiceRegistry>, handle: ProviderHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    /// Resolve the provider now. `None` if it is gone.
    pub fn get(&self) -> Option<ProviderObject> {
        self.registry.resolve(&self.handle)
    }

    /// Release one use obtained through [`LazyFactory::get`].
    pub fn release(&self) {
        self.registry.release(&self.handle);
    }
}

impl fmt::Debug for LazyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyFactory")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A concrete value handed to a component.
#[derive(Clone)]
pub enum BoundValue {
    Object(ProviderObject),
    Handle(ProviderHandle),
    Factory(LazyFactory),
    Properties(Arc<PropertyMap>),
    /// Handle plus object; ordered by the handle's ranking so tuples can be
    /// used directly as ranked map entries.
    Tuple(ProviderHandle, ProviderObject),
    /// An optional shape with nothing bound.
    Absent,
    Collection(Vec<BoundValue>),
}

impl BoundValue {
    /// Downcast the carried object for `Object` and `Tuple` values.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match self {
            BoundValue::Object(obj) | BoundValue::Tuple(_, obj) => {
                Arc::clone(obj).downcast::<T>().ok()
            }
            _ => None,
        }
    }

    /// The provider handle behind this value, when there is exactly one.
    pub fn handle(&self) -> Option<&ProviderHandle> {
        match self {
            BoundValue::Handle(h) | BoundValue::Tuple(h, _) => Some(h),
            BoundValue::Factory(factory) => Some(factory.handle()),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, BoundValue::Absent)
    }
}

impl fmt::Debug for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundValue::Object(_) => write!(f, "Object(..)"),
            BoundValue::Handle(h) => write!(f, "Handle({})", h.id()),
            BoundValue::Factory(factory) => write!(f, "Factory({})", factory.handle().id()),
            BoundValue::Properties(_) => write!(f, "Properties(..)"),
            BoundValue::Tuple(h, _) => write!(f, "Tuple({}, ..)", h.id()),
            BoundValue::Absent => write!(f, "Absent"),
            BoundValue::Collection(items) => write!(f, "Collection(len={})", items.len()),
        }
    }
}

/// Resolve one provider into the element shape. `None` means resolution
/// failed (the provider vanished between match and use).
pub(crate) fn resolve_element(
    shape: &ValueShape,
    pair: &Arc<RefPair>,
    registry: &Arc<ServiceRegistry>,
) -> Option<BoundValue> {
    match shape {
        ValueShape::Object => pair.object(registry).map(BoundValue::Object),
        ValueShape::Handle => Some(BoundValue::Handle(pair.handle().clone())),
        ValueShape::LazyFactory => Some(BoundValue::Factory(LazyFactory::new(
            Arc::clone(registry),
            pair.handle().clone(),
        ))),
        ValueShape::Properties => Some(BoundValue::Properties(Arc::clone(
            pair.handle().properties(),
        ))),
        ValueShape::Tuple => pair
            .object(registry)
            .map(|obj| BoundValue::Tuple(pair.handle().clone(), obj)),
        ValueShape::Optional(inner) => {
            Some(resolve_element(inner, pair, registry).unwrap_or(BoundValue::Absent))
        }
        // A collection is resolved over the whole bound set, not per element.
        ValueShape::Collection(_) => None,
    }
}

/// Resolve the full declared shape over the bound set, in ranking order.
///
/// `None` means a plain unary shape could not be resolved; the caller treats
/// that like a concurrent provider removal.
pub(crate) fn resolve_shape(
    shape: &ValueShape,
    pairs: &[Arc<RefPair>],
    registry: &Arc<ServiceRegistry>,
) -> Option<BoundValue> {
    match shape {
        ValueShape::Collection(inner) => Some(BoundValue::Collection(
            pairs
                .iter()
                .filter_map(|p| resolve_element(inner, p, registry))
                .collect(),
        )),
        ValueShape::Optional(inner) => Some(
            pairs
                .first()
                .and_then(|p| resolve_element(inner, p, registry))
                .unwrap_or(BoundValue::Absent),
        ),
        unary => pairs.first().and_then(|p| resolve_element(unary, p, registry)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PropertyValue;

    fn pair_for(registry: &Arc<ServiceRegistry>, value: u32, ranking: i32) -> (crate::registry::ProviderRegistration, Arc<RefPair>) {
        let props: PropertyMap = [("n".to_string(), PropertyValue::Int(value as i64))]
            .into_iter()
            .collect();
        let reg = registry.register("num", ranking, props, Arc::new(value));
        let pair = RefPair::new(reg.handle().clone());
        (reg, pair)
    }

    #[test]
    fn object_shape_resolves_and_caches() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_r, pair) = pair_for(&registry, 5, 0);

        let value = resolve_shape(&ValueShape::Object, &[pair.clone()], &registry).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 5);
        // Cached: use count stays at one across repeated resolution.
        let _again = resolve_shape(&ValueShape::Object, &[pair.clone()], &registry).unwrap();
        assert_eq!(registry.use_count(pair.handle()), 1);
    }

    #[test]
    fn handle_and_properties_shapes_do_not_resolve() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_r, pair) = pair_for(&registry, 9, 3);

        let value = resolve_shape(&ValueShape::Handle, &[pair.clone()], &registry).unwrap();
        assert_eq!(value.handle().unwrap().ranking(), 3);

        let value = resolve_shape(&ValueShape::Properties, &[pair.clone()], &registry).unwrap();
        match value {
            BoundValue::Properties(props) => {
                assert_eq!(props.get("n"), Some(&PropertyValue::Int(9)))
            }
            other => panic!("unexpected value: {other:?}"),
        }
        assert_eq!(registry.use_count(pair.handle()), 0);
    }

    #[test]
    fn lazy_factory_resolves_per_call() {
        let registry = Arc::new(ServiceRegistry::new());
        let (r, pair) = pair_for(&registry, 1, 0);

        let value = resolve_shape(&ValueShape::LazyFactory, &[pair], &registry).unwrap();
        let BoundValue::Factory(factory) = value else {
            panic!("expected factory");
        };
        assert!(factory.get().is_some());
        factory.release();

        r.unregister();
        assert!(factory.get().is_none());
    }

    #[test]
    fn optional_shape_wraps_absence() {
        let registry = Arc::new(ServiceRegistry::new());
        let shape = ValueShape::Optional(Box::new(ValueShape::Object));
        let value = resolve_shape(&shape, &[], &registry).unwrap();
        assert!(value.is_absent());

        // A vanished provider degrades to absent as well.
        let (r, pair) = pair_for(&registry, 2, 0);
        r.unregister();
        let value = resolve_shape(&shape, &[pair], &registry).unwrap();
        assert!(value.is_absent());
    }

    #[test]
    fn collection_keeps_ranking_order_and_excludes_failures() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_r1, low) = pair_for(&registry, 1, 0);
        let (_r2, high) = pair_for(&registry, 2, 10);
        let (r3, gone) = pair_for(&registry, 3, 5);
        r3.unregister();

        let shape = ValueShape::Collection(Box::new(ValueShape::Object));
        let pairs = vec![high, gone, low]; // ranking order incl. the dead one
        let value = resolve_shape(&shape, &pairs, &registry).unwrap();
        let BoundValue::Collection(items) = value else {
            panic!("expected collection");
        };
        let nums: Vec<u32> = items.iter().map(|v| *v.downcast::<u32>().unwrap()).collect();
        assert_eq!(nums, vec![2, 1]);
    }

    #[test]
    fn unary_resolution_failure_returns_none() {
        let registry = Arc::new(ServiceRegistry::new());
        let (r, pair) = pair_for(&registry, 4, 0);
        r.unregister();
        assert!(resolve_shape(&ValueShape::Object, &[pair], &registry).is_none());
        assert!(resolve_shape(&ValueShape::Object, &[], &registry).is_none());
    }
}
