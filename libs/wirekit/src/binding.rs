//! Declarative binding table.
//!
//! Instead of discovering injection targets reflectively at run time, every
//! reference carries an explicit [`InjectionPoint`] fixed at metadata
//! validation time. Overloaded bind-callback forms are modelled as a closed
//! [`MethodSignature`] enum whose variant order *is* the precedence order, so
//! "which overload wins" becomes a deterministic sort instead of a runtime
//! search across an inheritance chain. Validation selects the winning form
//! once; delivery shapes the callback payload from it.

use serde::Serialize;

use crate::values::ValueShape;

/// How a multi-shot field reference is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldStrategy {
    /// The whole field value is replaced on every change.
    Replace,
    /// The collection behind the field is updated in place. Only valid for
    /// multi-cardinality references.
    Update,
}

/// Where a reference's value is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InjectionPoint {
    /// Constructor argument at `index` (0-based), resolved before the
    /// instance exists.
    Constructor { index: usize },
    /// Named field on the component, written according to `strategy`.
    Field {
        name: String,
        strategy: FieldStrategy,
    },
    /// Bind/unbind/updated callbacks, invoked once per bound provider. The
    /// declared candidate forms are narrowed to one at validation time.
    Method {
        bind: String,
        unbind: Option<String>,
        updated: Option<String>,
        signatures: Vec<MethodSignature>,
    },
}

impl InjectionPoint {
    pub fn field(name: impl Into<String>) -> Self {
        InjectionPoint::Field {
            name: name.into(),
            strategy: FieldStrategy::Replace,
        }
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self, InjectionPoint::Constructor { .. })
    }
}

/// Declared form of a bind callback. Variant order is the selection
/// precedence: when a callback declares several plausible forms, the
/// smallest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodSignature {
    /// `fn(value)` — the resolved provider object itself.
    SingleValue,
    /// `fn(handle)` — the provider handle only, no resolution.
    SingleHandle,
    /// `fn(factory)` — a deferred resolver, resolving on every call.
    SingleFactory,
    /// `fn(properties)` — the provider's property map.
    SingleMap,
    /// `fn(handle, value)`
    HandleAndValue,
    /// `fn()`
    NoArgs,
}

impl MethodSignature {
    /// The payload a callback of this form receives; `None` for [`NoArgs`].
    ///
    /// [`NoArgs`]: MethodSignature::NoArgs
    pub fn payload_shape(&self) -> Option<ValueShape> {
        match self {
            MethodSignature::SingleValue => Some(ValueShape::Object),
            MethodSignature::SingleHandle => Some(ValueShape::Handle),
            MethodSignature::SingleFactory => Some(ValueShape::LazyFactory),
            MethodSignature::SingleMap => Some(ValueShape::Properties),
            MethodSignature::HandleAndValue => Some(ValueShape::Tuple),
            MethodSignature::NoArgs => None,
        }
    }
}

/// Pick the preferred signature among the declared candidates.
///
/// Returns `None` when the candidate list is empty.
pub fn select_signature(candidates: &[MethodSignature]) -> Option<MethodSignature> {
    candidates.iter().min().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_precedence_is_total_and_matches_declared_order() {
        let mut all = vec![
            MethodSignature::NoArgs,
            MethodSignature::HandleAndValue,
            MethodSignature::SingleMap,
            MethodSignature::SingleFactory,
            MethodSignature::SingleHandle,
            MethodSignature::SingleValue,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                MethodSignature::SingleValue,
                MethodSignature::SingleHandle,
                MethodSignature::SingleFactory,
                MethodSignature::SingleMap,
                MethodSignature::HandleAndValue,
                MethodSignature::NoArgs,
            ]
        );
    }

    #[test]
    fn select_signature_prefers_most_specific() {
        let picked = select_signature(&[
            MethodSignature::NoArgs,
            MethodSignature::SingleMap,
            MethodSignature::SingleValue,
        ]);
        assert_eq!(picked, Some(MethodSignature::SingleValue));

        let picked = select_signature(&[
            MethodSignature::HandleAndValue,
            MethodSignature::SingleHandle,
        ]);
        assert_eq!(picked, Some(MethodSignature::SingleHandle));

        assert_eq!(select_signature(&[]), None);
    }

    #[test]
    fn every_form_maps_to_its_payload_shape() {
        assert_eq!(
            MethodSignature::SingleValue.payload_shape(),
            Some(ValueShape::Object)
        );
        assert_eq!(
            MethodSignature::HandleAndValue.payload_shape(),
            Some(ValueShape::Tuple)
        );
        assert_eq!(MethodSignature::NoArgs.payload_shape(), None);
    }
}
