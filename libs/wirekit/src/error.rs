//! Structured errors for the component runtime.

use thiserror::Error;

use crate::filter::FilterError;

/// Declaration errors: malformed metadata, rejected at validation time.
/// A declaration that fails validation is never partially accepted.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("component name must not be empty")]
    MissingName,
    #[error("component '{component}' has no implementation locator")]
    MissingImplementation { component: String },
    #[error("component '{component}' declares reference '{reference}' more than once")]
    DuplicateReference {
        component: String,
        reference: String,
    },
    #[error("reference '{reference}' of component '{component}' has no capability type")]
    MissingCapability {
        component: String,
        reference: String,
    },
    #[error(
        "reference '{reference}' of component '{component}' is multi-cardinality but its value shape is not a collection"
    )]
    NonCollectionShape {
        component: String,
        reference: String,
    },
    #[error(
        "reference '{reference}' of component '{component}' is single-cardinality but declares a collection value shape"
    )]
    CollectionShapeOnUnary {
        component: String,
        reference: String,
    },
    #[error(
        "reference '{reference}' of component '{component}' uses the 'update' field strategy with static policy"
    )]
    StaticFieldUpdate {
        component: String,
        reference: String,
    },
    #[error(
        "reference '{reference}' of component '{component}' uses the 'update' field strategy on a single-cardinality field"
    )]
    UnaryFieldUpdate {
        component: String,
        reference: String,
    },
    #[error(
        "reference '{reference}' of component '{component}' targets constructor parameter {index}, but the constructor takes {params}"
    )]
    ConstructorIndexOutOfRange {
        component: String,
        reference: String,
        index: usize,
        params: usize,
    },
    #[error(
        "component '{component}' maps constructor parameter {index} from more than one reference"
    )]
    DuplicateConstructorIndex { component: String, index: usize },
    #[error("reference '{reference}' of component '{component}' has an invalid target filter")]
    InvalidTarget {
        component: String,
        reference: String,
        #[source]
        source: FilterError,
    },
}

/// Control-surface errors from the runtime facade.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("component '{0}' is already registered")]
    ComponentAlreadyRegistered(String),
    #[error("unknown component '{0}'")]
    ComponentNotFound(String),
}
