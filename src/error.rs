//! Typed errors raised while turning a declaration into a resource graph.

use thiserror::Error;

use crate::resources::{Attribute, ResourceRef};

/// Errors produced by synthesis, graph ordering and local value resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    /// Two declared resources map onto the same logical id.
    #[error("duplicate logical id '{0}'")]
    DuplicateLogicalId(String),

    /// A reference names a resource that is not declared.
    #[error("'{from}' references unknown resource '{target}'")]
    UnknownReference { from: String, target: String },

    /// The requested attribute does not exist on that kind of resource.
    #[error("attribute '{attribute}' is not available on '{target}'")]
    UnsupportedAttribute {
        target: ResourceRef,
        attribute: Attribute,
    },

    /// The dependency graph contains a cycle through the listed ids.
    #[error("dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// A template parameter has neither a supplied value nor a default.
    #[error("parameter '{0}' has no value and no default")]
    UnresolvedParameter(String),

    /// Resolving account-scoped values needs an account id.
    #[error("an account id is required to resolve '{0}' (pass --account or set CDK_DEFAULT_ACCOUNT)")]
    MissingAccount(String),

    /// A job's build specification could not be rendered.
    #[error("failed to render buildspec for job '{job}': {message}")]
    BuildSpec { job: String, message: String },
}

pub type StackResult<T> = Result<T, StackError>;
