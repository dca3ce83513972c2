//! Error taxonomy for resolution, graph build, rendering, planning and apply.
//!
//! Resolution and graph-build errors are fatal for a whole plan. `ActionFailed` is
//! per node and only aborts that node's dependents.

use thiserror::Error;

/// Data-source resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("lookup '{lookup}' found nothing: {detail}")]
    LookupNotFound { lookup: String, detail: String },

    #[error("lookup '{lookup}' is ambiguous: {} candidates ({})", .candidates.len(), .candidates.join(", "))]
    AmbiguousLookup {
        lookup: String,
        candidates: Vec<String>,
    },

    #[error("remote state {remote} unavailable: {reason}")]
    RemoteStateUnavailable { remote: String, reason: String },
}

/// Resource graph construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("resource '{node}' attribute '{attribute}' references '{reference}': {reason}")]
    UnresolvedReference {
        node: String,
        attribute: String,
        reference: String,
        reason: String,
    },

    #[error("resource '{id}' is declared more than once")]
    DuplicateNode { id: String },
}

/// Template rendering failures. No partial payload is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template variable '{name}' has no value")]
    MissingVariable { name: String },

    #[error("template variable '{name}' is not a scalar")]
    NonScalarVariable { name: String },

    #[error("malformed template placeholder '{text}'")]
    MalformedPlaceholder { text: String },
}

/// Planner failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle among: {}", .remaining.join(", "))]
    DependencyCycle { remaining: Vec<String> },
}

/// An apply-time failure of one action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("action on '{node_id}' failed: {cause}")]
pub struct ActionFailed {
    pub node_id: String,
    pub cause: String,
}

/// Any failure that prevents a plan from being produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("journal: {0}")]
    Journal(String),
}
