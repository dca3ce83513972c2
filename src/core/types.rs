//! Data model for the reconciliation engine.
//!
//! Defines the stack document, resource nodes with their attribute values and
//! references, observed state, plans, and apply reports. Declaration types derive
//! Serialize/Deserialize for YAML roundtripping.

use super::datasource::LookupRequest;
use super::stack::WebTierConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Top-level stack document
// ============================================================================

/// Root configuration, the desired state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Stack name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Read-only external lookups, resolved before the graph is built
    #[serde(default)]
    pub lookups: Vec<LookupRequest>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDecl>,

    /// Named module outputs
    #[serde(default)]
    pub outputs: IndexMap<String, Reference>,

    /// Load-balanced web tier preset
    #[serde(default)]
    pub web_tier: Option<WebTierConfig>,

    /// Apply policy
    #[serde(default)]
    pub policy: Policy,
}

/// A resource as written in a stack document (the id is the map key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    #[serde(default)]
    pub lifecycle: Lifecycle,

    #[serde(default)]
    pub attributes: IndexMap<String, AttrValue>,

    /// Explicit ordering edges on top of attribute references
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceDecl {
    pub fn to_node(&self, id: &str) -> ResourceNode {
        ResourceNode {
            id: id.to_string(),
            kind: self.kind,
            lifecycle: self.lifecycle,
            attributes: self.attributes.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Apply policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Upper bound on concurrently running actions
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Append provenance events to this JSONL file
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            max_parallel: default_max_parallel(),
            journal: None,
        }
    }
}

fn default_max_parallel() -> usize {
    8
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed branch, keep applying independent ones
    #[default]
    ContinueIndependent,
    /// Start nothing new after the first failure
    StopOnFirst,
}

// ============================================================================
// Resources
// ============================================================================

/// Resource kind enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    SecurityGroup,
    LaunchTemplate,
    AutoscalingGroup,
    LoadBalancer,
    Listener,
    ListenerRule,
    TargetGroup,
}

impl ResourceKind {
    /// Output attributes a provisioned resource of this kind exposes.
    pub fn outputs(self) -> &'static [&'static str] {
        match self {
            Self::SecurityGroup => &["id", "arn"],
            Self::LaunchTemplate => &["id", "latest_version"],
            Self::AutoscalingGroup => &["id", "arn", "name"],
            Self::LoadBalancer => &["id", "arn", "dns_name"],
            Self::Listener => &["id", "arn"],
            Self::ListenerRule => &["id", "arn"],
            Self::TargetGroup => &["id", "arn", "name"],
        }
    }

    pub fn has_output(self, name: &str) -> bool {
        self.outputs().contains(&name)
    }

    /// Attributes that cannot be changed in place; a change forces a Replace.
    pub fn replace_attributes(self) -> &'static [&'static str] {
        match self {
            Self::SecurityGroup => &["name", "description", "vpc_id"],
            Self::LaunchTemplate => &["image_id", "instance_type", "user_data"],
            Self::AutoscalingGroup => &["name", "launch_template_id"],
            Self::LoadBalancer => &["name", "internal", "load_balancer_type"],
            Self::Listener => &["load_balancer_arn"],
            Self::ListenerRule => &["listener_arn"],
            Self::TargetGroup => &["name", "port", "protocol", "vpc_id"],
        }
    }

    pub fn requires_replace(self, attribute: &str) -> bool {
        self.replace_attributes().contains(&attribute)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityGroup => write!(f, "security_group"),
            Self::LaunchTemplate => write!(f, "launch_template"),
            Self::AutoscalingGroup => write!(f, "autoscaling_group"),
            Self::LoadBalancer => write!(f, "load_balancer"),
            Self::Listener => write!(f, "listener"),
            Self::ListenerRule => write!(f, "listener_rule"),
            Self::TargetGroup => write!(f, "target_group"),
        }
    }
}

/// Replacement ordering policy, set per node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    DestroyBeforeCreate,
    CreateBeforeDestroy,
}

/// A declared resource: kind, identity, attributes, lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    pub lifecycle: Lifecycle,
    pub attributes: IndexMap<String, AttrValue>,
    pub depends_on: Vec<String>,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            lifecycle: Lifecycle::default(),
            attributes: IndexMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn create_before_destroy(mut self) -> Self {
        self.lifecycle = Lifecycle::CreateBeforeDestroy;
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Every reference held by this node's attributes, paired with the attribute name.
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        let mut refs = Vec::new();
        for (name, value) in &self.attributes {
            for r in value.references() {
                refs.push((name.as_str(), r));
            }
        }
        refs
    }
}

// ============================================================================
// Attribute values and references
// ============================================================================

/// Target of a reference: another node's output, or a data-source key.
///
/// Written as `<id>.<output>` or `data.<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Reference {
    Node { id: String, output: String },
    Data { key: String },
}

impl Reference {
    pub fn node(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Node {
            id: id.into(),
            output: output.into(),
        }
    }

    pub fn data(key: impl Into<String>) -> Self {
        Self::Data { key: key.into() }
    }

    /// The producing node, if this points at a node.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Node { id, .. } => Some(id),
            Self::Data { .. } => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { id, output } => write!(f, "{}.{}", id, output),
            Self::Data { key } => write!(f, "data.{}", key),
        }
    }
}

impl FromStr for Reference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some(("data", key)) if !key.is_empty() => Ok(Self::data(key)),
            Some((id, output)) if !id.is_empty() && !output.is_empty() && !output.contains('.') => {
                Ok(Self::node(id, output))
            }
            _ => Err(format!(
                "invalid reference '{}': expected <id>.<output> or data.<key>",
                s
            )),
        }
    }
}

impl TryFrom<String> for Reference {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> Self {
        r.to_string()
    }
}

/// An attribute value: a literal, a nested structure, or a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Ref {
        #[serde(rename = "ref")]
        reference: Reference,
    },
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<AttrValue>),
    Map(IndexMap<String, AttrValue>),
}

impl AttrValue {
    pub fn reference(r: Reference) -> Self {
        Self::Ref { reference: r }
    }

    pub fn list<T: Into<AttrValue>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<K: Into<String>, V: Into<AttrValue>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// All references in this value, depth-first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref { reference } => out.push(reference),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
            Self::Bool(_) | Self::Int(_) | Self::Str(_) => {}
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Render a scalar for template substitution. Lists, maps and unresolved
    /// references have no scalar form.
    pub fn render_scalar(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Ref { .. } | Self::List(_) | Self::Map(_) => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for AttrValue {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for AttrValue {
    fn from(r: Reference) -> Self {
        Self::reference(r)
    }
}

// ============================================================================
// Observed state
// ============================================================================

/// Resource convergence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    Failed,
    Unknown,
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// What the engine last saw of one provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub kind: ResourceKind,

    /// Physical identifier assigned by the provider
    pub instance_id: String,

    pub status: ConvergenceStatus,

    /// Attributes as applied, references already resolved
    #[serde(default)]
    pub attributes: IndexMap<String, AttrValue>,

    #[serde(default)]
    pub outputs: IndexMap<String, AttrValue>,

    /// BLAKE3 hash of `attributes`
    pub hash: String,

    /// Node ids this resource depended on when applied
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Observed state of a whole stack, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    #[serde(default)]
    pub resources: IndexMap<String, ObservedResource>,
}

impl ObservedState {
    pub fn get(&self, id: &str) -> Option<&ObservedResource> {
        self.resources.get(id)
    }

    pub fn output(&self, id: &str, output: &str) -> Option<&AttrValue> {
        self.resources.get(id).and_then(|r| r.outputs.get(output))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// Which half of a replacement a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePhase {
    CreateNew,
    DestroyOld,
}

/// Informational notes attached to a planned change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Annotation {
    /// Destroy-then-create replacement leaves a gap
    ReplacementRequiresDowntime,
    /// Present in observed state, no longer declared
    Orphaned,
    /// Last apply of this node failed
    RetryAfterFailure,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplacementRequiresDowntime => write!(f, "replacement requires downtime"),
            Self::Orphaned => write!(f, "no longer declared"),
            Self::RetryAfterFailure => write!(f, "retrying failed apply"),
        }
    }
}

/// An attribute value as shown in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RenderedValue {
    Known(AttrValue),
    /// Depends on a resource that does not exist yet
    KnownAfterApply,
}

impl fmt::Display for RenderedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => match v.render_scalar() {
                Some(s) => write!(f, "{}", s),
                None => write!(f, "{}", serde_json::to_string(v).unwrap_or_default()),
            },
            Self::KnownAfterApply => write!(f, "(known after apply)"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    /// Position in the plan
    pub seq: usize,

    pub node_id: String,

    pub kind: ResourceKind,

    pub action: PlanAction,

    /// Set when `action` is `Replace`
    pub phase: Option<ReplacePhase>,

    pub lifecycle: Lifecycle,

    pub rendered_attributes: IndexMap<String, RenderedValue>,

    /// Attributes whose desired value differs from the observed one
    pub changed_attributes: Vec<String>,

    pub annotations: Vec<Annotation>,

    /// Earlier changes (by `seq`) that must succeed before this one starts
    pub after: Vec<usize>,

    /// Human-readable description
    pub description: String,
}

impl PlannedChange {
    /// Creates a provider resource: Create, or the new half of a Replace.
    pub fn creates(&self) -> bool {
        self.action == PlanAction::Create || self.phase == Some(ReplacePhase::CreateNew)
    }

    /// Removes a provider resource: Destroy, or the old half of a Replace.
    pub fn destroys(&self) -> bool {
        self.action == PlanAction::Destroy || self.phase == Some(ReplacePhase::DestroyOld)
    }
}

/// Full execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stack name
    pub name: String,

    /// Ordered changes; every change appears after the changes it waits on
    pub changes: Vec<PlannedChange>,

    /// Topological order of declared nodes
    pub execution_order: Vec<String>,

    /// Summary counts, one per node decision
    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

impl Plan {
    /// The decision taken for each node, in plan order.
    pub fn decisions(&self) -> IndexMap<String, PlanAction> {
        let mut out = IndexMap::new();
        for change in &self.changes {
            out.entry(change.node_id.clone()).or_insert(change.action);
        }
        out
    }

    /// True when applying this plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.changes.iter().all(|c| c.action == PlanAction::NoOp)
    }

    /// Index of the first change for `node_id` matching `pred`.
    pub fn position(&self, node_id: &str, pred: impl Fn(&PlannedChange) -> bool) -> Option<usize> {
        self.changes
            .iter()
            .position(|c| c.node_id == node_id && pred(c))
    }
}

// ============================================================================
// Apply result
// ============================================================================

/// Terminal status of one node after an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    Converged,
    Unchanged,
    Failed { cause: String },
    Skipped { blocked_by: String },
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Unchanged => write!(f, "UNCHANGED"),
            Self::Failed { cause } => write!(f, "FAILED ({})", cause),
            Self::Skipped { blocked_by } => write!(f, "SKIPPED (blocked by {})", blocked_by),
        }
    }
}

/// Overall status of an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Succeeded,
    PartiallyFailed {
        failed: Vec<String>,
        skipped: Vec<String>,
    },
}

/// Result of applying one plan.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub run_id: String,
    pub outcomes: IndexMap<String, NodeOutcome>,
    pub status: PlanStatus,
    pub failures: Vec<super::error::ActionFailed>,
    /// Observed state after the apply; feed it to the next plan
    pub observed: ObservedState,
    /// Old instances of replaced nodes whose destroy did not complete
    pub stranded: Vec<(String, ObservedResource)>,
    /// Module outputs, present only when the apply succeeded
    pub outputs: IndexMap<String, AttrValue>,
    pub total_duration: std::time::Duration,
}

impl ApplyReport {
    pub fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }
}

// ============================================================================
// Tests
// ============================================================================
