//! Executor: applies a plan against a provider.
//!
//! Changes start as soon as every change they wait on has succeeded, bounded
//! by `max_parallel`. A failure skips the transitive dependents of the failed
//! change and leaves independent branches running (or stops everything under
//! `StopOnFirst`). Observed state is only written here, from the scheduler loop.
//!
//! The pipeline entry points chain it all: lookups → resolve → declare →
//! graph → plan → apply.

use super::datasource::{self, DataSourceBackend, DataSourceResult, LookupRequest};
use super::error::{ActionFailed, EngineError};
use super::graph::{self, ResourceGraph};
use super::parser;
use super::planner::{self, Resolver};
use super::stack;
use super::types::*;
use crate::health::MembershipMonitor;
use crate::journal::eventlog::{self, JournalEvent};
use crate::journal::hasher;
use crate::provider::{Provisioned, ResourceProvider};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

/// A plan plus everything needed to apply it.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub run_id: String,
    pub plan: Plan,
    pub graph: ResourceGraph,
    /// Module outputs to publish after a successful apply
    pub outputs: IndexMap<String, Reference>,
}

/// Executor settings, normally taken from the stack's `policy`.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub max_parallel: usize,
    pub failure: FailurePolicy,
    pub journal: Option<PathBuf>,
}

impl From<&Policy> for ExecOptions {
    fn from(policy: &Policy) -> Self {
        Self {
            max_parallel: policy.max_parallel,
            failure: policy.failure,
            journal: policy.journal.clone(),
        }
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions::from(&Policy::default())
    }
}

fn journal(path: Option<&Path>, event: JournalEvent) {
    if let Some(path) = path {
        if let Err(e) = eventlog::append_event(path, event) {
            warn!(path = %path.display(), error = %e, "journal write failed");
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Resolve lookups, declare nodes, build the graph and plan against `observed`.
pub fn prepare(
    config: &StackConfig,
    backend: &dyn DataSourceBackend,
    observed: &ObservedState,
) -> Result<Prepared, EngineError> {
    let errors = parser::validate_config(config);
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::Config(joined.join("; ")));
    }

    let mut lookups: Vec<LookupRequest> = config.lookups.clone();
    if let Some(tier) = &config.web_tier {
        lookups.extend(stack::lookup_requests(tier));
    }
    let data = datasource::resolve_all(&lookups, backend)?;

    let mut nodes: Vec<ResourceNode> = config
        .resources
        .iter()
        .map(|(id, decl)| decl.to_node(id))
        .collect();
    let mut outputs = config.outputs.clone();
    if let Some(tier) = &config.web_tier {
        let (tier_nodes, tier_outputs) = stack::declare(tier, &data)?;
        nodes.extend(tier_nodes);
        for (name, reference) in tier_outputs {
            outputs.entry(name).or_insert(reference);
        }
    }

    let prepared = plan_nodes(&config.name, nodes, &data, observed, outputs)?;
    journal(
        config.policy.journal.as_deref(),
        JournalEvent::PlanComputed {
            stack: config.name.clone(),
            run_id: prepared.run_id.clone(),
            to_create: prepared.plan.to_create,
            to_update: prepared.plan.to_update,
            to_replace: prepared.plan.to_replace,
            to_destroy: prepared.plan.to_destroy,
            unchanged: prepared.plan.unchanged,
        },
    );
    Ok(prepared)
}

/// Graph and plan for an explicit node list.
pub fn plan_nodes(
    name: &str,
    nodes: Vec<ResourceNode>,
    data: &DataSourceResult,
    observed: &ObservedState,
    outputs: IndexMap<String, Reference>,
) -> Result<Prepared, EngineError> {
    let graph = graph::build_graph(nodes, data)?;
    let plan = planner::plan(name, &graph, observed)?;
    info!(
        stack = name,
        create = plan.to_create,
        update = plan.to_update,
        replace = plan.to_replace,
        destroy = plan.to_destroy,
        unchanged = plan.unchanged,
        "plan computed"
    );
    Ok(Prepared {
        run_id: eventlog::generate_run_id(),
        plan,
        graph,
        outputs,
    })
}

/// Inputs to one reconciliation pass.
pub struct ApplyConfig<'a> {
    pub config: &'a StackConfig,
    pub backend: &'a dyn DataSourceBackend,
    pub provider: Arc<dyn ResourceProvider>,
    pub observed: ObservedState,
    pub dry_run: bool,
    pub membership: Option<MembershipMonitor>,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub plan: Plan,
    /// Absent for dry runs
    pub report: Option<ApplyReport>,
}

/// Plan and, unless `dry_run`, apply.
pub async fn apply(cfg: ApplyConfig<'_>) -> Result<ApplyOutcome, EngineError> {
    let prepared = prepare(cfg.config, cfg.backend, &cfg.observed)?;
    if cfg.dry_run {
        return Ok(ApplyOutcome {
            plan: prepared.plan,
            report: None,
        });
    }

    let mut executor = Executor::new(cfg.provider, ExecOptions::from(&cfg.config.policy));
    if let Some(monitor) = cfg.membership {
        executor = executor.with_membership(monitor);
    }
    let report = executor.apply(&prepared, cfg.observed).await;
    Ok(ApplyOutcome {
        plan: prepared.plan,
        report: Some(report),
    })
}

/// Resolve declared module outputs against observed state.
pub fn collect_outputs(
    outputs: &IndexMap<String, Reference>,
    observed: &ObservedState,
    data: &DataSourceResult,
) -> IndexMap<String, AttrValue> {
    let mut values = IndexMap::new();
    for (name, reference) in outputs {
        let value = match reference {
            Reference::Node { id, output } => observed.output(id, output),
            Reference::Data { key } => data.get(key),
        };
        match value {
            Some(v) => {
                values.insert(name.clone(), v.clone());
            }
            None => warn!(output = %name, reference = %reference, "output has no value"),
        }
    }
    values
}

// ============================================================================
// Executor
// ============================================================================

enum Op {
    Create {
        attributes: IndexMap<String, AttrValue>,
    },
    Update {
        instance_id: String,
        attributes: IndexMap<String, AttrValue>,
    },
    Destroy {
        instance_id: String,
    },
}

enum Effect {
    Created {
        provisioned: Provisioned,
        attributes: IndexMap<String, AttrValue>,
    },
    Updated {
        outputs: IndexMap<String, AttrValue>,
        attributes: IndexMap<String, AttrValue>,
    },
    Destroyed,
}

impl Effect {
    fn hash(&self) -> Option<String> {
        match self {
            Effect::Created { attributes, .. } | Effect::Updated { attributes, .. } => {
                Some(hasher::hash_attributes(attributes))
            }
            Effect::Destroyed => None,
        }
    }
}

/// One provider call, detached from the scheduler so it can run on the pool.
struct Job {
    node_id: String,
    kind: ResourceKind,
    op: Op,
    provider: Arc<dyn ResourceProvider>,
    membership: Option<MembershipMonitor>,
}

impl Job {
    async fn run(self) -> Result<Effect, String> {
        match self.op {
            Op::Create { attributes } => {
                let provisioned = self
                    .provider
                    .create(&self.node_id, self.kind, &attributes)
                    .await?;
                Ok(Effect::Created {
                    provisioned,
                    attributes,
                })
            }
            Op::Update {
                instance_id,
                attributes,
            } => {
                let outputs = self
                    .provider
                    .update(&self.node_id, self.kind, &instance_id, &attributes)
                    .await?;
                Ok(Effect::Updated {
                    outputs,
                    attributes,
                })
            }
            Op::Destroy { instance_id } => {
                if self.kind == ResourceKind::AutoscalingGroup {
                    if let Some(monitor) = &self.membership {
                        let drained = monitor
                            .terminate_group(&instance_id)
                            .await
                            .map_err(|e| format!("draining members: {}", e))?;
                        if !drained.is_empty() {
                            info!(node = %self.node_id, group = %instance_id, members = drained.len(), "members drained");
                        }
                    }
                }
                self.provider
                    .destroy(&self.node_id, self.kind, &instance_id)
                    .await?;
                Ok(Effect::Destroyed)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Waiting,
    Running,
    Done,
    Failed(String),
    Skipped(String),
}

/// Observed state as it evolves during one pass.
struct Working {
    observed: ObservedState,
    /// Old halves of replacements whose new half is already live
    retired: IndexMap<String, ObservedResource>,
    stranded: Vec<(String, ObservedResource)>,
}

fn action_label(change: &PlannedChange) -> String {
    match change.phase {
        Some(ReplacePhase::CreateNew) => format!("{}:create", change.action),
        Some(ReplacePhase::DestroyOld) => format!("{}:destroy", change.action),
        None => change.action.to_string(),
    }
}

pub struct Executor {
    provider: Arc<dyn ResourceProvider>,
    membership: Option<MembershipMonitor>,
    options: ExecOptions,
}

impl Executor {
    pub fn new(provider: Arc<dyn ResourceProvider>, options: ExecOptions) -> Self {
        Self {
            provider,
            membership: None,
            options,
        }
    }

    /// Drain autoscaling-group members through `monitor` before destroying a group.
    pub fn with_membership(mut self, monitor: MembershipMonitor) -> Self {
        self.membership = Some(monitor);
        self
    }

    fn journal(&self, event: JournalEvent) {
        journal(self.options.journal.as_deref(), event);
    }

    /// Apply `prepared.plan`, starting from `observed`.
    pub async fn apply(&self, prepared: &Prepared, observed: ObservedState) -> ApplyReport {
        let start = Instant::now();
        let plan = &prepared.plan;
        let run_id = prepared.run_id.clone();
        let n = plan.changes.len();

        self.journal(JournalEvent::ApplyStarted {
            stack: plan.name.clone(),
            run_id: run_id.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(stack = %plan.name, run_id = %run_id, changes = n, "apply started");

        let mut waiting: Vec<usize> = plan.changes.iter().map(|c| c.after.len()).collect();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for change in &plan.changes {
            for &pred in &change.after {
                successors[pred].push(change.seq);
            }
        }
        let mut progress = vec![Progress::Waiting; n];
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut work = Working {
            observed,
            retired: IndexMap::new(),
            stranded: Vec::new(),
        };
        let mut failures: Vec<ActionFailed> = Vec::new();
        let mut halted = false;
        let mut tasks: JoinSet<(usize, Result<Effect, String>, f64)> = JoinSet::new();
        let mut spawned: FxHashMap<task::Id, usize> = FxHashMap::default();
        let max_parallel = self.options.max_parallel.max(1);

        loop {
            while !halted && tasks.len() < max_parallel {
                let Some(seq) = ready.pop_front() else { break };
                let change = &plan.changes[seq];
                if change.action == PlanAction::NoOp {
                    progress[seq] = Progress::Done;
                    release(seq, &successors, &mut waiting, &progress, &mut ready);
                    continue;
                }

                match self.job_for(change, &prepared.graph, &work) {
                    Ok(job) => {
                        debug!(node = %change.node_id, action = %action_label(change), "action started");
                        self.journal(JournalEvent::ActionStarted {
                            node: change.node_id.clone(),
                            action: action_label(change),
                        });
                        progress[seq] = Progress::Running;
                        let handle = tasks.spawn(async move {
                            let started = Instant::now();
                            let result = job.run().await;
                            (seq, result, started.elapsed().as_secs_f64())
                        });
                        spawned.insert(handle.id(), seq);
                    }
                    Err(cause) => {
                        self.fail(seq, cause, plan, &successors, &mut progress, &mut failures);
                        halted |= self.options.failure == FailurePolicy::StopOnFirst;
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (seq, result, seconds) = match joined {
                Ok((id, done)) => {
                    spawned.remove(&id);
                    done
                }
                Err(e) => {
                    let Some(seq) = spawned.remove(&e.id()) else {
                        error!(error = %e, "action task aborted");
                        continue;
                    };
                    let cause = if e.is_panic() {
                        "action task panicked".to_string()
                    } else {
                        "action task aborted".to_string()
                    };
                    self.record_failure(&plan.changes[seq], &mut work);
                    self.fail(seq, cause, plan, &successors, &mut progress, &mut failures);
                    halted |= self.options.failure == FailurePolicy::StopOnFirst;
                    continue;
                }
            };
            let change = &plan.changes[seq];
            match result {
                Ok(effect) => {
                    let hash = effect.hash();
                    self.commit(change, &prepared.graph, effect, &mut work);
                    info!(node = %change.node_id, action = %action_label(change), seconds, "action succeeded");
                    self.journal(JournalEvent::ActionSucceeded {
                        node: change.node_id.clone(),
                        action: action_label(change),
                        duration_seconds: seconds,
                        hash,
                    });
                    progress[seq] = Progress::Done;
                    release(seq, &successors, &mut waiting, &progress, &mut ready);
                }
                Err(cause) => {
                    self.record_failure(change, &mut work);
                    self.fail(seq, cause, plan, &successors, &mut progress, &mut failures);
                    halted |= self.options.failure == FailurePolicy::StopOnFirst;
                }
            }
        }

        // Anything Waiting never got to start.
        let first_failed = failures.first().map(|f| f.node_id.clone());
        for seq in 0..n {
            match &progress[seq] {
                Progress::Running => {
                    let cause = "action task aborted".to_string();
                    failures.push(ActionFailed {
                        node_id: plan.changes[seq].node_id.clone(),
                        cause: cause.clone(),
                    });
                    progress[seq] = Progress::Failed(cause);
                }
                Progress::Waiting => {
                    let blocked_by = first_failed
                        .clone()
                        .unwrap_or_else(|| plan.changes[seq].node_id.clone());
                    self.journal(JournalEvent::ActionSkipped {
                        node: plan.changes[seq].node_id.clone(),
                        blocked_by: blocked_by.clone(),
                    });
                    progress[seq] = Progress::Skipped(blocked_by);
                }
                _ => {}
            }
        }

        let outcomes = node_outcomes(plan, &progress);
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Failed { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        let skipped: Vec<String> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Skipped { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        let status = if failed.is_empty() && skipped.is_empty() {
            PlanStatus::Succeeded
        } else {
            PlanStatus::PartiallyFailed {
                failed: failed.clone(),
                skipped: skipped.clone(),
            }
        };

        let outputs = if status == PlanStatus::Succeeded {
            collect_outputs(&prepared.outputs, &work.observed, prepared.graph.data())
        } else {
            IndexMap::new()
        };

        let converged = outcomes
            .values()
            .filter(|o| **o == NodeOutcome::Converged)
            .count() as u32;
        let unchanged = outcomes
            .values()
            .filter(|o| **o == NodeOutcome::Unchanged)
            .count() as u32;
        let total_duration = start.elapsed();
        self.journal(JournalEvent::ApplyCompleted {
            stack: plan.name.clone(),
            run_id: run_id.clone(),
            converged,
            unchanged,
            failed: failed.len() as u32,
            skipped: skipped.len() as u32,
            total_seconds: total_duration.as_secs_f64(),
        });
        info!(
            stack = %plan.name,
            converged,
            unchanged,
            failed = failed.len(),
            skipped = skipped.len(),
            "apply completed"
        );

        let mut stranded = work.stranded;
        stranded.extend(work.retired);
        ApplyReport {
            run_id,
            outcomes,
            status,
            failures,
            observed: work.observed,
            stranded,
            outputs,
            total_duration,
        }
    }

    fn job_for(&self, change: &PlannedChange, graph: &ResourceGraph, work: &Working) -> Result<Job, String> {
        let id = &change.node_id;
        let op = if change.creates() || change.action == PlanAction::Update {
            let node = graph
                .node(id)
                .ok_or_else(|| format!("{} is not declared", id))?;
            let attributes = resolve_known(node, graph.data(), &work.observed)?;
            if change.creates() {
                Op::Create { attributes }
            } else {
                let instance_id = work
                    .observed
                    .get(id)
                    .map(|r| r.instance_id.clone())
                    .ok_or_else(|| format!("{} has no observed instance to update", id))?;
                Op::Update {
                    instance_id,
                    attributes,
                }
            }
        } else {
            let record = work
                .retired
                .get(id)
                .or_else(|| work.observed.get(id))
                .ok_or_else(|| format!("{} has no observed instance to destroy", id))?;
            Op::Destroy {
                instance_id: record.instance_id.clone(),
            }
        };

        Ok(Job {
            node_id: id.clone(),
            kind: change.kind,
            op,
            provider: Arc::clone(&self.provider),
            membership: self.membership.clone(),
        })
    }

    fn commit(&self, change: &PlannedChange, graph: &ResourceGraph, effect: Effect, work: &mut Working) {
        let id = &change.node_id;
        let depends_on = graph.dependencies(id).to_vec();
        match effect {
            Effect::Created {
                provisioned,
                attributes,
            } => {
                let record = ObservedResource {
                    kind: change.kind,
                    instance_id: provisioned.instance_id,
                    status: ConvergenceStatus::Converged,
                    hash: hasher::hash_attributes(&attributes),
                    attributes,
                    outputs: provisioned.outputs,
                    depends_on,
                };
                if let Some(old) = work.observed.resources.insert(id.clone(), record) {
                    work.retired.insert(id.clone(), old);
                }
            }
            Effect::Updated {
                outputs,
                attributes,
            } => {
                if let Some(record) = work.observed.resources.get_mut(id) {
                    record.status = ConvergenceStatus::Converged;
                    record.hash = hasher::hash_attributes(&attributes);
                    record.attributes = attributes;
                    record.outputs = outputs;
                    record.depends_on = depends_on;
                }
            }
            Effect::Destroyed => {
                if work.retired.shift_remove(id).is_none() {
                    work.observed.resources.shift_remove(id);
                }
            }
        }
    }

    fn record_failure(&self, change: &PlannedChange, work: &mut Working) {
        let id = &change.node_id;
        if change.creates() {
            return;
        }
        if change.destroys() {
            if let Some(mut old) = work.retired.shift_remove(id) {
                old.status = ConvergenceStatus::Failed;
                work.stranded.push((id.clone(), old));
                return;
            }
        }
        if let Some(record) = work.observed.resources.get_mut(id) {
            record.status = ConvergenceStatus::Failed;
        }
    }

    /// Mark `seq` failed and skip everything downstream of it.
    fn fail(
        &self,
        seq: usize,
        cause: String,
        plan: &Plan,
        successors: &[Vec<usize>],
        progress: &mut [Progress],
        failures: &mut Vec<ActionFailed>,
    ) {
        let change = &plan.changes[seq];
        error!(node = %change.node_id, action = %action_label(change), cause = %cause, "action failed");
        self.journal(JournalEvent::ActionFailed {
            node: change.node_id.clone(),
            action: action_label(change),
            error: cause.clone(),
        });
        failures.push(ActionFailed {
            node_id: change.node_id.clone(),
            cause: cause.clone(),
        });
        progress[seq] = Progress::Failed(cause);

        let mut stack: Vec<usize> = successors[seq].clone();
        while let Some(next) = stack.pop() {
            if progress[next] != Progress::Waiting {
                continue;
            }
            let skipped = &plan.changes[next];
            warn!(node = %skipped.node_id, blocked_by = %change.node_id, "action skipped");
            self.journal(JournalEvent::ActionSkipped {
                node: skipped.node_id.clone(),
                blocked_by: change.node_id.clone(),
            });
            progress[next] = Progress::Skipped(change.node_id.clone());
            stack.extend(successors[next].iter().copied());
        }
    }
}

fn release(
    seq: usize,
    successors: &[Vec<usize>],
    waiting: &mut [usize],
    progress: &[Progress],
    ready: &mut VecDeque<usize>,
) {
    for &next in &successors[seq] {
        waiting[next] -= 1;
        if waiting[next] == 0 && progress[next] == Progress::Waiting {
            ready.push_back(next);
        }
    }
}

/// Resolve every reference now; anything still unknown is an error.
fn resolve_known(
    node: &ResourceNode,
    data: &DataSourceResult,
    observed: &ObservedState,
) -> Result<IndexMap<String, AttrValue>, String> {
    let pending = FxHashSet::default();
    let resolver = Resolver {
        data,
        observed,
        pending: &pending,
    };
    resolver
        .resolve_all(node)
        .into_iter()
        .map(|(name, value)| {
            value
                .map(|v| (name.clone(), v))
                .ok_or_else(|| format!("attribute '{}' references an output that does not exist", name))
        })
        .collect()
}

/// Collapse per-change progress into one terminal outcome per node.
fn node_outcomes(plan: &Plan, progress: &[Progress]) -> IndexMap<String, NodeOutcome> {
    fn rank(outcome: &NodeOutcome) -> u8 {
        match outcome {
            NodeOutcome::Unchanged => 0,
            NodeOutcome::Converged => 1,
            NodeOutcome::Skipped { .. } => 2,
            NodeOutcome::Failed { .. } => 3,
        }
    }

    let mut outcomes: IndexMap<String, NodeOutcome> = IndexMap::new();
    for change in &plan.changes {
        let outcome = match &progress[change.seq] {
            Progress::Done if change.action == PlanAction::NoOp => NodeOutcome::Unchanged,
            Progress::Done => NodeOutcome::Converged,
            Progress::Failed(cause) => NodeOutcome::Failed {
                cause: cause.clone(),
            },
            Progress::Skipped(blocked_by) => NodeOutcome::Skipped {
                blocked_by: blocked_by.clone(),
            },
            Progress::Waiting | Progress::Running => NodeOutcome::Skipped {
                blocked_by: change.node_id.clone(),
            },
        };
        match outcomes.get_mut(&change.node_id) {
            Some(existing) if rank(&outcome) > rank(existing) => *existing = outcome,
            Some(_) => {}
            None => {
                outcomes.insert(change.node_id.clone(), outcome);
            }
        }
    }
    outcomes
}
