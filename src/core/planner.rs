//! Plan generation: order the graph, diff desired against observed state,
//! expand replacements according to each node's lifecycle.
//!
//! The planner is pure: it reads the graph and observed state and returns a
//! [`Plan`]. Nothing is mutated, so it doubles as a dry run.

use super::datasource::DataSourceResult;
use super::error::PlanError;
use super::graph::ResourceGraph;
use super::types::*;
use crate::health::machine::{MemberSnapshot, MemberState};
use crate::journal::hasher;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

/// Topological order of the graph's nodes (producers first).
/// Kahn's algorithm; ties go to the node declared first.
pub fn execution_order(graph: &ResourceGraph) -> Result<Vec<String>, PlanError> {
    let ids: Vec<&str> = graph.nodes().map(|n| n.id.as_str()).collect();
    let mut in_degree: Vec<usize> = ids.iter().map(|id| graph.dependencies(id).len()).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(current) = ready.pop_first() {
        order.push(ids[current].to_string());
        for dependent in graph.dependents(ids[current]) {
            if let Some(j) = graph.declaration_index(dependent) {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
    }

    if order.len() != ids.len() {
        let placed: FxHashSet<&str> = order.iter().map(String::as_str).collect();
        let remaining = ids
            .iter()
            .filter(|id| !placed.contains(**id))
            .map(|id| id.to_string())
            .collect();
        return Err(PlanError::DependencyCycle { remaining });
    }

    Ok(order)
}

/// Resolves references in desired attribute values.
pub(crate) struct Resolver<'a> {
    pub data: &'a DataSourceResult,
    pub observed: &'a ObservedState,
    /// Nodes whose outputs will change during this plan
    pub pending: &'a FxHashSet<String>,
}

impl Resolver<'_> {
    /// `None` means the value is only known after apply.
    pub fn resolve(&self, value: &AttrValue) -> Option<AttrValue> {
        match value {
            AttrValue::Ref { reference } => match reference {
                Reference::Node { id, output } => {
                    if self.pending.contains(id) {
                        return None;
                    }
                    self.observed.output(id, output).cloned()
                }
                Reference::Data { key } => self.data.get(key).cloned(),
            },
            AttrValue::List(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Option<Vec<_>>>()
                .map(AttrValue::List),
            AttrValue::Map(entries) => entries
                .iter()
                .map(|(k, v)| self.resolve(v).map(|r| (k.clone(), r)))
                .collect::<Option<IndexMap<_, _>>>()
                .map(AttrValue::Map),
            AttrValue::Bool(_) | AttrValue::Int(_) | AttrValue::Str(_) => Some(value.clone()),
        }
    }

    pub fn resolve_all(&self, node: &ResourceNode) -> IndexMap<String, Option<AttrValue>> {
        node.attributes
            .iter()
            .map(|(name, value)| (name.clone(), self.resolve(value)))
            .collect()
    }
}

/// Decide what a node needs, given its resolved desired attributes.
fn decide(
    node: &ResourceNode,
    prior: Option<&ObservedResource>,
    resolved: &IndexMap<String, Option<AttrValue>>,
) -> (PlanAction, Vec<String>, Vec<Annotation>) {
    let Some(prior) = prior else {
        return (PlanAction::Create, Vec::new(), Vec::new());
    };

    if prior.kind != node.kind {
        return (PlanAction::Replace, vec!["type".to_string()], Vec::new());
    }

    let converged = prior.status == ConvergenceStatus::Converged;
    let known: Option<IndexMap<String, AttrValue>> = resolved
        .iter()
        .map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .collect();
    if let Some(known) = &known {
        if converged && hasher::hash_attributes(known) == prior.hash {
            return (PlanAction::NoOp, Vec::new(), Vec::new());
        }
    }

    let mut changed: Vec<String> = Vec::new();
    for (name, value) in resolved {
        match value {
            Some(v) if prior.attributes.get(name) == Some(v) => {}
            _ => changed.push(name.clone()),
        }
    }
    for name in prior.attributes.keys() {
        if !resolved.contains_key(name) {
            changed.push(name.clone());
        }
    }

    let mut annotations = Vec::new();
    if !converged {
        annotations.push(Annotation::RetryAfterFailure);
    }

    if changed.iter().any(|a| node.kind.requires_replace(a)) {
        (PlanAction::Replace, changed, annotations)
    } else if changed.is_empty() && converged {
        (PlanAction::NoOp, changed, annotations)
    } else {
        (PlanAction::Update, changed, annotations)
    }
}

fn render_resolved(resolved: &IndexMap<String, Option<AttrValue>>) -> IndexMap<String, RenderedValue> {
    resolved
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                Some(v) => RenderedValue::Known(v.clone()),
                None => RenderedValue::KnownAfterApply,
            };
            (k.clone(), rendered)
        })
        .collect()
}

fn render_observed(prior: Option<&ObservedResource>) -> IndexMap<String, RenderedValue> {
    prior
        .map(|p| {
            p.attributes
                .iter()
                .map(|(k, v)| (k.clone(), RenderedValue::Known(v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

struct Step {
    node_id: String,
    kind: ResourceKind,
    lifecycle: Lifecycle,
    action: PlanAction,
    phase: Option<ReplacePhase>,
    rendered: IndexMap<String, RenderedValue>,
    changed: Vec<String>,
    annotations: Vec<Annotation>,
    after: Vec<usize>,
}

/// Collects steps in emission order. Steps may wait on steps emitted later;
/// [`PlanBuilder::finish`] numbers them so every change follows its predecessors.
#[derive(Default)]
struct PlanBuilder {
    steps: Vec<Step>,
}

impl PlanBuilder {
    fn push(&mut self, step: Step) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// Make `slot` also wait on `on`.
    fn wait(&mut self, slot: usize, on: usize) {
        self.steps[slot].after.push(on);
    }

    /// Kahn over the steps, ties to the earliest emitted, so emission order is
    /// kept wherever it already satisfies the edges.
    fn finish(self) -> Result<Vec<PlannedChange>, PlanError> {
        let n = self.steps.len();
        let mut waiting = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (slot, step) in self.steps.iter().enumerate() {
            let mut preds = step.after.clone();
            preds.sort_unstable();
            preds.dedup();
            waiting[slot] = preds.len();
            for pred in preds {
                successors[pred].push(slot);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&slot| waiting[slot] == 0).collect();
        let mut numbered: Vec<Option<usize>> = vec![None; n];
        let mut sequence: Vec<usize> = Vec::with_capacity(n);
        while let Some(slot) = ready.pop_first() {
            numbered[slot] = Some(sequence.len());
            sequence.push(slot);
            for &next in &successors[slot] {
                waiting[next] -= 1;
                if waiting[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if sequence.len() < n {
            let mut remaining: Vec<String> = Vec::new();
            for (slot, step) in self.steps.iter().enumerate() {
                if numbered[slot].is_none() && !remaining.contains(&step.node_id) {
                    remaining.push(step.node_id.clone());
                }
            }
            return Err(PlanError::DependencyCycle { remaining });
        }

        let mut steps: Vec<Option<Step>> = self.steps.into_iter().map(Some).collect();
        let mut changes = Vec::with_capacity(n);
        for slot in sequence {
            let Some(step) = steps[slot].take() else { continue };
            let mut after: Vec<usize> = step.after.iter().filter_map(|&p| numbered[p]).collect();
            after.sort_unstable();
            after.dedup();
            let description = describe(&step.node_id, step.kind, step.action, step.phase, &step.changed);
            changes.push(PlannedChange {
                seq: changes.len(),
                node_id: step.node_id,
                kind: step.kind,
                action: step.action,
                phase: step.phase,
                lifecycle: step.lifecycle,
                rendered_attributes: step.rendered,
                changed_attributes: step.changed,
                annotations: step.annotations,
                after,
                description,
            });
        }
        Ok(changes)
    }
}

/// Generate an execution plan by comparing the graph to observed state.
pub fn plan(name: &str, graph: &ResourceGraph, observed: &ObservedState) -> Result<Plan, PlanError> {
    let order = execution_order(graph)?;

    let mut builder = PlanBuilder::default();
    let mut pending: FxHashSet<String> = FxHashSet::default();
    // node -> the change its dependents wait on
    let mut forward: FxHashMap<String, usize> = FxHashMap::default();
    let mut replaced_cbd: FxHashSet<String> = FxHashSet::default();
    // node -> the change that removes its old instance
    let mut destroyed: FxHashMap<String, usize> = FxHashMap::default();
    let (mut to_create, mut to_update, mut to_replace, mut to_destroy, mut unchanged) =
        (0u32, 0u32, 0u32, 0u32, 0u32);

    for id in &order {
        let Some(node) = graph.node(id) else { continue };
        let prior = observed.get(id);
        let resolved = Resolver {
            data: graph.data(),
            observed,
            pending: &pending,
        }
        .resolve_all(node);
        let (action, changed, mut annotations) = decide(node, prior, &resolved);
        let after: Vec<usize> = graph
            .dependencies(id)
            .iter()
            .filter_map(|d| forward.get(d).copied())
            .collect();

        let step = |action, phase, rendered, changed, annotations, after| Step {
            node_id: id.clone(),
            kind: node.kind,
            lifecycle: node.lifecycle,
            action,
            phase,
            rendered,
            changed,
            annotations,
            after,
        };

        match action {
            PlanAction::Create | PlanAction::Update | PlanAction::NoOp => {
                let seq = builder.push(step(
                    action,
                    None,
                    render_resolved(&resolved),
                    changed,
                    annotations,
                    after,
                ));
                forward.insert(id.clone(), seq);
            }
            PlanAction::Replace => match node.lifecycle {
                Lifecycle::CreateBeforeDestroy => {
                    let seq = builder.push(step(
                        action,
                        Some(ReplacePhase::CreateNew),
                        render_resolved(&resolved),
                        changed,
                        annotations,
                        after,
                    ));
                    forward.insert(id.clone(), seq);
                    replaced_cbd.insert(id.clone());
                }
                Lifecycle::DestroyBeforeCreate => {
                    annotations.push(Annotation::ReplacementRequiresDowntime);
                    let old = builder.push(step(
                        action,
                        Some(ReplacePhase::DestroyOld),
                        render_observed(prior),
                        changed.clone(),
                        annotations.clone(),
                        after.clone(),
                    ));
                    destroyed.insert(id.clone(), old);
                    let mut after_new = after;
                    after_new.push(old);
                    let seq = builder.push(step(
                        action,
                        Some(ReplacePhase::CreateNew),
                        render_resolved(&resolved),
                        changed,
                        annotations,
                        after_new,
                    ));
                    forward.insert(id.clone(), seq);
                }
            },
            PlanAction::Destroy => {}
        }

        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Replace => to_replace += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::NoOp => unchanged += 1,
        }
        if matches!(action, PlanAction::Create | PlanAction::Replace) {
            pending.insert(id.clone());
        }
    }

    // Old halves of create-before-destroy replacements, dependents first.
    for id in order.iter().rev() {
        if !replaced_cbd.contains(id) {
            continue;
        }
        let Some(node) = graph.node(id) else { continue };
        let mut after: Vec<usize> = forward.get(id).copied().into_iter().collect();
        for dependent in graph.dependents(id) {
            after.extend(forward.get(dependent).copied());
            after.extend(destroyed.get(dependent).copied());
        }
        let seq = builder.push(Step {
            node_id: id.clone(),
            kind: node.kind,
            lifecycle: node.lifecycle,
            action: PlanAction::Replace,
            phase: Some(ReplacePhase::DestroyOld),
            rendered: render_observed(observed.get(id)),
            changed: Vec::new(),
            annotations: Vec::new(),
            after,
        });
        destroyed.insert(id.clone(), seq);
    }

    // Orphans: observed but no longer declared. Destroy consumers before producers.
    let mut orphans: Vec<&String> = observed
        .resources
        .keys()
        .filter(|id| !graph.contains(id))
        .collect();
    while !orphans.is_empty() {
        let next = orphans.iter().position(|candidate| {
            !orphans.iter().any(|other| {
                other != candidate
                    && observed.resources[*other]
                        .depends_on
                        .iter()
                        .any(|d| d == *candidate)
            })
        });
        let Some(pos) = next else {
            return Err(PlanError::DependencyCycle {
                remaining: orphans.iter().map(|s| s.to_string()).collect(),
            });
        };
        let id = orphans.remove(pos);
        let prior = &observed.resources[id];

        let mut after: Vec<usize> = Vec::new();
        for (other_id, other) in &observed.resources {
            if other.depends_on.iter().any(|d| d == id) {
                after.extend(forward.get(other_id).copied());
                after.extend(destroyed.get(other_id).copied());
            }
        }
        let seq = builder.push(Step {
            node_id: id.clone(),
            kind: prior.kind,
            lifecycle: Lifecycle::default(),
            action: PlanAction::Destroy,
            phase: None,
            rendered: render_observed(Some(prior)),
            changed: Vec::new(),
            annotations: vec![Annotation::Orphaned],
            after,
        });
        // the old instance of a declared producer outlives everything still pointing at it
        for producer in &prior.depends_on {
            if graph.contains(producer) {
                if let Some(&old) = destroyed.get(producer) {
                    builder.wait(old, seq);
                }
            }
        }
        destroyed.insert(id.clone(), seq);
        to_destroy += 1;
    }

    Ok(Plan {
        name: name.to_string(),
        changes: builder.finish()?,
        execution_order: order,
        to_create,
        to_update,
        to_replace,
        to_destroy,
        unchanged,
    })
}

/// Generate a human-readable description of a planned change.
fn describe(
    id: &str,
    kind: ResourceKind,
    action: PlanAction,
    phase: Option<ReplacePhase>,
    changed: &[String],
) -> String {
    match (action, phase) {
        (PlanAction::Create, _) => format!("{}: create {}", id, kind),
        (PlanAction::Update, _) if changed.is_empty() => format!("{}: re-apply {}", id, kind),
        (PlanAction::Update, _) => format!("{}: update {} ({})", id, kind, changed.join(", ")),
        (PlanAction::Replace, Some(ReplacePhase::DestroyOld)) => {
            format!("{}: destroy previous {}", id, kind)
        }
        (PlanAction::Replace, _) => {
            format!("{}: create replacement {} ({})", id, kind, changed.join(", "))
        }
        (PlanAction::Destroy, _) => format!("{}: destroy {} (no longer declared)", id, kind),
        (PlanAction::NoOp, _) => format!("{}: no changes", id),
    }
}

/// Choose which members to drain so that at most `desired_capacity` stay active.
/// Unhealthy members go first, then ones still initializing, then in-service
/// ones; within a class the earliest registered goes first.
pub fn plan_scale_in(members: &[MemberSnapshot], desired_capacity: usize) -> Vec<String> {
    let mut active: Vec<(usize, &MemberSnapshot)> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.state.is_active())
        .collect();
    let excess = active.len().saturating_sub(desired_capacity);
    active.sort_by_key(|(i, m)| (scale_in_rank(m.state), *i));
    active
        .into_iter()
        .take(excess)
        .map(|(_, m)| m.instance_id.clone())
        .collect()
}

fn scale_in_rank(state: MemberState) -> u8 {
    match state {
        MemberState::Unhealthy => 0,
        MemberState::Initializing => 1,
        MemberState::InService => 2,
        MemberState::Draining | MemberState::Terminated => 3,
    }
}
