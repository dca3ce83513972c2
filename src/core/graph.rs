//! Resource graph construction.
//!
//! Every `Reference` in a node's attributes (and every explicit `depends_on`)
//! becomes an edge from the consuming node to the producing node. Dangling
//! references are rejected; cycles are found with a white/gray/black DFS.

use super::datasource::DataSourceResult;
use super::error::GraphError;
use super::types::{Reference, ResourceNode};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// A validated, acyclic resource graph.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Nodes in declaration order
    nodes: IndexMap<String, ResourceNode>,
    /// Node -> nodes it depends on (producers), first-reference order
    dependencies: FxHashMap<String, Vec<String>>,
    /// Node -> nodes that depend on it (consumers), declaration order
    dependents: FxHashMap<String, Vec<String>>,
    data: DataSourceResult,
}

impl ResourceGraph {
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Position of `id` in declaration order.
    pub fn declaration_index(&self, id: &str) -> Option<usize> {
        self.nodes.get_index_of(id)
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn data(&self) -> &DataSourceResult {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build the dependency graph for `nodes` against resolved lookups.
pub fn build_graph(
    nodes: Vec<ResourceNode>,
    data: &DataSourceResult,
) -> Result<ResourceGraph, GraphError> {
    let mut by_id: IndexMap<String, ResourceNode> = IndexMap::new();
    for node in nodes {
        if by_id.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { id: node.id });
        }
        by_id.insert(node.id.clone(), node);
    }

    let mut dependencies: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut dependents: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for id in by_id.keys() {
        dependencies.insert(id.clone(), Vec::new());
        dependents.insert(id.clone(), Vec::new());
    }

    for (id, node) in &by_id {
        let mut producers: Vec<&str> = Vec::new();

        for (attribute, reference) in node.references() {
            let unresolved = |reason: String| GraphError::UnresolvedReference {
                node: id.clone(),
                attribute: attribute.to_string(),
                reference: reference.to_string(),
                reason,
            };
            match reference {
                Reference::Node { id: target, output } => {
                    let producer = by_id
                        .get(target)
                        .ok_or_else(|| unresolved(format!("no resource named '{}'", target)))?;
                    if !producer.kind.has_output(output) {
                        return Err(unresolved(format!(
                            "{} has no output '{}'",
                            producer.kind, output
                        )));
                    }
                    producers.push(target);
                }
                Reference::Data { key } => {
                    if !data.contains_key(key) {
                        return Err(unresolved(format!("no data source result '{}'", key)));
                    }
                }
            }
        }

        for dep in &node.depends_on {
            if !by_id.contains_key(dep) {
                return Err(GraphError::UnresolvedReference {
                    node: id.clone(),
                    attribute: "depends_on".to_string(),
                    reference: dep.clone(),
                    reason: format!("no resource named '{}'", dep),
                });
            }
            producers.push(dep);
        }

        for producer in producers {
            let deps = dependencies.entry(id.clone()).or_default();
            if !deps.iter().any(|d| d == producer) {
                deps.push(producer.to_string());
                dependents
                    .entry(producer.to_string())
                    .or_default()
                    .push(id.clone());
            }
        }
    }

    if let Some(chain) = find_cycle(&by_id, &dependencies) {
        return Err(GraphError::CyclicDependency { chain });
    }

    Ok(ResourceGraph {
        nodes: by_id,
        dependencies,
        dependents,
        data: data.clone(),
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first search over dependency edges. Returns the chain of node ids that
/// closes a cycle (first and last element are the same node).
fn find_cycle(
    nodes: &IndexMap<String, ResourceNode>,
    dependencies: &FxHashMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut color: FxHashMap<&str, Color> =
        nodes.keys().map(|id| (id.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        dependencies: &'a FxHashMap<String, Vec<String>>,
        color: &mut FxHashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        color.insert(id, Color::Gray);
        path.push(id);

        for dep in dependencies.get(id).into_iter().flatten() {
            match color.get(dep.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                    let mut chain: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    chain.push(dep.clone());
                    return Some(chain);
                }
                Color::White => {
                    if let Some(chain) = visit(dep, dependencies, color, path) {
                        return Some(chain);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        color.insert(id, Color::Black);
        None
    }

    for id in nodes.keys() {
        if color.get(id.as_str()) == Some(&Color::White) {
            if let Some(chain) = visit(id, dependencies, &mut color, &mut path) {
                return Some(chain);
            }
        }
    }
    None
}
