//! # Dependency Graph
//!
//! Turns the flat, already-filtered schema list into an arena of nodes linked
//! by two kinds of edges:
//!
//! - **Interleaving**: a parent depends on each of its interleaved children.
//! - **Reference**: a referenced table depends on each table referencing it.
//!
//! "A depends on B" means B must be terminal before A may delete. An edge is
//! *cascade-covered* when deleting A removes B's rows on its own; when both
//! edge kinds connect the same pair the dependency is cascade-covered only if
//! every connecting edge cascades.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeId`], so iteration order is
//! deterministic and cycle detection is a plain depth-first colouring.

use crate::error::{ConfigError, Result, TruncateError};
use crate::schema::{IndexSchema, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Index of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A table that must be terminal before the owning node may delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub node: NodeId,
    /// Deleting the owner removes this table's dependent rows
    pub cascade: bool,
    pub interleaved: bool,
    pub referenced: bool,
}

#[derive(Debug, Clone)]
pub struct DeletionNode {
    pub id: NodeId,
    pub schema: TableSchema,
    /// Interleaving parent
    pub parent: Option<NodeId>,
    /// Interleaved children, in catalog order
    pub children: Vec<NodeId>,
    /// Nodes that must be terminal before this one deletes
    pub dependencies: Vec<Dependency>,
    /// Nodes that list this one as a dependency
    pub dependents: Vec<NodeId>,
    /// Nodes whose own deletion cascades onto this one
    pub cascaded_by: Vec<NodeId>,
    pub indexes: Vec<IndexSchema>,
}

impl DeletionNode {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Never deleted directly: an owner's delete cascades onto it
    pub fn is_cascade_owned(&self) -> bool {
        !self.cascaded_by.is_empty()
    }

    pub fn cascade_dependencies(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.dependencies.iter().filter(|d| d.cascade).map(|d| d.node)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DeletionNode>,
    roots: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
}

impl DependencyGraph {
    /// Build the graph, rejecting unresolved parents and dependency cycles
    pub fn build(schemas: Vec<TableSchema>, indexes: Vec<IndexSchema>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(schemas.len());
        for (i, schema) in schemas.iter().enumerate() {
            if by_name.insert(schema.name.clone(), NodeId(i)).is_some() {
                return Err(ConfigError::invalid_value(
                    "schemas",
                    format!("table `{}` is declared more than once", schema.name),
                )
                .into());
            }
        }

        let mut nodes: Vec<DeletionNode> = schemas
            .into_iter()
            .enumerate()
            .map(|(i, schema)| DeletionNode {
                id: NodeId(i),
                schema,
                parent: None,
                children: Vec::new(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
                cascaded_by: Vec::new(),
                indexes: Vec::new(),
            })
            .collect();

        for index in indexes {
            match by_name.get(&index.table) {
                Some(id) => nodes[id.0].indexes.push(index),
                None => debug!(index = %index.name, table = %index.table, "skipping index of unselected table"),
            }
        }

        // Interleaving edges
        for i in 0..nodes.len() {
            let Some(parent_name) = nodes[i].schema.parent.clone() else {
                continue;
            };
            let parent = *by_name.get(&parent_name).ok_or_else(|| ConfigError::UnresolvedParent {
                table: nodes[i].schema.name.clone(),
                parent: parent_name.clone(),
            })?;
            let cascade = nodes[i].schema.on_delete.is_cascade();
            nodes[i].parent = Some(parent);
            nodes[parent.0].children.push(NodeId(i));
            add_dependency(&mut nodes[parent.0], NodeId(i), cascade, true);
        }

        // Reference edges, unioned with the interleaving ones
        for i in 0..nodes.len() {
            let references = nodes[i].schema.referenced_by.clone();
            for reference in references {
                match by_name.get(&reference.table) {
                    Some(&referencing) => add_dependency(
                        &mut nodes[i],
                        referencing,
                        reference.on_delete.is_cascade(),
                        false,
                    ),
                    None => warn!(
                        table = %nodes[i].schema.name,
                        referenced_by = %reference.table,
                        "referencing table is not selected; ignoring reference"
                    ),
                }
            }
        }

        for i in 0..nodes.len() {
            let dependencies = nodes[i].dependencies.clone();
            for dep in dependencies {
                nodes[dep.node.0].dependents.push(NodeId(i));
                if dep.cascade {
                    nodes[dep.node.0].cascaded_by.push(NodeId(i));
                }
            }
        }

        let roots = nodes
            .iter()
            .filter(|n| n.parent.is_none())
            .map(|n| n.id)
            .collect();

        let graph = Self {
            nodes,
            roots,
            by_name,
        };
        graph.detect_cycles()?;

        debug!(
            tables = graph.nodes.len(),
            roots = graph.roots.len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DeletionNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[DeletionNode] {
        &self.nodes
    }

    /// Tables without an interleaving parent, in catalog order
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn find(&self, table: &str) -> Option<NodeId> {
        self.by_name.get(table).copied()
    }

    /// Depth-first, parent-before-children order over the interleaving forest.
    ///
    /// Stable for a given catalog, which keeps progress output ordered.
    pub fn flatten_tables(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// Every node reachable from `id` through cascade-covered dependencies
    pub fn cascade_closure(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].cascade_dependencies().collect();
        while let Some(next) = stack.pop() {
            if std::mem::replace(&mut seen[next.0], true) {
                continue;
            }
            order.push(next);
            stack.extend(self.nodes[next.0].cascade_dependencies());
        }
        order
    }

    /// Directly deleted nodes whose delete eventually cascades onto `id`.
    ///
    /// Walks `cascaded_by` upwards through intermediate cascaded tables; empty
    /// for a node nothing cascades onto.
    pub fn cascade_launchers(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut launchers = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].cascaded_by.clone();
        while let Some(next) = stack.pop() {
            if std::mem::replace(&mut seen[next.0], true) {
                continue;
            }
            let node = &self.nodes[next.0];
            if node.is_cascade_owned() {
                stack.extend(node.cascaded_by.iter().copied());
            } else {
                launchers.push(next);
            }
        }
        launchers.sort();
        launchers
    }

    fn detect_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &DependencyGraph,
            id: NodeId,
            colors: &mut [Color],
            path: &mut Vec<NodeId>,
        ) -> Option<Vec<String>> {
            colors[id.0] = Color::Gray;
            path.push(id);
            for dep in &graph.nodes[id.0].dependencies {
                match colors[dep.node.0] {
                    Color::Gray => {
                        let start = path.iter().position(|n| *n == dep.node).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|n| graph.nodes[n.0].schema.name.clone())
                            .collect();
                        cycle.push(graph.nodes[dep.node.0].schema.name.clone());
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = visit(graph, dep.node, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
            path.pop();
            colors[id.0] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        for node in &self.nodes {
            if colors[node.id.0] == Color::White {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, node.id, &mut colors, &mut path) {
                    return Err(TruncateError::Cycle { path: cycle });
                }
            }
        }
        Ok(())
    }
}

fn add_dependency(node: &mut DeletionNode, dep: NodeId, cascade: bool, interleaved: bool) {
    if let Some(existing) = node.dependencies.iter_mut().find(|d| d.node == dep) {
        existing.cascade &= cascade;
        existing.interleaved |= interleaved;
        existing.referenced |= !interleaved;
        return;
    }
    node.dependencies.push(Dependency {
        node: dep,
        cascade,
        interleaved,
        referenced: !interleaved,
    });
}
