//! View dependency graph.
//!
//! Edges point from a dependency to its dependent. The graph is validated
//! once at build time: every dependency must be declared, ids are unique,
//! and there are no cycles. Node indices equal declaration order.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use vista_core::ViewId;

use crate::error::GraphError;
use crate::view::View;

#[derive(Debug, Clone)]
pub struct ViewGraph {
    views: Vec<View>,
    graph: DiGraph<usize, ()>,
    index: HashMap<ViewId, usize>,
    /// Transitive dependent count per view.
    fan_out: Vec<usize>,
    topo_order: Vec<usize>,
}

impl ViewGraph {
    pub fn build(views: Vec<View>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(views.len(), 0);
        let mut index = HashMap::with_capacity(views.len());

        for (i, view) in views.iter().enumerate() {
            if !view.external && view.transformation().is_none() {
                return Err(GraphError::MissingTransformation(view.id.clone()));
            }
            if index.insert(view.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateView(view.id.clone()));
            }
            graph.add_node(i);
        }

        for (i, view) in views.iter().enumerate() {
            for dep in &view.dependencies {
                if dep == &view.id {
                    return Err(GraphError::Cycle(view.id.clone()));
                }
                let &d = index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    view: view.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(NodeIndex::new(d), NodeIndex::new(i), ());
            }
        }

        let topo_order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(views[cycle.node_id().index()].id.clone()))?
            .into_iter()
            .map(NodeIndex::index)
            .collect();

        let fan_out = (0..views.len())
            .map(|i| {
                let mut dfs = Dfs::new(&graph, NodeIndex::new(i));
                let mut reached = 0;
                while dfs.next(&graph).is_some() {
                    reached += 1;
                }
                reached - 1
            })
            .collect();

        Ok(Self {
            views,
            graph,
            index,
            fan_out,
            topo_order,
        })
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn view(&self, i: usize) -> &View {
        &self.views[i]
    }

    pub(crate) fn view_mut(&mut self, i: usize) -> &mut View {
        &mut self.views[i]
    }

    pub(crate) fn views_mut(&mut self) -> &mut [View] {
        &mut self.views
    }

    pub fn index_of(&self, id: &ViewId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &ViewId) -> Option<&View> {
        self.index_of(id).map(|i| &self.views[i])
    }

    /// Direct dependencies of view `i`.
    pub fn dependencies(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Incoming)
    }

    /// Direct dependents of view `i`.
    pub fn dependents(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Outgoing)
    }

    /// Number of views that transitively depend on view `i`.
    pub fn fan_out(&self, i: usize) -> usize {
        self.fan_out[i]
    }

    /// View `i` and everything downstream of it.
    pub fn subtree(&self, i: usize) -> Vec<usize> {
        let mut dfs = Dfs::new(&self.graph, NodeIndex::new(i));
        let mut out = Vec::new();
        while let Some(n) = dfs.next(&self.graph) {
            out.push(n.index());
        }
        out.sort_unstable();
        out
    }

    /// Dependencies before dependents.
    pub fn topological_order(&self) -> &[usize] {
        &self.topo_order
    }

    fn neighbors(&self, i: usize, dir: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(i), dir)
            .map(NodeIndex::index)
            .collect();
        out.sort_unstable();
        out
    }
}
