// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! DAG (Directed Acyclic Graph) builder for pipeline dependencies
//!
//! Builds and validates dependency graphs for pipeline stages,
//! ensuring proper execution order and detecting cycles.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::errors::GantryError;
use crate::pipeline::PipelineDefinition;

/// Stage dependency DAG. Node weights are declaration indices.
#[derive(Debug, Clone)]
pub struct DagBuilder {
    graph: DiGraph<usize, ()>,
    id_to_index: HashMap<String, NodeIndex>,
    ids: Vec<String>,
}

impl DagBuilder {
    /// Build a DAG from a pipeline definition.
    ///
    /// Fails on unknown dependencies and on cycles of any length.
    pub fn build(pipeline: &PipelineDefinition) -> Result<Self, GantryError> {
        let mut graph = DiGraph::new();
        let mut id_to_index = HashMap::new();
        let mut ids = Vec::with_capacity(pipeline.stages.len());

        // Add all stages as nodes
        for (idx, stage) in pipeline.stages.iter().enumerate() {
            let node = graph.add_node(idx);
            id_to_index.insert(stage.id.clone(), node);
            ids.push(stage.id.clone());
        }

        // Add dependency edges
        for stage in &pipeline.stages {
            let stage_node = id_to_index[&stage.id];

            for dep in &stage.depends_on {
                let dep_node = id_to_index.get(dep).ok_or_else(|| {
                    GantryError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                if !graph.contains_edge(*dep_node, stage_node) {
                    graph.add_edge(*dep_node, stage_node, ());
                }
            }
        }

        let dag = Self {
            graph,
            id_to_index,
            ids,
        };
        dag.validate_acyclic()?;

        Ok(dag)
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> Result<(), GantryError> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(_) => Err(GantryError::CircularDependency {
                stages: self.find_cycle_members(),
            }),
        }
    }

    /// Stages of one cycle, in declaration order, closed with the first one
    fn find_cycle_members(&self) -> Vec<String> {
        let cyclic = tarjan_scc(&self.graph).into_iter().find(|scc| {
            scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
        });

        let Some(mut members) = cyclic.map(|scc| scc.into_iter().map(|n| self.graph[n]).collect::<Vec<_>>())
        else {
            return Vec::new();
        };

        members.sort_unstable();
        let mut names: Vec<String> = members.iter().map(|&i| self.ids[i].clone()).collect();
        names.push(names[0].clone());
        names
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no stages
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Topological order; among unconstrained stages declaration order wins
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(self.ids[idx].clone());
            let node = self.id_to_index[&self.ids[idx]];
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let next_idx = self.graph[next];
                in_degree[next_idx] -= 1;
                if in_degree[next_idx] == 0 {
                    ready.push(Reverse(next_idx));
                }
            }
        }

        order
    }

    /// Get dependencies for a stage (stages that must run before it)
    pub fn dependencies(&self, stage_id: &str) -> Option<Vec<String>> {
        self.neighbors(stage_id, Direction::Incoming)
    }

    /// Get dependents for a stage (stages that depend on it)
    pub fn dependents(&self, stage_id: &str) -> Option<Vec<String>> {
        self.neighbors(stage_id, Direction::Outgoing)
    }

    fn neighbors(&self, stage_id: &str, direction: Direction) -> Option<Vec<String>> {
        let node = self.id_to_index.get(stage_id)?;
        let mut indices: Vec<usize> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n])
            .collect();
        indices.sort_unstable();
        Some(indices.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    /// Every stage that transitively depends on `stage_id`, in declaration order
    pub fn descendants(&self, stage_id: &str) -> Vec<String> {
        let Some(&start) = self.id_to_index.get(stage_id) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.push(self.graph[node]);
            }
        }

        found.sort_unstable();
        found.into_iter().map(|i| self.ids[i].clone()).collect()
    }

    /// Every stage `stage_id` transitively depends on, in execution order,
    /// so a stage's nearer producers come after the ones further upstream
    pub fn ancestors(&self, stage_id: &str) -> Vec<String> {
        let Some(&start) = self.id_to_index.get(stage_id) else {
            return Vec::new();
        };

        let upstream = Reversed(&self.graph);
        let mut found = HashSet::new();
        let mut dfs = Dfs::new(upstream, start);
        while let Some(node) = dfs.next(upstream) {
            if node != start {
                found.insert(node);
            }
        }

        self.execution_order()
            .into_iter()
            .filter(|id| found.contains(&self.id_to_index[id]))
            .collect()
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let (Some(node_a), Some(node_b)) =
            (self.id_to_index.get(stage_a), self.id_to_index.get(stage_b))
        else {
            return false;
        };

        node_a != node_b
            && petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Edges as declaration indices
    fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.graph.edge_indices().filter_map(|edge| {
            let (from, to) = self.graph.edge_endpoints(edge)?;
            Some((self.graph[from], self.graph[to]))
        })
    }

    /// Generate Mermaid diagram of the DAG.
    ///
    /// Nodes are keyed by declaration index and labelled with the stage id,
    /// so ids such as `a-b` and `a_b` stay distinct.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for (idx, id) in self.ids.iter().enumerate() {
            out.push_str(&format!("    s{}[\"{}\"]\n", idx, id));
        }

        for (from, to) in self.edges() {
            out.push_str(&format!("    s{} --> s{}\n", from, to));
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edges() {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                self.ids[from], self.ids[to]
            ));
        }

        // Isolated nodes have no edge to declare them
        for id in &self.ids {
            let node = self.id_to_index[id];
            if self.graph.neighbors_undirected(node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", id));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution order
    pub fn to_text(&self, pipeline: &PipelineDefinition) -> String {
        let mut out = String::new();

        for (i, id) in self.execution_order().iter().enumerate() {
            let kind = pipeline
                .get_stage(id)
                .map(|s| s.command_name())
                .unwrap_or("?");
            let deps = self.dependencies(id).unwrap_or_default();

            out.push_str(&format!("{}. {} ({})", i + 1, id, kind));
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }
            out.push('\n');
        }

        out
    }
}
