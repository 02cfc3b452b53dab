//! Company↔agent and company↔owner relationship graphs.

use std::collections::HashMap;

use bizreg_core::CompanyRecord;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use serde::Serialize;

mod layout;
mod render;

pub use layout::{spring_layout, LayoutConfig, Position};
pub use render::{render_svg, write_svg, PANEL_SIZE};

pub const CRATE_NAME: &str = "bizreg-graph";

/// Size multiplier per neighbor for agent and owner nodes.
pub const NODE_SIZE_SCALE: f64 = 100.0;
pub const COMPANY_NODE_SIZE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Agent,
    Owner,
}

impl Relationship {
    pub fn title(self) -> &'static str {
        match self {
            Relationship::Agent => "Company - Registered Agent",
            Relationship::Owner => "Company - Owner",
        }
    }

    fn party<'a>(self, record: &'a CompanyRecord) -> Option<&'a str> {
        match self {
            Relationship::Agent => record.agent.as_found(),
            Relationship::Owner => record.owner.as_found(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Company,
    Party,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphNode {
    pub kind: NodeKind,
    pub label: String,
}

/// Undirected bipartite graph between company names and one kind of party.
#[derive(Debug, Clone)]
pub struct RelationshipGraph {
    relationship: Relationship,
    graph: UnGraph<GraphNode, ()>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub companies: usize,
    pub parties: usize,
    pub edges: usize,
}

impl RelationshipGraph {
    /// Records whose party field is absent contribute nothing. Company and
    /// party nodes stay distinct even when the texts coincide.
    pub fn build(relationship: Relationship, records: &[CompanyRecord]) -> Self {
        let mut graph = UnGraph::<GraphNode, ()>::new_undirected();
        let mut nodes: HashMap<GraphNode, NodeIndex> = HashMap::new();

        let mut node_for = |graph: &mut UnGraph<GraphNode, ()>, kind: NodeKind, label: &str| {
            let node = GraphNode {
                kind,
                label: label.to_string(),
            };
            *nodes
                .entry(node.clone())
                .or_insert_with(|| graph.add_node(node))
        };

        for record in records {
            let Some(party) = relationship.party(record) else {
                continue;
            };
            let company = node_for(&mut graph, NodeKind::Company, &record.name);
            let party = node_for(&mut graph, NodeKind::Party, party);
            graph.update_edge(company, party, ());
        }

        Self {
            relationship,
            graph,
        }
    }

    pub fn relationship(&self) -> Relationship {
        self.relationship
    }

    pub fn graph(&self) -> &UnGraph<GraphNode, ()> {
        &self.graph
    }

    pub fn stats(&self) -> GraphStats {
        let parties = self
            .graph
            .node_weights()
            .filter(|n| n.kind == NodeKind::Party)
            .count();
        GraphStats {
            companies: self.graph.node_count() - parties,
            parties,
            edges: self.graph.edge_count(),
        }
    }

    /// `(company, party)` label pairs, one per edge.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.graph
            .edge_references()
            .filter_map(|edge| {
                let a = &self.graph[edge.source()];
                let b = &self.graph[edge.target()];
                match (a.kind, b.kind) {
                    (NodeKind::Company, NodeKind::Party) => Some((a.label.as_str(), b.label.as_str())),
                    (NodeKind::Party, NodeKind::Company) => Some((b.label.as_str(), a.label.as_str())),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn degree(&self, node: NodeIndex) -> usize {
        self.graph.neighbors(node).count()
    }

    /// Party nodes grow with the number of companies sharing them.
    pub fn node_size(&self, node: NodeIndex) -> f64 {
        match self.graph[node].kind {
            NodeKind::Company => COMPANY_NODE_SIZE,
            NodeKind::Party => self.degree(node) as f64 * NODE_SIZE_SCALE,
        }
    }

    pub fn party_sizes(&self) -> Vec<(&str, f64)> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph[idx].kind == NodeKind::Party)
            .map(|idx| (self.graph[idx].label.as_str(), self.node_size(idx)))
            .collect()
    }
}
