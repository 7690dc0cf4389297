//! The mind-map document: ordered nodes and edges plus op application.

use serde::{Deserialize, Serialize};

use crate::{DocumentError, EditOp, MindMapEdge, MindMapNode};

/// A mind-map document.
///
/// Nodes and edges keep insertion order so that two documents built from
/// the same op sequence compare equal. Applying an op is deterministic and
/// never fails: ops that reference missing ids are no-ops, which is what a
/// participant sees when an update races ahead of the matching add.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct MindMap {
    nodes: Vec<MindMapNode>,
    edges: Vec<MindMapEdge>,
}

impl MindMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(nodes: Vec<MindMapNode>, edges: Vec<MindMapEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Rebuild a document by applying `ops` to an empty one, in order.
    pub fn replay<'a>(ops: impl IntoIterator<Item = &'a EditOp>) -> Self {
        let mut doc = Self::new();
        for op in ops {
            doc.apply(op);
        }
        doc
    }

    pub fn nodes(&self) -> &[MindMapNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[MindMapEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&MindMapNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&MindMapEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn into_parts(self) -> (Vec<MindMapNode>, Vec<MindMapEdge>) {
        (self.nodes, self.edges)
    }

    /// Apply one edit. Returns `true` if the document changed.
    pub fn apply(&mut self, op: &EditOp) -> bool {
        match op {
            EditOp::NodeAdd { node } => {
                match self.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) => {
                        if existing == node {
                            return false;
                        }
                        *existing = node.clone();
                    }
                    None => self.nodes.push(node.clone()),
                }
                true
            }
            EditOp::NodeUpdate { patch } => match self.nodes.iter_mut().find(|n| n.id == patch.id) {
                Some(node) => {
                    let before = node.clone();
                    patch.apply_to(node);
                    *node != before
                }
                None => {
                    log::debug!("node_update for unknown node {}", patch.id);
                    false
                }
            },
            EditOp::NodeRemove { node_id } => {
                let nodes_before = self.nodes.len();
                let edges_before = self.edges.len();
                self.nodes.retain(|n| &n.id != node_id);
                self.edges.retain(|e| !e.touches(node_id));
                self.nodes.len() != nodes_before || self.edges.len() != edges_before
            }
            EditOp::EdgeAdd { edge } => {
                match self.edges.iter_mut().find(|e| e.id == edge.id) {
                    Some(existing) => {
                        if existing == edge {
                            return false;
                        }
                        *existing = edge.clone();
                    }
                    None => self.edges.push(edge.clone()),
                }
                true
            }
            EditOp::EdgeUpdate { patch } => match self.edges.iter_mut().find(|e| e.id == patch.id) {
                Some(edge) => {
                    let before = edge.clone();
                    patch.apply_to(edge);
                    *edge != before
                }
                None => {
                    log::debug!("edge_update for unknown edge {}", patch.id);
                    false
                }
            },
            EditOp::EdgeRemove { edge_id } => {
                let before = self.edges.len();
                self.edges.retain(|e| &e.id != edge_id);
                self.edges.len() != before
            }
            EditOp::BulkReplace { nodes, edges } => {
                if &self.nodes == nodes && &self.edges == edges {
                    return false;
                }
                self.nodes = nodes.clone();
                self.edges = edges.clone();
                true
            }
        }
    }

    /// Parse the `{ "nodes": [...], "edges": [...] }` shape emitted by the
    /// mind-map generator. Edges without an id get one derived from their
    /// endpoints.
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        #[derive(Deserialize)]
        struct RawEdge {
            #[serde(default)]
            id: Option<String>,
            source: String,
            target: String,
            #[serde(default)]
            relationship: Option<String>,
        }

        #[derive(Deserialize)]
        struct Raw {
            nodes: Vec<MindMapNode>,
            #[serde(default)]
            edges: Vec<RawEdge>,
        }

        let raw: Raw = serde_json::from_str(json)?;
        let mut doc = Self::new();
        for node in raw.nodes {
            if doc.node(&node.id).is_some() {
                return Err(DocumentError::DuplicateNode(node.id));
            }
            doc.nodes.push(node);
        }
        for edge in raw.edges {
            let id = edge
                .id
                .unwrap_or_else(|| format!("{}->{}", edge.source, edge.target));
            doc.edges.push(MindMapEdge {
                id,
                source: edge.source,
                target: edge.target,
                relationship: edge.relationship,
            });
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string(self)?)
    }
}
