//! Edit operations on a mind map.
//!
//! Every change to the shared document is one of a closed set of variants.
//! Update variants carry a patch: only the fields that are present are
//! written, so concurrent edits to different fields of the same node both
//! survive and edits to the same field resolve as "last write applied wins".

use serde::{Deserialize, Serialize};

use crate::{MindMapEdge, MindMapNode, Position};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditOp {
    NodeAdd { node: MindMapNode },
    NodeUpdate { patch: NodePatch },
    /// Also removes every edge touching the node.
    NodeRemove { node_id: String },
    EdgeAdd { edge: MindMapEdge },
    EdgeUpdate { patch: EdgePatch },
    EdgeRemove { edge_id: String },
    BulkReplace {
        nodes: Vec<MindMapNode>,
        edges: Vec<MindMapEdge>,
    },
}

impl EditOp {
    /// Stable name of the variant, matching its serialized tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EditOp::NodeAdd { .. } => "node_add",
            EditOp::NodeUpdate { .. } => "node_update",
            EditOp::NodeRemove { .. } => "node_remove",
            EditOp::EdgeAdd { .. } => "edge_add",
            EditOp::EdgeUpdate { .. } => "edge_update",
            EditOp::EdgeRemove { .. } => "edge_remove",
            EditOp::BulkReplace { .. } => "bulk_replace",
        }
    }

    /// Id of the node or edge this op targets. `None` for bulk replace.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            EditOp::NodeAdd { node } => Some(&node.id),
            EditOp::NodeUpdate { patch } => Some(&patch.id),
            EditOp::NodeRemove { node_id } => Some(node_id),
            EditOp::EdgeAdd { edge } => Some(&edge.id),
            EditOp::EdgeUpdate { patch } => Some(&patch.id),
            EditOp::EdgeRemove { edge_id } => Some(edge_id),
            EditOp::BulkReplace { .. } => None,
        }
    }
}

/// Partial node update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn moved_to(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.level.is_none()
            && self.parent_id.is_none()
            && self.description.is_none()
            && self.position.is_none()
    }

    pub(crate) fn apply_to(&self, node: &mut MindMapNode) {
        if let Some(label) = &self.label {
            node.label = label.clone();
        }
        if let Some(level) = self.level {
            node.level = level;
        }
        if let Some(parent_id) = &self.parent_id {
            node.parent_id = Some(parent_id.clone());
        }
        if let Some(description) = &self.description {
            node.description = Some(description.clone());
        }
        if let Some(position) = self.position {
            node.position = position;
        }
    }
}

/// Partial edge update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgePatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

impl EdgePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn reconnect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.target = Some(target.into());
        self
    }

    pub(crate) fn apply_to(&self, edge: &mut MindMapEdge) {
        if let Some(source) = &self.source {
            edge.source = source.clone();
        }
        if let Some(target) = &self.target {
            edge.target = target.clone();
        }
        if let Some(relationship) = &self.relationship {
            edge.relationship = Some(relationship.clone());
        }
    }
}
