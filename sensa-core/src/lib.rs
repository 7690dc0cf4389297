//! # sensa-core: Mind-map document model for Sensa
//!
//! Nodes and edges follow the shape produced by the Sensa mind-map
//! generator: every node has an id, a label, a hierarchy level, an optional
//! parent and description, and a canvas position.
//!
//! Edits are expressed as [`EditOp`] values and applied to a [`MindMap`].
//! The collaboration layer (`sensa-collab`) ships these ops between
//! participants; the editor owns the rendered document and applies them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod document;
mod ops;

pub use document::MindMap;
pub use ops::{EdgePatch, EditOp, NodePatch};

/// Canvas position in editor (world) coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MindMapNode {
    pub id: String,
    pub label: String,
    /// Hierarchy depth, 0 for the root concept.
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub position: Position,
}

impl MindMapNode {
    /// Create a root-level node with a fresh id.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_id(format!("node-{}", Uuid::new_v4()), label)
    }

    pub fn with_id(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            level: 0,
            parent_id: None,
            description: None,
            position: Position::default(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    /// Attach this node below `parent`, one level deeper.
    pub fn child_of(mut self, parent: &MindMapNode) -> Self {
        self.parent_id = Some(parent.id.clone());
        self.level = parent.level + 1;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MindMapEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub relationship: Option<String>,
}

impl MindMapEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_id(format!("edge-{}", Uuid::new_v4()), source, target)
    }

    pub fn with_id(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            relationship: None,
        }
    }

    pub fn labelled(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    /// Whether this edge touches the given node.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid mind-map JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builders() {
        let root = MindMapNode::with_id("root", "Photosynthesis").at(10.0, 20.0);
        let child = MindMapNode::with_id("light", "Light reactions")
            .child_of(&root)
            .describe("Happen in the thylakoid");

        assert_eq!(root.level, 0);
        assert_eq!(root.position, Position::new(10.0, 20.0));
        assert_eq!(child.level, 1);
        assert_eq!(child.parent_id.as_deref(), Some("root"));
        assert_eq!(child.description.as_deref(), Some("Happen in the thylakoid"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = MindMapNode::new("A");
        let b = MindMapNode::new("A");
        assert_ne!(a.id, b.id);

        let e1 = MindMapEdge::new("a", "b");
        let e2 = MindMapEdge::new("a", "b");
        assert_ne!(e1.id, e2.id);
    }

    #[test]
    fn test_edge_touches() {
        let edge = MindMapEdge::with_id("e1", "a", "b").labelled("causes");
        assert!(edge.touches("a"));
        assert!(edge.touches("b"));
        assert!(!edge.touches("c"));
        assert_eq!(edge.relationship.as_deref(), Some("causes"));
    }

    #[test]
    fn test_node_deserializes_generator_shape() {
        let json = r#"{
            "id": "root",
            "label": "Cell Biology",
            "level": 0,
            "parent_id": null,
            "description": "Study of cells"
        }"#;
        let node: MindMapNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.id, "root");
        assert_eq!(node.position, Position::default());
        assert!(node.parent_id.is_none());
    }
}
