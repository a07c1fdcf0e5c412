//! Dialogue nodes, choices and the tree that holds them.

use crate::consequence::Consequence;
use crate::state::{Meter, StateSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifier of a dialogue node.
///
/// Ids are handed out by the builder from a single counter, so they are
/// unique and increase monotonically over a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Wrap a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{:06}", self.0)
    }
}

/// Weight class of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceType {
    /// Flavor choice with little mechanical weight.
    Micro,
    #[default]
    Normal,
    /// A choice the story hinges on.
    #[serde(alias = "key")]
    Critical,
}

/// Allowed range for one meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRange {
    pub meter: Meter,
    #[serde(default)]
    pub min: Option<i32>,
    #[serde(default)]
    pub max: Option<i32>,
}

/// Conditions a state must meet for a choice to be offered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    /// Flags that must hold the given values (unset counts as false).
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Items that must be held.
    #[serde(default)]
    pub items: Vec<String>,
    /// Meter ranges that must be satisfied.
    #[serde(default)]
    pub meters: Vec<MeterRange>,
}

impl Preconditions {
    /// Check the conditions against a state.
    pub fn is_satisfied(&self, state: &StateSnapshot) -> bool {
        let flags_ok = self
            .flags
            .iter()
            .all(|(name, expected)| state.flag(name) == *expected);
        let items_ok = self.items.iter().all(|item| state.has_item(item));
        let meters_ok = self.meters.iter().all(|range| {
            let value = state.meter(range.meter);
            range.min.map_or(true, |min| value >= min) && range.max.map_or(true, |max| value <= max)
        });
        flags_ok && items_ok && meters_ok
    }

    /// True when nothing is required.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.items.is_empty() && self.meters.is_empty()
    }
}

/// A player choice leading out of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// Identifier, unique among the choices of one node.
    pub id: String,

    /// Text shown to the player.
    pub text: String,

    #[serde(default)]
    pub choice_type: ChoiceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,

    /// Effects applied when the choice is taken.
    #[serde(default)]
    pub consequences: Vec<Consequence>,

    /// The node this choice leads to, once expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<NodeId>,
}

impl Choice {
    /// Create a normal choice with no consequences.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            choice_type: ChoiceType::Normal,
            preconditions: None,
            consequences: Vec::new(),
            next_node_id: None,
        }
    }

    /// Set the choice type.
    pub fn with_type(mut self, choice_type: ChoiceType) -> Self {
        self.choice_type = choice_type;
        self
    }

    /// Add a consequence.
    pub fn with_consequence(mut self, consequence: Consequence) -> Self {
        self.consequences.push(consequence);
        self
    }

    /// Set the preconditions.
    pub fn with_preconditions(mut self, preconditions: Preconditions) -> Self {
        self.preconditions = Some(preconditions);
        self
    }

    /// Whether the choice can be offered in the given state.
    pub fn is_available(&self, state: &StateSnapshot) -> bool {
        self.preconditions
            .as_ref()
            .map_or(true, |p| p.is_satisfied(state))
    }

    /// Whether the choice clearly moves the story forward.
    pub fn is_advancing(&self) -> bool {
        self.choice_type == ChoiceType::Critical
            || self.consequences.iter().any(Consequence::is_advancing)
    }
}

/// How an ending node ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum EndingType {
    /// Reached through an ending flag; carries the flag suffix.
    Flagged(String),
    /// Personal resonance hit its ceiling.
    Failure,
}

impl fmt::Display for EndingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndingType::Flagged(name) => write!(f, "ending '{name}'"),
            EndingType::Failure => write!(f, "failure"),
        }
    }
}

/// One node of the dialogue tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueNode {
    pub id: NodeId,
    pub scene: String,
    pub depth: usize,
    pub state: StateSnapshot,
    pub state_hash: String,
    pub narrative: String,
    pub choices: Vec<Choice>,
    pub parent_id: Option<NodeId>,
    pub parent_choice_id: Option<String>,
    pub children: Vec<NodeId>,
    pub is_ending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_type: Option<EndingType>,
    pub created_at: DateTime<Utc>,
}

impl DialogueNode {
    /// A node with no children yet.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Look up one of this node's choices by id.
    pub fn find_choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.id == choice_id)
    }
}

/// Errors from tree mutation.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Tree already has a root ({0})")]
    RootExists(NodeId),

    #[error("Node {0} already exists")]
    DuplicateId(NodeId),

    #[error("Node {0} has no parent")]
    MissingParent(NodeId),

    #[error("Unknown parent node: {0}")]
    UnknownParent(NodeId),

    #[error("Node {0} is an ending and cannot receive children")]
    EndingParent(NodeId),
}

/// The dialogue tree: nodes keyed by id plus the root id.
///
/// Structural links (`parent_id`/`children`) only ever form a tree.
/// Deduplicated transitions are recorded on [`Choice::next_node_id`] and
/// may point anywhere, including back up the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogueTree {
    root: Option<NodeId>,
    nodes: BTreeMap<NodeId, DialogueNode>,
}

impl DialogueTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// The root id, once inserted.
    pub fn root_id(&self) -> Option<NodeId> {
        self.root
    }

    /// The root node, once inserted.
    pub fn root(&self) -> Option<&DialogueNode> {
        self.root.and_then(|id| self.nodes.get(&id))
    }

    /// Insert the root node.
    pub fn insert_root(&mut self, node: DialogueNode) -> Result<NodeId, TreeError> {
        if let Some(root) = self.root {
            return Err(TreeError::RootExists(root));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::DuplicateId(node.id));
        }
        let id = node.id;
        self.root = Some(id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Insert a child node and append it to its parent's children.
    pub fn insert_child(&mut self, node: DialogueNode) -> Result<NodeId, TreeError> {
        let id = node.id;
        let parent_id = node.parent_id.ok_or(TreeError::MissingParent(id))?;
        if self.nodes.contains_key(&id) {
            return Err(TreeError::DuplicateId(id));
        }
        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or(TreeError::UnknownParent(parent_id))?;
        if parent.is_ending {
            return Err(TreeError::EndingParent(parent_id));
        }
        parent.children.push(id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Get a node.
    pub fn get(&self, id: NodeId) -> Option<&DialogueNode> {
        self.nodes.get(&id)
    }

    /// Get a mutable node.
    ///
    /// Structural fields should not be edited through this; use
    /// [`insert_child`](Self::insert_child) to grow the tree.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut DialogueNode> {
        self.nodes.get_mut(&id)
    }

    /// Check whether a node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &DialogueNode> {
        self.nodes.values()
    }

    /// Largest id present.
    pub fn max_id(&self) -> Option<NodeId> {
        self.nodes.keys().next_back().copied()
    }

    /// Number of ending nodes.
    pub fn ending_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_ending).count()
    }

    /// Depth of the deepest node.
    pub fn max_depth(&self) -> usize {
        self.nodes.values().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Nodes at a given depth.
    pub fn nodes_at_depth(&self, depth: usize) -> impl Iterator<Item = &DialogueNode> {
        self.nodes.values().filter(move |n| n.depth == depth)
    }

    /// Leaves eligible for another expansion round, deepest first.
    ///
    /// Eligible means: not an ending, no children, and below `max_depth`.
    pub fn eligible_leaves(&self, max_depth: usize) -> Vec<&DialogueNode> {
        let mut leaves: Vec<&DialogueNode> = self
            .nodes
            .values()
            .filter(|n| !n.is_ending && n.is_leaf() && n.depth < max_depth)
            .collect();
        leaves.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.id.cmp(&b.id)));
        leaves
    }
}
