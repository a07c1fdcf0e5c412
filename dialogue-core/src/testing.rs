//! Testing utilities for dialogue tree builds.
//!
//! This module provides tools for integration testing and demos:
//! - `MockGenerator` for deterministic builds without a real generator
//! - `RepeatingGenerator` and `FailingGenerator` for degenerate generators
//! - Assertion helpers for the structural invariants of a tree

use crate::config::{BuilderConfig, StateConfig};
use crate::consequence::Consequence;
use crate::generator::{ContentGenerator, GenerationContext, GeneratorError};
use crate::node::{Choice, ChoiceType, DialogueTree, NodeId};
use crate::state::{StateSnapshot, RESONANCE_MAX};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

type Script = dyn Fn(&StateSnapshot, &GenerationContext) -> Vec<Choice> + Send + Sync;

/// A generator driven by a script closure.
///
/// Narratives are `"You chose: <choice text>"`. Call counters make it easy
/// to check how often the builder reached out.
pub struct MockGenerator {
    script: Box<Script>,
    fail_at_depth: Option<usize>,
    choice_calls: AtomicUsize,
    narrative_calls: AtomicUsize,
}

impl MockGenerator {
    /// Create a generator whose choices come from `script`.
    pub fn new(
        script: impl Fn(&StateSnapshot, &GenerationContext) -> Vec<Choice> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            fail_at_depth: None,
            choice_calls: AtomicUsize::new(0),
            narrative_calls: AtomicUsize::new(0),
        }
    }

    /// Offer `width` distinct choices everywhere.
    ///
    /// Each choice raises its own `key_` flag, so sibling states never
    /// merge. Choices leading to `ending_depth` or deeper also raise an
    /// `ending_c<i>` flag. Extension rounds produce new choice ids.
    pub fn branching(width: usize, ending_depth: usize) -> Self {
        Self::new(move |_state, ctx| {
            let child_depth = ctx.depth + 1;
            let round = ctx.extension_round;
            (0..width)
                .map(|i| {
                    let id = if round == 0 {
                        format!("c{i}")
                    } else {
                        format!("r{round}_c{i}")
                    };
                    let mut choice = Choice::new(id, format!("Option {} at depth {}", i + 1, ctx.depth))
                        .with_consequence(Consequence::flag(format!("key_d{child_depth}_c{i}_r{round}"), true))
                        .with_consequence(Consequence::AdjustClock { minutes: 1 });
                    if i == 0 {
                        choice = choice.with_type(ChoiceType::Critical);
                    }
                    if child_depth >= ending_depth {
                        choice = choice.with_consequence(Consequence::flag(format!("ending_c{i}"), true));
                    }
                    choice
                })
                .collect()
        })
    }

    /// Fail every choice request made for nodes at `depth`.
    pub fn failing_at_depth(mut self, depth: usize) -> Self {
        self.fail_at_depth = Some(depth);
        self
    }

    /// Number of `choices` calls so far.
    pub fn choice_calls(&self) -> usize {
        self.choice_calls.load(Ordering::SeqCst)
    }

    /// Number of `narrative` calls so far.
    pub fn narrative_calls(&self) -> usize {
        self.narrative_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn choices(
        &self,
        _scene: &str,
        state: &StateSnapshot,
        context: &GenerationContext,
    ) -> Result<Vec<Choice>, GeneratorError> {
        self.choice_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at_depth == Some(context.depth) {
            return Err(GeneratorError::Failed(format!(
                "scripted failure at depth {}",
                context.depth
            )));
        }
        Ok((self.script)(state, context))
    }

    async fn narrative(
        &self,
        choice: &Choice,
        _state: &StateSnapshot,
        _context: &GenerationContext,
    ) -> Result<String, GeneratorError> {
        self.narrative_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("You chose: {}", choice.text))
    }
}

/// Always offers the same two choices, neither of which changes anything.
pub struct RepeatingGenerator;

#[async_trait]
impl ContentGenerator for RepeatingGenerator {
    async fn choices(
        &self,
        _scene: &str,
        _state: &StateSnapshot,
        _context: &GenerationContext,
    ) -> Result<Vec<Choice>, GeneratorError> {
        Ok(vec![
            Choice::new("wait", "Wait and listen"),
            Choice::new("look", "Look around again"),
        ])
    }

    async fn narrative(
        &self,
        _choice: &Choice,
        _state: &StateSnapshot,
        _context: &GenerationContext,
    ) -> Result<String, GeneratorError> {
        Ok("Nothing changes.".to_string())
    }
}

/// Fails every call.
pub struct FailingGenerator;

#[async_trait]
impl ContentGenerator for FailingGenerator {
    async fn choices(
        &self,
        _scene: &str,
        _state: &StateSnapshot,
        _context: &GenerationContext,
    ) -> Result<Vec<Choice>, GeneratorError> {
        Err(GeneratorError::Failed("generator offline".to_string()))
    }

    async fn narrative(
        &self,
        _choice: &Choice,
        _state: &StateSnapshot,
        _context: &GenerationContext,
    ) -> Result<String, GeneratorError> {
        Err(GeneratorError::Failed("generator offline".to_string()))
    }
}

/// A small configuration suited to fast tests.
pub fn test_config() -> BuilderConfig {
    BuilderConfig::new()
        .with_max_depth(4)
        .with_thresholds(3, 0.5, 1)
        .with_max_branches(2)
        .with_workers(2)
        .with_max_nodes(100)
        .with_extension_limits(2, 2)
}

/// Structural summary of one node, without timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeShape {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub parent_choice_id: Option<String>,
    pub depth: usize,
    pub state_hash: String,
    pub is_ending: bool,
    pub children: Vec<NodeId>,
    pub links: Vec<(String, Option<NodeId>)>,
}

/// Summarize a tree for equality checks across runs.
pub fn tree_shape(tree: &DialogueTree) -> Vec<NodeShape> {
    tree.nodes()
        .map(|node| NodeShape {
            id: node.id,
            parent_id: node.parent_id,
            parent_choice_id: node.parent_choice_id.clone(),
            depth: node.depth,
            state_hash: node.state_hash.clone(),
            is_ending: node.is_ending,
            children: node.children.clone(),
            links: node
                .choices
                .iter()
                .map(|c| (c.id.clone(), c.next_node_id))
                .collect(),
        })
        .collect()
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the structural invariants every built tree must hold.
///
/// - exactly one root, without a parent
/// - every other node appears in exactly one parent's children, at depth
///   parent + 1
/// - ending nodes have no children
/// - meters and clock are within bounds
/// - every choice link points at an existing node
pub fn assert_tree_invariants(tree: &DialogueTree, config: &StateConfig) {
    let Some(root) = tree.root() else {
        panic!("Tree has no root");
    };
    assert!(root.parent_id.is_none(), "Root {} has a parent", root.id);
    assert_eq!(root.depth, 0, "Root depth should be 0");

    let mut appearances: HashMap<NodeId, usize> = HashMap::new();
    for node in tree.nodes() {
        for child in &node.children {
            *appearances.entry(*child).or_default() += 1;
        }
    }

    for node in tree.nodes() {
        if node.id != root.id {
            let parent_id = node
                .parent_id
                .unwrap_or_else(|| panic!("Node {} has no parent", node.id));
            let parent = tree
                .get(parent_id)
                .unwrap_or_else(|| panic!("Parent {} of {} is missing", parent_id, node.id));
            assert_eq!(
                appearances.get(&node.id).copied().unwrap_or(0),
                1,
                "Node {} should appear in exactly one children list",
                node.id
            );
            assert!(
                parent.children.contains(&node.id),
                "Parent {} does not list child {}",
                parent_id,
                node.id
            );
            assert_eq!(node.depth, parent.depth + 1, "Depth of {} is off", node.id);
        }

        if node.is_ending {
            assert!(node.children.is_empty(), "Ending {} has children", node.id);
        }

        let state = &node.state;
        assert!(
            (0..=RESONANCE_MAX).contains(&state.personal_resonance),
            "PR out of bounds at {}: {}",
            node.id,
            state.personal_resonance
        );
        assert!(
            (0..=RESONANCE_MAX).contains(&state.global_resonance),
            "GR out of bounds at {}: {}",
            node.id,
            state.global_resonance
        );
        assert!(
            (0..=config.fatigue_cap).contains(&state.world_fatigue),
            "WF out of bounds at {}: {}",
            node.id,
            state.world_fatigue
        );
        assert!(
            config.time_window.contains(state.clock),
            "Clock out of window at {}: {}",
            node.id,
            state.clock
        );

        for choice in &node.choices {
            if let Some(target) = choice.next_node_id {
                assert!(
                    tree.contains(target),
                    "Choice {} of {} links to missing node {}",
                    choice.id,
                    node.id,
                    target
                );
            }
        }
    }
}

/// Assert that no two nodes share a state hash.
pub fn assert_unique_states(tree: &DialogueTree) {
    let mut seen: HashMap<&str, NodeId> = HashMap::new();
    for node in tree.nodes() {
        if let Some(other) = seen.insert(node.state_hash.as_str(), node.id) {
            panic!(
                "Nodes {} and {} share state hash {}",
                other, node.id, node.state_hash
            );
        }
    }
}
