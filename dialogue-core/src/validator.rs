//! Structural validation of a dialogue tree.
//!
//! Measures the longest root-to-leaf path, the play time it implies and the
//! number of endings, and checks each against its threshold separately so
//! partial compliance stays visible.

use crate::node::{DialogueTree, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Minimums a finished tree has to meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Choices along the longest path.
    pub min_depth: usize,
    pub min_duration_minutes: f64,
    pub min_endings: usize,
}

/// Measured structure of a tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathMetrics {
    /// Choices along the longest path (`path_length - 1`).
    pub depth: usize,
    pub duration_minutes: f64,
    pub endings: usize,
}

impl PathMetrics {
    /// True when any measure is strictly better than `best`.
    pub fn improves_on(&self, best: &PathMetrics) -> bool {
        self.depth > best.depth
            || self.duration_minutes > best.duration_minutes
            || self.endings > best.endings
    }

    /// Field-wise maximum of two measurements.
    pub fn max_with(&self, other: &PathMetrics) -> PathMetrics {
        PathMetrics {
            depth: self.depth.max(other.depth),
            duration_minutes: self.duration_minutes.max(other.duration_minutes),
            endings: self.endings.max(other.endings),
        }
    }
}

/// A threshold the tree failed to meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Shortfall {
    Depth { actual: usize, required: usize },
    Duration { actual: f64, required: f64 },
    Endings { actual: usize, required: usize },
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::Depth { actual, required } => {
                write!(f, "main path depth {actual} < {required}")
            }
            Shortfall::Duration { actual, required } => {
                write!(f, "estimated duration {actual:.2} min < {required:.2} min")
            }
            Shortfall::Endings { actual, required } => {
                write!(f, "ending count {actual} < {required}")
            }
        }
    }
}

/// Result of validating a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Nodes on the longest path, root first.
    pub longest_path: Vec<NodeId>,
    pub metrics: PathMetrics,
    pub thresholds: Thresholds,
    pub depth_ok: bool,
    pub duration_ok: bool,
    pub endings_ok: bool,
}

impl ValidationReport {
    /// Number of nodes on the longest path.
    pub fn path_length(&self) -> usize {
        self.longest_path.len()
    }

    /// True when every check passed.
    pub fn passed(&self) -> bool {
        self.depth_ok && self.duration_ok && self.endings_ok
    }

    /// The checks that failed.
    pub fn shortfalls(&self) -> Vec<Shortfall> {
        let mut shortfalls = Vec::new();
        if !self.depth_ok {
            shortfalls.push(Shortfall::Depth {
                actual: self.metrics.depth,
                required: self.thresholds.min_depth,
            });
        }
        if !self.duration_ok {
            shortfalls.push(Shortfall::Duration {
                actual: self.metrics.duration_minutes,
                required: self.thresholds.min_duration_minutes,
            });
        }
        if !self.endings_ok {
            shortfalls.push(Shortfall::Endings {
                actual: self.metrics.endings,
                required: self.thresholds.min_endings,
            });
        }
        shortfalls
    }

    /// One-line summary of the failed checks.
    pub fn shortfall_summary(&self) -> String {
        self.shortfalls()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Checks a tree against structural thresholds.
#[derive(Debug, Clone)]
pub struct PathValidator {
    thresholds: Thresholds,
    seconds_per_choice: f64,
}

impl PathValidator {
    /// Create a validator.
    pub fn new(thresholds: Thresholds, seconds_per_choice: f64) -> Self {
        Self {
            thresholds,
            seconds_per_choice,
        }
    }

    /// The thresholds checked.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Estimated minutes to play a path of `path_length` nodes.
    pub fn estimate_duration(&self, path_length: usize) -> f64 {
        path_length.saturating_sub(1) as f64 * self.seconds_per_choice / 60.0
    }

    /// Longest root-to-leaf path over children links, root first.
    ///
    /// Nodes already visited are skipped, so a malformed tree with a cycle
    /// still terminates. Ties go to the first child in order.
    pub fn longest_path(&self, tree: &DialogueTree) -> Vec<NodeId> {
        let Some(root) = tree.root_id() else {
            return Vec::new();
        };

        let mut came_from: HashMap<NodeId, NodeId> = HashMap::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![(root, 1usize)];
        let mut best = (root, 1usize);

        while let Some((id, length)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if length > best.1 || (length == best.1 && id < best.0) {
                best = (id, length);
            }
            let Some(node) = tree.get(id) else {
                continue;
            };
            for child in node.children.iter().rev() {
                if !visited.contains(child) && tree.contains(*child) {
                    came_from.entry(*child).or_insert(id);
                    stack.push((*child, length + 1));
                }
            }
        }

        let mut path = vec![best.0];
        let mut current = best.0;
        while let Some(parent) = came_from.get(&current) {
            if path.contains(parent) {
                break;
            }
            path.push(*parent);
            current = *parent;
        }
        path.reverse();
        path
    }

    /// Measure a tree without checking thresholds.
    pub fn measure(&self, tree: &DialogueTree) -> (Vec<NodeId>, PathMetrics) {
        let path = self.longest_path(tree);
        let metrics = PathMetrics {
            depth: path.len().saturating_sub(1),
            duration_minutes: self.estimate_duration(path.len()),
            endings: tree.ending_count(),
        };
        (path, metrics)
    }

    /// Measure a tree and check every threshold.
    pub fn validate(&self, tree: &DialogueTree) -> ValidationReport {
        let (longest_path, metrics) = self.measure(tree);
        ValidationReport {
            depth_ok: metrics.depth >= self.thresholds.min_depth,
            duration_ok: metrics.duration_minutes >= self.thresholds.min_duration_minutes,
            endings_ok: metrics.endings >= self.thresholds.min_endings,
            longest_path,
            metrics,
            thresholds: self.thresholds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::node;

    fn thresholds(depth: usize, duration: f64, endings: usize) -> Thresholds {
        Thresholds {
            min_depth: depth,
            min_duration_minutes: duration,
            min_endings: endings,
        }
    }

    fn chain_with_ending() -> DialogueTree {
        // root -> A -> B(ending)
        let mut tree = DialogueTree::new();
        tree.insert_root(node(0, None, 0)).unwrap();
        tree.insert_child(node(1, Some(0), 1)).unwrap();
        let mut b = node(2, Some(1), 2);
        b.is_ending = true;
        tree.insert_child(b).unwrap();
        tree
    }

    #[test]
    fn test_duration_example() {
        let validator = PathValidator::new(thresholds(0, 0.0, 0), 15.0);
        let report = validator.validate(&chain_with_ending());

        assert_eq!(report.path_length(), 3);
        assert_eq!(report.metrics.duration_minutes, 0.5);
        assert_eq!(report.metrics.depth, 2);
        assert_eq!(report.metrics.endings, 1);
    }

    #[test]
    fn test_longest_path_picks_deepest_branch() {
        let mut tree = DialogueTree::new();
        tree.insert_root(node(0, None, 0)).unwrap();
        tree.insert_child(node(1, Some(0), 1)).unwrap();
        tree.insert_child(node(2, Some(0), 1)).unwrap();
        tree.insert_child(node(3, Some(2), 2)).unwrap();
        tree.insert_child(node(4, Some(3), 3)).unwrap();

        let validator = PathValidator::new(thresholds(0, 0.0, 0), 15.0);
        let path = validator.longest_path(&tree);
        assert_eq!(
            path,
            vec![NodeId::new(0), NodeId::new(2), NodeId::new(3), NodeId::new(4)]
        );
    }

    #[test]
    fn test_longest_path_survives_cycles() {
        let mut tree = chain_with_ending();
        // Corrupt the structure: B lists the root as a child.
        tree.get_mut(NodeId::new(2))
            .unwrap()
            .children
            .push(NodeId::new(0));

        let validator = PathValidator::new(thresholds(0, 0.0, 0), 15.0);
        assert_eq!(validator.longest_path(&tree).len(), 3);
    }

    #[test]
    fn test_checks_reported_separately() {
        let validator = PathValidator::new(thresholds(2, 5.0, 2), 15.0);
        let report = validator.validate(&chain_with_ending());

        assert!(report.depth_ok);
        assert!(!report.duration_ok);
        assert!(!report.endings_ok);
        assert!(!report.passed());

        let shortfalls = report.shortfalls();
        assert_eq!(shortfalls.len(), 2);
        assert!(matches!(shortfalls[0], Shortfall::Duration { .. }));
        assert!(report.shortfall_summary().contains("ending count 1 < 2"));
    }

    #[test]
    fn test_empty_tree() {
        let validator = PathValidator::new(thresholds(1, 0.0, 0), 15.0);
        let report = validator.validate(&DialogueTree::new());
        assert_eq!(report.path_length(), 0);
        assert_eq!(report.metrics.duration_minutes, 0.0);
        assert!(!report.depth_ok);
    }

    #[test]
    fn test_improves_on() {
        let best = PathMetrics {
            depth: 3,
            duration_minutes: 0.75,
            endings: 1,
        };
        assert!(!best.clone().improves_on(&best));
        let deeper = PathMetrics {
            depth: 4,
            ..best.clone()
        };
        assert!(deeper.improves_on(&best));
        assert_eq!(best.max_with(&deeper).depth, 4);
    }
}
