//! Build results and errors.

use crate::blueprint::BlueprintError;
use crate::config::ConfigError;
use crate::node::{DialogueTree, TreeError};
use crate::persist::PersistError;
use crate::validator::{Shortfall, ValidationReport};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal build errors.
///
/// Generator trouble never shows up here; it is absorbed by fallback content
/// and counted in [`BuildStats::generator_failures`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Blueprint error: {0}")]
    Blueprint(#[from] BlueprintError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Checkpoint does not match: {0}")]
    CheckpointMismatch(String),
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Expansion passes (the first pass plus one per extension round).
    pub passes: u32,
    pub extension_rounds: u32,
    pub nodes_created: usize,
    /// Transitions that linked to an existing node instead of creating one.
    pub dedup_hits: usize,
    /// Generator calls that failed, timed out or returned nothing.
    pub generator_failures: usize,
    pub checkpoints_written: u64,
    /// The run stopped at `max_nodes`.
    pub ceiling_hit: bool,
    /// Extension stopped because passes stopped improving.
    pub plateau_stopped: bool,
}

/// How a build ended.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Every threshold was met.
    Success {
        tree: DialogueTree,
        report: ValidationReport,
        stats: BuildStats,
    },
    /// Guided build that fell short of some blueprint targets.
    PartialSuccess {
        tree: DialogueTree,
        report: ValidationReport,
        stats: BuildStats,
        shortfalls: Vec<Shortfall>,
    },
    /// Strict build that fell short.
    Failure {
        tree: DialogueTree,
        report: ValidationReport,
        stats: BuildStats,
        reason: String,
    },
}

impl BuildOutcome {
    /// The finished tree.
    pub fn tree(&self) -> &DialogueTree {
        match self {
            BuildOutcome::Success { tree, .. }
            | BuildOutcome::PartialSuccess { tree, .. }
            | BuildOutcome::Failure { tree, .. } => tree,
        }
    }

    /// Take the finished tree.
    pub fn into_tree(self) -> DialogueTree {
        match self {
            BuildOutcome::Success { tree, .. }
            | BuildOutcome::PartialSuccess { tree, .. }
            | BuildOutcome::Failure { tree, .. } => tree,
        }
    }

    /// The final validation report.
    pub fn report(&self) -> &ValidationReport {
        match self {
            BuildOutcome::Success { report, .. }
            | BuildOutcome::PartialSuccess { report, .. }
            | BuildOutcome::Failure { report, .. } => report,
        }
    }

    /// Run counters.
    pub fn stats(&self) -> &BuildStats {
        match self {
            BuildOutcome::Success { stats, .. }
            | BuildOutcome::PartialSuccess { stats, .. }
            | BuildOutcome::Failure { stats, .. } => stats,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success { .. })
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            BuildOutcome::Success { .. } => "success",
            BuildOutcome::PartialSuccess { .. } => "partial success",
            BuildOutcome::Failure { .. } => "failure",
        }
    }
}
