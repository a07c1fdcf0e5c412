//! Tree construction.
//!
//! [`TreeBuilder`] grows a [`DialogueTree`] from a root state:
//!
//! 1. Breadth-first expansion. Nodes are dequeued in FIFO order (optionally
//!    trimmed to a beam), their choices are applied, resulting states are
//!    deduplicated, and new states get narrative and choices from the
//!    [`ContentGenerator`] through a bounded worker pool.
//! 2. Validation of the longest path, estimated duration and ending count.
//! 3. Extension rounds. While thresholds are unmet, eligible leaves get fresh
//!    choices and are expanded again, until the thresholds pass, the attempt
//!    budget runs out or passes stop improving.
//!
//! Checkpoints are written between batches and carry the whole loop state,
//! so [`TreeBuilder::resume`] continues exactly where a run left off.

mod allocator;
mod expand;
mod outcome;

pub use allocator::NodeIdAllocator;
pub use outcome::{BuildError, BuildOutcome, BuildStats};

use crate::blueprint::{StructuralBlueprint, ValidatedBlueprint};
use crate::config::{BuilderConfig, ExpansionStrategy};
use crate::generator::{ContentGenerator, GenerationContext};
use crate::node::{ChoiceType, DialogueNode, DialogueTree, NodeId};
use crate::persist::{Checkpoint, ProgressLog, QueueEntry, RunPhase, RunProgress, CHECKPOINT_VERSION};
use crate::state::StateSnapshot;
use crate::state_manager::StateManager;
use crate::validator::{PathMetrics, PathValidator, Thresholds, ValidationReport};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grows a dialogue tree against structural thresholds.
pub struct TreeBuilder {
    config: BuilderConfig,
    generator: Arc<dyn ContentGenerator>,
    blueprint: Option<ValidatedBlueprint>,
    thresholds: Thresholds,
    state_manager: StateManager,
    tree: DialogueTree,
    queue: VecDeque<QueueEntry>,
    allocator: NodeIdAllocator,
    progress: RunProgress,
    run_id: Uuid,
    progress_log: Option<ProgressLog>,
}

impl TreeBuilder {
    /// Create a builder for a strict (non-guided) run.
    pub fn new(
        config: BuilderConfig,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let run_id = Uuid::new_v4();
        let progress_log = config
            .progress_log_path
            .as_ref()
            .map(|path| ProgressLog::new(path.clone(), run_id));

        Ok(Self {
            thresholds: config.thresholds(),
            state_manager: StateManager::new(config.state.clone()),
            config,
            generator,
            blueprint: None,
            tree: DialogueTree::new(),
            queue: VecDeque::new(),
            allocator: NodeIdAllocator::new(),
            progress: RunProgress::default(),
            run_id,
            progress_log,
        })
    }

    /// Guide the run with a blueprint.
    ///
    /// The blueprint is validated first; its (possibly adjusted) depth and
    /// ending targets replace the configured ones.
    pub fn with_blueprint(mut self, blueprint: StructuralBlueprint) -> Result<Self, BuildError> {
        let validated = blueprint.validate()?;
        self.thresholds = guided_thresholds(&self.config, &validated);
        self.blueprint = Some(validated);
        Ok(self)
    }

    /// Use a prepared state manager, e.g. one with pre-seeded caches.
    pub fn with_state_manager(mut self, state_manager: StateManager) -> Self {
        self.state_manager = state_manager;
        self
    }

    /// Rebuild a builder from a checkpoint.
    pub fn from_checkpoint(
        checkpoint: Checkpoint,
        config: BuilderConfig,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<Self, BuildError> {
        config.validate()?;

        if checkpoint.tree.is_empty() {
            return Err(BuildError::CheckpointMismatch(
                "checkpoint holds no nodes".to_string(),
            ));
        }
        if let Some(max_id) = checkpoint.tree.max_id() {
            if checkpoint.node_counter <= max_id.value() {
                return Err(BuildError::CheckpointMismatch(format!(
                    "node counter {} is not past the largest id {}",
                    checkpoint.node_counter, max_id
                )));
            }
        }
        if let Some(entry) = checkpoint
            .queue
            .iter()
            .find(|entry| !checkpoint.tree.contains(entry.node_id))
        {
            return Err(BuildError::CheckpointMismatch(format!(
                "queued node {} is not in the tree",
                entry.node_id
            )));
        }

        let blueprint = checkpoint
            .blueprint
            .map(StructuralBlueprint::validate)
            .transpose()?;
        if blueprint.is_none() && config.thresholds() != checkpoint.thresholds {
            warn!("Configured thresholds differ from the checkpoint; keeping the checkpoint's");
        }

        let progress_log = config
            .progress_log_path
            .as_ref()
            .map(|path| ProgressLog::new(path.clone(), checkpoint.run_id));

        info!(
            run_id = %checkpoint.run_id,
            nodes = checkpoint.tree.len(),
            queued = checkpoint.queue.len(),
            "Resuming from checkpoint"
        );

        Ok(Self {
            state_manager: StateManager::with_cache(config.state.clone(), checkpoint.cache),
            config,
            generator,
            blueprint,
            thresholds: checkpoint.thresholds,
            tree: checkpoint.tree,
            queue: checkpoint.queue.into(),
            allocator: NodeIdAllocator::starting_at(checkpoint.node_counter),
            progress: checkpoint.progress,
            run_id: checkpoint.run_id,
            progress_log,
        })
    }

    /// Load a checkpoint file and continue its run to the end.
    pub async fn resume(
        path: impl AsRef<Path>,
        config: BuilderConfig,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<BuildOutcome, BuildError> {
        let checkpoint = Checkpoint::load(path).await?;
        Self::from_checkpoint(checkpoint, config, generator)?
            .continue_run()
            .await
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The tree built so far.
    pub fn tree(&self) -> &DialogueTree {
        &self.tree
    }

    /// Thresholds in force (blueprint-adjusted in guided runs).
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn stats(&self) -> &BuildStats {
        &self.progress.stats
    }

    /// Whether a blueprint guides the run.
    pub fn is_guided(&self) -> bool {
        self.blueprint.is_some()
    }

    /// Capture the current run state.
    pub fn snapshot(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: self.run_id,
            saved_at: Utc::now(),
            tree: self.tree.clone(),
            queue: self.queue.iter().cloned().collect(),
            node_counter: self.allocator.peek(),
            cache: self.state_manager.cache().clone(),
            thresholds: self.thresholds.clone(),
            blueprint: self.blueprint.as_ref().map(|bp| bp.blueprint().clone()),
            progress: self.progress.clone(),
        }
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    /// Build a tree from a root state. `opening` is the root narrative.
    pub async fn run(
        mut self,
        root_state: StateSnapshot,
        opening: impl Into<String>,
    ) -> Result<BuildOutcome, BuildError> {
        self.seed_root(root_state, opening.into()).await?;
        self.continue_run().await
    }

    /// Drive the run loop from wherever the builder stands.
    pub async fn continue_run(mut self) -> Result<BuildOutcome, BuildError> {
        let validator = PathValidator::new(self.thresholds.clone(), self.config.seconds_per_choice);

        let report = loop {
            if self.progress.phase == RunPhase::Finished {
                break validator.validate(&self.tree);
            }

            self.expand_pass().await?;
            let report = validator.validate(&self.tree);
            info!(
                pass = self.progress.stats.passes,
                nodes = self.tree.len(),
                depth = report.metrics.depth,
                duration_minutes = report.metrics.duration_minutes,
                endings = report.metrics.endings,
                "Pass complete"
            );
            self.record_plateau(&report.metrics);

            if report.passed() {
                break report;
            }
            if self.progress.stats.ceiling_hit {
                warn!(max_nodes = self.config.max_nodes, "Node ceiling reached before thresholds were met");
                break report;
            }
            if self.progress.plateau_rounds >= self.config.plateau_limit {
                warn!(
                    rounds = self.progress.plateau_rounds,
                    "No improvement across passes; stopping extension"
                );
                self.progress.stats.plateau_stopped = true;
                break report;
            }
            if self.progress.extension_attempts >= self.config.max_extension_attempts {
                warn!(
                    attempts = self.progress.extension_attempts,
                    "Extension attempts exhausted"
                );
                break report;
            }
            if !self.seed_extension_round() {
                warn!("No eligible leaves left to extend");
                break report;
            }
        };

        self.finish(report).await
    }

    async fn seed_root(&mut self, mut state: StateSnapshot, opening: String) -> Result<(), BuildError> {
        self.state_manager.normalize(&mut state);
        let id = self.allocator.allocate();

        let ending = self.state_manager.ending_kind(&state);
        let is_ending = ending.is_some() && self.ending_allowed(0);
        let fingerprint = if ending.is_some() && !is_ending {
            self.state_manager.deferred_fingerprint(&state)
        } else {
            self.state_manager.fingerprint(&state)
        };
        let choices = if is_ending || self.config.max_depth == 0 {
            Vec::new()
        } else {
            let context = self.context(Some(id), 0, Some(opening.clone()));
            let (choices, failures) = expand::request_choices(
                self.generator.as_ref(),
                &state,
                &context,
                self.config.generation_timeout(),
            )
            .await;
            self.progress.stats.generator_failures += failures;
            choices
        };

        let root = DialogueNode {
            id,
            scene: state.scene.clone(),
            depth: 0,
            state_hash: fingerprint.hash.clone(),
            state,
            narrative: opening,
            choices,
            parent_id: None,
            parent_choice_id: None,
            children: Vec::new(),
            is_ending,
            ending_type: if is_ending { ending } else { None },
            created_at: Utc::now(),
        };
        if let Some(log) = self.progress_log.as_mut() {
            log.record(&root)?;
        }
        self.tree.insert_root(root)?;
        self.state_manager.register(&fingerprint, id);
        self.progress.stats.nodes_created += 1;
        self.progress.nodes_since_checkpoint += 1;

        if !is_ending && self.config.max_depth > 0 {
            self.queue.push_back(QueueEntry {
                node_id: id,
                depth: 0,
                refresh: false,
            });
        }
        info!(run_id = %self.run_id, root = %id, guided = self.is_guided(), "Build started");
        Ok(())
    }

    /// Work through the queue until it is empty or the node ceiling is hit.
    async fn expand_pass(&mut self) -> Result<(), BuildError> {
        debug!(
            round = self.progress.extension_round,
            queued = self.queue.len(),
            "Starting expansion pass"
        );

        while let Some(entry) = self.queue.pop_front() {
            if self.tree.len() >= self.config.max_nodes {
                self.queue.push_front(entry);
                if !self.progress.stats.ceiling_hit {
                    warn!(max_nodes = self.config.max_nodes, "Node ceiling reached; stopping expansion");
                }
                self.progress.stats.ceiling_hit = true;
                break;
            }

            self.note_dequeue();
            self.expand_node(entry).await?;

            if self.progress.nodes_since_checkpoint >= self.config.checkpoint_every {
                self.checkpoint().await?;
            }
        }

        self.progress.stats.passes += 1;
        Ok(())
    }

    fn record_plateau(&mut self, metrics: &PathMetrics) {
        self.progress.best = match self.progress.best.take() {
            None => {
                self.progress.plateau_rounds = 0;
                Some(metrics.clone())
            }
            Some(best) if metrics.improves_on(&best) => {
                self.progress.plateau_rounds = 0;
                Some(best.max_with(metrics))
            }
            Some(best) => {
                self.progress.plateau_rounds += 1;
                Some(best)
            }
        };
    }

    /// Queue every eligible leaf for another round, deepest first.
    fn seed_extension_round(&mut self) -> bool {
        let leaves: Vec<QueueEntry> = self
            .tree
            .eligible_leaves(self.config.max_depth)
            .iter()
            .map(|node| QueueEntry {
                node_id: node.id,
                depth: node.depth,
                refresh: true,
            })
            .collect();
        if leaves.is_empty() {
            return false;
        }

        self.progress.extension_attempts += 1;
        self.progress.extension_round += 1;
        self.progress.stats.extension_rounds += 1;
        info!(
            round = self.progress.extension_round,
            leaves = leaves.len(),
            "Extension round"
        );
        self.queue.extend(leaves);
        true
    }

    /// Count a dequeue and trim the queue when the beam is due.
    fn note_dequeue(&mut self) {
        let ExpansionStrategy::Beam { width, trim_every } = self.config.strategy else {
            return;
        };
        self.progress.dequeued_since_trim += 1;
        if self.progress.dequeued_since_trim < trim_every {
            return;
        }
        self.progress.dequeued_since_trim = 0;
        if self.queue.len() <= width {
            return;
        }

        let mut ranked: Vec<(usize, (usize, bool, bool))> = self
            .queue
            .iter()
            .enumerate()
            .map(|(index, entry)| (index, self.beam_score(entry)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let keep: HashSet<usize> = ranked.into_iter().take(width).map(|(index, _)| index).collect();

        let before = self.queue.len();
        let queue = std::mem::take(&mut self.queue);
        self.queue = queue
            .into_iter()
            .enumerate()
            .filter(|(index, _)| keep.contains(index))
            .map(|(_, entry)| entry)
            .collect();
        debug!(dropped = before - self.queue.len(), "Trimmed beam");
    }

    /// Depth, then a critical incoming choice, then an advancing one.
    fn beam_score(&self, entry: &QueueEntry) -> (usize, bool, bool) {
        let incoming = self.tree.get(entry.node_id).and_then(|node| {
            let parent = self.tree.get(node.parent_id?)?;
            parent.find_choice(node.parent_choice_id.as_deref()?)
        });
        (
            entry.depth,
            incoming.is_some_and(|c| c.choice_type == ChoiceType::Critical),
            incoming.is_some_and(|c| c.is_advancing()),
        )
    }

    /// Flush the progress log and, when configured, write a checkpoint.
    async fn checkpoint(&mut self) -> Result<(), BuildError> {
        if let Some(log) = self.progress_log.as_mut() {
            let written = log.flush().await?;
            debug!(events = written, "Flushed progress log");
        }
        self.progress.nodes_since_checkpoint = 0;

        let Some(path) = self.config.checkpoint_path.clone() else {
            return Ok(());
        };
        self.progress.checkpoint_seq += 1;
        self.progress.stats.checkpoints_written += 1;

        let checkpoint = self.snapshot();
        checkpoint.save(&path).await?;
        if self.config.checkpoint_history {
            checkpoint
                .save(Checkpoint::history_path(&path, self.progress.checkpoint_seq))
                .await?;
        }
        info!(
            seq = self.progress.checkpoint_seq,
            nodes = self.tree.len(),
            path = %path.display(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn finish(mut self, report: ValidationReport) -> Result<BuildOutcome, BuildError> {
        self.progress.phase = RunPhase::Finished;
        self.checkpoint().await?;

        let stats = self.progress.stats.clone();
        let tree = self.tree;
        let outcome = if report.passed() {
            BuildOutcome::Success { tree, report, stats }
        } else if self.blueprint.is_some() {
            let shortfalls = report.shortfalls();
            BuildOutcome::PartialSuccess {
                tree,
                report,
                stats,
                shortfalls,
            }
        } else {
            let reason = report.shortfall_summary();
            BuildOutcome::Failure {
                tree,
                report,
                stats,
                reason,
            }
        };

        info!(
            outcome = outcome.label(),
            nodes = outcome.tree().len(),
            endings = outcome.report().metrics.endings,
            "Build finished"
        );
        Ok(outcome)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Children allowed for a node at `depth`.
    fn branch_limit(&self, depth: usize) -> usize {
        self.blueprint
            .as_ref()
            .map_or(self.config.max_branches_per_node, |bp| bp.max_children_at(depth))
    }

    /// Whether a node at `depth` may be an ending.
    fn ending_allowed(&self, depth: usize) -> bool {
        self.blueprint
            .as_ref()
            .map_or(true, |bp| bp.ending_allowed_at(depth))
    }

    fn context(
        &self,
        node_id: Option<NodeId>,
        depth: usize,
        preceding_narrative: Option<String>,
    ) -> GenerationContext {
        GenerationContext {
            node_id,
            depth,
            max_choices: self.branch_limit(depth),
            preceding_narrative,
            beat: self.blueprint.as_ref().map(|bp| bp.beat_at(depth).clone()),
            extension_round: self.progress.extension_round,
            ending_allowed: self.ending_allowed(depth + 1),
        }
    }
}

fn guided_thresholds(config: &BuilderConfig, blueprint: &ValidatedBlueprint) -> Thresholds {
    Thresholds {
        min_depth: blueprint.config().min_main_path_depth,
        min_duration_minutes: config.min_duration_minutes,
        min_endings: blueprint.config().target_endings,
    }
}
