//! Expanding one node: plan on the orchestrator, generate in the worker
//! pool, merge back on the orchestrator.

use super::{BuildError, TreeBuilder};
use crate::generator::{
    fallback_choices, ContentGenerator, GenerationContext, GeneratorError, FALLBACK_NARRATIVE,
};
use crate::node::{Choice, DialogueNode, EndingType, NodeId};
use crate::persist::QueueEntry;
use crate::state::StateSnapshot;
use crate::state_manager::{PruneReason, StateFingerprint};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, info, warn};

/// A new state that needs a node.
#[derive(Debug, Clone)]
struct Candidate {
    choice: Choice,
    state: StateSnapshot,
    fingerprint: StateFingerprint,
    depth: usize,
    is_ending: bool,
    ending_type: Option<EndingType>,
    needs_choices: bool,
}

/// Where a choice of the expanded node leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkTarget {
    Existing(NodeId),
    /// Index into the plan's candidates.
    Candidate(usize),
}

#[derive(Debug, Default)]
struct ExpansionPlan {
    links: Vec<(String, LinkTarget)>,
    candidates: Vec<Candidate>,
    dedup_hits: usize,
}

/// Work handed to one worker task.
#[derive(Debug, Clone)]
pub(crate) struct GenerationJob {
    pub choice: Choice,
    pub state: StateSnapshot,
    pub context: GenerationContext,
    pub needs_choices: bool,
}

/// What a worker produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GeneratedContent {
    pub narrative: String,
    pub choices: Vec<Choice>,
    pub failures: usize,
}

impl GeneratedContent {
    fn fallback(needs_choices: bool) -> Self {
        Self {
            narrative: FALLBACK_NARRATIVE.to_string(),
            choices: if needs_choices {
                fallback_choices()
            } else {
                Vec::new()
            },
            failures: 1,
        }
    }
}

impl TreeBuilder {
    /// Expand one queued node.
    pub(super) async fn expand_node(&mut self, entry: QueueEntry) -> Result<(), BuildError> {
        let Some(node) = self.tree.get(entry.node_id) else {
            warn!(node = %entry.node_id, "Queued node is missing from the tree");
            return Ok(());
        };
        if node.is_ending {
            return Ok(());
        }
        // Failure and ending reasons only reach here for endings the
        // blueprint deferred; those keep growing.
        if let Some(PruneReason::MaxDepth) =
            self.state_manager
                .prune_reason(&node.state, node.depth, self.config.max_depth)
        {
            return Ok(());
        }

        if entry.refresh {
            self.refresh_choices(entry.node_id).await;
        }

        let plan = self.plan(entry.node_id);
        let contents = if plan.candidates.is_empty() {
            Vec::new()
        } else {
            let jobs = self.jobs_for(entry.node_id, &plan);
            run_jobs(
                Arc::clone(&self.generator),
                jobs,
                self.config.worker_pool_width,
                self.config.generation_timeout(),
            )
            .await
        };
        self.merge(entry.node_id, plan, contents)
    }

    /// Ask for fresh choices and append the ones with unseen ids.
    async fn refresh_choices(&mut self, node_id: NodeId) {
        let Some(node) = self.tree.get(node_id) else {
            return;
        };
        let state = node.state.clone();
        let context = self.context(Some(node_id), node.depth, Some(node.narrative.clone()));

        let (fresh, failures) = request_choices(
            self.generator.as_ref(),
            &state,
            &context,
            self.config.generation_timeout(),
        )
        .await;
        self.progress.stats.generator_failures += failures;

        let Some(node) = self.tree.get_mut(node_id) else {
            return;
        };
        let before = node.choices.len();
        for choice in fresh {
            if node.find_choice(&choice.id).is_none() {
                node.choices.push(choice);
            }
        }
        debug!(
            node = %node_id,
            added = node.choices.len() - before,
            "Refreshed choices"
        );
    }

    /// Resolve every open choice of a node against the caches and the batch.
    fn plan(&self, node_id: NodeId) -> ExpansionPlan {
        let mut plan = ExpansionPlan::default();
        let Some(node) = self.tree.get(node_id) else {
            return plan;
        };

        let capacity = self.config.max_nodes.saturating_sub(self.tree.len());
        let mut slots = self
            .branch_limit(node.depth)
            .saturating_sub(node.children.len())
            .min(capacity);
        let child_depth = node.depth + 1;

        let mut options: Vec<&Choice> = node
            .choices
            .iter()
            .filter(|c| c.next_node_id.is_none() && c.is_available(&node.state))
            .collect();
        if self.config.prefer_advancing {
            options.sort_by_key(|c| !c.is_advancing());
        }

        for choice in options {
            if slots == 0 {
                break;
            }
            let next = self.state_manager.next_state(&node.state, choice);
            let ending = self.state_manager.ending_kind(&next);
            let is_ending = ending.is_some() && self.ending_allowed(child_depth);
            let fingerprint = if ending.is_some() && !is_ending {
                self.state_manager.deferred_fingerprint(&next)
            } else {
                self.state_manager.fingerprint(&next)
            };

            if let Some((existing, exact)) = self.state_manager.lookup(&fingerprint) {
                debug!(
                    from = %node_id,
                    choice = %choice.id,
                    to = %existing,
                    exact,
                    "Linked to existing node"
                );
                plan.links.push((choice.id.clone(), LinkTarget::Existing(existing)));
                plan.dedup_hits += 1;
                continue;
            }
            if let Some(index) = plan.candidates.iter().position(|c| {
                c.fingerprint.hash == fingerprint.hash
                    || (c.fingerprint.scene == fingerprint.scene
                        && c.fingerprint.approx_key == fingerprint.approx_key)
            }) {
                debug!(from = %node_id, choice = %choice.id, "Linked to sibling in batch");
                plan.links.push((choice.id.clone(), LinkTarget::Candidate(index)));
                plan.dedup_hits += 1;
                continue;
            }

            slots -= 1;
            if ending.is_some() && !is_ending {
                debug!(depth = child_depth, choice = %choice.id, "Ending deferred by blueprint");
            }
            plan.links
                .push((choice.id.clone(), LinkTarget::Candidate(plan.candidates.len())));
            plan.candidates.push(Candidate {
                choice: choice.clone(),
                state: next,
                fingerprint,
                depth: child_depth,
                is_ending,
                ending_type: if is_ending { ending } else { None },
                needs_choices: !is_ending && child_depth < self.config.max_depth,
            });
        }

        plan
    }

    fn jobs_for(&self, parent_id: NodeId, plan: &ExpansionPlan) -> Vec<GenerationJob> {
        let preceding = self.tree.get(parent_id).map(|parent| parent.narrative.clone());
        plan.candidates
            .iter()
            .map(|candidate| GenerationJob {
                choice: candidate.choice.clone(),
                state: candidate.state.clone(),
                context: self.context(None, candidate.depth, preceding.clone()),
                needs_choices: candidate.needs_choices,
            })
            .collect()
    }

    /// Insert generated nodes in candidate order and link the parent's
    /// choices.
    fn merge(
        &mut self,
        parent_id: NodeId,
        plan: ExpansionPlan,
        contents: Vec<GeneratedContent>,
    ) -> Result<(), BuildError> {
        let mut created = Vec::with_capacity(plan.candidates.len());

        for (candidate, content) in plan.candidates.into_iter().zip(contents) {
            let id = self.allocator.allocate();
            self.progress.stats.generator_failures += content.failures;

            if candidate.is_ending {
                info!(
                    node = %id,
                    depth = candidate.depth,
                    ending = ?candidate.ending_type,
                    "Ending reached"
                );
            }
            let enqueue = !candidate.is_ending && candidate.depth < self.config.max_depth;

            let node = DialogueNode {
                id,
                scene: candidate.state.scene.clone(),
                depth: candidate.depth,
                state_hash: candidate.fingerprint.hash.clone(),
                state: candidate.state,
                narrative: content.narrative,
                choices: content.choices,
                parent_id: Some(parent_id),
                parent_choice_id: Some(candidate.choice.id),
                children: Vec::new(),
                is_ending: candidate.is_ending,
                ending_type: candidate.ending_type,
                created_at: Utc::now(),
            };
            if let Some(log) = self.progress_log.as_mut() {
                log.record(&node)?;
            }
            self.tree.insert_child(node)?;
            self.state_manager.register(&candidate.fingerprint, id);

            if enqueue {
                self.queue.push_back(QueueEntry {
                    node_id: id,
                    depth: candidate.depth,
                    refresh: false,
                });
            }
            created.push(id);
        }

        self.progress.stats.nodes_created += created.len();
        self.progress.nodes_since_checkpoint += created.len();
        self.progress.stats.dedup_hits += plan.dedup_hits;

        if let Some(parent) = self.tree.get_mut(parent_id) {
            for (choice_id, target) in plan.links {
                let target = match target {
                    LinkTarget::Existing(id) => Some(id),
                    LinkTarget::Candidate(index) => created.get(index).copied(),
                };
                if let Some(choice) = parent.choices.iter_mut().find(|c| c.id == choice_id) {
                    choice.next_node_id = target;
                }
            }
        }
        Ok(())
    }
}

/// Run generation jobs concurrently, at most `width` at a time.
///
/// Results come back in job order. A task that panics yields fallback
/// content.
pub(crate) async fn run_jobs(
    generator: Arc<dyn ContentGenerator>,
    jobs: Vec<GenerationJob>,
    width: usize,
    timeout: Duration,
) -> Vec<GeneratedContent> {
    let semaphore = Arc::new(Semaphore::new(width.max(1)));
    let needs: Vec<bool> = jobs.iter().map(|job| job.needs_choices).collect();

    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let generator = Arc::clone(&generator);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                job.run(generator.as_ref(), timeout).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(needs)
        .map(|(result, needs_choices)| match result {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "Generation task failed; using fallback content");
                GeneratedContent::fallback(needs_choices)
            }
        })
        .collect()
}

impl GenerationJob {
    async fn run(self, generator: &dyn ContentGenerator, timeout: Duration) -> GeneratedContent {
        let mut failures = 0;

        let narrative = match time::timeout(
            timeout,
            generator.narrative(&self.choice, &self.state, &self.context),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                warn!(choice = %self.choice.id, "Generator returned an empty narrative; using fallback");
                failures += 1;
                FALLBACK_NARRATIVE.to_string()
            }
            Ok(Err(e)) => {
                warn!(choice = %self.choice.id, error = %e, "Narrative generation failed; using fallback");
                failures += 1;
                FALLBACK_NARRATIVE.to_string()
            }
            Err(_) => {
                warn!(choice = %self.choice.id, ?timeout, "Narrative generation timed out; using fallback");
                failures += 1;
                FALLBACK_NARRATIVE.to_string()
            }
        };

        let choices = if self.needs_choices {
            let context = GenerationContext {
                preceding_narrative: Some(narrative.clone()),
                ..self.context
            };
            let (choices, choice_failures) =
                request_choices(generator, &self.state, &context, timeout).await;
            failures += choice_failures;
            choices
        } else {
            Vec::new()
        };

        GeneratedContent {
            narrative,
            choices,
            failures,
        }
    }
}

/// Ask for choices, falling back on failure, timeout or an empty reply.
///
/// Returns the choices and the number of failed calls (0 or 1). Repeated
/// ids keep their first occurrence.
pub(crate) async fn request_choices(
    generator: &dyn ContentGenerator,
    state: &StateSnapshot,
    context: &GenerationContext,
    timeout: Duration,
) -> (Vec<Choice>, usize) {
    let result = match time::timeout(timeout, generator.choices(&state.scene, state, context)).await {
        Ok(result) => result,
        Err(_) => Err(GeneratorError::Timeout(timeout)),
    };

    match result {
        Ok(choices) if !choices.is_empty() => {
            let mut seen = HashSet::new();
            let unique = choices
                .into_iter()
                .filter(|choice| seen.insert(choice.id.clone()))
                .collect();
            (unique, 0)
        }
        Ok(_) => {
            warn!(depth = context.depth, "Generator returned no choices; using fallback");
            (fallback_choices(), 1)
        }
        Err(e) => {
            warn!(depth = context.depth, error = %e, "Choice generation failed; using fallback");
            (fallback_choices(), 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingGenerator, MockGenerator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowGenerator;

    #[async_trait]
    impl ContentGenerator for SlowGenerator {
        async fn choices(
            &self,
            _scene: &str,
            _state: &StateSnapshot,
            _context: &GenerationContext,
        ) -> Result<Vec<Choice>, GeneratorError> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(vec![Choice::new("late", "Too late")])
        }

        async fn narrative(
            &self,
            _choice: &Choice,
            _state: &StateSnapshot,
            _context: &GenerationContext,
        ) -> Result<String, GeneratorError> {
            time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        }
    }

    /// Records how many generator calls overlap.
    #[derive(Default)]
    struct CountingGenerator {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingGenerator {
        async fn hold(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContentGenerator for CountingGenerator {
        async fn choices(
            &self,
            _scene: &str,
            _state: &StateSnapshot,
            _context: &GenerationContext,
        ) -> Result<Vec<Choice>, GeneratorError> {
            self.hold().await;
            Ok(vec![Choice::new("on", "Go on")])
        }

        async fn narrative(
            &self,
            choice: &Choice,
            _state: &StateSnapshot,
            _context: &GenerationContext,
        ) -> Result<String, GeneratorError> {
            self.hold().await;
            Ok(format!("Counted: {}", choice.id))
        }
    }

    fn job(id: &str, needs_choices: bool) -> GenerationJob {
        GenerationJob {
            choice: Choice::new(id, id),
            state: StateSnapshot::new("hall"),
            context: GenerationContext::default(),
            needs_choices,
        }
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let (choices, failures) = request_choices(
            &SlowGenerator,
            &StateSnapshot::new("hall"),
            &GenerationContext::default(),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(failures, 1);
        assert_eq!(choices, fallback_choices());
    }

    #[tokio::test]
    async fn test_run_jobs_keeps_order_and_counts_failures() {
        let generator: Arc<dyn ContentGenerator> = Arc::new(MockGenerator::branching(2, 10));
        let jobs = vec![job("a", true), job("b", false), job("c", true)];
        let results = run_jobs(generator, jobs, 2, Duration::from_secs(5)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].narrative, "You chose: a");
        assert_eq!(results[1].narrative, "You chose: b");
        assert!(results[1].choices.is_empty());
        assert_eq!(results[2].choices.len(), 2);
        assert!(results.iter().all(|r| r.failures == 0));

        let failing: Arc<dyn ContentGenerator> = Arc::new(FailingGenerator);
        let results = run_jobs(failing, vec![job("a", true)], 1, Duration::from_secs(5)).await;
        assert_eq!(results[0].narrative, FALLBACK_NARRATIVE);
        assert_eq!(results[0].choices, fallback_choices());
        assert_eq!(results[0].failures, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_jobs_respects_pool_width() {
        let counting = Arc::new(CountingGenerator::default());
        let generator: Arc<dyn ContentGenerator> = counting.clone();
        let jobs = (0..6).map(|i| job(&format!("j{i}"), i % 2 == 0)).collect();

        let results = run_jobs(generator, jobs, 2, Duration::from_secs(5)).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.failures == 0));
        assert_eq!(results[3].narrative, "Counted: j3");
        assert_eq!(counting.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(counting.peak.load(Ordering::SeqCst), 2);
    }
}
