//! Integration tests for blueprint-guided builds.
//!
//! Run with: `cargo test -p dialogue-core --test guided`

use dialogue_core::testing::{assert_tree_invariants, test_config, MockGenerator};
use dialogue_core::validator::Shortfall;
use dialogue_core::{
    BuildError, BuildOutcome, BuilderConfig, Choice, Consequence, Meter, StateSnapshot,
    StructuralBlueprint, TreeBuilder,
};
use std::sync::{Arc, Mutex};

/// Four beats: a narrow opening, a wider middle, then two ending beats.
const BLUEPRINT: &str = r#"{
    "acts": [
        {
            "name": "Arrival",
            "beats": [
                {"id": "knock", "beat_type": "setup", "tension": 2,
                 "branches": [{"max_children": 1}]},
                {"id": "stairs", "beat_type": "escalation", "tension": 5,
                 "branches": [{"max_children": 2, "branch_type": "divergent"}]}
            ]
        },
        {
            "name": "Reckoning",
            "beats": [
                {"id": "attic", "beat_type": "climax", "tension": 9, "leads_to_ending": true},
                {"id": "dawn", "beat_type": "aftermath", "tension": 3, "leads_to_ending": true}
            ]
        }
    ],
    "config": {
        "min_main_path_depth": 3,
        "target_main_path_depth": 3,
        "target_endings": 1,
        "max_branches_per_node": 3
    }
}"#;

fn blueprint() -> StructuralBlueprint {
    StructuralBlueprint::from_json(BLUEPRINT).expect("Blueprint should parse")
}

fn guided_config() -> BuilderConfig {
    test_config().with_max_branches(3).with_thresholds(8, 0.5, 5)
}

// =============================================================================
// TEST 1: Branching follows the beats
// =============================================================================

#[tokio::test]
async fn test_children_capped_by_beat() {
    let config = guided_config();
    let state_config = config.state.clone();
    let bp = blueprint().validate().unwrap();

    let builder = TreeBuilder::new(config, Arc::new(MockGenerator::branching(3, 2)))
        .unwrap()
        .with_blueprint(blueprint())
        .unwrap();
    assert!(builder.is_guided());
    assert_eq!(builder.thresholds().min_depth, 3);
    assert_eq!(builder.thresholds().min_endings, 1);

    let outcome = builder.run(StateSnapshot::new("porch"), "Rain.").await.unwrap();
    let tree = outcome.tree();
    assert_tree_invariants(tree, &state_config);

    for node in tree.nodes() {
        assert!(
            node.children.len() <= bp.max_children_at(node.depth),
            "{} has {} children at depth {}",
            node.id,
            node.children.len(),
            node.depth
        );
    }
    assert_eq!(tree.nodes_at_depth(1).count(), 1);
    assert_eq!(tree.nodes_at_depth(2).count(), 1);
    assert_eq!(tree.nodes_at_depth(3).count(), 2);
    assert!(outcome.is_success(), "got {}", outcome.label());
}

// =============================================================================
// TEST 2: Endings only where a beat allows them
// =============================================================================

#[tokio::test]
async fn test_endings_deferred_until_ending_beat() {
    let bp = blueprint().validate().unwrap();
    let outcome = TreeBuilder::new(guided_config(), Arc::new(MockGenerator::branching(3, 2)))
        .unwrap()
        .with_blueprint(blueprint())
        .unwrap()
        .run(StateSnapshot::new("porch"), "Rain.")
        .await
        .unwrap();
    let tree = outcome.tree();

    for node in tree.nodes().filter(|n| n.is_ending) {
        assert!(bp.ending_allowed_at(node.depth), "ending {} at depth {}", node.id, node.depth);
    }

    // Depth 2 carries an ending flag but its beat cannot end the story, so
    // the node stays open and keeps growing.
    let deferred = tree.nodes_at_depth(2).next().unwrap();
    assert!(deferred.state.flag("ending_c0"));
    assert!(!deferred.is_ending);
    assert_eq!(deferred.ending_type, None);
    assert_eq!(deferred.children.len(), 2);
    assert!(tree.nodes_at_depth(3).all(|n| n.is_ending));
    assert_eq!(outcome.report().metrics.endings, 2);
}

#[tokio::test]
async fn test_no_endings_before_first_ending_beat() {
    let json = r#"{
        "acts": [{"name": "Only", "beats": [
            {"id": "doubt", "beat_type": "setup", "leads_to_ending": false},
            {"id": "verdict", "beat_type": "climax", "leads_to_ending": true}
        ]}],
        "config": {"min_main_path_depth": 2, "target_main_path_depth": 2, "target_endings": 1}
    }"#;
    let blueprint = StructuralBlueprint::from_json(json).unwrap();

    let outcome = TreeBuilder::new(guided_config(), Arc::new(MockGenerator::branching(2, 1)))
        .unwrap()
        .with_blueprint(blueprint)
        .unwrap()
        .run(StateSnapshot::new("porch"), "Rain.")
        .await
        .unwrap();
    let tree = outcome.tree();

    assert_eq!(tree.nodes_at_depth(1).filter(|n| n.is_ending).count(), 0);
    assert!(tree.nodes().filter(|n| n.depth >= 2).any(|n| n.is_ending));
    assert!(tree.nodes_at_depth(1).all(|n| !n.children.is_empty()));
    assert!(outcome.is_success(), "got {}", outcome.label());
}

#[tokio::test]
async fn test_deferred_ending_does_not_absorb_its_children() {
    let json = r#"{
        "acts": [{"name": "Only", "beats": [
            {"id": "doubt", "beat_type": "setup", "leads_to_ending": false},
            {"id": "verdict", "beat_type": "climax", "leads_to_ending": true}
        ]}],
        "config": {"min_main_path_depth": 2, "target_main_path_depth": 2, "target_endings": 1}
    }"#;
    let blueprint = StructuralBlueprint::from_json(json).unwrap();

    // Both depth-1 choices keep the ending flag and stay in the deferred
    // node's buckets.
    let generator = MockGenerator::new(|_state, ctx| {
        if ctx.depth == 0 {
            vec![Choice::new("flee", "Run for the door")
                .with_consequence(Consequence::flag("ending_flee", true))]
        } else {
            vec![
                Choice::new("wait", "Hold still")
                    .with_consequence(Consequence::AdjustClock { minutes: 2 }),
                Choice::new("flinch", "Flinch")
                    .with_consequence(Consequence::adjust(Meter::PersonalResonance, 1)),
            ]
        }
    });

    let outcome = TreeBuilder::new(guided_config(), Arc::new(generator))
        .unwrap()
        .with_blueprint(blueprint)
        .unwrap()
        .run(StateSnapshot::new("porch"), "Rain.")
        .await
        .unwrap();
    let tree = outcome.tree();
    assert_tree_invariants(tree, &guided_config().state);

    let held = tree.nodes_at_depth(1).next().unwrap();
    assert!(held.state.flag("ending_flee"));
    assert!(!held.is_ending);
    assert_eq!(held.choices.len(), 2);
    for choice in &held.choices {
        let target = choice.next_node_id.expect("choice should be linked");
        assert_ne!(target, held.id, "{} loops back to its own node", choice.id);
        let child = tree.get(target).unwrap();
        assert_eq!(child.depth, 2);
        assert!(child.is_ending);
    }

    assert_eq!(tree.len(), 3);
    assert_eq!(tree.ending_count(), 1);
    assert!(outcome.is_success(), "got {}", outcome.label());
}

// =============================================================================
// TEST 3: Generation context carries the beat
// =============================================================================

#[tokio::test]
async fn test_context_carries_beat_and_limits() {
    let seen: Arc<Mutex<Vec<(usize, String, usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let generator = MockGenerator::new(move |_state, ctx| {
        let beat = ctx.beat.as_ref().map(|b| b.id.clone()).unwrap_or_default();
        record
            .lock()
            .unwrap()
            .push((ctx.depth, beat, ctx.max_choices, ctx.ending_allowed));
        (0..3)
            .map(|i| {
                let mut choice = Choice::new(format!("c{i}"), "Go on")
                    .with_consequence(Consequence::flag(format!("key_d{}_c{i}", ctx.depth), true));
                if ctx.depth >= 1 {
                    choice = choice.with_consequence(Consequence::flag(format!("ending_c{i}"), true));
                }
                choice
            })
            .collect()
    });

    TreeBuilder::new(guided_config(), Arc::new(generator))
        .unwrap()
        .with_blueprint(blueprint())
        .unwrap()
        .run(StateSnapshot::new("porch"), "Rain.")
        .await
        .unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            (0, "knock".to_string(), 1, false),
            (1, "knock".to_string(), 1, false),
            (2, "stairs".to_string(), 2, true),
        ]
    );
}

// =============================================================================
// TEST 4: Unreachable targets give a partial success
// =============================================================================

#[tokio::test]
async fn test_partial_success_lists_shortfalls() {
    let config = guided_config().with_max_depth(2);

    let outcome = TreeBuilder::new(config, Arc::new(MockGenerator::branching(3, 2)))
        .unwrap()
        .with_blueprint(blueprint())
        .unwrap()
        .run(StateSnapshot::new("porch"), "Rain.")
        .await
        .unwrap();

    match &outcome {
        BuildOutcome::PartialSuccess { shortfalls, tree, .. } => {
            assert_eq!(
                shortfalls,
                &vec![
                    Shortfall::Depth {
                        actual: 2,
                        required: 3
                    },
                    Shortfall::Endings {
                        actual: 0,
                        required: 1
                    },
                ]
            );
            assert_eq!(tree.len(), 3);
            assert_eq!(tree.ending_count(), 0);
        }
        other => panic!("expected partial success, got {}", other.label()),
    }
}

// =============================================================================
// TEST 5: Blueprint validation
// =============================================================================

#[tokio::test]
async fn test_targets_shrink_to_fit_blueprint() {
    let mut bp = blueprint();
    bp.config.target_endings = 5;
    bp.config.min_main_path_depth = 9;

    let builder = TreeBuilder::new(guided_config(), Arc::new(MockGenerator::branching(2, 2)))
        .unwrap()
        .with_blueprint(bp)
        .unwrap();
    assert_eq!(builder.thresholds().min_endings, 2);
    assert_eq!(builder.thresholds().min_depth, 4);
}

#[tokio::test]
async fn test_blueprint_without_ending_beats_is_rejected() {
    let mut bp = blueprint();
    for act in &mut bp.acts {
        for beat in &mut act.beats {
            beat.leads_to_ending = false;
        }
    }

    let result = TreeBuilder::new(guided_config(), Arc::new(MockGenerator::branching(2, 2)))
        .unwrap()
        .with_blueprint(bp);
    assert!(matches!(result, Err(BuildError::Blueprint(_))));
}
