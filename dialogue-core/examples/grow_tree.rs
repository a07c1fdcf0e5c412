//! Grow a dialogue tree with the scripted generator and print a summary.
//!
//! Settings come from `DIALOGUE_*` variables (a `.env` file works too).
//! Pass a blueprint JSON file as the first argument for a guided build.
//!
//! Run with: `cargo run -p dialogue-core --example grow_tree`

use dialogue_core::testing::MockGenerator;
use dialogue_core::{BuildOutcome, BuilderConfig, StateSnapshot, StructuralBlueprint, TreeBuilder};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = BuilderConfig::from_env()?;
    let generator = Arc::new(MockGenerator::branching(
        config.max_branches_per_node,
        config.min_main_path_depth.max(1),
    ));

    let mut builder = TreeBuilder::new(config, generator.clone())?;
    if let Some(path) = std::env::args().nth(1) {
        let blueprint = StructuralBlueprint::load(&path).await?;
        builder = builder.with_blueprint(blueprint)?;
    }

    let root = StateSnapshot::new("hallway");
    let outcome = builder
        .run(root, "The lights go out. Somewhere upstairs, a door closes.")
        .await?;

    let report = outcome.report();
    let stats = outcome.stats();
    println!("Outcome: {}", outcome.label());
    println!(
        "Tree: {} nodes, {} endings, longest path {} nodes (~{:.1} min)",
        outcome.tree().len(),
        report.metrics.endings,
        report.path_length(),
        report.metrics.duration_minutes
    );
    println!(
        "Passes: {} ({} extension rounds), dedup hits: {}, generator calls: {} choice / {} narrative",
        stats.passes,
        stats.extension_rounds,
        stats.dedup_hits,
        generator.choice_calls(),
        generator.narrative_calls()
    );

    match &outcome {
        BuildOutcome::Success { .. } => {}
        BuildOutcome::PartialSuccess { shortfalls, .. } => {
            for shortfall in shortfalls {
                println!("  short: {shortfall}");
            }
        }
        BuildOutcome::Failure { reason, .. } => println!("  reason: {reason}"),
    }

    println!();
    println!("Main path:");
    for id in &report.longest_path {
        if let Some(node) = outcome.tree().get(*id) {
            let marker = if node.is_ending { " [ending]" } else { "" };
            println!("  {} (depth {}){}: {}", node.id, node.depth, marker, node.narrative);
        }
    }

    Ok(())
}
