//! Procedural dialogue tree expansion.
//!
//! This crate provides:
//! - State snapshots with bounded meters, an in-fiction clock, inventory and flags
//! - Exact and approximate state deduplication
//! - A breadth-first tree builder with a bounded generator worker pool,
//!   extension rounds and plateau detection
//! - Blueprint-guided builds that shape branching and gate endings by depth
//! - Resumable checkpoints and a JSONL progress log
//!
//! Narrative text and candidate choices come from a [`ContentGenerator`]
//! supplied by the caller.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dialogue_core::{BuilderConfig, StateSnapshot, TreeBuilder};
//! use dialogue_core::testing::MockGenerator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BuilderConfig::new()
//!         .with_max_depth(6)
//!         .with_thresholds(4, 1.0, 2)
//!         .with_checkpoint("run/tree.json", 10);
//!
//!     let generator = Arc::new(MockGenerator::branching(2, 5));
//!     let outcome = TreeBuilder::new(config, generator)?
//!         .run(StateSnapshot::new("hallway"), "The lights go out.")
//!         .await?;
//!
//!     println!("{} nodes, {}", outcome.tree().len(), outcome.label());
//!     Ok(())
//! }
//! ```

pub mod blueprint;
pub mod builder;
pub mod config;
pub mod consequence;
pub mod generator;
pub mod node;
pub mod persist;
pub mod state;
pub mod state_manager;
pub mod testing;
pub mod validator;

// Primary public API
pub use blueprint::{StructuralBlueprint, ValidatedBlueprint};
pub use builder::{BuildError, BuildOutcome, BuildStats, TreeBuilder};
pub use config::{BuilderConfig, ExpansionStrategy, StateConfig};
pub use consequence::Consequence;
pub use generator::{ContentGenerator, GenerationContext, GeneratorError, RawChoice};
pub use node::{Choice, ChoiceType, DialogueNode, DialogueTree, EndingType, NodeId};
pub use persist::{Checkpoint, ProgressLog};
pub use state::{ClockTime, Meter, StateSnapshot};
pub use state_manager::StateManager;
pub use validator::{PathValidator, Thresholds, ValidationReport};
