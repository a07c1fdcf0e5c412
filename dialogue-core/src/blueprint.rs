//! Structural blueprints for guided builds.
//!
//! A blueprint lays the story out as acts made of beats. Beats map onto tree
//! depths (the beat for depth `d` is beat `d - 1`, clamped to the last beat)
//! and constrain how wide the tree may branch and where endings may occur.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// Errors from blueprint loading and validation.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blueprint has no beats")]
    NoBeats,

    #[error("Blueprint has no beat that can lead to an ending")]
    NoEndingBeats,
}

/// Narrative function of a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatType {
    Setup,
    Escalation,
    Twist,
    Climax,
    Aftermath,
}

/// Shape of the branches leaving a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    /// Branches continue the main line.
    #[default]
    Main,
    /// Branches split into distinct routes.
    Divergent,
    /// Branches are expected to fold back together.
    Convergent,
    /// Optional detours.
    Optional,
}

/// Branching limits attached to a beat.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BranchSpec {
    #[serde(default)]
    pub max_children: Option<usize>,
    #[serde(default)]
    pub branch_type: BranchType,
}

/// One structural unit of the story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    pub id: String,
    pub beat_type: BeatType,
    #[serde(default)]
    pub tension: u8,
    #[serde(default)]
    pub critical_branch: bool,
    #[serde(default)]
    pub leads_to_ending: bool,
    #[serde(default)]
    pub branches: Vec<BranchSpec>,
}

/// An ordered group of beats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act {
    pub name: String,
    pub beats: Vec<Beat>,
}

/// Global structural targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueprintConfig {
    pub min_main_path_depth: usize,
    pub target_main_path_depth: usize,
    pub target_endings: usize,
    pub max_branches_per_node: usize,
}

impl Default for BlueprintConfig {
    fn default() -> Self {
        Self {
            min_main_path_depth: 4,
            target_main_path_depth: 6,
            target_endings: 2,
            max_branches_per_node: 3,
        }
    }
}

/// A full blueprint as authored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralBlueprint {
    pub acts: Vec<Act>,
    #[serde(default)]
    pub config: BlueprintConfig,
}

/// A threshold that validation had to shrink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlueprintAdjustment {
    pub field: &'static str,
    pub from: usize,
    pub to: usize,
}

impl fmt::Display for BlueprintAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} adjusted from {} to {}", self.field, self.from, self.to)
    }
}

impl StructuralBlueprint {
    /// Parse a blueprint from JSON.
    pub fn from_json(json: &str) -> Result<Self, BlueprintError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a blueprint from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BlueprintError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// All beats in story order.
    pub fn beats(&self) -> impl Iterator<Item = &Beat> {
        self.acts.iter().flat_map(|act| act.beats.iter())
    }

    /// Total number of beats.
    pub fn beat_count(&self) -> usize {
        self.beats().count()
    }

    /// Number of beats that may end the story.
    pub fn ending_beat_count(&self) -> usize {
        self.beats().filter(|b| b.leads_to_ending).count()
    }

    /// Check the blueprint and collapse inconsistent thresholds.
    ///
    /// Depth targets larger than the beat count and ending targets larger
    /// than the number of ending-capable beats are shrunk, not rejected. A
    /// blueprint without beats, or without any ending-capable beat, is
    /// unusable.
    pub fn validate(mut self) -> Result<ValidatedBlueprint, BlueprintError> {
        let beat_count = self.beat_count();
        if beat_count == 0 {
            return Err(BlueprintError::NoBeats);
        }
        let ending_beats = self.ending_beat_count();
        if ending_beats == 0 {
            return Err(BlueprintError::NoEndingBeats);
        }

        let mut adjustments = Vec::new();
        let mut shrink = |field: &'static str, value: &mut usize, limit: usize| {
            if *value > limit {
                adjustments.push(BlueprintAdjustment {
                    field,
                    from: *value,
                    to: limit,
                });
                *value = limit;
            }
        };

        let config = &mut self.config;
        shrink("min_main_path_depth", &mut config.min_main_path_depth, beat_count);
        shrink("target_main_path_depth", &mut config.target_main_path_depth, beat_count);
        shrink("target_endings", &mut config.target_endings, ending_beats);
        if config.target_main_path_depth < config.min_main_path_depth {
            adjustments.push(BlueprintAdjustment {
                field: "target_main_path_depth",
                from: config.target_main_path_depth,
                to: config.min_main_path_depth,
            });
            config.target_main_path_depth = config.min_main_path_depth;
        }
        if config.max_branches_per_node == 0 {
            adjustments.push(BlueprintAdjustment {
                field: "max_branches_per_node",
                from: 0,
                to: 1,
            });
            config.max_branches_per_node = 1;
        }

        for adjustment in &adjustments {
            warn!("Blueprint {}", adjustment);
        }

        let beats = self.beats().cloned().collect();
        Ok(ValidatedBlueprint {
            blueprint: self,
            beats,
            adjustments,
        })
    }
}

/// A blueprint that passed validation, with beats flattened for lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBlueprint {
    blueprint: StructuralBlueprint,
    beats: Vec<Beat>,
    adjustments: Vec<BlueprintAdjustment>,
}

impl ValidatedBlueprint {
    /// The (possibly adjusted) blueprint.
    pub fn blueprint(&self) -> &StructuralBlueprint {
        &self.blueprint
    }

    /// The (possibly adjusted) global targets.
    pub fn config(&self) -> &BlueprintConfig {
        &self.blueprint.config
    }

    /// Thresholds that validation had to shrink.
    pub fn adjustments(&self) -> &[BlueprintAdjustment] {
        &self.adjustments
    }

    /// The beat governing a tree depth.
    pub fn beat_at(&self, depth: usize) -> &Beat {
        let index = depth.saturating_sub(1).min(self.beats.len() - 1);
        &self.beats[index]
    }

    /// Maximum children of a node at `depth`.
    pub fn max_children_at(&self, depth: usize) -> usize {
        self.beat_at(depth)
            .branches
            .iter()
            .filter_map(|spec| spec.max_children)
            .max()
            .unwrap_or(self.blueprint.config.max_branches_per_node)
    }

    /// Whether a node at `depth` may end the story.
    pub fn ending_allowed_at(&self, depth: usize) -> bool {
        self.beat_at(depth).leads_to_ending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(id: &str, leads_to_ending: bool, max_children: Option<usize>) -> Beat {
        Beat {
            id: id.to_string(),
            beat_type: if leads_to_ending {
                BeatType::Climax
            } else {
                BeatType::Escalation
            },
            tension: 5,
            critical_branch: false,
            leads_to_ending,
            branches: max_children
                .map(|n| {
                    vec![BranchSpec {
                        max_children: Some(n),
                        branch_type: BranchType::Main,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    fn blueprint(beats: Vec<Beat>) -> StructuralBlueprint {
        StructuralBlueprint {
            acts: vec![Act {
                name: "Act I".to_string(),
                beats,
            }],
            config: BlueprintConfig::default(),
        }
    }

    #[test]
    fn test_beat_mapping_clamps() {
        let bp = blueprint(vec![
            beat("a", false, None),
            beat("b", false, None),
            beat("c", true, None),
        ])
        .validate()
        .unwrap();

        assert_eq!(bp.beat_at(0).id, "a");
        assert_eq!(bp.beat_at(1).id, "a");
        assert_eq!(bp.beat_at(2).id, "b");
        assert_eq!(bp.beat_at(3).id, "c");
        assert_eq!(bp.beat_at(40).id, "c");
    }

    #[test]
    fn test_max_children_falls_back_to_config() {
        let bp = blueprint(vec![beat("a", false, Some(1)), beat("b", true, None)])
            .validate()
            .unwrap();

        assert_eq!(bp.max_children_at(1), 1);
        assert_eq!(bp.max_children_at(2), 3);
    }

    #[test]
    fn test_ending_gating() {
        let bp = blueprint(vec![beat("a", false, None), beat("b", true, None)])
            .validate()
            .unwrap();
        assert!(!bp.ending_allowed_at(1));
        assert!(bp.ending_allowed_at(2));
        assert!(bp.ending_allowed_at(9));
    }

    #[test]
    fn test_validate_shrinks_thresholds() {
        let mut raw = blueprint(vec![beat("a", false, None), beat("b", true, None)]);
        raw.config.min_main_path_depth = 6;
        raw.config.target_main_path_depth = 8;
        raw.config.target_endings = 4;

        let bp = raw.validate().unwrap();
        assert_eq!(bp.config().min_main_path_depth, 2);
        assert_eq!(bp.config().target_main_path_depth, 2);
        assert_eq!(bp.config().target_endings, 1);
        assert_eq!(bp.adjustments().len(), 3);
    }

    #[test]
    fn test_validate_rejects_no_ending_beats() {
        let raw = blueprint(vec![beat("a", false, None), beat("b", false, None)]);
        assert!(matches!(raw.validate(), Err(BlueprintError::NoEndingBeats)));

        let empty = blueprint(Vec::new());
        assert!(matches!(empty.validate(), Err(BlueprintError::NoBeats)));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "acts": [{"name": "One", "beats": [
                {"id": "open", "beat_type": "setup", "branches": [{"max_children": 2}]},
                {"id": "end", "beat_type": "climax", "leads_to_ending": true}
            ]}],
            "config": {"min_main_path_depth": 2, "target_endings": 1}
        }"#;
        let bp = StructuralBlueprint::from_json(json).unwrap();
        assert_eq!(bp.beat_count(), 2);
        assert_eq!(bp.ending_beat_count(), 1);
        assert_eq!(bp.config.max_branches_per_node, 3);

        let bp = bp.validate().unwrap();
        assert_eq!(bp.max_children_at(1), 2);
        assert!(bp.adjustments().is_empty());
    }
}
