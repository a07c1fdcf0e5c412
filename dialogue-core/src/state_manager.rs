//! State hashing, deduplication and mutation.
//!
//! The [`StateManager`] owns the two dedup caches of a build:
//! - an exact cache keyed by the SHA-256 of a normalized projection of the
//!   state, and
//! - a per-scene approximate index keyed by a quantized projection, so that
//!   states that are merely close to each other collapse into one node.
//!
//! It is also the only place consequences are applied, which keeps every
//! meter within its bounds after every mutation.

use crate::config::StateConfig;
use crate::consequence::Consequence;
use crate::node::{Choice, EndingType, NodeId};
use crate::state::{Meter, StateSnapshot, RESONANCE_MAX};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Dedup caches, persisted in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateCache {
    /// Exact state hash -> node.
    by_hash: BTreeMap<String, NodeId>,
    /// Scene -> quantized key -> exact hash.
    approximate: BTreeMap<String, BTreeMap<String, String>>,
}

impl StateCache {
    /// Number of exact entries.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Look up a node by exact hash.
    pub fn node_for_hash(&self, hash: &str) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }
}

/// The coarse projection used for approximate matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuantizedState {
    pub personal_resonance: i32,
    pub global_resonance: i32,
    pub clock_bucket: u16,
    pub key_flags: BTreeMap<String, bool>,
    pub inventory: Vec<String>,
    /// Endings never merge with non-endings.
    pub ending: bool,
}

impl fmt::Display for QuantizedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<String> = self
            .key_flags
            .iter()
            .map(|(k, v)| format!("{k}={}", u8::from(*v)))
            .collect();
        write!(
            f,
            "pr={}|gr={}|t={}|f={}|i={}|e={}",
            self.personal_resonance,
            self.global_resonance,
            self.clock_bucket,
            flags.join(","),
            self.inventory.join(","),
            u8::from(self.ending)
        )
    }
}

/// Everything needed to look up or register a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFingerprint {
    pub scene: String,
    pub hash: String,
    pub approx_key: String,
}

/// Result of resolving a candidate state against the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The state (or one close enough) already has a node.
    Existing { node_id: NodeId, exact: bool },
    /// The state is new.
    New(StateFingerprint),
}

/// Why a node should not be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReason {
    MaxDepth,
    /// Personal resonance reached its ceiling.
    Failure,
    /// An ending flag is set.
    Ending,
}

/// Hashing, dedup and mutation for state snapshots.
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    config: StateConfig,
    cache: StateCache,
}

impl StateManager {
    /// Create a manager with empty caches.
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            cache: StateCache::default(),
        }
    }

    /// Create a manager around restored caches.
    pub fn with_cache(config: StateConfig, cache: StateCache) -> Self {
        Self { config, cache }
    }

    /// The state settings.
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// The dedup caches.
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    /// Deterministic digest of scene, PR, GR, clock, sorted flags and sorted
    /// inventory.
    pub fn hash(&self, state: &StateSnapshot) -> String {
        hex::encode(self.digest(state).finalize())
    }

    fn digest(&self, state: &StateSnapshot) -> Sha256 {
        let mut hasher = Sha256::new();
        feed(&mut hasher, &state.scene);
        feed(&mut hasher, &state.personal_resonance.to_string());
        feed(&mut hasher, &state.global_resonance.to_string());
        feed(&mut hasher, &state.clock.minutes().to_string());
        for (name, value) in &state.flags {
            feed(&mut hasher, name);
            feed(&mut hasher, if *value { "1" } else { "0" });
        }
        feed(&mut hasher, "#inventory");
        for item in state.sorted_inventory() {
            feed(&mut hasher, item);
        }
        hasher
    }

    /// Coarse projection: bucketed meters and clock, key flags only, the
    /// first few sorted inventory items, and whether the state is an ending.
    pub fn quantize(&self, state: &StateSnapshot) -> QuantizedState {
        let key_flags = state
            .flags
            .iter()
            .filter(|(name, _)| name.starts_with(&self.config.key_flag_prefix))
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        let inventory = state
            .sorted_inventory()
            .into_iter()
            .take(self.config.inventory_sample)
            .map(str::to_string)
            .collect();

        QuantizedState {
            personal_resonance: round_to_bucket(state.personal_resonance, self.config.meter_bucket),
            global_resonance: round_to_bucket(state.global_resonance, self.config.meter_bucket),
            clock_bucket: round_to_bucket(
                i32::from(state.clock.minutes()),
                i32::from(self.config.clock_bucket_minutes),
            )
            .clamp(0, i32::from(u16::MAX)) as u16,
            key_flags,
            inventory,
            ending: self.ending_kind(state).is_some(),
        }
    }

    /// Hash plus approximate key for a state.
    pub fn fingerprint(&self, state: &StateSnapshot) -> StateFingerprint {
        StateFingerprint {
            scene: state.scene.clone(),
            hash: self.hash(state),
            approx_key: self.quantize(state).to_string(),
        }
    }

    /// Fingerprint for an ending state a blueprint kept open.
    ///
    /// Deferred nodes only match other deferred states, so an ending reached
    /// further down never folds back into the open node above it.
    pub fn deferred_fingerprint(&self, state: &StateSnapshot) -> StateFingerprint {
        let mut hasher = self.digest(state);
        feed(&mut hasher, "#deferred");
        StateFingerprint {
            scene: state.scene.clone(),
            hash: hex::encode(hasher.finalize()),
            approx_key: format!("{}|deferred", self.quantize(state)),
        }
    }

    // =========================================================================
    // Deduplication
    // =========================================================================

    /// Resolve a state: exact hit, then approximate hit in the same scene,
    /// otherwise new.
    pub fn resolve(&self, state: &StateSnapshot) -> Resolution {
        let fingerprint = self.fingerprint(state);
        match self.lookup(&fingerprint) {
            Some((node_id, exact)) => Resolution::Existing { node_id, exact },
            None => Resolution::New(fingerprint),
        }
    }

    /// Look up a fingerprint; the flag is true for exact matches.
    pub fn lookup(&self, fingerprint: &StateFingerprint) -> Option<(NodeId, bool)> {
        if let Some(id) = self.cache.by_hash.get(&fingerprint.hash) {
            return Some((*id, true));
        }
        self.cache
            .approximate
            .get(&fingerprint.scene)
            .and_then(|index| index.get(&fingerprint.approx_key))
            .and_then(|hash| self.cache.by_hash.get(hash))
            .map(|id| (*id, false))
    }

    /// Record the node created for a fingerprint.
    ///
    /// The first node registered for an approximate key keeps it.
    pub fn register(&mut self, fingerprint: &StateFingerprint, node_id: NodeId) {
        self.cache
            .by_hash
            .entry(fingerprint.hash.clone())
            .or_insert(node_id);
        self.cache
            .approximate
            .entry(fingerprint.scene.clone())
            .or_default()
            .entry(fingerprint.approx_key.clone())
            .or_insert_with(|| fingerprint.hash.clone());
    }

    // =========================================================================
    // Pruning and endings
    // =========================================================================

    /// Whether a node at `depth` should not be expanded.
    pub fn should_prune(&self, state: &StateSnapshot, depth: usize, max_depth: usize) -> bool {
        self.prune_reason(state, depth, max_depth).is_some()
    }

    /// The first reason that applies, if any.
    pub fn prune_reason(
        &self,
        state: &StateSnapshot,
        depth: usize,
        max_depth: usize,
    ) -> Option<PruneReason> {
        if depth >= max_depth {
            Some(PruneReason::MaxDepth)
        } else if state.personal_resonance >= RESONANCE_MAX {
            Some(PruneReason::Failure)
        } else if self.ending_flag(state).is_some() {
            Some(PruneReason::Ending)
        } else {
            None
        }
    }

    /// What kind of ending a state represents, if any.
    pub fn ending_kind(&self, state: &StateSnapshot) -> Option<EndingType> {
        if let Some(name) = self.ending_flag(state) {
            return Some(EndingType::Flagged(name));
        }
        (state.personal_resonance >= RESONANCE_MAX).then_some(EndingType::Failure)
    }

    fn ending_flag(&self, state: &StateSnapshot) -> Option<String> {
        state
            .flags
            .iter()
            .filter(|(_, value)| **value)
            .find_map(|(name, _)| {
                self.config
                    .ending_flag_prefixes
                    .iter()
                    .find_map(|prefix| name.strip_prefix(prefix.as_str()))
                    .map(str::to_string)
            })
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Bounds of a meter.
    pub fn meter_bounds(&self, meter: Meter) -> (i32, i32) {
        match meter {
            Meter::PersonalResonance | Meter::GlobalResonance => (0, RESONANCE_MAX),
            Meter::WorldFatigue => (0, self.config.fatigue_cap.max(0)),
        }
    }

    /// Clamp every bounded field of a state.
    pub fn normalize(&self, state: &mut StateSnapshot) {
        for meter in Meter::ALL {
            let (low, high) = self.meter_bounds(meter);
            let value = state.meter_mut(meter);
            *value = (*value).clamp(low, high);
        }
        state.clock = self
            .config
            .time_window
            .clamp(i32::from(state.clock.minutes()));
    }

    /// Apply one consequence in place.
    pub fn apply_consequence(&self, state: &mut StateSnapshot, delta: &Consequence) {
        match delta {
            Consequence::AdjustMeter { meter, delta } => {
                let (low, high) = self.meter_bounds(*meter);
                let value = state.meter_mut(*meter);
                *value = value.saturating_add(*delta).clamp(low, high);
            }
            Consequence::SetMeter { meter, value } => {
                let (low, high) = self.meter_bounds(*meter);
                *state.meter_mut(*meter) = (*value).clamp(low, high);
            }
            Consequence::AddItems { items } => {
                for item in items {
                    if !state.inventory.contains(item) {
                        state.inventory.insert(item.clone());
                    }
                }
            }
            Consequence::SetFlags { flags } => {
                state
                    .flags
                    .extend(flags.iter().map(|(k, v)| (k.clone(), *v)));
            }
            Consequence::AdjustClock { minutes } => {
                let current = i32::from(state.clock.minutes());
                state.clock = self
                    .config
                    .time_window
                    .clamp(current.saturating_add(*minutes));
            }
            Consequence::SetClock { time } => {
                state.clock = self.config.time_window.clamp(i32::from(time.minutes()));
            }
            Consequence::EnterScene { scene } => {
                state.scene = scene.clone();
            }
        }
    }

    /// The state reached by taking `choice` from `state`.
    pub fn next_state(&self, state: &StateSnapshot, choice: &Choice) -> StateSnapshot {
        let mut next = state.clone();
        for consequence in &choice.consequences {
            self.apply_consequence(&mut next, consequence);
        }
        next.history.push(choice.id.clone());
        next
    }
}

/// Length-prefixed write so that field boundaries cannot collide.
fn feed(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

fn round_to_bucket(value: i32, bucket: i32) -> i32 {
    if bucket <= 1 {
        return value;
    }
    (value + bucket / 2).div_euclid(bucket) * bucket
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClockTime;

    fn manager() -> StateManager {
        StateManager::new(StateConfig::default())
    }

    #[test]
    fn test_hash_ignores_history_and_fatigue() {
        let sm = manager();
        let a = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 10);
        let mut b = a.clone();
        b.history.push("c1".to_string());
        b.world_fatigue = 2;
        assert_eq!(sm.hash(&a), sm.hash(&b));

        let c = a.clone().with_flag("seen", true);
        assert_ne!(sm.hash(&a), sm.hash(&c));
    }

    #[test]
    fn test_hash_inventory_order_insensitive() {
        let sm = manager();
        let a = StateSnapshot::new("hall").with_item("b").with_item("a");
        let b = StateSnapshot::new("hall").with_item("a").with_item("b");
        assert_eq!(sm.hash(&a), sm.hash(&b));
    }

    #[test]
    fn test_quantize_buckets() {
        let sm = manager();
        let state = StateSnapshot::new("hall")
            .with_meter(Meter::PersonalResonance, 12)
            .with_meter(Meter::GlobalResonance, 13)
            .with_clock(ClockTime::from_minutes(44))
            .with_flag("key_door", true)
            .with_flag("noise", true)
            .with_item("d")
            .with_item("c")
            .with_item("b")
            .with_item("a");

        let q = sm.quantize(&state);
        assert_eq!(q.personal_resonance, 10);
        assert_eq!(q.global_resonance, 15);
        assert_eq!(q.clock_bucket, 40);
        assert_eq!(q.key_flags.len(), 1);
        assert_eq!(q.inventory, vec!["a", "b", "c"]);
        assert!(!q.ending);
    }

    #[test]
    fn test_endings_do_not_merge_approximately() {
        let mut sm = manager();
        let calm = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 98);
        let fp = sm.fingerprint(&calm);
        sm.register(&fp, NodeId::new(1));

        let failed = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 100);
        assert!(matches!(sm.resolve(&failed), Resolution::New(_)));

        let ended = calm.clone().with_flag("ending_dawn", true);
        assert!(matches!(sm.resolve(&ended), Resolution::New(_)));
    }

    #[test]
    fn test_deferred_fingerprint_kept_apart() {
        let mut sm = manager();
        let held = StateSnapshot::new("hall").with_flag("ending_flee", true);
        let deferred = sm.deferred_fingerprint(&held);
        let plain = sm.fingerprint(&held);
        assert_ne!(deferred.hash, plain.hash);
        assert_ne!(deferred.approx_key, plain.approx_key);
        sm.register(&deferred, NodeId::new(1));

        let nudged = held.clone().with_clock(ClockTime::from_minutes(2));
        assert_eq!(sm.lookup(&sm.fingerprint(&held)), None);
        assert_eq!(sm.lookup(&sm.fingerprint(&nudged)), None);
        assert_eq!(
            sm.lookup(&sm.deferred_fingerprint(&nudged)),
            Some((NodeId::new(1), false))
        );
    }

    #[test]
    fn test_resolve_exact_then_approximate() {
        let mut sm = manager();
        let base = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 10);
        let fp = match sm.resolve(&base) {
            Resolution::New(fp) => fp,
            other => panic!("expected new state, got {other:?}"),
        };
        sm.register(&fp, NodeId::new(3));

        assert_eq!(
            sm.resolve(&base),
            Resolution::Existing {
                node_id: NodeId::new(3),
                exact: true
            }
        );

        let close = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 11);
        assert_eq!(
            sm.resolve(&close),
            Resolution::Existing {
                node_id: NodeId::new(3),
                exact: false
            }
        );

        // Same projection in another scene is a different node.
        let elsewhere = StateSnapshot::new("cellar").with_meter(Meter::PersonalResonance, 11);
        assert!(matches!(sm.resolve(&elsewhere), Resolution::New(_)));
    }

    #[test]
    fn test_should_prune() {
        let sm = manager();
        let state = StateSnapshot::new("hall");
        assert!(!sm.should_prune(&state, 1, 5));
        assert_eq!(sm.prune_reason(&state, 5, 5), Some(PruneReason::MaxDepth));

        let failed = state.clone().with_meter(Meter::PersonalResonance, 100);
        assert_eq!(sm.prune_reason(&failed, 1, 5), Some(PruneReason::Failure));
        assert_eq!(sm.ending_kind(&failed), Some(EndingType::Failure));

        let ended = state.with_flag("结局_X", true);
        assert_eq!(sm.prune_reason(&ended, 1, 5), Some(PruneReason::Ending));
        assert_eq!(
            sm.ending_kind(&ended),
            Some(EndingType::Flagged("X".to_string()))
        );
    }

    #[test]
    fn test_false_ending_flag_is_not_an_ending() {
        let sm = manager();
        let state = StateSnapshot::new("hall").with_flag("ending_dawn", false);
        assert_eq!(sm.ending_kind(&state), None);
    }

    #[test]
    fn test_apply_clamps_meters() {
        let sm = manager();
        let mut state = StateSnapshot::new("hall");
        sm.apply_consequence(&mut state, &Consequence::adjust(Meter::PersonalResonance, 250));
        sm.apply_consequence(&mut state, &Consequence::adjust(Meter::GlobalResonance, -40));
        sm.apply_consequence(&mut state, &Consequence::adjust(Meter::WorldFatigue, 9));
        assert_eq!(state.personal_resonance, 100);
        assert_eq!(state.global_resonance, 0);
        assert_eq!(state.world_fatigue, 3);

        sm.apply_consequence(
            &mut state,
            &Consequence::SetMeter {
                meter: Meter::GlobalResonance,
                value: 140,
            },
        );
        assert_eq!(state.global_resonance, 100);
    }

    #[test]
    fn test_meters_stay_in_bounds_over_long_sequences() {
        let sm = manager();
        let mut state = StateSnapshot::new("hall");
        let deltas = [37, -91, 64, 12, -5, 250, -300, 8, 99, -1];
        for (i, delta) in deltas.iter().cycle().take(200).enumerate() {
            let meter = Meter::ALL[i % 3];
            sm.apply_consequence(&mut state, &Consequence::adjust(meter, *delta));
            assert!((0..=100).contains(&state.personal_resonance));
            assert!((0..=100).contains(&state.global_resonance));
            assert!((0..=3).contains(&state.world_fatigue));
        }
    }

    #[test]
    fn test_apply_clock_and_items() {
        let sm = manager();
        let mut state = StateSnapshot::new("hall").with_item("lantern");
        sm.apply_consequence(&mut state, &Consequence::AdjustClock { minutes: 500 });
        assert_eq!(state.clock.to_string(), "04:00");
        sm.apply_consequence(&mut state, &Consequence::AdjustClock { minutes: -30 });
        assert_eq!(state.clock.to_string(), "03:30");
        sm.apply_consequence(
            &mut state,
            &Consequence::SetClock {
                time: ClockTime::from_minutes(23 * 60),
            },
        );
        assert_eq!(state.clock.to_string(), "04:00");

        sm.apply_consequence(
            &mut state,
            &Consequence::AddItems {
                items: vec!["key".into(), "lantern".into()],
            },
        );
        let items: Vec<&String> = state.inventory.iter().collect();
        assert_eq!(items, vec!["lantern", "key"]);
    }

    #[test]
    fn test_next_state_records_history() {
        let sm = manager();
        let root = StateSnapshot::new("hall").with_meter(Meter::PersonalResonance, 5);
        let choice = Choice::new("jump", "Jump")
            .with_consequence(Consequence::adjust(Meter::PersonalResonance, 20))
            .with_consequence(Consequence::flag("结局_X", true));

        let next = sm.next_state(&root, &choice);
        assert_eq!(next.personal_resonance, 25);
        assert!(next.flag("结局_X"));
        assert_eq!(next.history, vec!["jump"]);
        assert_eq!(root.history.len(), 0);
    }
}
