//! Story state snapshots.
//!
//! A [`StateSnapshot`] is the mechanical state carried by every dialogue
//! node: the three resonance meters, the in-fiction clock, the current
//! scene, the inventory and the story flags. Snapshots are plain data;
//! all mutation goes through the
//! [`StateManager`](crate::state_manager::StateManager) so that bounds
//! are enforced in one place.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound of the two resonance meters.
pub const RESONANCE_MAX: i32 = 100;

/// Default upper bound of the world fatigue meter.
pub const DEFAULT_FATIGUE_CAP: i32 = 3;

/// Error type for clock parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("Invalid clock notation: {0}")]
    InvalidNotation(String),
    #[error("Clock value out of range: {0}")]
    OutOfRange(String),
}

/// The bounded meters tracked on every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Meter {
    /// Personal Resonance: the protagonist's own exposure, 0-100.
    PersonalResonance,
    /// Global Resonance: world-level intensity, 0-100.
    GlobalResonance,
    /// World Fatigue: bounded escalation counter.
    WorldFatigue,
}

impl Meter {
    /// All meters, in canonical order.
    pub const ALL: [Meter; 3] = [
        Meter::PersonalResonance,
        Meter::GlobalResonance,
        Meter::WorldFatigue,
    ];

    /// Short display name.
    pub fn short_name(&self) -> &'static str {
        match self {
            Meter::PersonalResonance => "PR",
            Meter::GlobalResonance => "GR",
            Meter::WorldFatigue => "WF",
        }
    }

    /// Resolve a field name or one of its aliases to a meter.
    pub fn from_alias(name: &str) -> Option<Meter> {
        match name.trim().to_lowercase().as_str() {
            "pr" | "personal_resonance" | "personal" | "fear" => Some(Meter::PersonalResonance),
            "gr" | "global_resonance" | "resonance" | "global" | "truth" => {
                Some(Meter::GlobalResonance)
            }
            "wf" | "world_fatigue" | "fatigue" => Some(Meter::WorldFatigue),
            _ => None,
        }
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Time of night inside the fiction, stored as minutes since midnight.
///
/// Serialized as `"HH:MM"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(u16);

impl ClockTime {
    /// Midnight.
    pub const MIDNIGHT: ClockTime = ClockTime(0);

    /// Create a clock time from minutes since midnight.
    pub const fn from_minutes(minutes: u16) -> Self {
        Self(minutes)
    }

    /// Create a clock time from hours and minutes.
    pub fn from_hm(hours: u16, minutes: u16) -> Result<Self, ClockError> {
        if hours > 23 || minutes > 59 {
            return Err(ClockError::OutOfRange(format!("{hours:02}:{minutes:02}")));
        }
        Ok(Self(hours * 60 + minutes))
    }

    /// Minutes since midnight.
    pub fn minutes(&self) -> u16 {
        self.0
    }

    /// Parse `HH:MM` notation.
    pub fn parse(notation: &str) -> Result<Self, ClockError> {
        let trimmed = notation.trim();
        let (hours, minutes) = trimmed
            .split_once(':')
            .ok_or_else(|| ClockError::InvalidNotation(trimmed.to_string()))?;
        let hours: u16 = hours
            .trim()
            .parse()
            .map_err(|_| ClockError::InvalidNotation(trimmed.to_string()))?;
        let minutes: u16 = minutes
            .trim()
            .parse()
            .map_err(|_| ClockError::InvalidNotation(trimmed.to_string()))?;
        Self::from_hm(hours, minutes)
    }
}

impl FromStr for ClockTime {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = ClockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ClockTime> for String {
    fn from(value: ClockTime) -> Self {
        value.to_string()
    }
}

/// The window the in-fiction clock is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: ClockTime::MIDNIGHT,
            end: ClockTime::from_minutes(4 * 60),
        }
    }
}

impl TimeWindow {
    /// Clamp a minute count into the window.
    pub fn clamp(&self, minutes: i32) -> ClockTime {
        let start = i32::from(self.start.minutes());
        let end = i32::from(self.end.minutes()).max(start);
        // Bounded by u16 endpoints, so the cast cannot truncate.
        ClockTime::from_minutes(minutes.clamp(start, end) as u16)
    }

    /// Check whether a time falls inside the window.
    pub fn contains(&self, time: ClockTime) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Full mechanical state at a point in the story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Current scene identifier.
    pub scene: String,

    /// Personal Resonance (0-100).
    pub personal_resonance: i32,

    /// Global Resonance (0-100).
    pub global_resonance: i32,

    /// World Fatigue (0-cap).
    pub world_fatigue: i32,

    /// In-fiction clock.
    pub clock: ClockTime,

    /// Items held, in the order they were acquired.
    #[serde(default)]
    pub inventory: IndexSet<String>,

    /// Story flags.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,

    /// Ids of the choices applied to reach this state.
    #[serde(default)]
    pub history: Vec<String>,
}

impl StateSnapshot {
    /// Create a fresh snapshot in the given scene.
    pub fn new(scene: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            personal_resonance: 0,
            global_resonance: 0,
            world_fatigue: 0,
            clock: ClockTime::MIDNIGHT,
            inventory: IndexSet::new(),
            flags: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Set a meter value (unclamped; the state manager normalizes it).
    pub fn with_meter(mut self, meter: Meter, value: i32) -> Self {
        *self.meter_mut(meter) = value;
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: ClockTime) -> Self {
        self.clock = clock;
        self
    }

    /// Add an inventory item.
    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.inventory.insert(item.into());
        self
    }

    /// Set a flag.
    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }

    /// Read a meter.
    pub fn meter(&self, meter: Meter) -> i32 {
        match meter {
            Meter::PersonalResonance => self.personal_resonance,
            Meter::GlobalResonance => self.global_resonance,
            Meter::WorldFatigue => self.world_fatigue,
        }
    }

    pub(crate) fn meter_mut(&mut self, meter: Meter) -> &mut i32 {
        match meter {
            Meter::PersonalResonance => &mut self.personal_resonance,
            Meter::GlobalResonance => &mut self.global_resonance,
            Meter::WorldFatigue => &mut self.world_fatigue,
        }
    }

    /// Check whether an item is held.
    pub fn has_item(&self, item: &str) -> bool {
        self.inventory.contains(item)
    }

    /// Read a flag (unset flags are false).
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Inventory items in sorted order.
    pub fn sorted_inventory(&self) -> Vec<&str> {
        let mut items: Vec<&str> = self.inventory.iter().map(String::as_str).collect();
        items.sort_unstable();
        items
    }
}
