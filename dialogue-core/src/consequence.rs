//! Typed consequence deltas.
//!
//! Generators describe what a choice does with loosely typed fields such as
//! `{"pr": "+5", "time": "03:10", "flags": {"key_door": true}}`. Those are
//! parsed exactly once, at the generator boundary, into [`Consequence`]
//! values. Everything downstream works with the typed form.
//!
//! Accepted value shapes per field:
//! - meters: `5` / `"+5"` / `"-3"` adjust, `"40"` / `"=40"` / `{"set": 40}` set
//! - clock: `15` / `"+15"` / `"-10"` adjust (minutes), `"03:10"` set
//! - inventory: `"lantern"` or `["lantern", "key"]`
//! - flags: `{"name": true}`, `"name"` or `["a", "b"]` (listed flags are set true)
//! - scene: `"cellar"`

use crate::state::{ClockError, ClockTime, Meter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error type for consequence parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsequenceError {
    #[error("Unknown consequence field: {0}")]
    UnknownField(String),
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),
}

/// A single typed change to a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Consequence {
    /// Add a signed amount to a meter (clamped to its bounds).
    AdjustMeter { meter: Meter, delta: i32 },
    /// Overwrite a meter (clamped to its bounds).
    SetMeter { meter: Meter, value: i32 },
    /// Append items that are not already held.
    AddItems { items: Vec<String> },
    /// Merge flags into the snapshot.
    SetFlags { flags: BTreeMap<String, bool> },
    /// Move the clock by a number of minutes.
    AdjustClock { minutes: i32 },
    /// Set the clock to an absolute time.
    SetClock { time: ClockTime },
    /// Move to another scene.
    EnterScene { scene: String },
}

impl Consequence {
    /// Convenience constructor for a meter adjustment.
    pub fn adjust(meter: Meter, delta: i32) -> Self {
        Consequence::AdjustMeter { meter, delta }
    }

    /// Convenience constructor for a single flag.
    pub fn flag(name: impl Into<String>, value: bool) -> Self {
        let mut flags = BTreeMap::new();
        flags.insert(name.into(), value);
        Consequence::SetFlags { flags }
    }

    /// Whether this consequence moves the story forward.
    ///
    /// Used when ordering and scoring choices: time passing, rising global
    /// resonance, newly raised flags and scene changes all count.
    pub fn is_advancing(&self) -> bool {
        match self {
            Consequence::AdjustMeter {
                meter: Meter::GlobalResonance,
                delta,
            } => *delta > 0,
            Consequence::AdjustClock { minutes } => *minutes > 0,
            Consequence::SetFlags { flags } => flags.values().any(|v| *v),
            Consequence::EnterScene { .. } => true,
            _ => false,
        }
    }

    /// Parse one raw field into typed consequences.
    ///
    /// A field may expand to zero consequences (e.g. an empty item list or
    /// a `null` value).
    pub fn parse_field(key: &str, value: &Value) -> Result<Vec<Consequence>, ConsequenceError> {
        let field = ConsequenceField::from_alias(key)
            .ok_or_else(|| ConsequenceError::UnknownField(key.to_string()))?;

        if value.is_null() {
            return Ok(Vec::new());
        }

        let parsed = match field {
            ConsequenceField::Meter(meter) => match parse_amount(key, value)? {
                Amount::Relative(delta) => vec![Consequence::AdjustMeter { meter, delta }],
                Amount::Absolute(value) => vec![Consequence::SetMeter { meter, value }],
            },
            ConsequenceField::Clock => parse_clock(key, value)?,
            ConsequenceField::Inventory => {
                let items = parse_string_list(key, value)?;
                if items.is_empty() {
                    Vec::new()
                } else {
                    vec![Consequence::AddItems { items }]
                }
            }
            ConsequenceField::Flags => {
                let flags = parse_flags(key, value)?;
                if flags.is_empty() {
                    Vec::new()
                } else {
                    vec![Consequence::SetFlags { flags }]
                }
            }
            ConsequenceField::Scene => match value {
                Value::String(scene) if !scene.trim().is_empty() => {
                    vec![Consequence::EnterScene {
                        scene: scene.trim().to_string(),
                    }]
                }
                other => return Err(invalid(key, other)),
            },
        };

        Ok(parsed)
    }

    /// Parse a whole raw consequence object.
    pub fn parse_map(raw: &Map<String, Value>) -> Result<Vec<Consequence>, ConsequenceError> {
        let mut consequences = Vec::new();
        for (key, value) in raw {
            consequences.extend(Self::parse_field(key, value)?);
        }
        Ok(consequences)
    }
}

impl fmt::Display for Consequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consequence::AdjustMeter { meter, delta } => write!(f, "{meter} {delta:+}"),
            Consequence::SetMeter { meter, value } => write!(f, "{meter} = {value}"),
            Consequence::AddItems { items } => write!(f, "+items [{}]", items.join(", ")),
            Consequence::SetFlags { flags } => {
                let parts: Vec<String> = flags.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "flags {{{}}}", parts.join(", "))
            }
            Consequence::AdjustClock { minutes } => write!(f, "clock {minutes:+}m"),
            Consequence::SetClock { time } => write!(f, "clock = {time}"),
            Consequence::EnterScene { scene } => write!(f, "scene -> {scene}"),
        }
    }
}

/// The state field a raw consequence key refers to, after alias normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsequenceField {
    Meter(Meter),
    Clock,
    Inventory,
    Flags,
    Scene,
}

impl ConsequenceField {
    /// Resolve a raw key or alias.
    pub fn from_alias(key: &str) -> Option<Self> {
        if let Some(meter) = Meter::from_alias(key) {
            return Some(ConsequenceField::Meter(meter));
        }
        match key.trim().to_lowercase().as_str() {
            "time" | "clock" => Some(ConsequenceField::Clock),
            "inventory" | "items" | "add_items" | "item" => Some(ConsequenceField::Inventory),
            "flags" | "set_flags" | "flag" => Some(ConsequenceField::Flags),
            "scene" | "goto" | "enter_scene" => Some(ConsequenceField::Scene),
            _ => None,
        }
    }
}

enum Amount {
    Relative(i32),
    Absolute(i32),
}

fn invalid(field: &str, value: &Value) -> ConsequenceError {
    ConsequenceError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn number_to_i32(field: &str, value: &Value) -> Result<i32, ConsequenceError> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| invalid(field, value))
}

fn parse_amount(field: &str, value: &Value) -> Result<Amount, ConsequenceError> {
    match value {
        Value::Number(_) => Ok(Amount::Relative(number_to_i32(field, value)?)),
        Value::String(s) => {
            let s = s.trim();
            let parse = |text: &str| text.trim().parse::<i32>().map_err(|_| invalid(field, value));
            if let Some(rest) = s.strip_prefix('+') {
                Ok(Amount::Relative(parse(rest)?))
            } else if s.starts_with('-') {
                Ok(Amount::Relative(parse(s)?))
            } else if let Some(rest) = s.strip_prefix('=') {
                Ok(Amount::Absolute(parse(rest)?))
            } else {
                Ok(Amount::Absolute(parse(s)?))
            }
        }
        Value::Object(map) => {
            if let Some(set) = map.get("set") {
                Ok(Amount::Absolute(number_to_i32(field, set)?))
            } else if let Some(delta) = map.get("add").or_else(|| map.get("delta")) {
                Ok(Amount::Relative(number_to_i32(field, delta)?))
            } else {
                Err(invalid(field, value))
            }
        }
        other => Err(invalid(field, other)),
    }
}

fn parse_clock(field: &str, value: &Value) -> Result<Vec<Consequence>, ConsequenceError> {
    match value {
        Value::Number(_) => Ok(vec![Consequence::AdjustClock {
            minutes: number_to_i32(field, value)?,
        }]),
        Value::String(s) => {
            let s = s.trim();
            if s.contains(':') {
                return Ok(vec![Consequence::SetClock {
                    time: ClockTime::parse(s)?,
                }]);
            }
            let digits = s.trim_end_matches("min").trim_end_matches('m');
            let digits = digits.strip_prefix('+').unwrap_or(digits);
            let minutes = digits
                .trim()
                .parse::<i32>()
                .map_err(|_| invalid(field, value))?;
            Ok(vec![Consequence::AdjustClock { minutes }])
        }
        other => Err(invalid(field, other)),
    }
}

fn parse_string_list(field: &str, value: &Value) -> Result<Vec<String>, ConsequenceError> {
    match value {
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.trim().to_string()]),
        Value::Array(values) => values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| invalid(field, v))
            })
            .filter(|r| r.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
            .collect(),
        other => Err(invalid(field, other)),
    }
}

fn parse_flags(field: &str, value: &Value) -> Result<BTreeMap<String, bool>, ConsequenceError> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(name, v)| {
                v.as_bool()
                    .map(|b| (name.clone(), b))
                    .ok_or_else(|| invalid(field, v))
            })
            .collect(),
        _ => Ok(parse_string_list(field, value)?
            .into_iter()
            .map(|name| (name, true))
            .collect()),
    }
}
