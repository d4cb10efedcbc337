//! Action model: the typed, serializable record of one macro step.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::input::InputChord;

pub const DEFAULT_MIN_HOLD: f64 = 0.001;
pub const DEFAULT_MAX_HOLD: f64 = 0.3;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("min delay must be <= max delay and both non-negative")]
    DelayRange,
    #[error("min hold must be <= max hold and both non-negative")]
    HoldRange,
    #[error("min move delay must be <= max move delay and both non-negative")]
    MoveDelayRange,
    #[error("min x/y must be <= max x/y")]
    Rect,
    #[error("search rectangle must span more than one pixel on each axis")]
    DegenerateRect,
    #[error("key: {0}")]
    Key(#[from] crate::input::InputParseError),
    #[error("invalid hex color format, use #RRGGBB: {0}")]
    Color(String),
    #[error("x and y must both be set or both be empty")]
    PartialPoint,
    #[error("loop name cannot be empty")]
    EmptyLoopName,
    #[error("min loops must be <= max loops and both at least 1")]
    LoopRange,
    #[error("border margin must be between 0 and 50 percent")]
    Margin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub fn to_hex(self) -> String {
        let [r, g, b] = self.0;
        format!("#{r:02x}{g:02x}{b:02x}")
    }
}

impl FromStr for Rgb {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let bad = || ValidationError::Color(raw.to_string());
        let hex = raw.strip_prefix('#').ok_or_else(bad)?;
        // `from_str_radix` alone would accept a leading '+' per channel.
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad());
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| bad())
        };
        Ok(Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive integer rectangle in screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl Rect {
    pub fn point(x: i32, y: i32) -> Self {
        Rect {
            min_x: x,
            max_x: x,
            min_y: y,
            max_y: y,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= f64::from(self.min_x)
            && x <= f64::from(self.max_x)
            && y >= f64::from(self.min_y)
            && y <= f64::from(self.max_y)
    }

    pub fn width(&self) -> u32 {
        (i64::from(self.max_x) - i64::from(self.min_x) + 1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (i64::from(self.max_y) - i64::from(self.min_y) + 1).max(0) as u32
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(ValidationError::Rect);
        }
        Ok(())
    }
}

/// Response to a failed color predicate or to the end of a `Wait`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Continue,
    Wait,
    #[default]
    Abort,
    Restart,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    First,
    #[default]
    Random,
    Closest,
    Furthest,
}

fn default_min_hold() -> f64 {
    DEFAULT_MIN_HOLD
}

fn default_max_hold() -> f64 {
    DEFAULT_MAX_HOLD
}

fn default_loops() -> u32 {
    1
}

fn default_wait_end() -> Policy {
    Policy::Continue
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    KeyAction {
        key: String,
        #[serde(default = "default_min_hold")]
        min_hold: f64,
        #[serde(default = "default_max_hold")]
        max_hold: f64,
    },
    MouseMove {
        #[serde(flatten)]
        rect: Rect,
    },
    ColorCheck {
        expected_color: Rgb,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
        #[serde(default)]
        on_fail: Policy,
    },
    MouseToColor {
        expected_color: Rgb,
        #[serde(flatten)]
        rect: Rect,
        #[serde(default)]
        min_move_delay: f64,
        #[serde(default)]
        max_move_delay: f64,
        #[serde(default)]
        on_fail: Policy,
        #[serde(default)]
        border_margin_percent: f64,
        #[serde(default)]
        selection_mode: SelectionMode,
    },
    LoopStart {
        name: String,
        #[serde(default = "default_loops")]
        min_loops: u32,
        #[serde(default = "default_loops")]
        max_loops: u32,
    },
    LoopEnd {
        name: String,
    },
    IfColorStart {
        expected_color: Rgb,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
    },
    Else,
    IfEnd,
    Wait {
        #[serde(default = "default_wait_end")]
        on_end: Policy,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub min_delay: f64,
    #[serde(default)]
    pub max_delay: f64,
    #[serde(default)]
    pub comment: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Action {
            min_delay: 0.0,
            max_delay: 0.0,
            comment: String::new(),
            kind,
        }
    }

    pub fn with_delay(mut self, min_delay: f64, max_delay: f64) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    #[cfg(test)]
    pub fn key(key: impl Into<String>) -> Self {
        Action::new(ActionKind::KeyAction {
            key: key.into(),
            min_hold: DEFAULT_MIN_HOLD,
            max_hold: DEFAULT_MAX_HOLD,
        })
    }

    #[cfg(test)]
    pub fn loop_start(name: impl Into<String>, min_loops: u32, max_loops: u32) -> Self {
        Action::new(ActionKind::LoopStart {
            name: name.into(),
            min_loops,
            max_loops,
        })
    }

    #[cfg(test)]
    pub fn loop_end(name: impl Into<String>) -> Self {
        Action::new(ActionKind::LoopEnd { name: name.into() })
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::KeyAction { .. } => "key_action",
            ActionKind::MouseMove { .. } => "mouse_move",
            ActionKind::ColorCheck { .. } => "color_check",
            ActionKind::MouseToColor { .. } => "mouse_to_color",
            ActionKind::LoopStart { .. } => "loop_start",
            ActionKind::LoopEnd { .. } => "loop_end",
            ActionKind::IfColorStart { .. } => "if_color_start",
            ActionKind::Else => "else",
            ActionKind::IfEnd => "if_end",
            ActionKind::Wait { .. } => "wait",
        }
    }

    /// Human-readable one-line summary, as shown in an action list.
    pub fn details(&self) -> String {
        match &self.kind {
            ActionKind::KeyAction { key, .. } => match key.strip_prefix("mouse.") {
                Some(button) => format!("Click mouse button: {button}"),
                None => format!("Press key: {key}"),
            },
            ActionKind::MouseMove { rect } => format!(
                "Position: ({}-{}, {}-{})",
                rect.min_x, rect.max_x, rect.min_y, rect.max_y
            ),
            ActionKind::ColorCheck {
                expected_color, x, y, ..
            }
            | ActionKind::IfColorStart {
                expected_color, x, y,
            } => match (x, y) {
                (Some(x), Some(y)) => format!("Expected color {expected_color} at ({x}, {y})"),
                _ => format!("Expected color {expected_color} under pointer"),
            },
            ActionKind::MouseToColor {
                expected_color,
                rect,
                selection_mode,
                ..
            } => format!(
                "Move to {expected_color} in ({}-{}, {}-{}), {selection_mode:?}",
                rect.min_x, rect.max_x, rect.min_y, rect.max_y
            ),
            ActionKind::LoopStart {
                name,
                min_loops,
                max_loops,
            } => format!("Start loop '{name}' {min_loops}-{max_loops} times"),
            ActionKind::LoopEnd { name } => format!("End loop '{name}'"),
            ActionKind::Else => "Else".to_string(),
            ActionKind::IfEnd => "End if".to_string(),
            ActionKind::Wait { on_end } => format!("Wait, then {on_end:?}"),
        }
    }

    /// Edit-time checks for a single action. Structure across actions is
    /// checked by [`crate::program::Program::compile`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !range_ok(self.min_delay, self.max_delay) {
            return Err(ValidationError::DelayRange);
        }
        match &self.kind {
            ActionKind::KeyAction {
                key,
                min_hold,
                max_hold,
            } => {
                // Unknown key names are skipped at playback, not rejected.
                InputChord::parse_lenient(key)?;
                if !range_ok(*min_hold, *max_hold) {
                    return Err(ValidationError::HoldRange);
                }
            }
            ActionKind::MouseMove { rect } => rect.validate()?,
            ActionKind::ColorCheck { x, y, .. } | ActionKind::IfColorStart { x, y, .. } => {
                if x.is_some() != y.is_some() {
                    return Err(ValidationError::PartialPoint);
                }
            }
            ActionKind::MouseToColor {
                rect,
                min_move_delay,
                max_move_delay,
                border_margin_percent,
                ..
            } => {
                rect.validate()?;
                if rect.min_x == rect.max_x || rect.min_y == rect.max_y {
                    return Err(ValidationError::DegenerateRect);
                }
                if !range_ok(*min_move_delay, *max_move_delay) {
                    return Err(ValidationError::MoveDelayRange);
                }
                if !(0.0..=50.0).contains(border_margin_percent) {
                    return Err(ValidationError::Margin);
                }
            }
            ActionKind::LoopStart {
                name,
                min_loops,
                max_loops,
            } => {
                if name.trim().is_empty() {
                    return Err(ValidationError::EmptyLoopName);
                }
                if *min_loops < 1 || min_loops > max_loops {
                    return Err(ValidationError::LoopRange);
                }
            }
            ActionKind::LoopEnd { name } => {
                if name.trim().is_empty() {
                    return Err(ValidationError::EmptyLoopName);
                }
            }
            ActionKind::Else | ActionKind::IfEnd | ActionKind::Wait { .. } => {}
        }
        Ok(())
    }
}

fn range_ok(min: f64, max: f64) -> bool {
    min.is_finite() && max.is_finite() && min >= 0.0 && min <= max
}
