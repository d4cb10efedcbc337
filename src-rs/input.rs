//! Symbolic key/button vocabulary shared by recording, storage and injection.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputParseError {
    #[error("key cannot be empty")]
    Empty,
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("unknown mouse button: {0}")]
    UnknownButton(String),
    #[error("chord supports exactly one modifier and one key: {0}")]
    BadChord(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamedKey {
    Enter,
    Esc,
    Tab,
    Space,
    Backspace,
    Delete,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    Shift,
    Ctrl,
    Alt,
    Cmd,
    CapsLock,
    NumLock,
    ScrollLock,
    PrintScreen,
    Pause,
    Menu,
    MediaPlayPause,
    MediaNext,
    MediaPrevious,
    VolumeUp,
    VolumeDown,
    VolumeMute,
    F(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Char(char),
    Named(NamedKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Input {
    Key(KeyCode),
    Button(MouseButton),
}

/// One input, or a modifier held around a second input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputChord {
    pub inputs: Vec<Input>,
}

const NAMED_KEYS: &[(&str, NamedKey)] = &[
    ("enter", NamedKey::Enter),
    ("return", NamedKey::Enter),
    ("esc", NamedKey::Esc),
    ("escape", NamedKey::Esc),
    ("tab", NamedKey::Tab),
    ("space", NamedKey::Space),
    ("backspace", NamedKey::Backspace),
    ("delete", NamedKey::Delete),
    ("insert", NamedKey::Insert),
    ("home", NamedKey::Home),
    ("end", NamedKey::End),
    ("page_up", NamedKey::PageUp),
    ("page_down", NamedKey::PageDown),
    ("up", NamedKey::Up),
    ("down", NamedKey::Down),
    ("left", NamedKey::Left),
    ("right", NamedKey::Right),
    ("shift", NamedKey::Shift),
    ("shift_l", NamedKey::Shift),
    ("shift_r", NamedKey::Shift),
    ("ctrl", NamedKey::Ctrl),
    ("ctrl_l", NamedKey::Ctrl),
    ("ctrl_r", NamedKey::Ctrl),
    ("alt", NamedKey::Alt),
    ("alt_l", NamedKey::Alt),
    ("alt_r", NamedKey::Alt),
    ("cmd", NamedKey::Cmd),
    ("cmd_l", NamedKey::Cmd),
    ("cmd_r", NamedKey::Cmd),
    ("caps_lock", NamedKey::CapsLock),
    ("alt_gr", NamedKey::Alt),
    ("num_lock", NamedKey::NumLock),
    ("scroll_lock", NamedKey::ScrollLock),
    ("print_screen", NamedKey::PrintScreen),
    ("pause", NamedKey::Pause),
    ("menu", NamedKey::Menu),
    ("media_play_pause", NamedKey::MediaPlayPause),
    ("media_next", NamedKey::MediaNext),
    ("media_previous", NamedKey::MediaPrevious),
    ("media_volume_up", NamedKey::VolumeUp),
    ("media_volume_down", NamedKey::VolumeDown),
    ("media_volume_mute", NamedKey::VolumeMute),
];

impl NamedKey {
    pub fn name(self) -> String {
        if let NamedKey::F(n) = self {
            return format!("f{n}");
        }
        NAMED_KEYS
            .iter()
            .find(|(_, key)| *key == self)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_default()
    }

    fn lookup(raw: &str) -> Option<NamedKey> {
        let lower = raw.to_ascii_lowercase();
        if let Some(num) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            if (1..=12).contains(&num) {
                return Some(NamedKey::F(num));
            }
        }
        NAMED_KEYS
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, key)| *key)
    }
}

impl MouseButton {
    pub fn name(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

impl FromStr for MouseButton {
    type Err = InputParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(InputParseError::UnknownButton(other.to_string())),
        }
    }
}

impl FromStr for Input {
    type Err = InputParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(InputParseError::Empty);
        }
        if let Some(button) = raw.strip_prefix("mouse.") {
            return Ok(Input::Button(button.parse()?));
        }
        let mut chars = raw.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            return Ok(Input::Key(KeyCode::Char(ch)));
        }
        let name = raw.strip_prefix("Key.").unwrap_or(raw);
        NamedKey::lookup(name)
            .map(|key| Input::Key(KeyCode::Named(key)))
            .ok_or_else(|| InputParseError::UnknownKey(raw.to_string()))
    }
}

fn chord_parts(s: &str) -> Result<Vec<&str>, InputParseError> {
    let raw = s.trim();
    if raw.is_empty() {
        return Err(InputParseError::Empty);
    }
    // A lone "+" is the plus key, not a chord separator.
    let parts: Vec<&str> = if raw.contains(" + ") {
        raw.split(" + ").collect()
    } else {
        vec![raw]
    };
    if parts.len() > 2 || parts.iter().any(|p| p.trim().is_empty()) {
        return Err(InputParseError::BadChord(raw.to_string()));
    }
    Ok(parts)
}

/// A chord whose parts could not all be resolved. Recordings made on another
/// platform can name keys this vocabulary does not have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialChord {
    pub chord: InputChord,
    pub unknown: Vec<String>,
}

impl InputChord {
    /// Like `parse`, but unknown key and button names are collected instead of
    /// failing. Only an empty or malformed chord is an error.
    pub fn parse_lenient(s: &str) -> Result<PartialChord, InputParseError> {
        let mut inputs = Vec::new();
        let mut unknown = Vec::new();
        for part in chord_parts(s)? {
            match part.parse::<Input>() {
                Ok(input) => inputs.push(input),
                Err(InputParseError::UnknownKey(name) | InputParseError::UnknownButton(name)) => {
                    unknown.push(name)
                }
                Err(err) => return Err(err),
            }
        }
        Ok(PartialChord {
            chord: InputChord { inputs },
            unknown,
        })
    }
}

impl FromStr for InputChord {
    type Err = InputParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inputs = chord_parts(s)?
            .iter()
            .map(|part| part.parse::<Input>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InputChord { inputs })
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Button(button) => write!(f, "mouse.{}", button.name()),
            Input::Key(KeyCode::Char(ch)) => write!(f, "{ch}"),
            Input::Key(KeyCode::Named(key)) => write!(f, "{}", key.name()),
        }
    }
}
