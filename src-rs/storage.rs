//! Macro files: a JSON array of action records.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::action::Action;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid macro JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: expected a JSON array of actions")]
    NotAnArray { path: PathBuf },
    #[error("{path}: action {index}: {source}")]
    Record {
        path: PathBuf,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads a macro, upgrading records saved by older versions.
///
/// Nothing is returned on failure, so callers keep whatever they had loaded.
pub fn load_macro(path: &Path) -> Result<Vec<Action>, StorageError> {
    let raw = fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_macro(&raw).map_err(|err| err.at(path))
}

/// Parses macro JSON text; errors carry an empty path until [`load_macro`]
/// attaches one.
pub fn parse_macro(raw: &str) -> Result<Vec<Action>, StorageError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| StorageError::Json {
        path: PathBuf::new(),
        source,
    })?;
    let Value::Array(records) = value else {
        return Err(StorageError::NotAnArray {
            path: PathBuf::new(),
        });
    };

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            serde_json::from_value(upgrade_record(record)).map_err(|source| StorageError::Record {
                path: PathBuf::new(),
                index,
                source,
            })
        })
        .collect()
}

/// Creates the directory `path` will be written into, if it has one.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

pub fn save_macro(path: &Path, actions: &[Action]) -> Result<(), StorageError> {
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };
    ensure_parent_dir(path).map_err(write_err)?;
    let raw = serde_json::to_string_pretty(actions).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, raw).map_err(write_err)
}

impl StorageError {
    fn at(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            StorageError::Json { source, .. } => StorageError::Json { path, source },
            StorageError::NotAnArray { .. } => StorageError::NotAnArray { path },
            StorageError::Record { index, source, .. } => StorageError::Record {
                path,
                index,
                source,
            },
            other => other,
        }
    }
}

fn take_f64(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
    map.remove(key).and_then(|v| v.as_f64())
}

fn add_f64(map: &mut Map<String, Value>, key: &str, extra: f64) {
    let base = map.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    map.insert(key.to_string(), Value::from(base + extra));
}

/// Rewrites one record from any earlier schema into the current shape.
fn upgrade_record(record: Value) -> Value {
    let Value::Object(mut map) = record else {
        return record;
    };
    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Recording timestamps were sometimes left in saved files.
    map.remove("timestamp");

    if let Some(delay) = take_f64(&mut map, "delay") {
        map.entry("min_delay").or_insert(Value::from(delay));
        map.entry("max_delay").or_insert(Value::from(delay));
    }

    match kind.as_str() {
        "key_action" => {
            if let Some(hold) = take_f64(&mut map, "hold_duration") {
                debug!(hold, "upgrading scalar hold duration");
                map.insert("min_hold".to_string(), Value::from(hold));
                map.insert("max_hold".to_string(), Value::from(hold));
            }
        }
        "mouse_move" => {
            // Move time used to be separate; it is now part of the delay.
            let min_move = take_f64(&mut map, "min_move_duration");
            let max_move = take_f64(&mut map, "max_move_duration");
            if min_move.is_some() || max_move.is_some() {
                let min_move = min_move.unwrap_or(0.0);
                let max_move = max_move.unwrap_or(min_move);
                add_f64(&mut map, "min_delay", min_move);
                add_f64(&mut map, "max_delay", max_move);
            }
        }
        "mouse_to_color" => {
            if let Some(duration) = take_f64(&mut map, "move_duration") {
                map.insert("min_move_delay".to_string(), Value::from(duration));
                map.insert("max_move_delay".to_string(), Value::from(duration));
            }
        }
        _ => {}
    }

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, Rect};
    use tempfile::tempdir;

    #[test]
    fn save_then_load_preserves_actions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("macro.json");
        let actions = vec![
            Action::loop_start("main", 2, 3).with_delay(0.1, 0.2),
            Action::key("Key.ctrl + c"),
            Action::loop_end("main"),
        ];
        save_macro(&path, &actions).unwrap();
        assert_eq!(load_macro(&path).unwrap(), actions);
    }

    #[test]
    fn ensure_parent_dir_handles_bare_and_nested_paths() {
        ensure_parent_dir(Path::new("macro.json")).unwrap();
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("macro.json");
        ensure_parent_dir(&nested).unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
        assert!(!nested.exists());
    }

    #[test]
    fn legacy_scalar_hold_becomes_a_range() {
        let actions =
            parse_macro(r#"[{"type": "key_action", "key": "a", "hold_duration": 0.25}]"#).unwrap();
        assert_eq!(
            actions[0].kind,
            ActionKind::KeyAction {
                key: "a".into(),
                min_hold: 0.25,
                max_hold: 0.25
            }
        );
    }

    #[test]
    fn legacy_move_durations_fold_into_delay() {
        let actions = parse_macro(
            r#"[{"type": "mouse_move", "min_x": 1, "max_x": 1, "min_y": 2, "max_y": 2,
                 "min_delay": 0.5, "max_delay": 0.5,
                 "min_move_duration": 0.25, "max_move_duration": 0.5,
                 "timestamp": 3.0, "comment": ""}]"#,
        )
        .unwrap();
        assert_eq!(actions[0].kind, ActionKind::MouseMove { rect: Rect::point(1, 2) });
        assert_eq!(actions[0].min_delay, 0.75);
        assert_eq!(actions[0].max_delay, 1.0);
    }

    #[test]
    fn load_failure_reports_path_and_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"[{"type": "key_action", "key": "a"}, {"type": "teleport"}]"#).unwrap();
        let err = load_macro(&path).unwrap_err();
        assert!(matches!(err, StorageError::Record { index: 1, .. }));
        assert!(err.to_string().contains("bad.json"));

        fs::write(&path, r#"{"actions": []}"#).unwrap();
        assert!(matches!(
            load_macro(&path),
            Err(StorageError::NotAnArray { .. })
        ));

        assert!(matches!(
            load_macro(&dir.path().join("missing.json")),
            Err(StorageError::Read { .. })
        ));
    }
}
