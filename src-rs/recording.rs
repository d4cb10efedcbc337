//! Turning a raw capture trace into actions, and the channel capture sources
//! write into.

use std::collections::HashMap;
#[cfg(any(test, feature = "capture"))]
use std::sync::mpsc::{self, Receiver, Sender};
#[cfg(any(test, feature = "capture"))]
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::{Action, ActionKind, Rect};
#[cfg(any(test, feature = "capture"))]
use crate::input::{Input, KeyCode, NamedKey};

/// One captured event. Timestamps are seconds since recording started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: RawEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEventKind {
    KeyPress { key: String },
    KeyRelease { key: String },
    ButtonPress { button: String, x: i32, y: i32 },
    ButtonRelease { button: String, x: i32, y: i32 },
    Move { x: i32, y: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecordMode {
    Dense,
    Sparse {
        /// Half-width of the square a plain click expands into.
        click_radius: i32,
        /// Added to `max_delay` so replays vary.
        extra_slack: f64,
    },
}

/// Converts a trace into actions. Events are sorted by timestamp first.
pub fn post_process(events: &[RawEvent], mode: RecordMode) -> Vec<Action> {
    let mut sorted = events.to_vec();
    sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    match mode {
        RecordMode::Dense => dense(&sorted),
        RecordMode::Sparse {
            click_radius,
            extra_slack,
        } => sparse(&sorted, click_radius, extra_slack),
    }
}

fn last_timestamp(events: &[RawEvent]) -> f64 {
    events.last().map(|e| e.timestamp).unwrap_or(0.0)
}

fn release_time(events: &[RawEvent], from: usize, key: &str, button: bool) -> Option<f64> {
    events[from + 1..].iter().find_map(|e| match &e.kind {
        RawEventKind::KeyRelease { key: k } if !button && k == key => Some(e.timestamp),
        RawEventKind::ButtonRelease { button: b, .. } if button && b == key => Some(e.timestamp),
        _ => None,
    })
}

fn key_action(key: String, hold: f64) -> Action {
    let hold = hold.max(0.0);
    Action::new(ActionKind::KeyAction {
        key,
        min_hold: hold,
        max_hold: hold,
    })
}

fn button_key(button: &str) -> String {
    format!("mouse.{button}")
}

fn dense(events: &[RawEvent]) -> Vec<Action> {
    let end = last_timestamp(events);
    let mut timed: Vec<(f64, Action)> = Vec::new();

    for (idx, event) in events.iter().enumerate() {
        let ts = event.timestamp;
        match &event.kind {
            RawEventKind::Move { x, y } => {
                timed.push((ts, Action::new(ActionKind::MouseMove { rect: Rect::point(*x, *y) })));
            }
            RawEventKind::KeyPress { key } => {
                let released = release_time(events, idx, key, false).unwrap_or(end);
                timed.push((ts, key_action(key.clone(), released - ts)));
            }
            RawEventKind::ButtonPress { button, x, y } => {
                let released = release_time(events, idx, button, true).unwrap_or(end);
                timed.push((ts, Action::new(ActionKind::MouseMove { rect: Rect::point(*x, *y) })));
                timed.push((ts, key_action(button_key(button), released - ts)));
            }
            RawEventKind::KeyRelease { .. } | RawEventKind::ButtonRelease { .. } => {}
        }
    }

    let mut prev = timed.first().map(|(ts, _)| *ts).unwrap_or(0.0);
    timed
        .into_iter()
        .map(|(ts, action)| {
            let gap = (ts - prev).max(0.0);
            prev = ts;
            action.with_delay(gap, gap)
        })
        .collect()
}

struct Drag {
    button: String,
    start: f64,
    origin: (i32, i32),
    rect: Rect,
}

fn sparse(events: &[RawEvent], click_radius: i32, extra_slack: f64) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut last_end = 0.0f64;
    let mut drag: Option<Drag> = None;
    let mut held_keys: HashMap<String, f64> = HashMap::new();
    let end = last_timestamp(events);

    for event in events {
        let ts = event.timestamp;
        match &event.kind {
            RawEventKind::Move { x, y } => {
                if let Some(d) = drag.as_mut() {
                    d.rect.min_x = d.rect.min_x.min(*x);
                    d.rect.max_x = d.rect.max_x.max(*x);
                    d.rect.min_y = d.rect.min_y.min(*y);
                    d.rect.max_y = d.rect.max_y.max(*y);
                }
            }
            RawEventKind::ButtonPress { button, x, y } => {
                if drag.is_some() {
                    debug!(button = %button, "ignoring second button press during drag");
                    continue;
                }
                drag = Some(Drag {
                    button: button.clone(),
                    start: ts,
                    origin: (*x, *y),
                    rect: Rect::point(*x, *y),
                });
            }
            RawEventKind::ButtonRelease { button, x, y } => {
                let Some(mut d) = drag.take_if(|d| d.button == *button) else {
                    continue;
                };
                d.rect.min_x = d.rect.min_x.min(*x);
                d.rect.max_x = d.rect.max_x.max(*x);
                d.rect.min_y = d.rect.min_y.min(*y);
                d.rect.max_y = d.rect.max_y.max(*y);
                push_click(&mut actions, &d, ts, last_end, click_radius, extra_slack);
                last_end = ts;
            }
            RawEventKind::KeyPress { key } => {
                held_keys.entry(key.clone()).or_insert(ts);
            }
            RawEventKind::KeyRelease { key } => {
                let Some(pressed) = held_keys.remove(key) else {
                    continue;
                };
                let gap = (pressed - last_end).max(0.0);
                actions.push(key_action(key.clone(), ts - pressed).with_delay(gap, gap));
                last_end = ts;
            }
        }
    }

    if let Some(d) = drag {
        push_click(&mut actions, &d, end, last_end, click_radius, extra_slack);
    }
    for (key, pressed) in held_keys {
        warn!(key = %key, "key still held when recording stopped");
        let gap = (pressed - last_end).max(0.0);
        actions.push(key_action(key, end - pressed).with_delay(gap, gap));
    }
    actions
}

fn push_click(
    actions: &mut Vec<Action>,
    drag: &Drag,
    released: f64,
    last_end: f64,
    click_radius: i32,
    extra_slack: f64,
) {
    let is_drag = drag.rect != Rect::point(drag.origin.0, drag.origin.1);
    let rect = if is_drag {
        drag.rect
    } else {
        let r = click_radius.max(0);
        Rect {
            min_x: drag.origin.0 - r,
            max_x: drag.origin.0 + r,
            min_y: drag.origin.1 - r,
            max_y: drag.origin.1 + r,
        }
    };
    let gap = (drag.start - last_end).max(0.0);
    actions.push(Action::new(ActionKind::MouseMove { rect }).with_delay(gap, gap + extra_slack.max(0.0)));
    actions.push(key_action(button_key(&drag.button), released - drag.start));
}

/// Collects events from any number of capture sources through one channel so
/// appends never interleave.
#[cfg(any(test, feature = "capture"))]
pub struct Recorder {
    tx: Sender<RawEvent>,
    rx: Receiver<RawEvent>,
    started: Instant,
}

/// Cloneable handle a capture source uses to submit events.
#[cfg(any(test, feature = "capture"))]
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<RawEvent>,
    started: Instant,
}

#[cfg(any(test, feature = "capture"))]
impl EventSink {
    pub fn send(&self, kind: RawEventKind) -> bool {
        let timestamp = self.started.elapsed().as_secs_f64();
        self.tx.send(RawEvent { timestamp, kind }).is_ok()
    }
}

#[cfg(any(test, feature = "capture"))]
impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "capture"))]
impl Recorder {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Recorder {
            tx,
            rx,
            started: Instant::now(),
        }
    }

    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            started: self.started,
        }
    }

    /// Drops the recorder's own sender and drains whatever was queued.
    pub fn finish(self) -> Vec<RawEvent> {
        let Recorder { tx, rx, .. } = self;
        drop(tx);
        let mut events: Vec<RawEvent> = rx.try_iter().collect();
        events.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        events
    }
}

/// Symbolic name of an input as stored in recordings.
#[cfg(any(test, feature = "capture"))]
pub fn input_name(input: &Input) -> String {
    match input {
        Input::Key(KeyCode::Named(key)) => format!("Key.{}", key.name()),
        other => other.to_string(),
    }
}

/// True for the key that ends a recording.
#[cfg(any(test, feature = "capture"))]
pub fn is_stop_key(input: &Input) -> bool {
    *input == Input::Key(KeyCode::Named(NamedKey::Esc))
}

#[cfg(feature = "capture")]
pub use listener::record_until_escape;

#[cfg(feature = "capture")]
mod listener {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::Result;
    use tracing::{info, warn};

    use super::{input_name, is_stop_key, RawEvent, RawEventKind, Recorder};
    use crate::input::{Input, KeyCode, MouseButton, NamedKey};

    fn map_button(button: rdev::Button) -> Option<MouseButton> {
        match button {
            rdev::Button::Left => Some(MouseButton::Left),
            rdev::Button::Right => Some(MouseButton::Right),
            rdev::Button::Middle => Some(MouseButton::Middle),
            rdev::Button::Unknown(_) => None,
        }
    }

    fn map_key(key: rdev::Key, name: Option<&str>) -> Option<Input> {
        use rdev::Key as K;
        let named = match key {
            K::Return | K::KpReturn => NamedKey::Enter,
            K::Escape => NamedKey::Esc,
            K::Tab => NamedKey::Tab,
            K::Space => NamedKey::Space,
            K::Backspace => NamedKey::Backspace,
            K::Delete => NamedKey::Delete,
            K::Insert => NamedKey::Insert,
            K::Home => NamedKey::Home,
            K::End => NamedKey::End,
            K::PageUp => NamedKey::PageUp,
            K::PageDown => NamedKey::PageDown,
            K::UpArrow => NamedKey::Up,
            K::DownArrow => NamedKey::Down,
            K::LeftArrow => NamedKey::Left,
            K::RightArrow => NamedKey::Right,
            K::ShiftLeft | K::ShiftRight => NamedKey::Shift,
            K::ControlLeft | K::ControlRight => NamedKey::Ctrl,
            K::Alt | K::AltGr => NamedKey::Alt,
            K::MetaLeft | K::MetaRight => NamedKey::Cmd,
            K::CapsLock => NamedKey::CapsLock,
            K::NumLock => NamedKey::NumLock,
            K::ScrollLock => NamedKey::ScrollLock,
            K::PrintScreen => NamedKey::PrintScreen,
            K::Pause => NamedKey::Pause,
            K::F1 => NamedKey::F(1),
            K::F2 => NamedKey::F(2),
            K::F3 => NamedKey::F(3),
            K::F4 => NamedKey::F(4),
            K::F5 => NamedKey::F(5),
            K::F6 => NamedKey::F(6),
            K::F7 => NamedKey::F(7),
            K::F8 => NamedKey::F(8),
            K::F9 => NamedKey::F(9),
            K::F10 => NamedKey::F(10),
            K::F11 => NamedKey::F(11),
            K::F12 => NamedKey::F(12),
            _ => {
                let mut chars = name?.chars();
                let ch = chars.next()?;
                return chars.next().is_none().then_some(Input::Key(KeyCode::Char(ch)));
            }
        };
        Some(Input::Key(KeyCode::Named(named)))
    }

    /// Listens globally until Escape is pressed. The rdev listener thread
    /// cannot be joined, so it is left parked once the stop flag is set.
    pub fn record_until_escape() -> Result<Vec<RawEvent>> {
        let recorder = Recorder::new();
        let sink = recorder.sink();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        thread::spawn(move || {
            let mut pointer = (0i32, 0i32);
            // Release events of some platforms carry no name; remember presses.
            let mut names: Vec<(rdev::Key, Input)> = Vec::new();
            let result = rdev::listen(move |event: rdev::Event| {
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                let kind = match event.event_type {
                    rdev::EventType::KeyPress(key) => {
                        let Some(input) = map_key(key, event.name.as_deref()) else {
                            return;
                        };
                        if is_stop_key(&input) {
                            stop_flag.store(true, Ordering::SeqCst);
                            return;
                        }
                        names.retain(|(k, _)| *k != key);
                        names.push((key, input));
                        RawEventKind::KeyPress {
                            key: input_name(&input),
                        }
                    }
                    rdev::EventType::KeyRelease(key) => {
                        let Some(pos) = names.iter().position(|(k, _)| *k == key) else {
                            return;
                        };
                        let (_, input) = names.remove(pos);
                        RawEventKind::KeyRelease {
                            key: input_name(&input),
                        }
                    }
                    rdev::EventType::ButtonPress(button) => {
                        let Some(button) = map_button(button) else {
                            return;
                        };
                        RawEventKind::ButtonPress {
                            button: button.name().to_string(),
                            x: pointer.0,
                            y: pointer.1,
                        }
                    }
                    rdev::EventType::ButtonRelease(button) => {
                        let Some(button) = map_button(button) else {
                            return;
                        };
                        RawEventKind::ButtonRelease {
                            button: button.name().to_string(),
                            x: pointer.0,
                            y: pointer.1,
                        }
                    }
                    rdev::EventType::MouseMove { x, y } => {
                        pointer = (x.round() as i32, y.round() as i32);
                        RawEventKind::Move {
                            x: pointer.0,
                            y: pointer.1,
                        }
                    }
                    rdev::EventType::Wheel { .. } => return,
                };
                sink.send(kind);
            });
            if let Err(err) = result {
                warn!("input listener failed: {err:?}");
            }
        });

        info!("recording; press Esc to stop");
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
        }
        Ok(recorder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(timestamp: f64, kind: RawEventKind) -> RawEvent {
        RawEvent { timestamp, kind }
    }

    fn mv(timestamp: f64, x: i32, y: i32) -> RawEvent {
        ev(timestamp, RawEventKind::Move { x, y })
    }

    fn delays(actions: &[Action]) -> Vec<(f64, f64)> {
        actions.iter().map(|a| (a.min_delay, a.max_delay)).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn dense_delays_are_gaps_between_events() {
        let actions = post_process(
            &[mv(0.0, 1, 1), mv(0.5, 2, 2), mv(1.2, 3, 3)],
            RecordMode::Dense,
        );
        let got = delays(&actions);
        let want = [0.0, 0.5, 0.7];
        assert_eq!(got.len(), 3);
        for ((min, max), expected) in got.iter().zip(want) {
            assert!(approx(*min, expected) && approx(*max, expected), "{got:?}");
        }
    }

    #[test]
    fn dense_sorts_events_and_pairs_key_presses() {
        let actions = post_process(
            &[
                ev(1.3, RawEventKind::KeyRelease { key: "a".into() }),
                ev(1.0, RawEventKind::KeyPress { key: "a".into() }),
                mv(0.2, 5, 5),
            ],
            RecordMode::Dense,
        );
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0].kind, ActionKind::MouseMove { .. }));
        match &actions[1].kind {
            ActionKind::KeyAction { key, min_hold, max_hold } => {
                assert_eq!(key, "a");
                assert!(approx(*min_hold, 0.3) && approx(*max_hold, 0.3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(approx(actions[1].min_delay, 0.8));
    }

    #[test]
    fn dense_click_becomes_move_then_button() {
        let actions = post_process(
            &[
                ev(0.0, RawEventKind::ButtonPress { button: "left".into(), x: 9, y: 8 }),
                ev(0.1, RawEventKind::ButtonRelease { button: "left".into(), x: 9, y: 8 }),
            ],
            RecordMode::Dense,
        );
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0].kind,
            ActionKind::MouseMove { rect: Rect::point(9, 8) }
        );
        assert!(matches!(&actions[1].kind, ActionKind::KeyAction { key, .. } if key == "mouse.left"));
        assert_eq!(actions[1].min_delay, 0.0);
    }

    #[test]
    fn sparse_click_gets_slack_and_square() {
        let actions = post_process(
            &[
                ev(0.2, RawEventKind::KeyPress { key: "x".into() }),
                ev(0.4, RawEventKind::KeyRelease { key: "x".into() }),
                ev(1.0, RawEventKind::ButtonPress { button: "left".into(), x: 50, y: 60 }),
                ev(1.1, RawEventKind::ButtonRelease { button: "left".into(), x: 50, y: 60 }),
            ],
            RecordMode::Sparse {
                click_radius: 3,
                extra_slack: 0.2,
            },
        );
        assert_eq!(actions.len(), 3);
        let click = &actions[1];
        assert!(approx(click.min_delay, 0.6), "{}", click.min_delay);
        assert!(approx(click.max_delay, 0.8), "{}", click.max_delay);
        assert_eq!(
            click.kind,
            ActionKind::MouseMove {
                rect: Rect { min_x: 47, max_x: 53, min_y: 57, max_y: 63 }
            }
        );
        assert_eq!((actions[2].min_delay, actions[2].max_delay), (0.0, 0.0));
        // The keyboard action keeps an exact delay.
        assert!(approx(actions[0].min_delay, 0.2) && approx(actions[0].max_delay, 0.2));
    }

    #[test]
    fn sparse_drag_becomes_bounding_rectangle() {
        let actions = post_process(
            &[
                ev(0.0, RawEventKind::ButtonPress { button: "left".into(), x: 10, y: 10 }),
                mv(0.1, 30, 5),
                mv(0.2, 40, 25),
                ev(0.3, RawEventKind::ButtonRelease { button: "left".into(), x: 40, y: 25 }),
            ],
            RecordMode::Sparse {
                click_radius: 5,
                extra_slack: 0.0,
            },
        );
        assert_eq!(
            actions[0].kind,
            ActionKind::MouseMove {
                rect: Rect { min_x: 10, max_x: 40, min_y: 5, max_y: 25 }
            }
        );
    }

    #[test]
    fn sparse_drops_plain_moves_and_unmatched_releases() {
        let actions = post_process(
            &[
                mv(0.1, 1, 1),
                ev(0.2, RawEventKind::KeyRelease { key: "q".into() }),
                ev(0.3, RawEventKind::ButtonRelease { button: "left".into(), x: 0, y: 0 }),
            ],
            RecordMode::Sparse {
                click_radius: 5,
                extra_slack: 0.0,
            },
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn recorder_serializes_events_from_many_sources() {
        let recorder = Recorder::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = recorder.sink();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        sink.send(RawEventKind::Move { x: i, y: j });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let events = recorder.finish();
        assert_eq!(events.len(), 100);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn raw_events_round_trip_as_json() {
        let raw = r#"[{"timestamp": 0.5, "type": "button_press", "button": "left", "x": 1, "y": 2}]"#;
        let events: Vec<RawEvent> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            events[0].kind,
            RawEventKind::ButtonPress { button: "left".into(), x: 1, y: 2 }
        );
    }

    #[test]
    fn stop_key_and_names() {
        let esc: Input = "esc".parse().unwrap();
        assert!(is_stop_key(&esc));
        assert_eq!(input_name(&esc), "Key.esc");
        assert_eq!(input_name(&"z".parse().unwrap()), "z");
    }
}
