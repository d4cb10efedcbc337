//! Boundaries to the outside world: reading screen pixels and injecting input.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, trace};
use wait_timeout::ChildExt;

use crate::action::{Rect, Rgb};
use crate::input::Input;
use crate::region::PixelGrid;

const CAPTURE_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("no screen capture tool found (tried screencapture, grim, import)")]
    NoCaptureTool,
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("failed to read screenshot {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("point ({x}, {y}) is outside the captured screen")]
    OutOfBounds { x: i32, y: i32 },
    #[error("input injection failed: {0}")]
    Injection(String),
    #[error("input not supported by this backend: {0}")]
    Unsupported(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Reads pixels from the screen.
pub trait ScreenSource: Send {
    fn grab(&mut self, rect: Rect) -> PlatformResult<PixelGrid>;

    fn get_pixel(&mut self, x: i32, y: i32) -> PlatformResult<Rgb> {
        let grid = self.grab(Rect::point(x, y))?;
        grid.get(x, y).ok_or(PlatformError::OutOfBounds { x, y })
    }
}

/// Emulates pointer and keyboard input. Implementations may hold OS handles
/// that must stay on one thread, so playback builds its injector on the worker.
pub trait InputInjector {
    fn move_pointer_to(&mut self, x: i32, y: i32) -> PlatformResult<()>;
    fn press(&mut self, input: &Input) -> PlatformResult<()>;
    fn release(&mut self, input: &Input) -> PlatformResult<()>;

    /// Where the pointer is now, when the backend can tell.
    fn pointer_position(&mut self) -> Option<(i32, i32)> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CaptureTool {
    Screencapture,
    Grim,
    Import,
}

/// Captures regions by shelling out to the platform screenshot tool.
pub struct CommandScreenSource {
    tool: CaptureTool,
    scratch_dir: PathBuf,
}

impl CommandScreenSource {
    pub fn detect() -> PlatformResult<Self> {
        let candidates: &[(&str, CaptureTool)] = if cfg!(target_os = "macos") {
            &[("screencapture", CaptureTool::Screencapture)]
        } else {
            &[("grim", CaptureTool::Grim), ("import", CaptureTool::Import)]
        };
        let tool = candidates
            .iter()
            .find(|(name, _)| command_exists(name))
            .map(|(_, tool)| *tool)
            .ok_or(PlatformError::NoCaptureTool)?;
        debug!(?tool, "using screen capture tool");
        Ok(CommandScreenSource {
            tool,
            scratch_dir: env::temp_dir(),
        })
    }

    fn command_for(&self, rect: Rect, out: &Path) -> Command {
        let (w, h) = (rect.width(), rect.height());
        match self.tool {
            CaptureTool::Screencapture => {
                let mut cmd = Command::new("screencapture");
                cmd.arg("-x")
                    .arg("-R")
                    .arg(format!("{},{},{w},{h}", rect.min_x, rect.min_y))
                    .arg(out);
                cmd
            }
            CaptureTool::Grim => {
                let mut cmd = Command::new("grim");
                cmd.arg("-g")
                    .arg(format!("{},{} {w}x{h}", rect.min_x, rect.min_y))
                    .arg(out);
                cmd
            }
            CaptureTool::Import => {
                let mut cmd = Command::new("import");
                cmd.arg("-window")
                    .arg("root")
                    .arg("-crop")
                    .arg(format!("{w}x{h}+{}+{}", rect.min_x, rect.min_y))
                    .arg(out);
                cmd
            }
        }
    }
}

impl ScreenSource for CommandScreenSource {
    fn grab(&mut self, rect: Rect) -> PlatformResult<PixelGrid> {
        let out = self.scratch_dir.join(format!(
            "wind-macro-grab-{}-{}.png",
            std::process::id(),
            rand::thread_rng().gen_range(1000..9999)
        ));
        let mut cmd = self.command_for(rect, &out);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| PlatformError::Capture(err.to_string()))?;
        match child.wait_timeout(Duration::from_millis(CAPTURE_TIMEOUT_MS)) {
            Ok(Some(status)) if status.success() => {}
            Ok(Some(status)) => {
                return Err(PlatformError::Capture(format!(
                    "{:?} exited with {status}",
                    self.tool
                )));
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlatformError::Capture(format!(
                    "{:?} timed out after {CAPTURE_TIMEOUT_MS}ms",
                    self.tool
                )));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlatformError::Capture(err.to_string()));
            }
        }

        let loaded = image::open(&out).map_err(|source| PlatformError::Image {
            path: out.clone(),
            source,
        });
        let _ = fs::remove_file(&out);
        let mut image = loaded?;

        // HiDPI captures come back scaled; map them onto logical pixels.
        if image.dimensions() != (rect.width(), rect.height()) {
            image = image.resize_exact(rect.width(), rect.height(), FilterType::Nearest);
        }
        Ok(PixelGrid::new((rect.min_x, rect.min_y), image.to_rgb8()))
    }
}

/// Serves pixels from a saved screenshot whose top-left is screen (0, 0).
pub struct ImageFileSource {
    image: RgbImage,
}

impl ImageFileSource {
    pub fn open(path: &Path) -> PlatformResult<Self> {
        let image = image::open(path).map_err(|source| PlatformError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: DynamicImage) -> Self {
        ImageFileSource {
            image: image.to_rgb8(),
        }
    }
}

impl ScreenSource for ImageFileSource {
    fn grab(&mut self, rect: Rect) -> PlatformResult<PixelGrid> {
        let (w, h) = self.image.dimensions();
        let x0 = rect.min_x.max(0);
        let y0 = rect.min_y.max(0);
        let x1 = i64::from(rect.max_x).min(i64::from(w) - 1);
        let y1 = i64::from(rect.max_y).min(i64::from(h) - 1);
        if i64::from(x0) > x1 || i64::from(y0) > y1 {
            return Err(PlatformError::OutOfBounds {
                x: rect.min_x,
                y: rect.min_y,
            });
        }
        let crop = image::imageops::crop_imm(
            &self.image,
            x0 as u32,
            y0 as u32,
            (x1 - i64::from(x0) + 1) as u32,
            (y1 - i64::from(y0) + 1) as u32,
        )
        .to_image();
        Ok(PixelGrid::new((x0, y0), crop))
    }
}

/// Logs every input instead of injecting it and tracks a virtual pointer.
#[derive(Debug, Default)]
pub struct DryRunInjector {
    pointer: (i32, i32),
}

impl InputInjector for DryRunInjector {
    fn move_pointer_to(&mut self, x: i32, y: i32) -> PlatformResult<()> {
        trace!(x, y, "move");
        self.pointer = (x, y);
        Ok(())
    }

    fn press(&mut self, input: &Input) -> PlatformResult<()> {
        info!(%input, "press");
        Ok(())
    }

    fn release(&mut self, input: &Input) -> PlatformResult<()> {
        info!(%input, "release");
        Ok(())
    }

    fn pointer_position(&mut self) -> Option<(i32, i32)> {
        Some(self.pointer)
    }
}

#[cfg(feature = "inject")]
pub use enigo_backend::EnigoInjector;

#[cfg(feature = "inject")]
mod enigo_backend {
    use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

    use super::{InputInjector, PlatformError, PlatformResult};
    use crate::input::{Input, KeyCode, MouseButton, NamedKey};

    pub struct EnigoInjector {
        enigo: Enigo,
    }

    impl EnigoInjector {
        pub fn new() -> PlatformResult<Self> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|err| PlatformError::Injection(err.to_string()))?;
            Ok(EnigoInjector { enigo })
        }

        fn send(&mut self, input: &Input, direction: Direction) -> PlatformResult<()> {
            let result = match input {
                Input::Button(button) => self.enigo.button(map_button(*button), direction),
                Input::Key(code) => self.enigo.key(map_key(*code)?, direction),
            };
            result.map_err(|err| PlatformError::Injection(err.to_string()))
        }
    }

    fn map_button(button: MouseButton) -> Button {
        match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
            MouseButton::Middle => Button::Middle,
        }
    }

    fn map_key(code: KeyCode) -> PlatformResult<Key> {
        let named = match code {
            KeyCode::Char(ch) => return Ok(Key::Unicode(ch)),
            KeyCode::Named(named) => named,
        };
        Ok(match named {
            NamedKey::Enter => Key::Return,
            NamedKey::Esc => Key::Escape,
            NamedKey::Tab => Key::Tab,
            NamedKey::Space => Key::Space,
            NamedKey::Backspace => Key::Backspace,
            NamedKey::Delete => Key::Delete,
            #[cfg(not(target_os = "macos"))]
            NamedKey::Insert => Key::Insert,
            #[cfg(target_os = "macos")]
            NamedKey::Insert => return Err(PlatformError::Unsupported("insert".to_string())),
            NamedKey::Home => Key::Home,
            NamedKey::End => Key::End,
            NamedKey::PageUp => Key::PageUp,
            NamedKey::PageDown => Key::PageDown,
            NamedKey::Up => Key::UpArrow,
            NamedKey::Down => Key::DownArrow,
            NamedKey::Left => Key::LeftArrow,
            NamedKey::Right => Key::RightArrow,
            NamedKey::Shift => Key::Shift,
            NamedKey::Ctrl => Key::Control,
            NamedKey::Alt => Key::Alt,
            NamedKey::Cmd => Key::Meta,
            NamedKey::CapsLock => Key::CapsLock,
            NamedKey::NumLock
            | NamedKey::ScrollLock
            | NamedKey::PrintScreen
            | NamedKey::Pause
            | NamedKey::Menu
            | NamedKey::MediaPlayPause
            | NamedKey::MediaNext
            | NamedKey::MediaPrevious
            | NamedKey::VolumeUp
            | NamedKey::VolumeDown
            | NamedKey::VolumeMute => return Err(PlatformError::Unsupported(named.name())),
            NamedKey::F(1) => Key::F1,
            NamedKey::F(2) => Key::F2,
            NamedKey::F(3) => Key::F3,
            NamedKey::F(4) => Key::F4,
            NamedKey::F(5) => Key::F5,
            NamedKey::F(6) => Key::F6,
            NamedKey::F(7) => Key::F7,
            NamedKey::F(8) => Key::F8,
            NamedKey::F(9) => Key::F9,
            NamedKey::F(10) => Key::F10,
            NamedKey::F(11) => Key::F11,
            NamedKey::F(12) => Key::F12,
            NamedKey::F(n) => return Err(PlatformError::Unsupported(format!("f{n}"))),
        })
    }

    impl InputInjector for EnigoInjector {
        fn move_pointer_to(&mut self, x: i32, y: i32) -> PlatformResult<()> {
            self.enigo
                .move_mouse(x, y, Coordinate::Abs)
                .map_err(|err| PlatformError::Injection(err.to_string()))
        }

        fn press(&mut self, input: &Input) -> PlatformResult<()> {
            self.send(input, Direction::Press)
        }

        fn release(&mut self, input: &Input) -> PlatformResult<()> {
            self.send(input, Direction::Release)
        }

        fn pointer_position(&mut self) -> Option<(i32, i32)> {
            self.enigo.location().ok()
        }
    }
}

pub fn command_exists(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {name} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use image::Rgb as Pixel;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Injected {
        Move(i32, i32),
        Press(Input),
        Release(Input),
    }

    /// Records every injected call; clones share the log.
    #[derive(Clone, Debug, Default)]
    pub struct MockInjector {
        pub log: Arc<Mutex<Vec<Injected>>>,
    }

    impl MockInjector {
        pub fn events(&self) -> Vec<Injected> {
            self.log.lock().unwrap().clone()
        }

        pub fn moves(&self) -> Vec<(i32, i32)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Injected::Move(x, y) => Some((x, y)),
                    _ => None,
                })
                .collect()
        }

        pub fn presses_of(&self, input: &str) -> usize {
            let input: Input = input.parse().unwrap();
            self.events()
                .iter()
                .filter(|e| **e == Injected::Press(input))
                .count()
        }

        /// Inputs pressed and not yet released.
        pub fn held(&self) -> Vec<Input> {
            let mut held = Vec::new();
            for event in self.events() {
                match event {
                    Injected::Press(input) => held.push(input),
                    Injected::Release(input) => {
                        if let Some(pos) = held.iter().rposition(|h| *h == input) {
                            held.remove(pos);
                        }
                    }
                    Injected::Move(..) => {}
                }
            }
            held
        }
    }

    impl InputInjector for MockInjector {
        fn move_pointer_to(&mut self, x: i32, y: i32) -> PlatformResult<()> {
            self.log.lock().unwrap().push(Injected::Move(x, y));
            Ok(())
        }

        fn press(&mut self, input: &Input) -> PlatformResult<()> {
            self.log.lock().unwrap().push(Injected::Press(*input));
            Ok(())
        }

        fn release(&mut self, input: &Input) -> PlatformResult<()> {
            self.log.lock().unwrap().push(Injected::Release(*input));
            Ok(())
        }
    }

    pub fn screen_with(w: u32, h: u32, fill: [u8; 3], paint: &[(u32, u32, [u8; 3])]) -> ImageFileSource {
        let mut image = RgbImage::from_pixel(w, h, Pixel(fill));
        for (x, y, color) in paint {
            image.put_pixel(*x, *y, Pixel(*color));
        }
        ImageFileSource::from_image(DynamicImage::ImageRgb8(image))
    }

    #[test]
    fn image_source_clips_and_offsets_grabs() {
        let mut screen = screen_with(20, 10, [0, 0, 0], &[(15, 5, [9, 9, 9])]);
        let grid = screen
            .grab(Rect {
                min_x: 10,
                max_x: 40,
                min_y: -5,
                max_y: 7,
            })
            .unwrap();
        assert_eq!(grid.origin(), (10, 0));
        assert_eq!(grid.width(), 10);
        assert_eq!(grid.height(), 8);
        assert_eq!(grid.get(15, 5), Some(Rgb([9, 9, 9])));
        assert_eq!(screen.get_pixel(15, 5).unwrap(), Rgb([9, 9, 9]));
        assert!(matches!(
            screen.get_pixel(50, 5),
            Err(PlatformError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn dry_run_tracks_pointer() {
        let mut injector = DryRunInjector::default();
        injector.move_pointer_to(4, 7).unwrap();
        assert_eq!(injector.pointer_position(), Some((4, 7)));
    }

    #[test]
    fn image_source_loads_png_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        RgbImage::from_pixel(4, 4, Pixel([1, 2, 3])).save(&path).unwrap();
        let mut screen = ImageFileSource::open(&path).unwrap();
        assert_eq!(screen.get_pixel(3, 3).unwrap(), Rgb([1, 2, 3]));
    }
}
