//! Overlay of a macro's screen zones on a screenshot, for checking that
//! recorded rectangles and probe points still line up with the UI.

use std::path::Path;

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, Pixel, Rgba, RgbaImage};
use serde::Serialize;

use crate::action::{Action, ActionKind, Rect, Rgb};
use crate::storage::ensure_parent_dir;

const MOVE_COLOR: Rgba<u8> = Rgba([40, 140, 255, 255]);
const PROBE_COLOR: Rgba<u8> = Rgba([255, 60, 200, 255]);
const LABEL_BG: Rgba<u8> = Rgba([0, 0, 0, 170]);
const LABEL_FG: Rgba<u8> = Rgba([255, 255, 255, 255]);
const PROBE_ARM: i32 = 6;

/// One drawn zone, echoed in the JSON summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Zone {
    pub index: usize,
    pub kind: &'static str,
    pub rect: Rect,
    /// Partly or wholly outside the screenshot.
    pub clipped: bool,
}

/// Every action that refers to a screen location, in program order.
pub fn zones(actions: &[Action], width: u32, height: u32) -> Vec<Zone> {
    actions
        .iter()
        .enumerate()
        .filter_map(|(index, action)| {
            let rect = match &action.kind {
                ActionKind::MouseMove { rect } | ActionKind::MouseToColor { rect, .. } => *rect,
                ActionKind::ColorCheck {
                    x: Some(x),
                    y: Some(y),
                    ..
                }
                | ActionKind::IfColorStart {
                    x: Some(x),
                    y: Some(y),
                    ..
                } => Rect::point(*x, *y),
                _ => return None,
            };
            let clipped = rect.min_x < 0
                || rect.min_y < 0
                || rect.max_x >= width as i32
                || rect.max_y >= height as i32;
            Some(Zone {
                index,
                kind: action.type_name(),
                rect,
                clipped,
            })
        })
        .collect()
}

/// Draws every zone onto a copy of `screenshot`, labelled with its action index.
pub fn render(screenshot: &DynamicImage, actions: &[Action]) -> (RgbaImage, Vec<Zone>) {
    let mut img = screenshot.to_rgba8();
    let zones = zones(actions, img.width(), img.height());

    let mut canvas = Canvas(&mut img);
    for zone in &zones {
        let color = match &actions[zone.index].kind {
            ActionKind::MouseMove { .. } => MOVE_COLOR,
            ActionKind::MouseToColor { expected_color, .. } => contrast_outline(*expected_color),
            _ => PROBE_COLOR,
        };
        let rect = zone.rect;
        if rect.width() == 1 && rect.height() == 1 {
            canvas.crosshair(rect.min_x, rect.min_y, color);
        } else {
            canvas.outline(rect, color, 2);
        }
        canvas.label(rect.min_x + 3, (rect.min_y - 12).max(0), &format!("#{}", zone.index));
    }
    (img, zones)
}

pub fn save_png(img: RgbaImage, out_path: &Path) -> Result<()> {
    ensure_parent_dir(out_path)
        .with_context(|| format!("failed to create parent directory of {}", out_path.display()))?;
    DynamicImage::ImageRgba8(img)
        .save(out_path)
        .with_context(|| format!("failed to save preview image: {}", out_path.display()))
}

/// The zone's own color when it stands out; otherwise black or white.
fn contrast_outline(color: Rgb) -> Rgba<u8> {
    let [r, g, b] = color.0;
    let luma = (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)) / 255.0;
    if luma > 0.85 {
        Rgba([0, 0, 0, 255])
    } else if luma < 0.15 {
        Rgba([255, 255, 255, 255])
    } else {
        Rgba([r, g, b, 255])
    }
}

/// Screen-coordinate drawing that silently drops anything off the image.
struct Canvas<'a>(&'a mut RgbaImage);

impl Canvas<'_> {
    fn pixel_mut(&mut self, x: i32, y: i32) -> Option<&mut Rgba<u8>> {
        let (x, y) = (u32::try_from(x).ok()?, u32::try_from(y).ok()?);
        if x < self.0.width() && y < self.0.height() {
            Some(self.0.get_pixel_mut(x, y))
        } else {
            None
        }
    }

    fn plot(&mut self, x: i32, y: i32, color: Rgba<u8>) {
        if let Some(px) = self.pixel_mut(x, y) {
            *px = color;
        }
    }

    fn blend(&mut self, x: i32, y: i32, color: Rgba<u8>) {
        if let Some(px) = self.pixel_mut(x, y) {
            px.blend(&color);
        }
    }

    /// `thickness` rings grown outward from the rectangle's own edge.
    fn outline(&mut self, rect: Rect, color: Rgba<u8>, thickness: i32) {
        for ring in 0..thickness.max(1) {
            let (left, top) = (rect.min_x - ring, rect.min_y - ring);
            let (right, bottom) = (rect.max_x + ring, rect.max_y + ring);
            for x in left..=right {
                self.plot(x, top, color);
                self.plot(x, bottom, color);
            }
            for y in top..=bottom {
                self.plot(left, y, color);
                self.plot(right, y, color);
            }
        }
    }

    fn crosshair(&mut self, x: i32, y: i32, color: Rgba<u8>) {
        // The probed pixel and its direct neighbours stay visible.
        for d in (2..=PROBE_ARM).flat_map(|d| [d, -d]) {
            self.plot(x + d, y, color);
            self.plot(x, y + d, color);
        }
    }

    /// White 8x8 glyphs on a translucent plate with a two-pixel margin.
    fn label(&mut self, x: i32, y: i32, text: &str) {
        let width = 8 * text.chars().count() as i32;
        for py in y - 2..=y + 8 {
            for px in x - 2..=x + width {
                self.blend(px, py, LABEL_BG);
            }
        }
        for (slot, ch) in text.chars().enumerate() {
            let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')).unwrap_or([0; 8]);
            let left = x + 8 * slot as i32;
            for (row, bits) in (0i32..).zip(glyph) {
                for col in (0..8).filter(|&col| (bits >> col) & 1 == 1) {
                    self.plot(left + col, y + row, LABEL_FG);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Policy, SelectionMode};
    use tempfile::tempdir;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([128, 128, 128, 255])))
    }

    fn sample_actions() -> Vec<Action> {
        vec![
            Action::key("a"),
            Action::new(ActionKind::MouseMove {
                rect: Rect {
                    min_x: 20,
                    max_x: 60,
                    min_y: 30,
                    max_y: 50,
                },
            }),
            Action::new(ActionKind::ColorCheck {
                expected_color: Rgb([255, 0, 0]),
                x: Some(10),
                y: Some(10),
                on_fail: Policy::Abort,
            }),
            Action::new(ActionKind::ColorCheck {
                expected_color: Rgb([255, 0, 0]),
                x: None,
                y: None,
                on_fail: Policy::Abort,
            }),
            Action::new(ActionKind::MouseToColor {
                expected_color: Rgb([0, 200, 0]),
                rect: Rect {
                    min_x: 90,
                    max_x: 150,
                    min_y: 0,
                    max_y: 20,
                },
                min_move_delay: 0.1,
                max_move_delay: 0.2,
                on_fail: Policy::Continue,
                border_margin_percent: 10.0,
                selection_mode: SelectionMode::Random,
            }),
        ]
    }

    #[test]
    fn zones_cover_located_actions_only() {
        let zones = zones(&sample_actions(), 100, 100);
        let indices: Vec<usize> = zones.iter().map(|z| z.index).collect();
        assert_eq!(indices, vec![1, 2, 4]);
        assert!(!zones[0].clipped);
        assert!(zones[2].clipped);
        assert_eq!(zones[1].rect, Rect::point(10, 10));
    }

    #[test]
    fn render_outlines_rectangles_and_keeps_probe_pixel() {
        let (img, zones) = render(&blank(100, 100), &sample_actions());
        assert_eq!(zones.len(), 3);
        // Bottom edge of the move rectangle sits outside any label.
        assert_eq!(*img.get_pixel(40, 50), MOVE_COLOR);
        assert_eq!(*img.get_pixel(10, 10), Rgba([128, 128, 128, 255]));
        assert_eq!(*img.get_pixel(10, 14), PROBE_COLOR);
    }

    #[test]
    fn labels_sit_on_a_translucent_plate() {
        let (img, _) = render(&blank(100, 100), &sample_actions());
        // Zone #1 is labelled at (23, 18); the plate starts two pixels out.
        let plate = *img.get_pixel(21, 16);
        assert!(plate[0] < 128 && plate[0] > 0, "plate {plate:?}");
        assert_eq!(plate[3], 255);
        // The second row of '#' lights columns 1, 2, 4 and 5.
        let glyph_row: Vec<Rgba<u8>> = (23..31).map(|x| *img.get_pixel(x, 19)).collect();
        assert!(glyph_row.contains(&LABEL_FG));
    }

    #[test]
    fn save_png_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a").join("b").join("preview.png");
        let (img, _) = render(&blank(32, 32), &[]);
        save_png(img, &out).unwrap();
        let reloaded = image::open(&out).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (32, 32));
    }
}
