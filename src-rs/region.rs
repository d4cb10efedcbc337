//! Color region analysis: find pixels of an exact color inside a captured
//! rectangle, group them into 4-connected components and pick a target point.

use std::collections::VecDeque;

use image::RgbImage;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::action::{Rgb, SelectionMode};

/// A captured rectangle of the screen. `origin` is the screen position of the
/// top-left pixel.
#[derive(Clone, Debug)]
pub struct PixelGrid {
    origin: (i32, i32),
    image: RgbImage,
}

impl PixelGrid {
    pub fn new(origin: (i32, i32), image: RgbImage) -> Self {
        PixelGrid { origin, image }
    }

    pub fn origin(&self) -> (i32, i32) {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Color at a screen coordinate, if it lies inside the grid.
    pub fn get(&self, x: i32, y: i32) -> Option<Rgb> {
        let gx = u32::try_from(i64::from(x) - i64::from(self.origin.0)).ok()?;
        let gy = u32::try_from(i64::from(y) - i64::from(self.origin.1)).ok()?;
        if gx >= self.width() || gy >= self.height() {
            return None;
        }
        Some(Rgb(self.image.get_pixel(gx, gy).0))
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    fn mask(&self, color: Rgb) -> Vec<bool> {
        self.image.pixels().map(|p| p.0 == color.0).collect()
    }
}

/// Placement constraints for [`find_target`].
#[derive(Clone, Copy, Debug)]
pub struct TargetQuery {
    pub color: Rgb,
    pub mode: SelectionMode,
    pub border_margin_percent: f64,
    /// Current pointer in screen coordinates, for closest/furthest.
    pub pointer: (f64, f64),
}

/// Grid-local pixel coordinates of one group of matching pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub pixels: Vec<(u32, u32)>,
}

impl Component {
    fn centroid(&self) -> (f64, f64) {
        let n = self.pixels.len().max(1) as f64;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + f64::from(*x), sy + f64::from(*y)));
        (sx / n, sy / n)
    }

    fn bbox(&self) -> (u32, u32, u32, u32) {
        let mut minx = u32::MAX;
        let mut miny = u32::MAX;
        let mut maxx = 0u32;
        let mut maxy = 0u32;
        for &(x, y) in &self.pixels {
            minx = minx.min(x);
            miny = miny.min(y);
            maxx = maxx.max(x);
            maxy = maxy.max(y);
        }
        (minx, miny, maxx, maxy)
    }
}

/// 4-connected components of `mask`, in row-major order of their first pixel.
pub fn connected_components(mask: &[bool], width: u32, height: u32) -> Vec<Component> {
    let total = (width as usize) * (height as usize);
    let mut visited = vec![false; total];
    let mut components = Vec::new();

    for start in 0..total {
        if visited[start] || !mask[start] {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited[start] = true;
        let mut pixels = Vec::new();

        while let Some(node) = queue.pop_front() {
            let cx = (node as u32) % width;
            let cy = (node as u32) / width;
            pixels.push((cx, cy));

            let mut visit = |next: usize| {
                if mask[next] && !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            };
            if cx > 0 {
                visit(node - 1);
            }
            if cx + 1 < width {
                visit(node + 1);
            }
            if cy > 0 {
                visit(node - width as usize);
            }
            if cy + 1 < height {
                visit(node + width as usize);
            }
        }

        components.push(Component { pixels });
    }

    components
}

/// Finds a point of `query.color` inside `grid` honoring the selection mode and
/// border margin. Returns screen coordinates, or `None` when no pixel matches.
pub fn find_target<R: Rng>(grid: &PixelGrid, query: &TargetQuery, rng: &mut R) -> Option<(i32, i32)> {
    let mask = grid.mask(query.color);
    let (width, height) = (grid.width(), grid.height());

    let chosen = if query.mode == SelectionMode::First {
        let pixels: Vec<(u32, u32)> = mask
            .iter()
            .enumerate()
            .filter(|(_, hit)| **hit)
            .map(|(idx, _)| ((idx as u32) % width, (idx as u32) / width))
            .collect();
        if pixels.is_empty() {
            return None;
        }
        Component { pixels }
    } else {
        let components = connected_components(&mask, width, height);
        let local_pointer = (
            query.pointer.0 - f64::from(grid.origin.0),
            query.pointer.1 - f64::from(grid.origin.1),
        );
        choose_component(components, query.mode, local_pointer, rng)?
    };

    let pick = if query.mode == SelectionMode::First {
        Pick::First
    } else {
        Pick::Uniform
    };
    let (x, y) = place_in_component(&chosen, query.border_margin_percent, pick, rng)?;
    Some((grid.origin.0 + x as i32, grid.origin.1 + y as i32))
}

fn choose_component<R: Rng>(
    components: Vec<Component>,
    mode: SelectionMode,
    pointer: (f64, f64),
    rng: &mut R,
) -> Option<Component> {
    if components.is_empty() {
        return None;
    }
    if mode == SelectionMode::Random {
        let idx = rng.gen_range(0..components.len());
        return components.into_iter().nth(idx);
    }

    let distances: Vec<f64> = components
        .iter()
        .map(|c| {
            let (cx, cy) = c.centroid();
            (cx - pointer.0).hypot(cy - pointer.1)
        })
        .collect();
    let mut best = 0;
    for (idx, dist) in distances.iter().enumerate().skip(1) {
        let better = match mode {
            SelectionMode::Closest => *dist < distances[best],
            _ => *dist > distances[best],
        };
        if better {
            best = idx;
        }
    }
    components.into_iter().nth(best)
}

/// Normalized distance to the nearest edge on one axis: 1.0 at the center,
/// 0.0 on the edge. A zero-extent axis counts as centered.
fn axis_margin(p: u32, min: u32, max: u32) -> f64 {
    if max == min {
        return 1.0;
    }
    let near = f64::from(p - min);
    let far = f64::from(max - p);
    2.0 * near.min(far) / f64::from(max - min)
}

/// How to break ties among pixels that clear the margin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pick {
    /// Earliest in row-major order.
    First,
    Uniform,
}

impl Pick {
    fn choose_from<R: Rng>(self, pixels: &[(u32, u32)], rng: &mut R) -> Option<(u32, u32)> {
        match self {
            Pick::First => pixels.first().copied(),
            Pick::Uniform => pixels.choose(rng).copied(),
        }
    }
}

fn place_in_component<R: Rng>(
    component: &Component,
    border_margin_percent: f64,
    pick: Pick,
    rng: &mut R,
) -> Option<(u32, u32)> {
    if component.pixels.is_empty() {
        return None;
    }
    let (minx, miny, maxx, maxy) = component.bbox();

    if border_margin_percent >= 50.0 {
        let cx = (f64::from(minx) + f64::from(maxx)) / 2.0;
        let cy = (f64::from(miny) + f64::from(maxy)) / 2.0;
        let mut best = component.pixels[0];
        let mut best_dist = f64::INFINITY;
        for &(x, y) in &component.pixels {
            let dist = (f64::from(x) - cx).hypot(f64::from(y) - cy);
            if dist < best_dist {
                best_dist = dist;
                best = (x, y);
            }
        }
        return Some(best);
    }

    let threshold = border_margin_percent.max(0.0) / 100.0;
    let scored: Vec<((u32, u32), f64)> = component
        .pixels
        .iter()
        .map(|&(x, y)| {
            let score = axis_margin(x, minx, maxx).min(axis_margin(y, miny, maxy));
            ((x, y), score)
        })
        .collect();

    let passing: Vec<(u32, u32)> = scored
        .iter()
        .filter(|(_, score)| *score >= threshold)
        .map(|(p, _)| *p)
        .collect();
    if let Some(p) = pick.choose_from(&passing, rng) {
        return Some(p);
    }

    let top = scored
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::NEG_INFINITY, f64::max);
    let best: Vec<(u32, u32)> = scored
        .iter()
        .filter(|(_, score)| *score == top)
        .map(|(p, _)| *p)
        .collect();
    pick.choose_from(&best, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb as Pixel;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const RED: Rgb = Rgb([255, 0, 0]);

    fn grid_with(w: u32, h: u32, origin: (i32, i32), red: &[(u32, u32)]) -> PixelGrid {
        let mut image = RgbImage::from_pixel(w, h, Pixel([255, 255, 255]));
        for &(x, y) in red {
            image.put_pixel(x, y, Pixel(RED.0));
        }
        PixelGrid::new(origin, image)
    }

    fn block(x0: u32, y0: u32, w: u32, h: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                out.push((x, y));
            }
        }
        out
    }

    fn query(mode: SelectionMode, margin: f64, pointer: (f64, f64)) -> TargetQuery {
        TargetQuery {
            color: RED,
            mode,
            border_margin_percent: margin,
            pointer,
        }
    }

    #[test]
    fn components_use_four_connectivity() {
        // Diagonal neighbours are separate components.
        let mut mask = vec![false; 9];
        mask[0] = true;
        mask[4] = true;
        mask[5] = true;
        let components = connected_components(&mask, 3, 3);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].pixels, vec![(0, 0)]);
        assert_eq!(components[1].pixels.len(), 2);
    }

    #[test]
    fn empty_mask_is_not_found() {
        let grid = grid_with(10, 10, (0, 0), &[]);
        let mut rng = StdRng::seed_from_u64(1);
        for mode in [
            SelectionMode::First,
            SelectionMode::Random,
            SelectionMode::Closest,
            SelectionMode::Furthest,
        ] {
            assert_eq!(find_target(&grid, &query(mode, 0.0, (0.0, 0.0)), &mut rng), None);
        }
    }

    #[test]
    fn closest_and_furthest_pick_by_centroid_distance() {
        let mut red = block(1, 1, 3, 3);
        red.extend(block(30, 30, 3, 3));
        let grid = grid_with(40, 40, (100, 200), &red);
        let mut rng = StdRng::seed_from_u64(2);

        let near = find_target(&grid, &query(SelectionMode::Closest, 50.0, (100.0, 200.0)), &mut rng);
        assert_eq!(near, Some((102, 202)));

        let far = find_target(&grid, &query(SelectionMode::Furthest, 50.0, (100.0, 200.0)), &mut rng);
        assert_eq!(far, Some((131, 231)));
    }

    #[test]
    fn half_margin_returns_center_pixel() {
        let grid = grid_with(20, 20, (0, 0), &block(4, 6, 5, 7));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let hit = find_target(&grid, &query(SelectionMode::Random, 50.0, (0.0, 0.0)), &mut rng);
            assert_eq!(hit, Some((6, 9)));
        }
    }

    #[test]
    fn margin_keeps_points_away_from_edges() {
        let grid = grid_with(30, 30, (0, 0), &block(0, 0, 21, 21));
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let (x, y) = find_target(&grid, &query(SelectionMode::Random, 40.0, (0.0, 0.0)), &mut rng)
                .unwrap();
            // 2 * min(d, 20 - d) / 20 >= 0.4  =>  4 <= d <= 16
            assert!((4..=16).contains(&x), "x = {x}");
            assert!((4..=16).contains(&y), "y = {y}");
        }
    }

    #[test]
    fn unreachable_margin_falls_back_to_best_pixels() {
        // An L shape: the bbox center is not part of the component.
        let mut red = block(0, 0, 9, 1);
        red.extend(block(0, 1, 1, 8));
        let grid = grid_with(10, 10, (0, 0), &red);
        let mut rng = StdRng::seed_from_u64(5);
        let hit = find_target(&grid, &query(SelectionMode::Random, 45.0, (0.0, 0.0)), &mut rng)
            .unwrap();
        // Every pixel of the L has score 0 on one axis, so all tie at 0.
        assert!(red.contains(&(hit.0 as u32, hit.1 as u32)));
    }

    #[test]
    fn first_mode_returns_earliest_match_in_scan_order() {
        let grid = grid_with(9, 9, (0, 0), &[(8, 8), (4, 0), (0, 3)]);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let hit = find_target(&grid, &query(SelectionMode::First, 0.0, (0.0, 0.0)), &mut rng);
            assert_eq!(hit, Some((4, 0)), "seed {seed}");
        }
    }

    #[test]
    fn first_mode_with_margin_is_deterministic() {
        let grid = grid_with(10, 10, (0, 0), &block(2, 2, 8, 8));
        let mut rng = StdRng::seed_from_u64(1);
        let expected = find_target(&grid, &query(SelectionMode::First, 30.0, (0.0, 0.0)), &mut rng);
        for seed in 2..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(
                find_target(&grid, &query(SelectionMode::First, 30.0, (0.0, 0.0)), &mut rng),
                expected
            );
        }
        // The block spans 2..=9; a 30% margin needs two pixels of clearance.
        assert_eq!(expected, Some((4, 4)));
    }

    #[test]
    fn grid_get_maps_screen_coordinates() {
        let grid = grid_with(4, 4, (10, 20), &[(1, 2)]);
        assert_eq!(grid.get(11, 22), Some(RED));
        assert_eq!(grid.get(9, 22), None);
        assert_eq!(grid.get(14, 20), None);
    }
}
