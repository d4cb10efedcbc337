//! Humanized pointer movement: the wind-model path generator, the overshoot
//! ("miss") planner, and the executor that walks a pointer along a path.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::platform::{InputInjector, PlatformResult};
use crate::sleep::{interruptible_sleep, CancelToken};

const SQRT_3: f64 = 1.732_050_807_568_877_2;
const SQRT_5: f64 = 2.236_067_977_499_79;

/// Hard cap on integration steps; normal paths finish in a few hundred.
const MAX_STEPS: usize = 10_000;

pub const MISS_PROBABILITY: f64 = 0.3;
/// Slowest allowed traversal for a path that includes a miss.
pub const MISS_MIN_SECONDS_PER_PIXEL: f64 = 0.0008;
const MISS_MIN_DISTANCE: f64 = 10.0;
const MISS_PAUSE: (f64, f64) = (0.05, 0.15);
const MISS_RADIUS_FRACTION: (f64, f64) = (0.04, 0.10);
const MISS_RADIUS_PX: (f64, f64) = (3.0, 40.0);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindParams {
    /// Pull toward the destination.
    pub gravity: f64,
    /// Wind fluctuation magnitude.
    pub wind: f64,
    /// Velocity clip.
    pub max_step: f64,
    /// Distance below which wind is damped and the clip shrinks.
    pub damping_distance: f64,
}

impl Default for WindParams {
    fn default() -> Self {
        WindParams {
            gravity: 9.0,
            wind: 3.0,
            max_step: 15.0,
            damping_distance: 12.0,
        }
    }
}

/// Lazy waypoint generator. Yields integer positions each time the rounded
/// position changes and always ends on the rounded destination.
pub struct WindPath<R: Rng> {
    rng: R,
    params: WindParams,
    pos: (f64, f64),
    dest: (f64, f64),
    velocity: (f64, f64),
    wind: (f64, f64),
    max_step: f64,
    last: (i32, i32),
    steps: usize,
    finished: bool,
}

impl<R: Rng> WindPath<R> {
    pub fn new(start: (f64, f64), dest: (f64, f64), params: WindParams, rng: R) -> Self {
        WindPath {
            rng,
            params,
            pos: start,
            dest,
            velocity: (0.0, 0.0),
            wind: (0.0, 0.0),
            max_step: params.max_step,
            last: round_point(start),
            steps: 0,
            finished: false,
        }
    }

    fn finish(&mut self) -> Option<(i32, i32)> {
        self.finished = true;
        let target = round_point(self.dest);
        if self.last != target {
            self.last = target;
            return Some(target);
        }
        None
    }
}

impl<R: Rng> Iterator for WindPath<R> {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let dx = self.dest.0 - self.pos.0;
            let dy = self.dest.1 - self.pos.1;
            let dist = dx.hypot(dy);
            if dist < 1.0 || self.steps >= MAX_STEPS {
                return self.finish();
            }
            self.steps += 1;

            let wind_mag = self.params.wind.min(dist);
            if dist >= self.params.damping_distance {
                let wx = (2.0 * self.rng.gen::<f64>() - 1.0) * wind_mag / SQRT_5;
                let wy = (2.0 * self.rng.gen::<f64>() - 1.0) * wind_mag / SQRT_5;
                self.wind = (self.wind.0 / SQRT_3 + wx, self.wind.1 / SQRT_3 + wy);
            } else {
                self.wind = (self.wind.0 / SQRT_3, self.wind.1 / SQRT_3);
                if self.max_step < 3.0 {
                    self.max_step = self.rng.gen::<f64>() * 3.0 + 3.0;
                } else {
                    self.max_step /= SQRT_5;
                }
            }

            self.velocity.0 += self.wind.0 + self.params.gravity * dx / dist;
            self.velocity.1 += self.wind.1 + self.params.gravity * dy / dist;
            let speed = self.velocity.0.hypot(self.velocity.1);
            if speed > self.max_step {
                let clip = self.max_step / 2.0 + self.rng.gen::<f64>() * self.max_step / 2.0;
                self.velocity = (
                    self.velocity.0 / speed * clip,
                    self.velocity.1 / speed * clip,
                );
            }

            self.pos.0 += self.velocity.0;
            self.pos.1 += self.velocity.1;
            let rounded = round_point(self.pos);
            if rounded != self.last {
                self.last = rounded;
                return Some(rounded);
            }
        }
    }
}

fn round_point(p: (f64, f64)) -> (i32, i32) {
    (p.0.round() as i32, p.1.round() as i32)
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (b.0 - a.0).hypot(b.1 - a.1)
}

/// Seed source for individual moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveSeed(pub u64);

impl MoveSeed {
    /// Derives the seed of the `counter`-th move of a run.
    pub fn from_run(run_seed: u64, counter: u64) -> Self {
        MoveSeed(splitmix64(run_seed ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Collects the full path; mostly useful for inspection and tests.
pub fn generate_path(start: (f64, f64), dest: (f64, f64), seed: MoveSeed) -> Vec<(i32, i32)> {
    WindPath::new(start, dest, WindParams::default(), seed.rng()).collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Miss {
    pub point: (f64, f64),
    pub pause: f64,
    /// Time for the leg to the miss point; the second leg gets the rest.
    pub first_leg: f64,
    pub second_leg: f64,
}

/// Decides whether a move of `duration` seconds overshoots first.
pub fn plan_miss<R: Rng>(
    start: (f64, f64),
    dest: (f64, f64),
    duration: f64,
    rng: &mut R,
) -> Option<Miss> {
    let direct = distance(start, dest);
    if direct < MISS_MIN_DISTANCE || duration <= 0.0 {
        return None;
    }
    if rng.gen::<f64>() >= MISS_PROBABILITY {
        return None;
    }

    let angle = rng.gen_range(0.0..2.0 * PI);
    let radius = (direct * rng.gen_range(MISS_RADIUS_FRACTION.0..=MISS_RADIUS_FRACTION.1))
        .clamp(MISS_RADIUS_PX.0, MISS_RADIUS_PX.1);
    let point = (dest.0 + radius * angle.cos(), dest.1 + radius * angle.sin());
    let pause = rng.gen_range(MISS_PAUSE.0..=MISS_PAUSE.1);

    let d1 = distance(start, point);
    let d2 = distance(point, dest);
    let moving = duration - pause;
    if moving <= 0.0 || moving / (d1 + d2) < MISS_MIN_SECONDS_PER_PIXEL {
        return None;
    }

    let first_leg = moving * d1 / (d1 + d2);
    Some(Miss {
        point,
        pause,
        first_leg,
        second_leg: moving - first_leg,
    })
}

/// Moves the pointer along one generated path, spreading `duration` evenly
/// over the waypoints. Returns the last position reached.
pub fn human_move(
    injector: &mut dyn InputInjector,
    cancel: &CancelToken,
    start: (f64, f64),
    dest: (f64, f64),
    duration: f64,
    seed: MoveSeed,
) -> PlatformResult<(f64, f64)> {
    if duration <= 0.0 || distance(start, dest) < 1.0 {
        let (x, y) = round_point(dest);
        injector.move_pointer_to(x, y)?;
        return Ok(dest);
    }

    let path = generate_path(start, dest, seed);
    if path.is_empty() {
        let (x, y) = round_point(dest);
        injector.move_pointer_to(x, y)?;
        return Ok(dest);
    }

    let step_time = duration / path.len() as f64;
    let mut reached = start;
    for (x, y) in path {
        if cancel.is_cancelled() {
            break;
        }
        injector.move_pointer_to(x, y)?;
        reached = (f64::from(x), f64::from(y));
        interruptible_sleep(step_time, cancel);
    }
    Ok(reached)
}

/// Full humanized move: optional miss, pause, correction.
pub fn move_with_miss<R: Rng>(
    injector: &mut dyn InputInjector,
    cancel: &CancelToken,
    start: (f64, f64),
    dest: (f64, f64),
    duration: f64,
    rng: &mut R,
) -> PlatformResult<(f64, f64)> {
    let Some(miss) = plan_miss(start, dest, duration, rng) else {
        return human_move(injector, cancel, start, dest, duration, MoveSeed(rng.gen()));
    };

    debug!(
        miss_x = miss.point.0,
        miss_y = miss.point.1,
        pause = miss.pause,
        "overshooting before final approach"
    );
    let reached = human_move(
        injector,
        cancel,
        start,
        miss.point,
        miss.first_leg,
        MoveSeed(rng.gen()),
    )?;
    if !interruptible_sleep(miss.pause, cancel) {
        return Ok(reached);
    }
    human_move(
        injector,
        cancel,
        reached,
        dest,
        miss.second_leg,
        MoveSeed(rng.gen()),
    )
}

/// Time budget for moving `dist` pixels out of a sampled delay, bounded per
/// pixel. Returns `(pause, move_time)`.
pub fn split_delay(delay: f64, dist: f64, min_spp: f64, max_spp: f64) -> (f64, f64) {
    if dist < 1.0 {
        return (delay.max(0.0), 0.0);
    }
    let lo = dist * min_spp;
    let hi = (dist * max_spp).max(lo);
    let move_time = delay.clamp(lo, hi);
    ((delay - move_time).max(0.0), move_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::MockInjector;
    use rand::rngs::StdRng;

    #[test]
    fn path_terminates_on_destination() {
        for (i, dest) in [(500.0, 300.0), (-40.0, 12.0), (3.0, 1.0), (1000.0, 0.0)]
            .into_iter()
            .enumerate()
        {
            let path = generate_path((0.0, 0.0), dest, MoveSeed(i as u64));
            assert!(!path.is_empty());
            assert!(path.len() < MAX_STEPS);
            assert_eq!(*path.last().unwrap(), round_point(dest));
        }
    }

    #[test]
    fn same_seed_gives_same_path() {
        let a = generate_path((10.0, 10.0), (400.0, 250.0), MoveSeed(7));
        let b = generate_path((10.0, 10.0), (400.0, 250.0), MoveSeed(7));
        assert_eq!(a, b);
    }

    #[test]
    fn waypoints_change_on_every_emit() {
        let path = generate_path((0.0, 0.0), (300.0, 200.0), MoveSeed(3));
        for pair in path.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn run_seeds_differ_per_move_and_repeat_per_run() {
        assert_ne!(MoveSeed::from_run(1, 0), MoveSeed::from_run(1, 1));
        assert_ne!(MoveSeed::from_run(1, 0), MoveSeed::from_run(2, 0));
        assert_eq!(MoveSeed::from_run(5, 3), MoveSeed::from_run(5, 3));
    }

    #[test]
    fn zero_duration_jumps_directly() {
        let mut injector = MockInjector::default();
        let cancel = CancelToken::new();
        let end = human_move(
            &mut injector,
            &cancel,
            (0.0, 0.0),
            (200.0, 100.0),
            0.0,
            MoveSeed(1),
        )
        .unwrap();
        assert_eq!(end, (200.0, 100.0));
        assert_eq!(injector.moves(), vec![(200, 100)]);
    }

    #[test]
    fn human_move_walks_every_waypoint() {
        let mut injector = MockInjector::default();
        let cancel = CancelToken::new();
        let expected = generate_path((0.0, 0.0), (120.0, 80.0), MoveSeed(9));
        human_move(
            &mut injector,
            &cancel,
            (0.0, 0.0),
            (120.0, 80.0),
            0.02,
            MoveSeed(9),
        )
        .unwrap();
        assert_eq!(injector.moves(), expected);
    }

    #[test]
    fn cancelled_move_stops_early() {
        let mut injector = MockInjector::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        human_move(
            &mut injector,
            &cancel,
            (0.0, 0.0),
            (500.0, 500.0),
            1.0,
            MoveSeed(2),
        )
        .unwrap();
        assert!(injector.moves().is_empty());
    }

    #[test]
    fn miss_respects_speed_floor_and_splits_duration() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut planned = 0;
        for _ in 0..200 {
            if let Some(miss) = plan_miss((0.0, 0.0), (400.0, 0.0), 2.0, &mut rng) {
                planned += 1;
                assert!((miss.first_leg + miss.second_leg + miss.pause - 2.0).abs() < 1e-9);
                assert!(miss.first_leg > miss.second_leg);
            }
        }
        assert!(planned > 20 && planned < 120, "planned {planned}");

        // 400 px in 0.1 s is far faster than the floor allows.
        for _ in 0..200 {
            assert!(plan_miss((0.0, 0.0), (400.0, 0.0), 0.1, &mut rng).is_none());
        }
        // Short hops never miss.
        assert!(plan_miss((0.0, 0.0), (5.0, 0.0), 5.0, &mut rng).is_none());
    }

    #[test]
    fn miss_overshoots_then_settles_on_destination() {
        let (start, dest, duration) = ((0.0, 0.0), (200.0, 0.0), 0.4);
        let (seed, miss) = (0..1000u64)
            .find_map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                plan_miss(start, dest, duration, &mut rng).map(|miss| (seed, miss))
            })
            .expect("some seed overshoots");

        let mut injector = MockInjector::default();
        let cancel = CancelToken::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let end = move_with_miss(&mut injector, &cancel, start, dest, duration, &mut rng).unwrap();

        let moves = injector.moves();
        let overshoot = round_point(miss.point);
        assert_ne!(overshoot, round_point(dest));
        let turn = moves.iter().position(|p| *p == overshoot).expect("path visits the miss point");
        assert!(turn < moves.len() - 1);
        assert_eq!(*moves.last().unwrap(), (200, 0));
        assert_eq!(end, (200.0, 0.0));
    }

    #[test]
    fn split_delay_bounds_move_time_per_pixel() {
        let (pause, mv) = split_delay(1.0, 100.0, 0.001, 0.004);
        assert!((pause - 0.6).abs() < 1e-9);
        assert!((mv - 0.4).abs() < 1e-9);
        let (pause, mv) = split_delay(0.05, 100.0, 0.001, 0.004);
        assert_eq!(pause, 0.0);
        assert!((mv - 0.1).abs() < 1e-9);
        assert_eq!(split_delay(0.3, 0.0, 0.001, 0.004), (0.3, 0.0));
    }
}
