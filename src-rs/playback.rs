//! The playback engine: an instruction-pointer interpreter over a compiled
//! [`Program`], run on a dedicated worker thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionKind, Policy, Rect, Rgb, SelectionMode};
use crate::config::{PlaybackSettings, RepeatMode};
use crate::input::{Input, InputChord};
use crate::path::{move_with_miss, split_delay, MoveSeed};
use crate::platform::{InputInjector, PlatformError, PlatformResult, ScreenSource};
use crate::program::{Jump, Program};
use crate::region::{find_target, TargetQuery};
use crate::sleep::{interruptible_sleep, CancelToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Starting,
    Running,
    Finished,
    Aborted,
    Cancelled,
}

impl PlaybackState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlaybackState::Finished | PlaybackState::Aborted | PlaybackState::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Finished,
    Aborted(String),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlaybackReport {
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Completed passes over the whole macro.
    pub iterations: u32,
    /// Actions started, counting loop repetitions.
    pub actions_executed: u64,
    pub seed: u64,
}

/// Shared view of the engine state for the foreground.
#[derive(Clone, Debug)]
pub struct StateCell(Arc<Mutex<PlaybackState>>);

impl Default for StateCell {
    fn default() -> Self {
        StateCell(Arc::new(Mutex::new(PlaybackState::Idle)))
    }
}

impl StateCell {
    pub fn get(&self) -> PlaybackState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, state: PlaybackState) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

#[derive(Clone, Debug, PartialEq)]
struct LoopFrame {
    start_index: usize,
    remaining: u32,
    name: String,
}

/// Everything one run mutates. Never outlives the run.
pub struct PlaybackContext {
    ip: usize,
    loop_stack: Vec<LoopFrame>,
    pointer: (f64, f64),
    held: Vec<Input>,
    cancel: CancelToken,
    rng: StdRng,
    run_seed: u64,
    moves: u64,
}

impl PlaybackContext {
    fn new(pointer: (f64, f64), cancel: CancelToken, run_seed: u64) -> Self {
        PlaybackContext {
            ip: 0,
            loop_stack: Vec::new(),
            pointer,
            held: Vec::new(),
            cancel,
            rng: StdRng::seed_from_u64(run_seed),
            run_seed,
            moves: 0,
        }
    }

    fn next_move_seed(&mut self) -> MoveSeed {
        let seed = MoveSeed::from_run(self.run_seed, self.moves);
        self.moves += 1;
        seed
    }
}

enum Flow {
    Next,
    Jump(usize),
    Restart,
    Abort(String),
    Cancelled,
}

enum IterationEnd {
    Completed,
    Deadline,
    Cancelled,
    Aborted(String),
}

fn uniform<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

pub struct Engine<'a> {
    program: &'a Program,
    settings: &'a PlaybackSettings,
    injector: &'a mut dyn InputInjector,
    screen: Option<&'a mut dyn ScreenSource>,
    state: StateCell,
    ctx: PlaybackContext,
    executed: u64,
}

impl<'a> Engine<'a> {
    pub fn new(
        program: &'a Program,
        settings: &'a PlaybackSettings,
        injector: &'a mut dyn InputInjector,
        screen: Option<&'a mut dyn ScreenSource>,
        cancel: CancelToken,
        state: StateCell,
    ) -> Self {
        let run_seed = settings.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let pointer = injector
            .pointer_position()
            .map(|(x, y)| (f64::from(x), f64::from(y)))
            .unwrap_or((0.0, 0.0));
        Engine {
            program,
            settings,
            injector,
            screen,
            state,
            ctx: PlaybackContext::new(pointer, cancel, run_seed),
            executed: 0,
        }
    }

    /// Runs the pre-roll and every repetition, then releases anything still
    /// held no matter how the run ended.
    pub fn run(&mut self) -> PlaybackReport {
        self.state.set(PlaybackState::Starting);
        info!(
            actions = self.program.len(),
            seed = self.ctx.run_seed,
            "playback starting in {:.1}s",
            self.settings.pre_roll
        );

        let (outcome, iterations) = if !interruptible_sleep(self.settings.pre_roll, &self.ctx.cancel) {
            (Outcome::Cancelled, 0)
        } else {
            self.state.set(PlaybackState::Running);
            self.repeat()
        };

        self.release_all();
        self.state.set(match outcome {
            Outcome::Finished => PlaybackState::Finished,
            Outcome::Aborted(_) => PlaybackState::Aborted,
            Outcome::Cancelled => PlaybackState::Cancelled,
        });
        match &outcome {
            Outcome::Aborted(reason) => warn!(%reason, "playback aborted"),
            other => info!(?other, iterations, actions = self.executed, "playback ended"),
        }

        PlaybackReport {
            outcome,
            iterations,
            actions_executed: self.executed,
            seed: self.ctx.run_seed,
        }
    }

    fn repeat(&mut self) -> (Outcome, u32) {
        if self.program.is_empty() {
            return (Outcome::Finished, 0);
        }
        // A budget too large for `Instant` runs until stopped.
        let deadline = match self.settings.repeat {
            RepeatMode::Minutes(minutes) => Duration::try_from_secs_f64((minutes * 60.0).max(0.0))
                .ok()
                .and_then(|budget| Instant::now().checked_add(budget)),
            RepeatMode::Loops(_) => None,
        };

        let mut iterations = 0u32;
        loop {
            match self.iteration(deadline) {
                IterationEnd::Completed => iterations += 1,
                IterationEnd::Deadline => return (Outcome::Finished, iterations),
                IterationEnd::Cancelled => return (Outcome::Cancelled, iterations),
                IterationEnd::Aborted(reason) => return (Outcome::Aborted(reason), iterations),
            }
            if let RepeatMode::Loops(count) = self.settings.repeat {
                if iterations >= count {
                    return (Outcome::Finished, iterations);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return (Outcome::Finished, iterations);
            }
            if self.ctx.cancel.is_cancelled() {
                return (Outcome::Cancelled, iterations);
            }
        }
    }

    fn iteration(&mut self, deadline: Option<Instant>) -> IterationEnd {
        self.ctx.ip = 0;
        self.ctx.loop_stack.clear();

        while self.ctx.ip < self.program.len() {
            if self.ctx.cancel.is_cancelled() {
                return IterationEnd::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return IterationEnd::Deadline;
            }

            let index = self.ctx.ip;
            self.executed += 1;
            let flow = match self.step(index) {
                Ok(flow) => flow,
                Err(err) => Flow::Abort(format!("action {index}: {err}")),
            };
            match flow {
                Flow::Next => self.ctx.ip += 1,
                Flow::Jump(target) => self.ctx.ip = target,
                Flow::Restart => {
                    debug!(index, "restarting from the first action");
                    self.release_all();
                    self.ctx.ip = 0;
                    self.ctx.loop_stack.clear();
                }
                Flow::Abort(reason) => return IterationEnd::Aborted(reason),
                Flow::Cancelled => return IterationEnd::Cancelled,
            }
        }
        IterationEnd::Completed
    }

    fn sample_delay(&mut self, action: &Action) -> f64 {
        uniform(&mut self.ctx.rng, action.min_delay, action.max_delay) * self.settings.time_scale()
    }

    fn sleep(&self, secs: f64) -> bool {
        interruptible_sleep(secs, &self.ctx.cancel)
    }

    fn step(&mut self, index: usize) -> Result<Flow, PlatformError> {
        let program = self.program;
        let action = &program.actions()[index];
        let delay = self.sample_delay(action);
        debug!(index, kind = action.type_name(), delay, "step");

        // A move spends its delay partly travelling; everything else waits first.
        if let ActionKind::MouseMove { rect } = &action.kind {
            return self.mouse_move(rect, delay);
        }
        if !self.sleep(delay) {
            return Ok(Flow::Cancelled);
        }

        match &action.kind {
            ActionKind::KeyAction {
                key,
                min_hold,
                max_hold,
            } => self.key_action(key, *min_hold, *max_hold),
            ActionKind::MouseMove { .. } => Ok(Flow::Next),
            ActionKind::ColorCheck {
                expected_color,
                x,
                y,
                on_fail,
            } => self.color_check(index, *expected_color, point(*x, *y), *on_fail),
            ActionKind::MouseToColor {
                expected_color,
                rect,
                min_move_delay,
                max_move_delay,
                on_fail,
                border_margin_percent,
                selection_mode,
            } => {
                let query = ColorTarget {
                    color: *expected_color,
                    rect: *rect,
                    mode: *selection_mode,
                    margin: *border_margin_percent,
                    move_delay: (*min_move_delay, *max_move_delay),
                };
                self.mouse_to_color(index, &query, *on_fail)
            }
            ActionKind::LoopStart {
                name,
                min_loops,
                max_loops,
            } => {
                let count = self.ctx.rng.gen_range(*min_loops..=(*max_loops).max(*min_loops));
                debug!(name = %name, count, "loop start");
                self.ctx.loop_stack.push(LoopFrame {
                    start_index: index,
                    remaining: count,
                    name: name.clone(),
                });
                Ok(Flow::Next)
            }
            ActionKind::LoopEnd { name } => Ok(self.loop_end(index, name)),
            ActionKind::IfColorStart {
                expected_color,
                x,
                y,
            } => {
                let holds = match self.color_matches(*expected_color, point(*x, *y)) {
                    Some(matched) => matched,
                    None => {
                        warn!(index, "no screen capture; taking the false branch");
                        false
                    }
                };
                if holds {
                    return Ok(Flow::Next);
                }
                Ok(match program.jump(index) {
                    Jump::If {
                        else_at: Some(else_at),
                        ..
                    } => Flow::Jump(else_at + 1),
                    Jump::If { end, .. } => Flow::Jump(end + 1),
                    other => Flow::Abort(format!("if_color_start at action {index} has no partner ({other:?})")),
                })
            }
            ActionKind::Else => Ok(match program.jump(index) {
                Jump::Else { end } => Flow::Jump(end + 1),
                other => Flow::Abort(format!("else at action {index} has no partner ({other:?})")),
            }),
            ActionKind::IfEnd => Ok(Flow::Next),
            ActionKind::Wait { on_end } => Ok(self.wait_end(index, *on_end)),
        }
    }

    fn key_action(&mut self, key: &str, min_hold: f64, max_hold: f64) -> Result<Flow, PlatformError> {
        let partial = match InputChord::parse_lenient(key) {
            Ok(partial) => partial,
            Err(err) => {
                warn!(key, %err, "skipping unresolvable key");
                return Ok(Flow::Next);
            }
        };
        for name in &partial.unknown {
            warn!(key, name = %name, "skipping unknown key name");
        }

        let mut pressed = Vec::with_capacity(partial.chord.inputs.len());
        for input in &partial.chord.inputs {
            match self.injector.press(input) {
                Ok(()) => {}
                Err(PlatformError::Unsupported(what)) => {
                    warn!(%input, what = %what, "backend cannot inject key; skipping");
                    continue;
                }
                Err(err) => return Err(err),
            }
            self.ctx.held.push(*input);
            pressed.push(*input);
        }
        let hold = uniform(&mut self.ctx.rng, min_hold, max_hold) * self.settings.time_scale();
        let completed = self.sleep(hold);
        for input in pressed.iter().rev() {
            self.injector.release(input)?;
            if let Some(pos) = self.ctx.held.iter().rposition(|h| h == input) {
                self.ctx.held.remove(pos);
            }
        }
        Ok(if completed { Flow::Next } else { Flow::Cancelled })
    }

    fn mouse_move(&mut self, rect: &Rect, delay: f64) -> Result<Flow, PlatformError> {
        let current = self.ctx.pointer;
        let dest = if rect.contains(current.0, current.1) {
            current
        } else {
            (
                uniform(&mut self.ctx.rng, f64::from(rect.min_x), f64::from(rect.max_x)),
                uniform(&mut self.ctx.rng, f64::from(rect.min_y), f64::from(rect.max_y)),
            )
        };
        let dist = (dest.0 - current.0).hypot(dest.1 - current.1);
        let scale = self.settings.time_scale();
        let (pause, move_time) = split_delay(
            delay,
            dist,
            self.settings.min_seconds_per_pixel * scale,
            self.settings.max_seconds_per_pixel * scale,
        );
        if !self.sleep(pause) {
            return Ok(Flow::Cancelled);
        }
        if dist > 0.0 {
            self.move_pointer(dest, move_time)?;
        }
        Ok(if self.ctx.cancel.is_cancelled() {
            Flow::Cancelled
        } else {
            Flow::Next
        })
    }

    fn move_pointer(&mut self, dest: (f64, f64), duration: f64) -> Result<(), PlatformError> {
        if !self.settings.humanize {
            self.injector
                .move_pointer_to(dest.0.round() as i32, dest.1.round() as i32)?;
            self.ctx.pointer = dest;
            return Ok(());
        }
        let mut rng = self.ctx.next_move_seed().rng();
        let reached = move_with_miss(
            &mut *self.injector,
            &self.ctx.cancel,
            self.ctx.pointer,
            dest,
            duration,
            &mut rng,
        )?;
        self.ctx.pointer = reached;
        Ok(())
    }

    /// `None` when no screen is available or the capture failed.
    fn color_matches(&mut self, expected: Rgb, at: Option<(i32, i32)>) -> Option<bool> {
        let (x, y) = at.unwrap_or((
            self.ctx.pointer.0.round() as i32,
            self.ctx.pointer.1.round() as i32,
        ));
        let screen = self.screen.as_mut()?;
        match screen.get_pixel(x, y) {
            Ok(actual) => {
                debug!(x, y, %actual, %expected, "color sample");
                Some(actual == expected)
            }
            Err(err) => {
                warn!(%err, "color sample failed");
                None
            }
        }
    }

    fn color_check(
        &mut self,
        index: usize,
        expected: Rgb,
        at: Option<(i32, i32)>,
        on_fail: Policy,
    ) -> Result<Flow, PlatformError> {
        loop {
            match self.color_matches(expected, at) {
                None => {
                    warn!(index, "skipping color check: screen capture unavailable");
                    return Ok(Flow::Next);
                }
                Some(true) => return Ok(Flow::Next),
                Some(false) => {}
            }
            match on_fail {
                Policy::Continue => return Ok(Flow::Next),
                Policy::Abort => {
                    return Ok(Flow::Abort(format!(
                        "color check failed at action {index}: expected {expected}"
                    )));
                }
                Policy::Restart => return Ok(Flow::Restart),
                Policy::Wait => {
                    if !self.sleep(self.settings.poll_interval) {
                        return Ok(Flow::Cancelled);
                    }
                }
            }
        }
    }

    fn mouse_to_color(&mut self, index: usize, target: &ColorTarget, on_fail: Policy) -> Result<Flow, PlatformError> {
        loop {
            let Some(screen) = self.screen.as_mut() else {
                warn!(index, "skipping mouse_to_color: screen capture unavailable");
                return Ok(Flow::Next);
            };
            let grid = match screen.grab(target.rect) {
                Ok(grid) => grid,
                Err(err) => {
                    warn!(index, %err, "skipping mouse_to_color: capture failed");
                    return Ok(Flow::Next);
                }
            };
            let query = TargetQuery {
                color: target.color,
                mode: target.mode,
                border_margin_percent: target.margin,
                pointer: self.ctx.pointer,
            };
            if let Some((x, y)) = find_target(&grid, &query, &mut self.ctx.rng) {
                let duration = uniform(&mut self.ctx.rng, target.move_delay.0, target.move_delay.1)
                    * self.settings.time_scale();
                debug!(index, x, y, duration, "color target found");
                self.move_pointer((f64::from(x), f64::from(y)), duration)?;
                return Ok(Flow::Next);
            }
            match on_fail {
                Policy::Continue => return Ok(Flow::Next),
                Policy::Abort => {
                    return Ok(Flow::Abort(format!(
                        "color {} not found at action {index}",
                        target.color
                    )));
                }
                Policy::Restart => return Ok(Flow::Restart),
                Policy::Wait => {
                    if !self.sleep(self.settings.poll_interval) {
                        return Ok(Flow::Cancelled);
                    }
                }
            }
        }
    }

    fn loop_end(&mut self, index: usize, name: &str) -> Flow {
        let Some(frame) = self.ctx.loop_stack.last_mut() else {
            return Flow::Abort(format!("mismatched loop at action {index}: '{name}' has no open loop"));
        };
        if frame.name != name {
            return Flow::Abort(format!(
                "mismatched loop at action {index}: '{name}' closes '{}'",
                frame.name
            ));
        }
        if frame.remaining > 1 {
            frame.remaining -= 1;
            return Flow::Jump(frame.start_index + 1);
        }
        self.ctx.loop_stack.pop();
        Flow::Next
    }

    fn wait_end(&mut self, index: usize, on_end: Policy) -> Flow {
        match on_end {
            Policy::Continue => Flow::Next,
            Policy::Abort => Flow::Abort(format!("wait at action {index} ended playback")),
            Policy::Restart => Flow::Restart,
            Policy::Wait => {
                info!(index, "waiting until stopped");
                while self.sleep(self.settings.poll_interval.max(0.001)) {}
                Flow::Cancelled
            }
        }
    }

    fn release_all(&mut self) {
        while let Some(input) = self.ctx.held.pop() {
            if let Err(err) = self.injector.release(&input) {
                warn!(%input, %err, "failed to release held input");
            }
        }
    }
}

struct ColorTarget {
    color: Rgb,
    rect: Rect,
    mode: SelectionMode,
    margin: f64,
    move_delay: (f64, f64),
}

fn point(x: Option<i32>, y: Option<i32>) -> Option<(i32, i32)> {
    x.zip(y)
}

/// Builds the input injector on the worker thread, since some backends hold
/// handles that cannot move between threads.
pub type InjectorFactory = Box<dyn FnOnce() -> PlatformResult<Box<dyn InputInjector>> + Send>;

/// Foreground handle to a playback worker.
pub struct PlaybackHandle {
    cancel: CancelToken,
    state: StateCell,
    done: Receiver<PlaybackReport>,
    thread: Option<JoinHandle<()>>,
}

fn rejected(reason: String, seed: Option<u64>) -> PlaybackReport {
    PlaybackReport {
        outcome: Outcome::Aborted(reason),
        iterations: 0,
        actions_executed: 0,
        seed: seed.unwrap_or_default(),
    }
}

impl PlaybackHandle {
    /// Compiles `actions` and plays them on a new worker thread. Structural
    /// errors, or an injector that cannot be built, end the run before any
    /// action executes.
    pub fn spawn(
        actions: Vec<Action>,
        settings: PlaybackSettings,
        make_injector: InjectorFactory,
        mut screen: Option<Box<dyn ScreenSource>>,
    ) -> Self {
        let cancel = CancelToken::new();
        let state = StateCell::default();
        let (tx, done) = mpsc::channel();

        let worker_cancel = cancel.clone();
        let worker_state = state.clone();
        let thread = thread::spawn(move || {
            let prepared = Program::compile(actions)
                .map_err(|err| err.to_string())
                .and_then(|program| {
                    make_injector()
                        .map(|injector| (program, injector))
                        .map_err(|err| format!("input injection unavailable: {err}"))
                });
            let report = match prepared {
                Ok((program, mut injector)) => {
                    let screen: Option<&mut dyn ScreenSource> = match screen.as_mut() {
                        Some(screen) => Some(&mut **screen),
                        None => None,
                    };
                    Engine::new(
                        &program,
                        &settings,
                        &mut *injector,
                        screen,
                        worker_cancel,
                        worker_state,
                    )
                    .run()
                }
                Err(reason) => {
                    warn!(%reason, "playback rejected before the first action");
                    worker_state.set(PlaybackState::Aborted);
                    rejected(reason, settings.seed)
                }
            };
            let _ = tx.send(report);
        });

        PlaybackHandle {
            cancel,
            state,
            done,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    /// Blocks until the run ends on its own (or via the cancel token).
    pub fn wait(mut self) -> PlaybackReport {
        let report = self
            .done
            .recv()
            .unwrap_or_else(|_| rejected("playback worker exited without a report".to_string(), None));
        self.join();
        report
    }

    /// Cancels the run and waits at most `timeout` for the worker to wind
    /// down. Returns `None` if it did not report in time.
    pub fn stop(mut self, timeout: Duration) -> Option<PlaybackReport> {
        self.cancel.cancel();
        match self.done.recv_timeout(timeout) {
            Ok(report) => {
                self.join();
                Some(report)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "playback worker did not stop in time; detaching");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                None
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("playback worker panicked");
            }
        }
    }
}
