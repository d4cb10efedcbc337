mod action;
mod config;
mod input;
mod path;
mod platform;
mod playback;
mod preview;
mod program;
mod recording;
mod region;
mod sleep;
mod storage;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::action::{Action, ActionKind, Rect};
use crate::config::{out_root, PlaybackSettings, RecordSettings, RepeatMode};
use crate::input::InputChord;
use crate::platform::{
    CommandScreenSource, DryRunInjector, ImageFileSource, InputInjector, PlatformResult, ScreenSource,
};
use crate::playback::{InjectorFactory, Outcome, PlaybackHandle};
use crate::program::Program;
use crate::recording::{post_process, RawEvent};
use crate::storage::{ensure_parent_dir, load_macro, save_macro};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    name = "wind-macro",
    version,
    about = "Record and replay input macros with humanized timing and pointer paths"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a macro file; press Enter to stop
    Play(PlayArgs),
    /// Check every action and the loop/if nesting of a macro file
    Validate(ValidateArgs),
    /// Turn a raw event trace (JSON) into a macro
    Process(ProcessArgs),
    /// Record global input until Escape and save it as a macro
    Record(RecordArgs),
    /// Draw each action's screen zone onto a screenshot
    Preview(PreviewArgs),
    /// Print the color of one screen pixel
    #[command(name = "pick-color")]
    PickColor(PickColorArgs),
}

#[derive(Args, Debug)]
struct PlayArgs {
    /// Macro JSON path
    macro_path: PathBuf,
    /// Play the whole macro this many times
    #[arg(long, conflicts_with = "minutes")]
    repeat: Option<u32>,
    /// Keep repeating for this many minutes
    #[arg(long)]
    minutes: Option<f64>,
    /// Playback speed in percent (100 = recorded speed)
    #[arg(long, env = "WIND_MACRO_SPEED", default_value_t = 100.0)]
    speed: f64,
    /// Seconds to wait before the first action
    #[arg(long, default_value_t = 3.0)]
    pre_roll: f64,
    /// Fixed seed for reproducible timing and paths
    #[arg(long, env = "WIND_MACRO_SEED")]
    seed: Option<u64>,
    /// Read colors from this screenshot instead of the live screen
    #[arg(long)]
    screen_image: Option<PathBuf>,
    /// Jump the pointer instead of following generated paths
    #[arg(long, action = ArgAction::SetTrue)]
    no_humanize: bool,
    /// Log inputs instead of injecting them
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Print settings and the playback report as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Macro JSON path
    macro_path: PathBuf,
    /// Print the report as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct RecordTuning {
    /// Keep only clicks and key presses, with delay ranges
    #[arg(long, action = ArgAction::SetTrue)]
    sparse: bool,
    /// Half-width of the zone a sparse click expands into
    #[arg(long, default_value_t = 5)]
    click_radius: i32,
    /// Seconds added to each sparse max_delay
    #[arg(long, default_value_t = 0.2)]
    extra_slack: f64,
}

impl RecordTuning {
    fn settings(&self) -> RecordSettings {
        RecordSettings {
            sparse: self.sparse,
            click_radius: self.click_radius,
            extra_slack: self.extra_slack,
        }
    }
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Raw event trace JSON path
    trace: PathBuf,
    #[command(flatten)]
    tuning: RecordTuning,
    /// Output macro path (default: <out-root>/macros/macro-<ts>.json)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RecordArgs {
    #[command(flatten)]
    tuning: RecordTuning,
    /// Output macro path (default: <out-root>/macros/macro-<ts>.json)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Also save the raw event trace here
    #[arg(long)]
    raw_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    /// Macro JSON path
    macro_path: PathBuf,
    /// Draw onto this screenshot instead of capturing the screen
    #[arg(long)]
    screen_image: Option<PathBuf>,
    /// Output PNG path (default: <out-root>/preview/preview-<ts>.png)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Print image path and zones as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct PickColorArgs {
    x: i32,
    y: i32,
    /// Read from this screenshot instead of the live screen
    #[arg(long)]
    screen_image: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => command_play(args),
        Commands::Validate(args) => command_validate(args),
        Commands::Process(args) => command_process(args),
        Commands::Record(args) => command_record(args),
        Commands::Preview(args) => command_preview(args),
        Commands::PickColor(args) => command_pick_color(args),
    }
}

fn playback_settings(args: &PlayArgs) -> Result<PlaybackSettings> {
    if !(args.speed > 0.0) {
        bail!("--speed must be greater than 0 (got {})", args.speed);
    }
    if args.pre_roll < 0.0 {
        bail!("--pre-roll must not be negative");
    }
    let repeat = match (args.repeat, args.minutes) {
        (_, Some(minutes)) if !(minutes > 0.0) => bail!("--minutes must be greater than 0"),
        (_, Some(minutes)) => RepeatMode::Minutes(minutes),
        (Some(0), None) => bail!("--repeat must be at least 1"),
        (Some(count), None) => RepeatMode::Loops(count),
        (None, None) => RepeatMode::Loops(1),
    };
    Ok(PlaybackSettings {
        repeat,
        speed_percent: args.speed,
        pre_roll: args.pre_roll,
        humanize: !args.no_humanize,
        seed: args.seed,
        ..PlaybackSettings::default()
    })
}

fn open_screen(screen_image: Option<&Path>) -> Result<Box<dyn ScreenSource>> {
    match screen_image {
        Some(path) => Ok(Box::new(ImageFileSource::open(path)?)),
        None => Ok(Box::new(
            CommandScreenSource::detect().context("no screen capture available; pass --screen-image")?,
        )),
    }
}

#[cfg(feature = "inject")]
fn live_injector() -> Result<InjectorFactory> {
    Ok(Box::new(|| -> PlatformResult<Box<dyn InputInjector>> {
        Ok(Box::new(crate::platform::EnigoInjector::new()?))
    }))
}

#[cfg(not(feature = "inject"))]
fn live_injector() -> Result<InjectorFactory> {
    bail!("built without input injection; rebuild with `--features inject` or pass --dry-run")
}

fn command_play(args: PlayArgs) -> Result<()> {
    let settings = playback_settings(&args)?;
    let actions = load_macro(&args.macro_path)?;

    let screen = match open_screen(args.screen_image.as_deref()) {
        Ok(screen) => Some(screen),
        Err(err) if args.screen_image.is_none() => {
            warn!("{err:#}; color actions will be skipped");
            None
        }
        Err(err) => return Err(err),
    };
    let injector: InjectorFactory = if args.dry_run {
        Box::new(|| -> PlatformResult<Box<dyn InputInjector>> {
            Ok(Box::new(DryRunInjector::default()))
        })
    } else {
        live_injector()?
    };

    info!(
        path = %args.macro_path.display(),
        actions = actions.len(),
        "press Enter to stop playback"
    );
    let handle = PlaybackHandle::spawn(actions, settings.clone(), injector, screen);

    let (enter_tx, enter_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        if matches!(io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            let _ = enter_tx.send(());
        }
    });

    let report = loop {
        if handle.state().is_terminal() {
            break Some(handle.wait());
        }
        match enter_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                info!("stop requested");
                break handle.stop(STOP_TIMEOUT);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // stdin closed: keep playing until the run ends by itself.
            Err(mpsc::RecvTimeoutError::Disconnected) => break Some(handle.wait()),
        }
    };
    let Some(report) = report else {
        bail!("playback did not stop within {STOP_TIMEOUT:?}");
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string(&json!({
                "macro": args.macro_path,
                "settings": settings,
                "report": report,
                "finished_at": timestamp_iso(),
            }))?
        );
    } else {
        println!(
            "{:?}: {} iteration(s), {} action(s), seed {}",
            report.outcome, report.iterations, report.actions_executed, report.seed
        );
    }

    if let Outcome::Aborted(reason) = report.outcome {
        bail!("playback aborted: {reason}");
    }
    Ok(())
}

fn validation_report(actions: &[Action]) -> Vec<Value> {
    let mut problems: Vec<Value> = actions
        .iter()
        .enumerate()
        .filter_map(|(index, action)| {
            action
                .validate()
                .err()
                .map(|err| {
                    json!({
                        "index": index,
                        "type": action.type_name(),
                        "details": action.details(),
                        "error": err.to_string(),
                    })
                })
        })
        .collect();
    if problems.is_empty() {
        if let Err(err) = Program::compile(actions.to_vec()) {
            problems.push(json!({"index": Value::Null, "type": "structure", "error": err.to_string()}));
        }
    }
    problems
}

/// Key names playback will skip because no backend knows them.
fn unknown_key_warnings(actions: &[Action]) -> Vec<Value> {
    actions
        .iter()
        .enumerate()
        .filter_map(|(index, action)| match &action.kind {
            ActionKind::KeyAction { key, .. } => InputChord::parse_lenient(key)
                .ok()
                .filter(|partial| !partial.unknown.is_empty())
                .map(|partial| json!({"index": index, "key": key, "unknown": partial.unknown})),
            _ => None,
        })
        .collect()
}

fn command_validate(args: ValidateArgs) -> Result<()> {
    let actions = load_macro(&args.macro_path)?;
    let problems = validation_report(&actions);
    let warnings = unknown_key_warnings(&actions);
    for warning in &warnings {
        warn!(index = %warning["index"], key = %warning["key"], "unknown key names will be skipped");
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string(&json!({
                "macro": args.macro_path,
                "actions": actions.len(),
                "valid": problems.is_empty(),
                "problems": problems,
                "warnings": warnings,
            }))?
        );
    } else if problems.is_empty() {
        for (index, action) in actions.iter().enumerate() {
            println!("#{index}\t{}", action.details());
        }
        println!("ok: {} action(s)", actions.len());
    } else {
        for problem in &problems {
            let index = problem["index"]
                .as_u64()
                .map(|i| format!("#{i}"))
                .unwrap_or_else(|| "-".to_string());
            let shown = problem["details"].as_str().or_else(|| problem["type"].as_str());
            println!(
                "{index}\t{}\t{}",
                shown.unwrap_or_default(),
                problem["error"].as_str().unwrap_or_default()
            );
        }
    }

    if !problems.is_empty() {
        bail!("{} problem(s) in {}", problems.len(), args.macro_path.display());
    }
    Ok(())
}

fn default_macro_path() -> PathBuf {
    out_root()
        .join("macros")
        .join(format!("macro-{}.json", timestamp_compact()))
}

fn finish_recording(events: &[RawEvent], tuning: &RecordTuning, out: Option<PathBuf>) -> Result<()> {
    let settings = tuning.settings();
    let actions = post_process(events, settings.mode());
    let out = out.unwrap_or_else(default_macro_path);
    save_macro(&out, &actions)?;
    info!(
        events = events.len(),
        actions = actions.len(),
        sparse = settings.sparse,
        "macro saved"
    );
    println!("{}", out.display());
    Ok(())
}

fn command_process(args: ProcessArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.trace)
        .with_context(|| format!("failed to read trace: {}", args.trace.display()))?;
    let events: Vec<RawEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid trace JSON: {}", args.trace.display()))?;
    finish_recording(&events, &args.tuning, args.out)
}

#[cfg(feature = "capture")]
fn command_record(args: RecordArgs) -> Result<()> {
    info!("recording; press Escape to stop");
    let events = crate::recording::record_until_escape()?;
    if let Some(raw_out) = &args.raw_out {
        write_json_pretty(raw_out, &serde_json::to_value(&events)?)?;
    }
    finish_recording(&events, &args.tuning, args.out)
}

#[cfg(not(feature = "capture"))]
fn command_record(_args: RecordArgs) -> Result<()> {
    bail!("built without input capture; rebuild with `--features capture`")
}

/// Screen area that covers every zone, anchored at the origin.
fn zones_extent(actions: &[Action]) -> Rect {
    let zones = preview::zones(actions, u32::MAX, u32::MAX);
    Rect {
        min_x: 0,
        max_x: zones.iter().map(|z| z.rect.max_x).max().unwrap_or(0).max(0),
        min_y: 0,
        max_y: zones.iter().map(|z| z.rect.max_y).max().unwrap_or(0).max(0),
    }
}

fn command_preview(args: PreviewArgs) -> Result<()> {
    let actions = load_macro(&args.macro_path)?;
    let screenshot = match &args.screen_image {
        Some(path) => image::open(path)
            .with_context(|| format!("failed to open screenshot: {}", path.display()))?,
        None => {
            let mut screen = open_screen(None)?;
            let grid = screen.grab(zones_extent(&actions))?;
            image::DynamicImage::ImageRgb8(grid.into_image())
        }
    };

    let (img, zones) = preview::render(&screenshot, &actions);
    let out = args.out.unwrap_or_else(|| {
        out_root()
            .join("preview")
            .join(format!("preview-{}.png", timestamp_compact()))
    });
    preview::save_png(img, &out)?;

    let clipped = zones.iter().filter(|z| z.clipped).count();
    if clipped > 0 {
        warn!(clipped, "some zones fall outside the screenshot");
    }
    if args.json {
        println!(
            "{}",
            serde_json::to_string(&json!({"image_path": out, "zones": zones}))?
        );
    } else {
        println!("{}", out.display());
    }
    Ok(())
}

fn command_pick_color(args: PickColorArgs) -> Result<()> {
    let mut screen = open_screen(args.screen_image.as_deref())?;
    let color = screen
        .get_pixel(args.x, args.y)
        .with_context(|| format!("failed to read pixel ({}, {})", args.x, args.y))?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string(&json!({"x": args.x, "y": args.y, "color": color}))?
        );
    } else {
        println!("{color}");
    }
    Ok(())
}

#[cfg(any(test, feature = "capture"))]
fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)
        .with_context(|| format!("failed to create parent directory of {}", path.display()))?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn play_args_build_settings() {
        let cli = Cli::try_parse_from([
            "wind-macro", "play", "m.json", "--minutes", "2.5", "--speed", "150", "--seed", "7",
            "--no-humanize", "--pre-roll", "0",
        ])
        .unwrap();
        let Commands::Play(args) = cli.command else {
            panic!("expected play");
        };
        let settings = playback_settings(&args).unwrap();
        assert_eq!(settings.repeat, RepeatMode::Minutes(2.5));
        assert_eq!(settings.speed_percent, 150.0);
        assert_eq!(settings.seed, Some(7));
        assert!(!settings.humanize);
        assert_eq!(settings.pre_roll, 0.0);
    }

    #[test]
    fn play_rejects_conflicting_or_bad_repeat() {
        assert!(Cli::try_parse_from(["wind-macro", "play", "m.json", "--repeat", "2", "--minutes", "1"]).is_err());

        let cli = Cli::try_parse_from(["wind-macro", "play", "m.json", "--speed", "0"]).unwrap();
        let Commands::Play(args) = cli.command else {
            panic!("expected play");
        };
        assert!(playback_settings(&args).is_err());
    }

    #[test]
    fn validation_report_lists_field_then_structure_problems() {
        let bad_field = vec![Action::key("a").with_delay(2.0, 1.0), Action::loop_end("x")];
        let problems = validation_report(&bad_field);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0]["index"], 0);

        let bad_nesting = vec![Action::loop_start("x", 1, 1), Action::key("a")];
        let problems = validation_report(&bad_nesting);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0]["type"], "structure");

        assert!(validation_report(&[Action::key("a")]).is_empty());
    }

    #[test]
    fn validation_names_the_failing_action() {
        let problems = validation_report(&[Action::key("q").with_delay(2.0, 1.0)]);
        assert_eq!(problems[0]["details"], "Press key: q");
    }

    #[test]
    fn unknown_key_names_warn_without_failing_validation() {
        let actions = vec![Action::key("a"), Action::key("ctrl + Key.launch_app2")];
        assert!(validation_report(&actions).is_empty());
        let warnings = unknown_key_warnings(&actions);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0]["index"], 1);
        assert_eq!(warnings[0]["unknown"], json!(["Key.launch_app2"]));
    }

    #[test]
    fn process_writes_macro_from_trace() {
        let dir = tempdir().unwrap();
        let trace = dir.path().join("trace.json");
        fs::write(
            &trace,
            r#"[{"timestamp": 0.0, "type": "key_press", "key": "a"},
                {"timestamp": 0.1, "type": "key_release", "key": "a"}]"#,
        )
        .unwrap();
        let out = dir.path().join("out").join("macro.json");
        let cli = Cli::try_parse_from([
            "wind-macro",
            "process",
            trace.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Process(args) = cli.command else {
            panic!("expected process");
        };
        command_process(args).unwrap();
        let actions = load_macro(&out).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].kind, ActionKind::KeyAction { .. }));
    }

    #[test]
    fn zones_extent_covers_all_rects() {
        let actions = vec![
            Action::new(ActionKind::MouseMove {
                rect: Rect {
                    min_x: 10,
                    max_x: 30,
                    min_y: 5,
                    max_y: 80,
                },
            }),
            Action::key("a"),
        ];
        let extent = zones_extent(&actions);
        assert_eq!((extent.max_x, extent.max_y), (30, 80));
        assert_eq!((extent.min_x, extent.min_y), (0, 0));
    }

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        assert!(target.exists());
    }
}
