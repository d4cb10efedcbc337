use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::recording::RecordMode;

pub const OUT_DIR_ENV: &str = "WIND_MACRO_OUT_DIR";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Run the whole macro this many times.
    Loops(u32),
    /// Keep repeating until this many wall-clock minutes have passed.
    Minutes(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub repeat: RepeatMode,
    /// 100 plays at recorded speed, 200 twice as fast.
    pub speed_percent: f64,
    /// Countdown before the first action, in seconds.
    pub pre_roll: f64,
    /// Follow generated paths; otherwise the pointer jumps.
    pub humanize: bool,
    pub min_seconds_per_pixel: f64,
    pub max_seconds_per_pixel: f64,
    /// Retry interval for `wait` policies, in seconds.
    pub poll_interval: f64,
    /// Fixed run seed; drawn at random when absent.
    pub seed: Option<u64>,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        PlaybackSettings {
            repeat: RepeatMode::Loops(1),
            speed_percent: 100.0,
            pre_roll: 3.0,
            humanize: true,
            min_seconds_per_pixel: 0.001,
            max_seconds_per_pixel: 0.004,
            poll_interval: 0.05,
            seed: None,
        }
    }
}

impl PlaybackSettings {
    /// Multiplier applied to every sampled duration.
    pub fn time_scale(&self) -> f64 {
        if self.speed_percent > 0.0 {
            100.0 / self.speed_percent
        } else {
            1.0
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordSettings {
    pub sparse: bool,
    pub click_radius: i32,
    pub extra_slack: f64,
}

impl Default for RecordSettings {
    fn default() -> Self {
        RecordSettings {
            sparse: false,
            click_radius: 5,
            extra_slack: 0.2,
        }
    }
}

impl RecordSettings {
    pub fn mode(&self) -> RecordMode {
        if self.sparse {
            RecordMode::Sparse {
                click_radius: self.click_radius,
                extra_slack: self.extra_slack,
            }
        } else {
            RecordMode::Dense
        }
    }
}

/// Where generated files go when no explicit path is given.
pub fn out_root() -> PathBuf {
    env::var(OUT_DIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".wind-macro"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_scales_durations() {
        let mut settings = PlaybackSettings::default();
        assert_eq!(settings.time_scale(), 1.0);
        settings.speed_percent = 200.0;
        assert_eq!(settings.time_scale(), 0.5);
        settings.speed_percent = 0.0;
        assert_eq!(settings.time_scale(), 1.0);
    }

    #[test]
    fn record_settings_select_mode() {
        let dense = RecordSettings::default();
        assert_eq!(dense.mode(), RecordMode::Dense);
        let sparse = RecordSettings {
            sparse: true,
            ..RecordSettings::default()
        };
        assert_eq!(
            sparse.mode(),
            RecordMode::Sparse {
                click_radius: 5,
                extra_slack: 0.2
            }
        );
    }
}
