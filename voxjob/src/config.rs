//! Runtime configuration.
//!
//! [`Config`] has sensible defaults for every field. It can be built in code with the `with_*`
//! methods, deserialized from JSON with [`Config::from_json`], or read from `VOXJOB_*`
//! environment variables with [`Config::from_env`].
use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

use crate::{job::Stage, sweeper::SweepSchedule};

const ENV_PREFIX: &str = "VOXJOB_";
/// Longest accepted period for any duration setting: ten years.
const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}: {reason}")]
    InvalidVar {
        name: String,
        value: String,
        reason: String,
    },
    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("Invalid sweep cron expression {expression:?}: {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Wall-clock ceilings for each pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub acquire_secs: u64,
    pub normalize_secs: u64,
    pub separate_secs: u64,
    pub finalize_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            acquire_secs: 300,
            normalize_secs: 120,
            separate_secs: 600,
            finalize_secs: 60,
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        Duration::from_secs(match stage {
            Stage::Acquire => self.acquire_secs,
            Stage::Normalize => self.normalize_secs,
            Stage::Separate => self.separate_secs,
            Stage::Finalize => self.finalize_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of jobs processing at once.
    pub max_concurrent_jobs: usize,
    /// Longest accepted input, in seconds.
    pub max_duration_secs: u64,
    pub max_upload_bytes: u64,
    /// Accepted upload extensions, lower case and without the dot.
    pub supported_formats: Vec<String>,
    /// How long a job and its files are kept, measured from creation.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Cron expression overriding `sweep_interval_secs` when set.
    pub sweep_cron: Option<String>,
    /// Minimum time a job must have been terminal before it can be swept.
    pub sweep_grace_secs: u64,
    pub timeouts: StageTimeouts,
    pub heartbeat_interval_ms: u64,
    /// Length of the preview clip; 0 disables previews.
    pub preview_duration_secs: u64,
    /// Used for queue wait estimates.
    pub estimated_job_secs: u64,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            max_duration_secs: 600,
            max_upload_bytes: 50 * 1024 * 1024,
            supported_formats: ["mp3", "wav", "m4a", "flac"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 10 * 60,
            sweep_cron: None,
            sweep_grace_secs: 0,
            timeouts: StageTimeouts::default(),
            heartbeat_interval_ms: 2_000,
            preview_duration_secs: 30,
            estimated_job_secs: 180,
            upload_dir: PathBuf::from("temp/uploads"),
            output_dir: PathBuf::from("temp/outputs"),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Start from the defaults and apply every `VOXJOB_*` variable that is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };
        let mut config = Self::default();

        if let Some(value) = parse_var(var("MAX_CONCURRENT_JOBS"))? {
            config.max_concurrent_jobs = value;
        }
        if let Some(value) = parse_var(var("MAX_DURATION_SECS"))? {
            config.max_duration_secs = value;
        }
        if let Some(value) = parse_scaled(var("MAX_UPLOAD_MB"), 1024 * 1024)? {
            config.max_upload_bytes = value;
        }
        if let Some((_, value)) = var("SUPPORTED_FORMATS") {
            config.supported_formats = value
                .split(',')
                .map(|format| format.trim().trim_start_matches('.').to_lowercase())
                .filter(|format| !format.is_empty())
                .collect();
        }
        if let Some(value) = parse_scaled(var("RETENTION_HOURS"), 60 * 60)? {
            config.retention_secs = value;
        }
        if let Some(value) = parse_var(var("SWEEP_INTERVAL_SECS"))? {
            config.sweep_interval_secs = value;
        }
        if let Some((_, value)) = var("SWEEP_CRON") {
            config.sweep_cron = Some(value);
        }
        if let Some(value) = parse_var(var("SWEEP_GRACE_SECS"))? {
            config.sweep_grace_secs = value;
        }
        if let Some(value) = parse_var(var("ACQUIRE_TIMEOUT_SECS"))? {
            config.timeouts.acquire_secs = value;
        }
        if let Some(value) = parse_var(var("NORMALIZE_TIMEOUT_SECS"))? {
            config.timeouts.normalize_secs = value;
        }
        if let Some(value) = parse_var(var("SEPARATE_TIMEOUT_SECS"))? {
            config.timeouts.separate_secs = value;
        }
        if let Some(value) = parse_var(var("FINALIZE_TIMEOUT_SECS"))? {
            config.timeouts.finalize_secs = value;
        }
        if let Some(value) = parse_var(var("HEARTBEAT_INTERVAL_MS"))? {
            config.heartbeat_interval_ms = value;
        }
        if let Some(value) = parse_var(var("PREVIEW_DURATION_SECS"))? {
            config.preview_duration_secs = value;
        }
        if let Some((_, value)) = var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = var("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_jobs must be at least 1".to_owned(),
            ));
        }
        let timeouts = &self.timeouts;
        if [
            timeouts.acquire_secs,
            timeouts.normalize_secs,
            timeouts.separate_secs,
            timeouts.finalize_secs,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Validation(
                "stage timeouts must be greater than zero".to_owned(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "heartbeat_interval_ms must be greater than zero".to_owned(),
            ));
        }
        let periods = [
            ("retention_secs", self.retention_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("sweep_grace_secs", self.sweep_grace_secs),
            ("timeouts.acquire_secs", timeouts.acquire_secs),
            ("timeouts.normalize_secs", timeouts.normalize_secs),
            ("timeouts.separate_secs", timeouts.separate_secs),
            ("timeouts.finalize_secs", timeouts.finalize_secs),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms / 1000),
            ("preview_duration_secs", self.preview_duration_secs),
            ("estimated_job_secs", self.estimated_job_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs > MAX_PERIOD_SECS) {
            return Err(ConfigError::Validation(format!(
                "{name} must not exceed {MAX_PERIOD_SECS} seconds"
            )));
        }
        if self.supported_formats.is_empty() {
            return Err(ConfigError::Validation(
                "supported_formats must not be empty".to_owned(),
            ));
        }
        self.sweep_schedule().map(|_| ())
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_secs = duration.as_secs();
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn with_sweep_cron(mut self, expression: impl Into<String>) -> Self {
        self.sweep_cron = Some(expression.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_preview_duration(mut self, duration: Duration) -> Self {
        self.preview_duration_secs = duration.as_secs();
        self
    }

    pub fn with_storage(mut self, upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = upload_dir.into();
        self.output_dir = output_dir.into();
        self
    }

    /// Saturates at [`TimeDelta::MAX`] for values [`Config::validate`] would reject.
    pub fn retention(&self) -> TimeDelta {
        period(self.retention_secs)
    }

    pub fn sweep_grace(&self) -> TimeDelta {
        period(self.sweep_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_schedule(&self) -> Result<SweepSchedule, ConfigError> {
        match &self.sweep_cron {
            Some(expression) => cron::Schedule::from_str(expression)
                .map(|schedule| SweepSchedule::Cron(Box::new(schedule)))
                .map_err(|source| ConfigError::InvalidCron {
                    expression: expression.clone(),
                    source,
                }),
            None if self.sweep_interval_secs == 0 => Err(ConfigError::Validation(
                "sweep_interval_secs must be greater than zero".to_owned(),
            )),
            None => Ok(SweepSchedule::Every(Duration::from_secs(
                self.sweep_interval_secs,
            ))),
        }
    }

    pub(crate) fn is_supported_format(&self, extension: &str) -> bool {
        let extension = extension.to_lowercase();
        self.supported_formats
            .iter()
            .any(|format| *format == extension)
    }
}

fn period(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Parses a `u64` given in a larger unit and converts it, rejecting values that overflow.
fn parse_scaled(var: Option<(String, String)>, factor: u64) -> Result<Option<u64>, ConfigError> {
    let Some((name, value)) = var else {
        return Ok(None);
    };
    let parsed = parse_var::<u64>(Some((name.clone(), value.clone())))?;
    match parsed.and_then(|amount| amount.checked_mul(factor)) {
        Some(scaled) => Ok(Some(scaled)),
        None => Err(ConfigError::InvalidVar {
            name,
            value,
            reason: "value is too large".to_owned(),
        }),
    }
}

fn parse_var<T>(var: Option<(String, String)>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var.map(|(name, value)| {
        value
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::InvalidVar {
                name,
                reason: err.to_string(),
                value,
            })
    })
    .transpose()
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use assert_matches::assert_matches;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_jobs, 10);
        assert_eq!(config.max_duration_secs, 600);
        assert_eq!(config.retention(), TimeDelta::hours(24));
        assert_eq!(config.sweep_grace(), TimeDelta::zero());
        assert!(config.is_supported_format("MP3"));
        assert!(!config.is_supported_format("ogg"));
        config.validate().unwrap();
    }

    #[test]
    fn from_env_applies_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VOXJOB_MAX_CONCURRENT_JOBS", "3"),
            ("VOXJOB_MAX_UPLOAD_MB", "200"),
            ("VOXJOB_RETENTION_HOURS", "12"),
            ("VOXJOB_SUPPORTED_FORMATS", "mp3, .OGG"),
            ("VOXJOB_SEPARATE_TIMEOUT_SECS", "900"),
            ("VOXJOB_OUTPUT_DIR", "/tmp/out"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.max_upload_bytes, 200 * 1024 * 1024);
        assert_eq!(config.retention(), TimeDelta::hours(12));
        assert_eq!(config.supported_formats, vec!["mp3", "ogg"]);
        assert_eq!(
            config.timeouts.for_stage(Stage::Separate),
            Duration::from_secs(900)
        );
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.max_duration_secs, 600);
    }

    #[test]
    fn from_env_rejects_garbage() {
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_MAX_CONCURRENT_JOBS", "many")])),
            Err(ConfigError::InvalidVar { name, .. }) if name == "VOXJOB_MAX_CONCURRENT_JOBS"
        );
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_MAX_CONCURRENT_JOBS", "0")])),
            Err(ConfigError::Validation(_))
        );
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_SWEEP_CRON", "whenever")])),
            Err(ConfigError::InvalidCron { .. })
        );
    }

    #[test]
    fn rejects_out_of_range_periods() {
        assert_matches!(
            Config::from_json(r#"{"retention_secs": 10000000000000000}"#),
            Err(ConfigError::Validation(message)) if message.contains("retention_secs")
        );
        assert_matches!(
            Config::from_json(r#"{"sweep_grace_secs": 18446744073709551615}"#),
            Err(ConfigError::Validation(message)) if message.contains("sweep_grace_secs")
        );
        assert_matches!(
            Config::from_json(r#"{"heartbeat_interval_ms": 18446744073709551615}"#),
            Err(ConfigError::Validation(_))
        );
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_MAX_UPLOAD_MB", "18446744073709551615")])),
            Err(ConfigError::InvalidVar { name, .. }) if name == "VOXJOB_MAX_UPLOAD_MB"
        );
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_RETENTION_HOURS", "9999999999999999")])),
            Err(ConfigError::InvalidVar { name, .. }) if name == "VOXJOB_RETENTION_HOURS"
        );
        assert_matches!(
            Config::from_lookup(lookup(&[("VOXJOB_RETENTION_HOURS", "9999999")])),
            Err(ConfigError::Validation(_))
        );

        let unchecked = Config {
            retention_secs: u64::MAX,
            ..Config::default()
        };
        assert_eq!(unchecked.retention(), TimeDelta::MAX);
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = Config::from_json(
            r#"{"max_concurrent_jobs": 2, "timeouts": {"separate_secs": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.timeouts.separate_secs, 30);
        assert_eq!(config.timeouts.acquire_secs, 300);
        assert_eq!(config.preview_duration_secs, 30);
    }

    #[test]
    fn sweep_schedule_prefers_cron() {
        let config = Config::default().with_sweep_cron("0 */5 * * * *");
        assert_matches!(config.sweep_schedule(), Ok(SweepSchedule::Cron(_)));
        assert_matches!(
            Config::default().sweep_schedule(),
            Ok(SweepSchedule::Every(interval)) if interval == Duration::from_secs(600)
        );
    }
}
