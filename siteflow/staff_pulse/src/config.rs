//! TOML configuration for the engine.
//!
//! ```toml
//! [rules]
//! utc_offset_minutes = 330
//! warning_hour = 16
//! cutoff_hour = 18
//! due_soon_minutes = 60
//!
//! [monitor]
//! resync_interval_secs = 300
//! side_effect_attempts = 2
//! side_effect_backoff_ms = 250
//! feed_capacity = 64
//!
//! [telemetry]
//! log_path = "logs/pulse.log"
//! event_log = "logs/pulse-events.jsonl"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use shared_event_bus::FileEventPublisher;

use crate::{
    flags::FlagRules,
    lifecycle::EffectPolicy,
    telemetry::{PulseTelemetry, PulseTelemetryBuilder, COMPONENT},
};

const MAX_OFFSET_MINUTES: i32 = 14 * 60;
const MAX_DUE_SOON_MINUTES: i64 = 24 * 60;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PulseConfig {
    /// Flag thresholds.
    #[serde(default)]
    pub rules: RulesSection,
    /// Monitor and side-effect tuning.
    #[serde(default)]
    pub monitor: MonitorSection,
    /// Telemetry sinks.
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(skip)]
    source_dir: Option<PathBuf>,
}

/// `[rules]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RulesSection {
    /// Business offset from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Afternoon warning hour.
    #[serde(default = "default_warning_hour")]
    pub warning_hour: u32,
    /// End-of-day cutoff hour.
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    /// Due-soon window.
    #[serde(default = "default_due_soon_minutes")]
    pub due_soon_minutes: i64,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            warning_hour: default_warning_hour(),
            cutoff_hour: default_cutoff_hour(),
            due_soon_minutes: default_due_soon_minutes(),
        }
    }
}

/// `[monitor]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitorSection {
    /// Period of the backstop resync; 0 disables it.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Tries per lifecycle side effect.
    #[serde(default = "default_side_effect_attempts")]
    pub side_effect_attempts: u32,
    /// Pause between side-effect tries.
    #[serde(default = "default_side_effect_backoff_ms")]
    pub side_effect_backoff_ms: u64,
    /// Snapshot buffer of in-memory feeds.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval_secs(),
            side_effect_attempts: default_side_effect_attempts(),
            side_effect_backoff_ms: default_side_effect_backoff_ms(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

/// `[telemetry]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// JSON-lines log file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl PulseConfig {
    /// Loads and validates a TOML file. Relative telemetry paths resolve
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pulse config {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.source_dir = Some(
            path.parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        );
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rules = &self.rules;
        if rules.utc_offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() {
            bail!(
                "utc_offset_minutes {} outside ±{MAX_OFFSET_MINUTES}",
                rules.utc_offset_minutes
            );
        }
        if rules.warning_hour > 23 || rules.cutoff_hour > 23 {
            bail!("warning_hour and cutoff_hour must be below 24");
        }
        if rules.warning_hour > rules.cutoff_hour {
            bail!(
                "warning_hour {} is after cutoff_hour {}",
                rules.warning_hour,
                rules.cutoff_hour
            );
        }
        if rules.due_soon_minutes <= 0 || rules.due_soon_minutes > MAX_DUE_SOON_MINUTES {
            bail!(
                "due_soon_minutes {} outside 1..={MAX_DUE_SOON_MINUTES}",
                rules.due_soon_minutes
            );
        }
        if self.monitor.side_effect_attempts == 0 {
            bail!("side_effect_attempts must be at least 1");
        }
        if self.monitor.feed_capacity == 0 {
            bail!("feed_capacity must be at least 1");
        }
        Ok(())
    }

    /// Evaluator thresholds.
    pub fn flag_rules(&self) -> Result<FlagRules> {
        let utc_offset = self
            .rules
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("invalid utc offset {}", self.rules.utc_offset_minutes))?;
        let due_soon = chrono::Duration::try_minutes(self.rules.due_soon_minutes)
            .with_context(|| format!("due_soon_minutes {} out of range", self.rules.due_soon_minutes))?;
        Ok(FlagRules {
            utc_offset,
            warning_hour: self.rules.warning_hour,
            cutoff_hour: self.rules.cutoff_hour,
            due_soon,
        })
    }

    /// Side-effect retry policy.
    #[must_use]
    pub const fn effect_policy(&self) -> EffectPolicy {
        EffectPolicy {
            attempts: self.monitor.side_effect_attempts,
            backoff: Duration::from_millis(self.monitor.side_effect_backoff_ms),
        }
    }

    /// Resync period; zero means disabled.
    #[must_use]
    pub const fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.resync_interval_secs)
    }

    /// Resolves a path relative to the loaded file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        match &self.source_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }

    /// Telemetry builder preloaded with the `[telemetry]` sinks.
    pub fn telemetry_builder(&self) -> Result<PulseTelemetryBuilder> {
        let mut builder = PulseTelemetry::builder(COMPONENT);
        if let Some(path) = &self.telemetry.log_path {
            builder = builder.log_path(self.resolve_path(path));
        }
        if let Some(path) = &self.telemetry.event_log {
            let publisher = FileEventPublisher::new(self.resolve_path(path))
                .context("opening telemetry event log")?;
            builder = builder.event_publisher(Arc::new(publisher));
        }
        Ok(builder)
    }

    /// Builds the telemetry handle described by `[telemetry]`.
    pub fn build_telemetry(&self) -> Result<PulseTelemetry> {
        self.telemetry_builder()?.build()
    }
}

const fn default_warning_hour() -> u32 {
    16
}

const fn default_cutoff_hour() -> u32 {
    18
}

const fn default_due_soon_minutes() -> i64 {
    60
}

const fn default_resync_interval_secs() -> u64 {
    300
}

const fn default_side_effect_attempts() -> u32 {
    2
}

const fn default_side_effect_backoff_ms() -> u64 {
    250
}

const fn default_feed_capacity() -> usize {
    64
}
