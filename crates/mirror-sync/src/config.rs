//! Process configuration. Read once at start-up; nothing here is reloaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_storage::PoolConfig;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_REDACTION_TEXT: &str = "[Comment Redacted]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required configuration value {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub source_url: String,
    pub analytics_url: String,
    pub pool: PoolConfig,
}

/// Tunables for the sweep jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub publish_window_minutes: i64,
    pub redact_after_days: i64,
    pub purge_after_days: i64,
    pub redaction_text: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            publish_window_minutes: 5,
            redact_after_days: 14,
            purge_after_days: 30,
            redaction_text: DEFAULT_REDACTION_TEXT.to_string(),
        }
    }
}

impl JobSettings {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            publish_window_minutes: non_negative(
                lookup,
                "MIRROR_PUBLISH_WINDOW_MINUTES",
                defaults.publish_window_minutes,
            )?,
            redact_after_days: non_negative(
                lookup,
                "MIRROR_REDACT_AFTER_DAYS",
                defaults.redact_after_days,
            )?,
            purge_after_days: non_negative(
                lookup,
                "MIRROR_PURGE_AFTER_DAYS",
                defaults.purge_after_days,
            )?,
            redaction_text: optional(lookup, "MIRROR_REDACTION_TEXT")
                .unwrap_or(defaults.redaction_text),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub jobs: JobSettings,
    pub schedule_file: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source_url = required(&lookup, "SOURCE_DATABASE_URL")?;
        let analytics_url = required(&lookup, "ANALYTICS_DATABASE_URL")?;
        let max_connections = non_negative(&lookup, "MIRROR_DB_MAX_CONNECTIONS", 5)?;
        let acquire_timeout_secs = non_negative(&lookup, "MIRROR_DB_ACQUIRE_TIMEOUT_SECS", 30)?;

        Ok(Self {
            database: DatabaseConfig {
                source_url,
                analytics_url,
                pool: PoolConfig {
                    max_connections: u32::try_from(max_connections).map_err(|_| {
                        ConfigError::Invalid {
                            key: "MIRROR_DB_MAX_CONNECTIONS",
                            value: max_connections.to_string(),
                        }
                    })?,
                    acquire_timeout: Duration::from_secs(acquire_timeout_secs.unsigned_abs()),
                },
            },
            jobs: JobSettings::from_lookup(&lookup)?,
            schedule_file: schedule_file_from_lookup(&lookup),
        })
    }
}

pub fn schedule_file_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    optional(lookup, "MIRROR_SCHEDULE_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("schedule.yaml"))
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<String, ConfigError> {
    optional(lookup, key).ok_or(ConfigError::Missing(key))
}

fn non_negative(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: i64,
) -> Result<i64, ConfigError> {
    match optional(lookup, key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<i64>() {
            Ok(value) if value >= 0 => Ok(value),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub jobs: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleEntry {
    pub job: String,
    pub cron: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

pub async fn load_schedule(path: &Path) -> Result<ScheduleFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
