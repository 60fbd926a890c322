//! Migrator configuration.
//!
//! Sources, lowest precedence first: defaults, an optional JSON file, the
//! environment (a `.env` file is loaded if present), then whatever the caller
//! sets through the builder methods.

use crate::backup::SnapshotSchedule;
use crate::backup::schedule::DEFAULT_PREFIX;
use crate::batch::{BackoffPolicy, BatchSettings};
use crate::core::{MigrationError, Registry, Result};
use crate::lifecycle::EngineSettings;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost:5432/tendermonitor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub lock_threshold: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
            lock_threshold: policy.lock_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub prefix: String,
    pub weekly_day: Weekday,
    pub keep: usize,
    pub pg_dump: PathBuf,
    pub timeout_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("/opt/tendermonitor/backups"),
            prefix: DEFAULT_PREFIX.to_string(),
            weekly_day: Weekday::Sun,
            keep: 1,
            pg_dump: PathBuf::from("pg_dump"),
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub database_url: String,
    /// Candidate ids fetched per query
    pub candidate_limit: usize,
    /// Ids per transaction
    pub sub_batch_size: usize,
    pub statement_timeout_ms: u64,
    pub lock_wait_timeout_ms: u64,
    pub completion_grace_days: u32,
    /// `None` disables reaping of stalled statements.
    pub stalled_statement_age_secs: Option<u64>,
    pub registries: Vec<Registry>,
    pub backoff: BackoffConfig,
    pub backup: BackupConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            candidate_limit: engine.candidate_limit,
            sub_batch_size: engine.batch.sub_batch_size,
            statement_timeout_ms: engine.batch.statement_timeout.as_millis() as u64,
            lock_wait_timeout_ms: 10_000,
            completion_grace_days: engine.completion_grace_days,
            stalled_statement_age_secs: Some(30),
            registries: Registry::ALL.to_vec(),
            backoff: BackoffConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl MigratorConfig {
    /// Defaults, then `path` if given, then the environment. Validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        dotenvy::dotenv().ok();
        let config = base.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| MigrationError::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Overlays `TENDER_*` variables (and `DATABASE_URL`) found by `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TENDER_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database_url = url;
        } else if let Some(host) = lookup("TENDER_MONITOR_DB_HOST") {
            self.database_url = compose_url(&host, &lookup);
        }

        set(&mut self.candidate_limit, parse_var(&lookup, "TENDER_CANDIDATE_LIMIT")?);
        set(&mut self.sub_batch_size, parse_var(&lookup, "TENDER_SUB_BATCH_SIZE")?);
        set(&mut self.statement_timeout_ms, parse_var(&lookup, "TENDER_STATEMENT_TIMEOUT_MS")?);
        set(&mut self.lock_wait_timeout_ms, parse_var(&lookup, "TENDER_LOCK_WAIT_TIMEOUT_MS")?);
        set(&mut self.completion_grace_days, parse_var(&lookup, "TENDER_COMPLETION_GRACE_DAYS")?);
        if let Some(age) = parse_var::<u64>(&lookup, "TENDER_STALLED_STATEMENT_AGE_SECS")? {
            self.stalled_statement_age_secs = (age > 0).then_some(age);
        }
        if let Some(list) = lookup("TENDER_REGISTRIES") {
            self.registries = parse_registries(&list)?;
        }

        set(&mut self.backoff.base_delay_ms, parse_var(&lookup, "TENDER_BACKOFF_BASE_MS")?);
        set(&mut self.backoff.max_delay_ms, parse_var(&lookup, "TENDER_BACKOFF_MAX_MS")?);
        set(&mut self.backoff.jitter, parse_var(&lookup, "TENDER_BACKOFF_JITTER")?);
        set(&mut self.backoff.lock_threshold, parse_var(&lookup, "TENDER_LOCK_THRESHOLD")?);

        if let Some(enabled) = lookup("TENDER_BACKUP_ENABLED") {
            self.backup.enabled = parse_bool("TENDER_BACKUP_ENABLED", &enabled)?;
        }
        set(&mut self.backup.dir, lookup("TENDER_BACKUP_DIR").map(PathBuf::from));
        set(&mut self.backup.prefix, lookup("TENDER_BACKUP_PREFIX"));
        set(&mut self.backup.weekly_day, parse_var(&lookup, "TENDER_BACKUP_WEEKDAY")?);
        set(&mut self.backup.keep, parse_var(&lookup, "TENDER_BACKUP_KEEP")?);
        set(&mut self.backup.pg_dump, lookup("TENDER_PG_DUMP").map(PathBuf::from));
        set(&mut self.backup.timeout_secs, parse_var(&lookup, "TENDER_BACKUP_TIMEOUT_SECS")?);

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MigrationError::Config(msg));

        if self.database_url.trim().is_empty() {
            return invalid("database_url is empty".into());
        }
        if self.candidate_limit == 0 {
            return invalid("candidate_limit must be greater than zero".into());
        }
        if self.sub_batch_size == 0 {
            return invalid("sub_batch_size must be greater than zero".into());
        }
        if self.sub_batch_size > self.candidate_limit {
            return invalid(format!(
                "sub_batch_size ({}) exceeds candidate_limit ({})",
                self.sub_batch_size, self.candidate_limit
            ));
        }
        if self.statement_timeout_ms == 0 || self.lock_wait_timeout_ms == 0 {
            return invalid("timeouts must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return invalid(format!("backoff jitter {} is outside [0, 1]", self.backoff.jitter));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return invalid(format!(
                "backoff base delay ({} ms) exceeds max delay ({} ms)",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            ));
        }
        if self.registries.is_empty() {
            return invalid("no registries selected".into());
        }
        if self.backup.enabled && self.backup.keep == 0 {
            return invalid("backup.keep must be at least 1".into());
        }
        Ok(())
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }

    pub fn sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn only_registry(mut self, registry: Registry) -> Self {
        self.registries = vec![registry];
        self
    }

    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup.dir = dir.into();
        self
    }

    pub fn without_backup(mut self) -> Self {
        self.backup.enabled = false;
        self
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn stalled_statement_age(&self) -> Option<Duration> {
        self.stalled_statement_age_secs.map(Duration::from_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.backoff.base_delay_ms),
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            jitter: self.backoff.jitter,
            lock_threshold: self.backoff.lock_threshold,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            candidate_limit: self.candidate_limit,
            completion_grace_days: self.completion_grace_days,
            batch: BatchSettings {
                sub_batch_size: self.sub_batch_size,
                statement_timeout: self.statement_timeout(),
                backoff: self.backoff_policy(),
            },
        }
    }

    pub fn snapshot_schedule(&self) -> SnapshotSchedule {
        SnapshotSchedule {
            weekly_day: self.backup.weekly_day,
            keep: self.backup.keep,
        }
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.timeout_secs)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| MigrationError::Config(format!("{} has invalid value '{}': {}", name, raw, e)))
        })
        .transpose()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MigrationError::Config(format!("{} must be a boolean, got '{}'", name, other))),
    }
}

fn parse_registries(list: &str) -> Result<Vec<Registry>> {
    let mut registries = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let registry: Registry = part.parse()?;
        if !registries.contains(&registry) {
            registries.push(registry);
        }
    }
    Ok(registries)
}

/// Key/value connection string from the discrete `TENDER_MONITOR_DB_*`
/// variables.
fn compose_url(host: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let quote = |v: &str| format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'"));
    let mut parts = vec![format!("host={}", quote(host))];
    for (var, key) in [
        ("TENDER_MONITOR_DB_PORT", "port"),
        ("TENDER_MONITOR_DB_DATABASE", "dbname"),
        ("TENDER_MONITOR_DB_USER", "user"),
        ("TENDER_MONITOR_DB_PASSWORD", "password"),
    ] {
        if let Some(value) = lookup(var) {
            parts.push(format!("{}={}", key, quote(&value)));
        }
    }
    parts.join(" ")
}
