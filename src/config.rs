use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activity::{BASELINE_TOKENS, DEFAULT_MAX_RECENT_CALLS};
use crate::locator::LocatorSettings;

pub const CONFIG_FILE_NAME: &str = "hud-config.json";
const DEFAULT_LOOKBACK_DAYS: u32 = 7;
const DEFAULT_ACTIVE_WINDOW_SECS: u64 = 60;
const DEFAULT_START_TOLERANCE_SECS: u64 = 600;
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1000;
const DEFAULT_LOCATE_INTERVAL_MS: u64 = 5000;
const MIN_INTERVAL_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid session start `{value}`: expected an RFC3339 timestamp")]
    InvalidSessionStart { value: String },
    #[error("sessions directory {} does not exist", .path.display())]
    SessionsDirMissing { path: PathBuf },
    #[error("no Codex home directory found (checked: {checked})")]
    CodexHomeMissing { checked: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HudConfig {
    pub sessions_dir: Option<PathBuf>,
    pub target_cwd: Option<PathBuf>,
    pub target_session_start: Option<String>,
    pub lookback_days: u32,
    pub active_window_secs: u64,
    pub start_tolerance_secs: u64,
    pub max_recent_calls: usize,
    pub refresh_interval_ms: u64,
    pub locate_interval_ms: u64,
    pub baseline_tokens: u64,
}

impl Default for HudConfig {
    fn default() -> Self {
        Self {
            sessions_dir: None,
            target_cwd: None,
            target_session_start: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            active_window_secs: DEFAULT_ACTIVE_WINDOW_SECS,
            start_tolerance_secs: DEFAULT_START_TOLERANCE_SECS,
            max_recent_calls: DEFAULT_MAX_RECENT_CALLS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            locate_interval_ms: DEFAULT_LOCATE_INTERVAL_MS,
            baseline_tokens: BASELINE_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub sessions_dir: Option<PathBuf>,
    pub target_cwd: Option<PathBuf>,
    pub target_session_start: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub codex_home: Option<PathBuf>,
    pub sessions_root: PathBuf,
    pub target_cwd: Option<PathBuf>,
    pub target_start: Option<DateTime<Utc>>,
    pub lookback_days: u32,
    pub active_window: Duration,
    pub start_tolerance: Duration,
    pub max_recent_calls: usize,
    pub refresh_interval: Duration,
    pub locate_interval: Duration,
    pub baseline_tokens: u64,
}

impl HudConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(dir) = env_string(lookup, "CODEX_SESSIONS_PATH") {
            self.sessions_dir = Some(PathBuf::from(dir));
        }
        if let Some(cwd) = env_string(lookup, "CODEX_HUD_CWD") {
            self.target_cwd = Some(PathBuf::from(cwd));
        }
        if let Some(start) = env_string(lookup, "CODEX_HUD_SESSION_START") {
            self.target_session_start = Some(start);
        }
        if let Some(ms) = env_u64(lookup, "CODEX_HUD_REFRESH_MS") {
            self.refresh_interval_ms = ms;
        }
        if let Some(ms) = env_u64(lookup, "CODEX_HUD_LOCATE_MS") {
            self.locate_interval_ms = ms;
        }
        if let Some(days) = env_u64(lookup, "CODEX_HUD_LOOKBACK_DAYS") {
            self.lookback_days = u32::try_from(days).unwrap_or(u32::MAX);
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = overrides.sessions_dir.clone() {
            self.sessions_dir = Some(dir);
        }
        if let Some(cwd) = overrides.target_cwd.clone() {
            self.target_cwd = Some(cwd);
        }
        if let Some(start) = overrides.target_session_start.clone() {
            self.target_session_start = Some(start);
        }
    }

    pub fn into_runtime(self, codex_home: Option<PathBuf>) -> Result<RuntimeSettings, ConfigError> {
        let sessions_root = match self.sessions_dir {
            Some(dir) if dir.is_dir() => dir,
            Some(dir) => return Err(ConfigError::SessionsDirMissing { path: dir }),
            None => match codex_home.as_ref() {
                Some(home) => home.join("sessions"),
                None => {
                    return Err(ConfigError::CodexHomeMissing {
                        checked: "CODEX_HOME, ~/.codex, ~/.codex_home".to_string(),
                    });
                }
            },
        };
        let target_start = self
            .target_session_start
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                DateTime::parse_from_rfc3339(value)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| ConfigError::InvalidSessionStart {
                        value: value.to_string(),
                    })
            })
            .transpose()?;

        Ok(RuntimeSettings {
            codex_home,
            sessions_root,
            target_cwd: self.target_cwd,
            target_start,
            lookback_days: self.lookback_days,
            active_window: Duration::from_secs(self.active_window_secs),
            start_tolerance: Duration::from_secs(self.start_tolerance_secs),
            max_recent_calls: self.max_recent_calls.max(1),
            refresh_interval: Duration::from_millis(self.refresh_interval_ms.max(MIN_INTERVAL_MS)),
            locate_interval: Duration::from_millis(self.locate_interval_ms.max(MIN_INTERVAL_MS)),
            baseline_tokens: self.baseline_tokens,
        })
    }
}

impl RuntimeSettings {
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        Self::resolve_with(overrides, &process_env)
    }

    pub fn resolve_with(
        overrides: &Overrides,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let codex_home = find_codex_home(lookup);
        let mut config = match codex_home.as_ref() {
            Some(home) => HudConfig::load(&home.join(CONFIG_FILE_NAME))?,
            None => HudConfig::default(),
        };
        config.apply_env(lookup);
        config.apply_overrides(overrides);
        Ok(config.into_runtime(codex_home)?)
    }

    pub fn locator_settings(&self) -> LocatorSettings {
        LocatorSettings {
            sessions_root: self.sessions_root.clone(),
            lookback_days: self.lookback_days,
            active_window: self.active_window,
            start_tolerance: self.start_tolerance,
            target_cwd: self.target_cwd.clone(),
            target_start: self.target_start,
        }
    }
}

pub fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

// First existing of `$CODEX_HOME`, `~/.codex`, `~/.codex_home`.
pub fn find_codex_home(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    codex_home_candidates(lookup)
        .into_iter()
        .find(|candidate| candidate.is_dir())
        .map(|home| fs::canonicalize(&home).unwrap_or(home))
}

fn codex_home_candidates(lookup: &impl Fn(&str) -> Option<String>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(custom) = env_string(lookup, "CODEX_HOME") {
        candidates.push(PathBuf::from(custom));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".codex"));
        candidates.push(home.join(".codex_home"));
    }
    candidates
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    env_string(lookup, name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}
