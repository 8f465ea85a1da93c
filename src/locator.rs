use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

const ROLLOUT_PREFIX: &str = "rollout-";
const ROLLOUT_SUFFIX: &str = ".jsonl";
const FILENAME_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const FILENAME_TIME_LEN: usize = 19;
const FIRST_RECORD_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCandidate {
    pub path: PathBuf,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub size: u64,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct LocatorSettings {
    pub sessions_root: PathBuf,
    pub lookback_days: u32,
    pub active_window: Duration,
    pub start_tolerance: Duration,
    pub target_cwd: Option<PathBuf>,
    pub target_start: Option<DateTime<Utc>>,
}

impl LocatorSettings {
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            lookback_days: 7,
            active_window: Duration::from_secs(60),
            start_tolerance: Duration::from_secs(600),
            target_cwd: None,
            target_start: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Selected(SessionCandidate),
    Cleared,
}

#[derive(Debug)]
pub struct SessionLocator {
    settings: LocatorSettings,
    target_cwd: Option<PathBuf>,
    current: Option<SessionCandidate>,
    cwd_cache: HashMap<PathBuf, PathBuf>,
}

impl SessionLocator {
    pub fn new(settings: LocatorSettings) -> Self {
        let target_cwd = settings.target_cwd.as_deref().map(canonical_or_raw);
        Self {
            settings,
            target_cwd,
            current: None,
            cwd_cache: HashMap::new(),
        }
    }

    pub fn current(&self) -> Option<&SessionCandidate> {
        self.current.as_ref()
    }

    pub fn check(&mut self) -> Option<SessionChange> {
        self.check_at(SystemTime::now())
    }

    pub fn check_at(&mut self, now: SystemTime) -> Option<SessionChange> {
        let eligible = self.eligible_candidates(now);
        let best = self.pick_best(&eligible, now);
        let refreshed_current = self.current.as_ref().and_then(|current| {
            eligible
                .iter()
                .find(|candidate| candidate.path == current.path)
                .cloned()
        });

        match (refreshed_current, best) {
            (_, None) => {
                if self.current.take().is_some() {
                    info!("no eligible rollout; clearing active session");
                    return Some(SessionChange::Cleared);
                }
                None
            }
            (Some(current), Some(best))
                if current.path == best.path
                    || self.rank_class(&current, now) >= self.rank_class(&best, now) =>
            {
                self.current = Some(current);
                None
            }
            (_, Some(best)) => {
                info!(path = %best.path.display(), session_id = %best.session_id, "selected rollout");
                self.current = Some(best.clone());
                Some(SessionChange::Selected(best))
            }
        }
    }

    pub fn discover(&self, now: SystemTime) -> Vec<SessionCandidate> {
        let today = DateTime::<Local>::from(now).date_naive();
        let mut candidates = Vec::new();
        for days_back in 0..=self.settings.lookback_days {
            let Some(day) = today.checked_sub_days(chrono::Days::new(u64::from(days_back))) else {
                break;
            };
            let day_dir = self
                .settings
                .sessions_root
                .join(day.format("%Y").to_string())
                .join(day.format("%m").to_string())
                .join(day.format("%d").to_string());
            if !day_dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&day_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some((started_at, session_id)) = entry
                    .file_name()
                    .to_str()
                    .and_then(parse_rollout_filename)
                else {
                    continue;
                };
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let Ok(modified_at) = metadata.modified() else {
                    continue;
                };
                candidates.push(SessionCandidate {
                    path: entry.path().to_path_buf(),
                    session_id,
                    started_at,
                    size: metadata.len(),
                    modified_at,
                });
            }
        }
        candidates.sort_by_key(|candidate| Reverse(candidate.modified_at));
        candidates
    }

    pub fn eligible_candidates(&mut self, now: SystemTime) -> Vec<SessionCandidate> {
        let candidates = self.discover(now);
        let live: HashSet<&Path> = candidates.iter().map(|c| c.path.as_path()).collect();
        self.cwd_cache.retain(|path, _| live.contains(path.as_path()));
        candidates
            .into_iter()
            .filter(|candidate| self.is_eligible(candidate))
            .collect()
    }

    pub fn is_eligible(&mut self, candidate: &SessionCandidate) -> bool {
        let Some(target) = self.target_cwd.as_ref() else {
            return true;
        };
        if let Some(cwd) = self.cwd_cache.get(&candidate.path) {
            return cwd == target;
        }
        let Some(cwd) = peek_session_cwd(&candidate.path) else {
            debug!(path = %candidate.path.display(), "rollout has no readable session_meta yet");
            return false;
        };
        let cwd = canonical_or_raw(&cwd);
        let matches = &cwd == target;
        self.cwd_cache.insert(candidate.path.clone(), cwd);
        matches
    }

    fn pick_best(&self, eligible: &[SessionCandidate], now: SystemTime) -> Option<SessionCandidate> {
        let preferred: Vec<&SessionCandidate> = eligible
            .iter()
            .filter(|candidate| self.rank_class(candidate, now) > 0)
            .collect();
        let pool: Vec<&SessionCandidate> = if preferred.is_empty() {
            eligible.iter().collect()
        } else {
            preferred
        };

        match self.settings.target_start {
            Some(target) => pool
                .into_iter()
                .min_by(|a, b| {
                    start_distance(a, target)
                        .cmp(&start_distance(b, target))
                        .then_with(|| b.modified_at.cmp(&a.modified_at))
                        .then_with(|| a.path.cmp(&b.path))
                })
                .cloned(),
            None => pool
                .into_iter()
                .max_by(|a, b| {
                    a.modified_at
                        .cmp(&b.modified_at)
                        .then_with(|| b.path.cmp(&a.path))
                })
                .cloned(),
        }
    }

    fn rank_class(&self, candidate: &SessionCandidate, now: SystemTime) -> u8 {
        let preferred = match self.settings.target_start {
            Some(target) => start_distance(candidate, target) <= self.settings.start_tolerance,
            None => is_recently_modified(candidate, now, self.settings.active_window),
        };
        u8::from(preferred)
    }
}

fn start_distance(candidate: &SessionCandidate, target: DateTime<Utc>) -> Duration {
    candidate
        .started_at
        .signed_duration_since(target)
        .abs()
        .to_std()
        .unwrap_or(Duration::MAX)
}

fn is_recently_modified(candidate: &SessionCandidate, now: SystemTime, window: Duration) -> bool {
    match now.duration_since(candidate.modified_at) {
        Ok(age) => age <= window,
        // Modified "in the future" relative to `now`: clock skew, treat as fresh.
        Err(_) => true,
    }
}

// rollout-2026-01-15T17-47-44-<uuid>.jsonl
pub fn parse_rollout_filename(file_name: &str) -> Option<(DateTime<Utc>, String)> {
    let stem = file_name
        .strip_prefix(ROLLOUT_PREFIX)?
        .strip_suffix(ROLLOUT_SUFFIX)?;
    let stamp = stem.get(..FILENAME_TIME_LEN)?;
    let session_id = stem.get(FILENAME_TIME_LEN..)?.strip_prefix('-')?;
    if session_id.is_empty()
        || !session_id
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch) || ch == '-')
    {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, FILENAME_TIME_FORMAT).ok()?;
    let started_at = Local
        .from_local_datetime(&naive)
        .earliest()?
        .with_timezone(&Utc);
    Some((started_at, session_id.to_string()))
}

fn peek_session_cwd(path: &Path) -> Option<PathBuf> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file.take(FIRST_RECORD_LIMIT));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).ok()?;
    if line.last() != Some(&b'\n') {
        return None;
    }
    let value: Value = serde_json::from_slice(&line).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("session_meta") {
        return None;
    }
    value
        .get("payload")?
        .get("cwd")?
        .as_str()
        .map(PathBuf::from)
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
