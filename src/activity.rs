use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RECENT_CALLS: usize = 10;
pub const BASELINE_TOKENS: u64 = 12_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub status: ToolStatus,
    pub duration_ms: Option<u64>,
    pub target: Option<String>,
}

impl ToolCall {
    pub(crate) fn finish(&mut self, failed: bool, finished_at: DateTime<Utc>) {
        self.status = if failed {
            ToolStatus::Error
        } else {
            ToolStatus::Completed
        };
        let elapsed = finished_at.signed_duration_since(self.started_at);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub originator: Option<String>,
    pub cli_version: Option<String>,
    pub model_provider: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PlanStep {
    pub step: String,
    pub status: PlanStepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanProgress {
    pub steps: Vec<PlanStep>,
    pub explanation: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PlanProgress {
    pub fn new(
        steps: Vec<PlanStep>,
        explanation: Option<String>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        let completed = steps
            .iter()
            .filter(|step| step.status == PlanStepStatus::Completed)
            .count();
        Self {
            total: steps.len(),
            completed,
            steps,
            explanation,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn non_cached_input(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_input_tokens)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsageInfo {
    pub total: Option<TokenUsage>,
    pub last: Option<TokenUsage>,
    pub model_context_window: Option<u64>,
}

impl TokenUsageInfo {
    pub fn overlay(self, newer: TokenUsageInfo) -> TokenUsageInfo {
        TokenUsageInfo {
            total: newer.total.or(self.total),
            last: newer.last.or(self.last),
            model_context_window: newer.model_context_window.or(self.model_context_window),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageWindow {
    pub used_percent: f64,
    pub remaining_percent: f64,
    pub window_minutes: u64,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RateLimits {
    pub primary: Option<UsageWindow>,
    pub secondary: Option<UsageWindow>,
}

impl RateLimits {
    pub fn is_present(&self) -> bool {
        self.primary.is_some() || self.secondary.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Blank,
    Malformed,
    Unrecognized,
    OrphanOutput,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SkipCounts {
    pub blank: u64,
    pub malformed: u64,
    pub unrecognized: u64,
    pub orphan_output: u64,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Blank => self.blank += 1,
            SkipReason::Malformed => self.malformed += 1,
            SkipReason::Unrecognized => self.unrecognized += 1,
            SkipReason::OrphanOutput => self.orphan_output += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.blank + self.malformed + self.unrecognized + self.orphan_output
    }

    fn absorb(&mut self, other: SkipCounts) {
        self.blank += other.blank;
        self.malformed += other.malformed;
        self.unrecognized += other.unrecognized;
        self.orphan_output += other.orphan_output;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseDelta {
    pub session: Option<SessionInfo>,
    pub new_calls: Vec<ToolCall>,
    pub finished_calls: Vec<ToolCall>,
    pub total_calls: u64,
    pub calls_by_name: BTreeMap<String, u64>,
    pub plan: Option<PlanProgress>,
    pub token_usage: Option<TokenUsageInfo>,
    pub rate_limits: Option<RateLimits>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub model: Option<String>,
    pub compaction_count: u64,
    pub last_compaction_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_tool_activity_at: Option<DateTime<Utc>>,
    pub last_assistant_message_at: Option<DateTime<Utc>>,
    pub records: u64,
    pub skipped: SkipCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityAggregate {
    pub session: Option<SessionInfo>,
    pub running_calls: HashMap<String, ToolCall>,
    pub recent_calls: VecDeque<ToolCall>,
    pub max_recent_calls: usize,
    pub total_calls: u64,
    pub calls_by_name: BTreeMap<String, u64>,
    pub plan: Option<PlanProgress>,
    pub token_usage: Option<TokenUsageInfo>,
    pub rate_limits: Option<RateLimits>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub model: Option<String>,
    pub compaction_count: u64,
    pub last_compaction_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_tool_activity_at: Option<DateTime<Utc>>,
    pub last_assistant_message_at: Option<DateTime<Utc>>,
    pub records: u64,
    pub skipped: SkipCounts,
    pub(crate) next_synthetic_id: u64,
}

impl Default for ActivityAggregate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECENT_CALLS)
    }
}

impl ActivityAggregate {
    pub fn new(max_recent_calls: usize) -> Self {
        Self {
            session: None,
            running_calls: HashMap::new(),
            recent_calls: VecDeque::new(),
            max_recent_calls: max_recent_calls.max(1),
            total_calls: 0,
            calls_by_name: BTreeMap::new(),
            plan: None,
            token_usage: None,
            rate_limits: None,
            approval_policy: None,
            sandbox_mode: None,
            model: None,
            compaction_count: 0,
            last_compaction_at: None,
            last_event_at: None,
            last_tool_activity_at: None,
            last_assistant_message_at: None,
            records: 0,
            skipped: SkipCounts::default(),
            next_synthetic_id: 0,
        }
    }

    pub fn merge(&mut self, delta: ParseDelta) {
        if self.session.is_none() {
            self.session = delta.session;
        }

        self.total_calls += delta.total_calls;
        for (name, count) in delta.calls_by_name {
            *self.calls_by_name.entry(name).or_insert(0) += count;
        }

        for finished in delta.finished_calls {
            // Evicted calls stay counted but are no longer displayed.
            if let Some(slot) = self
                .recent_calls
                .iter_mut()
                .rev()
                .find(|call| call.id == finished.id)
            {
                *slot = finished;
            }
        }
        self.recent_calls.extend(delta.new_calls);
        while self.recent_calls.len() > self.max_recent_calls {
            self.recent_calls.pop_front();
        }

        if delta.plan.is_some() {
            self.plan = delta.plan;
        }
        if let Some(usage) = delta.token_usage {
            self.token_usage = Some(self.token_usage.unwrap_or_default().overlay(usage));
        }
        if delta.rate_limits.is_some() {
            self.rate_limits = delta.rate_limits;
        }
        if delta.approval_policy.is_some() {
            self.approval_policy = delta.approval_policy;
        }
        if delta.sandbox_mode.is_some() {
            self.sandbox_mode = delta.sandbox_mode;
        }
        if delta.model.is_some() {
            self.model = delta.model;
        }

        self.compaction_count += delta.compaction_count;
        self.last_compaction_at = max_datetime(self.last_compaction_at, delta.last_compaction_at);
        self.last_event_at = max_datetime(self.last_event_at, delta.last_event_at);
        self.last_tool_activity_at =
            max_datetime(self.last_tool_activity_at, delta.last_tool_activity_at);
        self.last_assistant_message_at =
            max_datetime(self.last_assistant_message_at, delta.last_assistant_message_at);

        self.records += delta.records;
        self.skipped.absorb(delta.skipped);
    }

    pub fn running_count(&self) -> usize {
        self.running_calls.len()
    }

    pub fn context_usage(&self, baseline: u64) -> Option<ContextUsage> {
        ContextUsage::from_token_usage(self.token_usage.as_ref()?, baseline)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextUsage {
    pub used: u64,
    pub window: u64,
    pub percent_left: u8,
    pub percent_used: u8,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl ContextUsage {
    pub fn from_token_usage(info: &TokenUsageInfo, baseline: u64) -> Option<Self> {
        let window = info.model_context_window.filter(|window| *window > 0)?;
        let last = info.last?;
        let percent_left = percent_of_context_left(last.total_tokens, window, baseline);
        Some(Self {
            used: last.total_tokens,
            window,
            percent_left,
            percent_used: 100 - percent_left,
            input_tokens: last.non_cached_input(),
            output_tokens: last.output_tokens,
            cached_tokens: last.cached_input_tokens,
        })
    }
}

pub fn percent_of_context_left(last_total: u64, context_window: u64, baseline: u64) -> u8 {
    if context_window <= baseline {
        return 0;
    }
    let effective_window = context_window - baseline;
    let used = last_total.saturating_sub(baseline);
    let remaining = effective_window.saturating_sub(used);
    let percent = (remaining as f64 / effective_window as f64) * 100.0;
    percent.round().clamp(0.0, 100.0) as u8
}

pub(crate) fn max_datetime(
    left: Option<DateTime<Utc>>,
    right: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(if a >= b { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0)
            .single()
            .expect("timestamp")
    }

    fn call(id: &str, status: ToolStatus) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "Read".to_string(),
            started_at: at(0),
            status,
            duration_ms: None,
            target: None,
        }
    }

    #[test]
    fn context_left_matches_reference_values() {
        assert_eq!(percent_of_context_left(100_000, 200_000, BASELINE_TOKENS), 53);
        assert_eq!(percent_of_context_left(0, 200_000, BASELINE_TOKENS), 100);
        assert_eq!(percent_of_context_left(5_000, 10_000, BASELINE_TOKENS), 0);
        assert_eq!(percent_of_context_left(500_000, 200_000, BASELINE_TOKENS), 0);
    }

    #[test]
    fn context_usage_uses_last_request_totals() {
        let info = TokenUsageInfo {
            total: Some(TokenUsage {
                total_tokens: 167_013,
                ..TokenUsage::default()
            }),
            last: Some(TokenUsage {
                input_tokens: 15_612,
                cached_input_tokens: 13_952,
                output_tokens: 193,
                reasoning_output_tokens: 64,
                total_tokens: 15_805,
            }),
            model_context_window: Some(258_400),
        };
        let usage = ContextUsage::from_token_usage(&info, BASELINE_TOKENS).expect("usage");
        assert_eq!(usage.used, 15_805);
        assert_eq!(usage.input_tokens, 1_660);
        assert_eq!(usage.percent_left, 98);
        assert_eq!(usage.percent_used, 2);
    }

    #[test]
    fn context_usage_requires_window_and_last_usage() {
        let info = TokenUsageInfo {
            last: Some(TokenUsage::default()),
            ..TokenUsageInfo::default()
        };
        assert!(ContextUsage::from_token_usage(&info, BASELINE_TOKENS).is_none());
    }

    #[test]
    fn merge_sums_counters_and_trims_recent_window() {
        let mut aggregate = ActivityAggregate::new(3);
        for round in 0..3 {
            let mut delta = ParseDelta::default();
            for idx in 0..2 {
                delta
                    .new_calls
                    .push(call(&format!("c{round}-{idx}"), ToolStatus::Completed));
            }
            delta.total_calls = 2;
            delta.calls_by_name.insert("Read".to_string(), 2);
            aggregate.merge(delta);
        }

        assert_eq!(aggregate.total_calls, 6);
        assert_eq!(aggregate.calls_by_name.get("Read"), Some(&6));
        let ids: Vec<&str> = aggregate.recent_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1-1", "c2-0", "c2-1"]);
    }

    #[test]
    fn finished_call_replaces_running_entry_in_place() {
        let mut aggregate = ActivityAggregate::new(5);
        aggregate.merge(ParseDelta {
            new_calls: vec![call("c1", ToolStatus::Running)],
            total_calls: 1,
            ..ParseDelta::default()
        });

        let mut done = call("c1", ToolStatus::Completed);
        done.duration_ms = Some(250);
        aggregate.merge(ParseDelta {
            finished_calls: vec![done],
            ..ParseDelta::default()
        });

        assert_eq!(aggregate.recent_calls.len(), 1);
        assert_eq!(aggregate.recent_calls[0].status, ToolStatus::Completed);
        assert_eq!(aggregate.recent_calls[0].duration_ms, Some(250));
        assert_eq!(aggregate.total_calls, 1);
    }

    #[test]
    fn latest_wins_fields_survive_empty_deltas() {
        let mut aggregate = ActivityAggregate::default();
        aggregate.merge(ParseDelta {
            approval_policy: Some("on-request".to_string()),
            sandbox_mode: Some("workspace-write".to_string()),
            plan: Some(PlanProgress::new(Vec::new(), None, None)),
            rate_limits: Some(RateLimits {
                primary: Some(UsageWindow::default()),
                secondary: None,
            }),
            token_usage: Some(TokenUsageInfo {
                model_context_window: Some(200_000),
                ..TokenUsageInfo::default()
            }),
            ..ParseDelta::default()
        });
        for _ in 0..3 {
            aggregate.merge(ParseDelta::default());
        }

        assert_eq!(aggregate.approval_policy.as_deref(), Some("on-request"));
        assert_eq!(aggregate.sandbox_mode.as_deref(), Some("workspace-write"));
        assert!(aggregate.plan.is_some());
        assert!(aggregate.rate_limits.is_some());
        assert_eq!(
            aggregate.token_usage.and_then(|u| u.model_context_window),
            Some(200_000)
        );
    }

    #[test]
    fn token_usage_keeps_previous_context_window() {
        let mut aggregate = ActivityAggregate::default();
        aggregate.merge(ParseDelta {
            token_usage: Some(TokenUsageInfo {
                model_context_window: Some(272_000),
                ..TokenUsageInfo::default()
            }),
            ..ParseDelta::default()
        });
        aggregate.merge(ParseDelta {
            token_usage: Some(TokenUsageInfo {
                last: Some(TokenUsage {
                    total_tokens: 40_000,
                    ..TokenUsage::default()
                }),
                ..TokenUsageInfo::default()
            }),
            ..ParseDelta::default()
        });

        let usage = aggregate.token_usage.expect("usage");
        assert_eq!(usage.model_context_window, Some(272_000));
        assert_eq!(usage.last.map(|u| u.total_tokens), Some(40_000));
    }

    #[test]
    fn session_is_set_once() {
        let mut aggregate = ActivityAggregate::default();
        aggregate.merge(ParseDelta {
            session: Some(SessionInfo {
                id: Some("first".to_string()),
                ..SessionInfo::default()
            }),
            ..ParseDelta::default()
        });
        aggregate.merge(ParseDelta {
            session: Some(SessionInfo {
                id: Some("second".to_string()),
                ..SessionInfo::default()
            }),
            ..ParseDelta::default()
        });
        assert_eq!(
            aggregate.session.and_then(|s| s.id).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn compaction_accumulates_and_keeps_latest_time() {
        let mut aggregate = ActivityAggregate::default();
        aggregate.merge(ParseDelta {
            compaction_count: 2,
            last_compaction_at: Some(at(50)),
            ..ParseDelta::default()
        });
        aggregate.merge(ParseDelta {
            compaction_count: 1,
            last_compaction_at: Some(at(10)),
            ..ParseDelta::default()
        });
        assert_eq!(aggregate.compaction_count, 3);
        assert_eq!(aggregate.last_compaction_at, Some(at(50)));
    }
}
