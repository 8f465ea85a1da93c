use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;
use tracing::trace;

use crate::activity::{
    ActivityAggregate, ParseDelta, PlanProgress, PlanStep, RateLimits, SessionInfo, SkipReason,
    TokenUsage, TokenUsageInfo, ToolCall, ToolStatus, UsageWindow, max_datetime,
};
use crate::util::truncate;

const COMMAND_TARGET_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    SessionMeta(SessionMeta),
    ResponseItem(ResponseItem),
    EventMsg(EventMsg),
    TurnContext(TurnContext),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseItem {
    ToolCall(ToolInvocation),
    ToolOutput(ToolOutput),
    AssistantMessage,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventMsg {
    PlanUpdate(PlanUpdate),
    TokenCount(TokenCount),
    RateLimits(RateLimits),
    TurnStarted { model_context_window: Option<u64> },
    ContextCompacted,
    AgentMessage,
    Other,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionMeta {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub cwd: Option<String>,
    pub originator: Option<String>,
    pub cli_version: Option<String>,
    pub model_provider: Option<String>,
    pub git: Option<GitMeta>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitMeta {
    pub commit_hash: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolInvocation {
    pub name: Option<String>,
    pub call_id: Option<String>,
    pub id: Option<String>,
    pub arguments: Option<Value>,
    pub input: Option<String>,
}

impl ToolInvocation {
    fn correlation_id(&self) -> Option<&str> {
        self.call_id.as_deref().or(self.id.as_deref())
    }

    fn arguments_value(&self) -> Option<Value> {
        match self.arguments.as_ref()? {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            other => Some(other.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolOutput {
    pub call_id: Option<String>,
    pub id: Option<String>,
    pub output: Option<Value>,
}

impl ToolOutput {
    fn correlation_id(&self) -> Option<&str> {
        self.call_id.as_deref().or(self.id.as_deref())
    }

    pub fn signals_failure(&self) -> bool {
        let Some(output) = self.output.as_ref() else {
            return false;
        };
        let decoded;
        let object = match output {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    decoded = value;
                    &decoded
                }
                Err(_) => return false,
            },
            other => other,
        };
        if object.get("success").and_then(Value::as_bool) == Some(false) {
            return true;
        }
        object
            .get("metadata")
            .and_then(|meta| meta.get("exit_code"))
            .and_then(Value::as_i64)
            .is_some_and(|code| code != 0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanUpdate {
    pub plan: Option<Vec<PlanStep>>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenCount {
    pub info: Option<TokenCountInfo>,
    pub rate_limits: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenCountInfo {
    pub total_token_usage: Option<TokenUsage>,
    pub last_token_usage: Option<TokenUsage>,
    pub model_context_window: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnContext {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl LogRecord {
    pub fn parse(line: &str) -> Result<Self, SkipReason> {
        let line = line.trim();
        if line.is_empty() {
            return Err(SkipReason::Blank);
        }
        let envelope: Envelope = serde_json::from_str(line).map_err(|_| SkipReason::Malformed)?;
        let timestamp = envelope.timestamp.as_deref().and_then(parse_utc_timestamp);
        let body = RecordBody::from_parts(&envelope.kind, envelope.payload)?;
        Ok(Self { timestamp, body })
    }
}

impl RecordBody {
    fn from_parts(kind: &str, payload: Value) -> Result<Self, SkipReason> {
        let body = match kind {
            "session_meta" => RecordBody::SessionMeta(decode(payload)?),
            "response_item" => RecordBody::ResponseItem(ResponseItem::from_payload(payload)?),
            "event_msg" => RecordBody::EventMsg(EventMsg::from_payload(payload)?),
            "turn_context" => RecordBody::TurnContext(TurnContext::from_payload(&payload)),
            _ => RecordBody::Unknown,
        };
        Ok(body)
    }
}

impl ResponseItem {
    fn from_payload(payload: Value) -> Result<Self, SkipReason> {
        let item = match str_at(&payload, &["type"]).as_deref() {
            Some("function_call") | Some("custom_tool_call") => {
                ResponseItem::ToolCall(decode(payload)?)
            }
            Some("function_call_output") | Some("custom_tool_call_output") => {
                ResponseItem::ToolOutput(decode(payload)?)
            }
            Some("message") if str_at(&payload, &["role"]).as_deref() == Some("assistant") => {
                ResponseItem::AssistantMessage
            }
            _ => ResponseItem::Other,
        };
        Ok(item)
    }
}

impl EventMsg {
    fn from_payload(payload: Value) -> Result<Self, SkipReason> {
        let event = match str_at(&payload, &["type"]).as_deref() {
            Some("plan_update") => EventMsg::PlanUpdate(decode(payload)?),
            Some("token_count") => EventMsg::TokenCount(decode(payload)?),
            Some("rate_limit") | Some("rate_limits") => {
                let source = payload.get("rate_limits").unwrap_or(&payload);
                EventMsg::RateLimits(parse_rate_limits(source))
            }
            Some("turn_started") | Some("task_started") => EventMsg::TurnStarted {
                model_context_window: uint_at(&payload, &["model_context_window"]),
            },
            Some("context_compacted") => EventMsg::ContextCompacted,
            Some("agent_message") => EventMsg::AgentMessage,
            _ => EventMsg::Other,
        };
        Ok(event)
    }
}

impl TurnContext {
    fn from_payload(payload: &Value) -> Self {
        Self {
            cwd: str_at(payload, &["cwd"]),
            model: str_at(payload, &["model"]),
            approval_policy: str_at(payload, &["approval_policy"]),
            sandbox_mode: str_at(payload, &["sandbox_policy", "type"])
                .or_else(|| str_at(payload, &["sandbox_policy"]))
                .or_else(|| str_at(payload, &["sandbox_mode"])),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, SkipReason> {
    serde_json::from_value(payload).map_err(|_| SkipReason::Malformed)
}

pub fn is_complete_json(line: &str) -> bool {
    serde_json::from_str::<IgnoredAny>(line.trim()).is_ok()
}

pub struct RecordInterpreter<'a> {
    running: &'a mut HashMap<String, ToolCall>,
    next_synthetic_id: &'a mut u64,
    delta: ParseDelta,
}

impl<'a> RecordInterpreter<'a> {
    pub fn new(aggregate: &'a mut ActivityAggregate) -> Self {
        Self {
            running: &mut aggregate.running_calls,
            next_synthetic_id: &mut aggregate.next_synthetic_id,
            delta: ParseDelta::default(),
        }
    }

    pub fn fold_line(&mut self, line: &str) -> Result<(), SkipReason> {
        let outcome = LogRecord::parse(line).and_then(|record| self.apply(record));
        if let Err(reason) = outcome {
            trace!(?reason, "skipped rollout line");
            self.delta.skipped.record(reason);
        }
        outcome
    }

    pub fn apply(&mut self, record: LogRecord) -> Result<(), SkipReason> {
        let ts = record.timestamp;
        self.delta.records += 1;
        self.delta.last_event_at = max_datetime(self.delta.last_event_at, ts);

        match record.body {
            RecordBody::SessionMeta(meta) => self.observe_session(meta),
            RecordBody::ResponseItem(ResponseItem::ToolCall(invocation)) => {
                return self.start_call(invocation, ts);
            }
            RecordBody::ResponseItem(ResponseItem::ToolOutput(output)) => {
                return self.complete_call(output, ts);
            }
            RecordBody::ResponseItem(ResponseItem::AssistantMessage)
            | RecordBody::EventMsg(EventMsg::AgentMessage) => {
                self.delta.last_assistant_message_at =
                    max_datetime(self.delta.last_assistant_message_at, ts);
            }
            RecordBody::ResponseItem(ResponseItem::Other) => {}
            RecordBody::EventMsg(event) => self.apply_event(event, ts),
            RecordBody::TurnContext(context) => {
                if context.approval_policy.is_some() {
                    self.delta.approval_policy = context.approval_policy;
                }
                if context.sandbox_mode.is_some() {
                    self.delta.sandbox_mode = context.sandbox_mode;
                }
                if context.model.is_some() {
                    self.delta.model = context.model;
                }
            }
            RecordBody::Unknown => return Err(SkipReason::Unrecognized),
        }
        Ok(())
    }

    pub fn finish(self) -> ParseDelta {
        self.delta
    }

    fn observe_session(&mut self, meta: SessionMeta) {
        if self.delta.session.is_some() {
            return;
        }
        let git = meta.git.unwrap_or_default();
        self.delta.session = Some(SessionInfo {
            id: meta.id,
            cwd: meta.cwd.map(PathBuf::from),
            started_at: meta.timestamp.as_deref().and_then(parse_utc_timestamp),
            originator: meta.originator,
            cli_version: meta.cli_version,
            model_provider: meta.model_provider,
            git_branch: git.branch,
            git_commit: git.commit_hash,
        });
    }

    fn start_call(
        &mut self,
        invocation: ToolInvocation,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), SkipReason> {
        let Some(name) = invocation.name.clone().filter(|name| !name.is_empty()) else {
            return Err(SkipReason::Malformed);
        };
        let id = match invocation.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                *self.next_synthetic_id += 1;
                format!("call-{}", self.next_synthetic_id)
            }
        };

        let arguments = invocation.arguments_value();
        if name == "update_plan"
            && let Some(args) = arguments.as_ref()
            && let Ok(update) = serde_json::from_value::<PlanUpdate>(args.clone())
            && let Some(steps) = update.plan
        {
            self.delta.plan = Some(PlanProgress::new(steps, update.explanation, ts));
        }

        let call = ToolCall {
            id: id.clone(),
            target: tool_target(&name, arguments.as_ref(), invocation.input.as_deref()),
            name: name.clone(),
            started_at: ts.unwrap_or_else(Utc::now),
            status: ToolStatus::Running,
            duration_ms: None,
        };

        self.delta.total_calls += 1;
        *self.delta.calls_by_name.entry(name).or_insert(0) += 1;
        self.delta.last_tool_activity_at = max_datetime(self.delta.last_tool_activity_at, ts);
        self.running.insert(id, call.clone());
        self.delta.new_calls.push(call);
        Ok(())
    }

    fn complete_call(
        &mut self,
        output: ToolOutput,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), SkipReason> {
        self.delta.last_tool_activity_at = max_datetime(self.delta.last_tool_activity_at, ts);
        let Some(mut call) = output
            .correlation_id()
            .and_then(|id| self.running.remove(id))
        else {
            return Err(SkipReason::OrphanOutput);
        };
        call.finish(output.signals_failure(), ts.unwrap_or_else(Utc::now));

        match self
            .delta
            .new_calls
            .iter_mut()
            .rev()
            .find(|existing| existing.id == call.id)
        {
            Some(slot) => *slot = call,
            None => self.delta.finished_calls.push(call),
        }
        Ok(())
    }

    fn apply_event(&mut self, event: EventMsg, ts: Option<DateTime<Utc>>) {
        match event {
            EventMsg::PlanUpdate(update) => {
                if let Some(steps) = update.plan {
                    self.delta.plan = Some(PlanProgress::new(steps, update.explanation, ts));
                }
            }
            EventMsg::TokenCount(count) => {
                if let Some(info) = count.info {
                    self.overlay_token_usage(TokenUsageInfo {
                        total: info.total_token_usage,
                        last: info.last_token_usage,
                        model_context_window: info.model_context_window,
                    });
                }
                if let Some(raw) = count.rate_limits.as_ref() {
                    let limits = parse_rate_limits(raw);
                    if limits.is_present() {
                        self.delta.rate_limits = Some(limits);
                    }
                }
            }
            EventMsg::RateLimits(limits) => {
                if limits.is_present() {
                    self.delta.rate_limits = Some(limits);
                }
            }
            EventMsg::TurnStarted {
                model_context_window: Some(window),
            } => self.overlay_token_usage(TokenUsageInfo {
                model_context_window: Some(window),
                ..TokenUsageInfo::default()
            }),
            EventMsg::TurnStarted { .. } => {}
            EventMsg::ContextCompacted => {
                self.delta.compaction_count += 1;
                self.delta.last_compaction_at = max_datetime(self.delta.last_compaction_at, ts);
            }
            EventMsg::AgentMessage | EventMsg::Other => {}
        }
    }

    fn overlay_token_usage(&mut self, newer: TokenUsageInfo) {
        let current = self.delta.token_usage.unwrap_or_default();
        self.delta.token_usage = Some(current.overlay(newer));
    }
}

pub fn tool_target(name: &str, arguments: Option<&Value>, input: Option<&str>) -> Option<String> {
    let lowered = name.to_ascii_lowercase();
    if lowered == "apply_patch" {
        return input.and_then(extract_patch_target).or_else(|| {
            let patch = str_at(arguments?, &["input"])?;
            extract_patch_target(&patch)
        });
    }

    let args = arguments?;
    match lowered.as_str() {
        "read" | "write" | "edit" | "multiedit" => str_at(args, &["file_path"])
            .or_else(|| str_at(args, &["path"]))
            .or_else(|| str_at(args, &["filePath"])),
        "glob" | "grep" | "search" => str_at(args, &["pattern"]),
        "bash" | "shell" | "shell_command" | "exec_command" | "run_terminal_command" => {
            command_text(args).map(|command| truncate(&command, COMMAND_TARGET_MAX_CHARS))
        }
        "task" => str_at(args, &["description"]).or_else(|| str_at(args, &["subagent_type"])),
        "view_image" => str_at(args, &["path"]).or_else(|| str_at(args, &["image_path"])),
        _ => None,
    }
}

fn command_text(args: &Value) -> Option<String> {
    let command = args.get("command").or_else(|| args.get("cmd"))?;
    let text = match command {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            match parts.as_slice() {
                [shell, flag, script] if is_shell(shell) && flag.starts_with('-') => {
                    (*script).to_string()
                }
                _ => parts.join(" "),
            }
        }
        _ => return None,
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn is_shell(program: &str) -> bool {
    let base = program.rsplit('/').next().unwrap_or(program);
    matches!(base, "bash" | "sh" | "zsh" | "pwsh" | "powershell")
}

fn extract_patch_target(input: &str) -> Option<String> {
    const MARKERS: [&str; 4] = [
        "*** Update File: ",
        "*** Add File: ",
        "*** Delete File: ",
        "*** Move to: ",
    ];
    input.lines().find_map(|line| {
        MARKERS
            .iter()
            .find_map(|marker| line.strip_prefix(marker))
            .map(|path| path.trim().to_string())
    })
}

pub fn parse_rate_limits(value: &Value) -> RateLimits {
    RateLimits {
        primary: parse_usage_window(value.get("primary")),
        secondary: parse_usage_window(value.get("secondary")),
    }
}

fn parse_usage_window(value: Option<&Value>) -> Option<UsageWindow> {
    let value = value.filter(|value| value.is_object())?;
    let used_percent = clamp_percent(float_at(value, &["used_percent"]).unwrap_or(0.0));

    Some(UsageWindow {
        used_percent,
        remaining_percent: clamp_percent(100.0 - used_percent),
        window_minutes: uint_at(value, &["window_minutes"]).unwrap_or(0),
        resets_at: int_at(value, &["resets_at"])
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single()),
    })
}

fn clamp_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

pub(crate) fn parse_utc_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn value_at<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    Some(cursor)
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    value_at(value, path)?.as_str().map(ToString::to_string)
}

fn uint_at(value: &Value, path: &[&str]) -> Option<u64> {
    let cursor = value_at(value, path)?;
    cursor
        .as_u64()
        .or_else(|| cursor.as_i64().and_then(|n| (n >= 0).then_some(n as u64)))
}

fn int_at(value: &Value, path: &[&str]) -> Option<i64> {
    let cursor = value_at(value, path)?;
    cursor
        .as_i64()
        .or_else(|| cursor.as_u64().map(|n| n as i64))
}

fn float_at(value: &Value, path: &[&str]) -> Option<f64> {
    let cursor = value_at(value, path)?;
    cursor
        .as_f64()
        .or_else(|| cursor.as_u64().map(|n| n as f64))
}
