use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::activity::{ActivityAggregate, ContextUsage, ToolCall, ToolStatus, UsageWindow};
use crate::config::RuntimeSettings;
use crate::coordinator::ParseCoordinator;
use crate::locator::{SessionCandidate, SessionLocator};
use crate::util::{context_bar, format_age, format_tokens, human_duration, truncate};

const IDLE_LINE: &str = "codex-hud: no active Codex session";
const STOP_POLL: Duration = Duration::from_millis(100);

pub fn watch(settings: &RuntimeSettings) -> Result<()> {
    let stop = install_stop_signal()?;
    let coordinator = Arc::new(ParseCoordinator::new(settings.max_recent_calls));
    let mut locator = SessionLocator::new(settings.locator_settings());
    if let Some(change) = locator.check() {
        coordinator.apply_change(&change);
    }

    let locator_thread = {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&stop);
        let interval = settings.locate_interval;
        thread::Builder::new()
            .name("session-locator".to_string())
            .spawn(move || {
                while sleep_unless_stopped(&stop, interval) {
                    if let Some(change) = locator.check() {
                        coordinator.apply_change(&change);
                        coordinator.refresh();
                    }
                }
            })
            .context("failed to spawn session locator thread")?
    };

    let mut last_line = String::new();
    loop {
        let line = match coordinator.refresh() {
            Some(aggregate) => summary_line(&aggregate, settings.baseline_tokens),
            None => IDLE_LINE.to_string(),
        };
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
        if !sleep_unless_stopped(&stop, settings.refresh_interval) {
            break;
        }
    }

    locator_thread
        .join()
        .map_err(|_| anyhow!("session locator thread panicked"))?;
    debug!("watch stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    rollout: &'a SessionCandidate,
    context: Option<ContextUsage>,
    aggregate: &'a ActivityAggregate,
}

pub fn print_status(settings: &RuntimeSettings, json: bool) -> Result<()> {
    let mut locator = SessionLocator::new(settings.locator_settings());
    locator.check();
    let Some(candidate) = locator.current().cloned() else {
        if json {
            println!("null");
        } else {
            println!("{IDLE_LINE}");
            println!("sessions_root: {}", settings.sessions_root.display());
        }
        return Ok(());
    };

    let coordinator = ParseCoordinator::new(settings.max_recent_calls);
    coordinator.set_path(&candidate.path);
    let aggregate = coordinator
        .refresh()
        .ok_or_else(|| anyhow!("rollout {} was deselected", candidate.path.display()))?;
    let context = aggregate.context_usage(settings.baseline_tokens);

    if json {
        let report = StatusReport {
            rollout: &candidate,
            context,
            aggregate: &aggregate,
        };
        let rendered =
            serde_json::to_string_pretty(&report).context("failed to serialize status")?;
        println!("{rendered}");
        return Ok(());
    }

    print_detailed(settings, &candidate, &aggregate, context);
    Ok(())
}

pub fn list_sessions(settings: &RuntimeSettings) -> Result<()> {
    let now = SystemTime::now();
    let mut locator = SessionLocator::new(settings.locator_settings());
    locator.check_at(now);
    let selected = locator.current().map(|candidate| candidate.path.clone());
    let candidates = locator.discover(now);

    println!("sessions_root: {}", settings.sessions_root.display());
    if candidates.is_empty() {
        println!("no rollouts in the last {} day(s)", settings.lookback_days);
        return Ok(());
    }
    let now_utc = DateTime::<Utc>::from(now);
    for candidate in &candidates {
        let marker = if selected.as_ref() == Some(&candidate.path) {
            '*'
        } else if locator.is_eligible(candidate) {
            ' '
        } else {
            'x'
        };
        println!(
            "{marker} {:>10}  {:>8}  {}  {}",
            format_age(DateTime::<Utc>::from(candidate.modified_at), now_utc),
            format_tokens(candidate.size),
            candidate.session_id,
            candidate.path.display()
        );
    }
    Ok(())
}

pub fn summary_line(aggregate: &ActivityAggregate, baseline: u64) -> String {
    let mut parts = Vec::new();

    let session = aggregate
        .session
        .as_ref()
        .and_then(|session| session.id.as_deref())
        .map(|id| truncate(id, 13))
        .unwrap_or_else(|| "session".to_string());
    parts.push(session);
    if let Some(model) = aggregate.model.as_deref() {
        parts.push(model.to_string());
    }
    if let Some(context) = aggregate.context_usage(baseline) {
        parts.push(format!(
            "ctx {} {}% left",
            context_bar(context.percent_used, 10),
            context.percent_left
        ));
    }
    parts.push(format!(
        "tools {} running / {} total",
        aggregate.running_count(),
        aggregate.total_calls
    ));
    if let Some(call) = aggregate.recent_calls.back() {
        parts.push(format!("last {}", describe_call(call)));
    }
    if let Some(plan) = aggregate.plan.as_ref() {
        parts.push(format!("plan {}/{}", plan.completed, plan.total));
    }
    if let Some(limits) = aggregate.rate_limits.as_ref() {
        for window in [limits.primary.as_ref(), limits.secondary.as_ref()]
            .into_iter()
            .flatten()
        {
            parts.push(format!(
                "{} {:.0}% left",
                window_label(window),
                window.remaining_percent
            ));
        }
    }
    if aggregate.compaction_count > 0 {
        parts.push(format!("compacted x{}", aggregate.compaction_count));
    }
    parts.join(" | ")
}

fn print_detailed(
    settings: &RuntimeSettings,
    candidate: &SessionCandidate,
    aggregate: &ActivityAggregate,
    context: Option<ContextUsage>,
) {
    let now = Utc::now();
    println!("codex-hud status");
    println!("sessions_root: {}", settings.sessions_root.display());
    println!("rollout: {}", candidate.path.display());
    if let Some(session) = aggregate.session.as_ref() {
        println!("session: {}", session.id.as_deref().unwrap_or("unknown"));
        if let Some(cwd) = session.cwd.as_ref() {
            println!("  cwd: {}", cwd.display());
        }
        if let Some(started) = session.started_at {
            println!("  started: {} ({})", started.to_rfc3339(), format_age(started, now));
        }
        println!(
            "  cli: {} | provider: {}",
            session.cli_version.as_deref().unwrap_or("n/a"),
            session.model_provider.as_deref().unwrap_or("n/a")
        );
        if let Some(branch) = session.git_branch.as_deref() {
            println!("  branch: {branch}");
        }
    }
    println!(
        "model: {} | approval: {} | sandbox: {}",
        aggregate.model.as_deref().unwrap_or("n/a"),
        aggregate.approval_policy.as_deref().unwrap_or("n/a"),
        aggregate.sandbox_mode.as_deref().unwrap_or("n/a")
    );
    match context {
        Some(context) => println!(
            "context: {}/{} {} {}% left",
            format_tokens(context.used),
            format_tokens(context.window),
            context_bar(context.percent_used, 20),
            context.percent_left
        ),
        None => println!("context: n/a"),
    }
    if let Some(total) = aggregate.token_usage.and_then(|usage| usage.total) {
        println!(
            "tokens: in {} | cached {} | out {} | total {}",
            format_tokens(total.non_cached_input()),
            format_tokens(total.cached_input_tokens),
            format_tokens(total.output_tokens),
            format_tokens(total.total_tokens)
        );
    }
    if let Some(limits) = aggregate.rate_limits.as_ref() {
        for window in [limits.primary.as_ref(), limits.secondary.as_ref()]
            .into_iter()
            .flatten()
        {
            let reset = window
                .resets_at
                .map(|at| match (at - now).to_std() {
                    Ok(left) => format!("resets in {}", human_duration(left)),
                    Err(_) => "reset due".to_string(),
                })
                .unwrap_or_else(|| "reset n/a".to_string());
            println!(
                "limit {}: {:.0}% left ({reset})",
                window_label(window),
                window.remaining_percent
            );
        }
    }
    if let Some(plan) = aggregate.plan.as_ref() {
        println!("plan: {}/{} steps completed", plan.completed, plan.total);
    }
    println!(
        "tools: {} total, {} running",
        aggregate.total_calls,
        aggregate.running_count()
    );
    for (name, count) in &aggregate.calls_by_name {
        println!("  {name}: {count}");
    }
    if !aggregate.recent_calls.is_empty() {
        println!("recent:");
        for call in &aggregate.recent_calls {
            println!("  {}", describe_call(call));
        }
    }
    if aggregate.compaction_count > 0 {
        let when = aggregate
            .last_compaction_at
            .map(|at| format_age(at, now))
            .unwrap_or_else(|| "n/a".to_string());
        println!("compactions: {} (last {when})", aggregate.compaction_count);
    }
    if let Some(last) = aggregate.last_event_at {
        println!("last event: {}", format_age(last, now));
    }
    if aggregate.skipped.total() > 0 {
        let skipped = aggregate.skipped;
        println!(
            "skipped lines: {} (blank {}, malformed {}, unrecognized {}, orphan outputs {})",
            skipped.total(),
            skipped.blank,
            skipped.malformed,
            skipped.unrecognized,
            skipped.orphan_output
        );
    }
}

fn describe_call(call: &ToolCall) -> String {
    let mut text = call.name.clone();
    if let Some(target) = call.target.as_deref() {
        text.push(' ');
        text.push_str(&truncate(target, 40));
    }
    match call.status {
        ToolStatus::Running => text.push_str(" (running)"),
        ToolStatus::Completed => {
            if let Some(ms) = call.duration_ms {
                text.push_str(&format!(" ({})", human_duration(Duration::from_millis(ms))));
            }
        }
        ToolStatus::Error => text.push_str(" (error)"),
    }
    text
}

fn window_label(window: &UsageWindow) -> String {
    match window.window_minutes {
        0 => "limit".to_string(),
        minutes if minutes % 1_440 == 0 => format!("{}d", minutes / 1_440),
        minutes if minutes % 60 == 0 => format!("{}h", minutes / 60),
        minutes => format!("{minutes}m"),
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(STOP_POLL);
        thread::sleep(step);
        remaining -= step;
    }
    !stop.load(Ordering::Relaxed)
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
