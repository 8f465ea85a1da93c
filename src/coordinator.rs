use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::activity::ActivityAggregate;
use crate::flight::{FlightRole, SingleFlight};
use crate::locator::SessionChange;
use crate::record::{RecordInterpreter, is_complete_json};
use crate::tail::OffsetReader;

#[derive(Debug)]
struct TailState {
    path: Option<PathBuf>,
    offset: u64,
    aggregate: ActivityAggregate,
}

#[derive(Debug)]
pub struct ParseCoordinator {
    state: Mutex<TailState>,
    flight: SingleFlight,
    reader: OffsetReader,
    max_recent_calls: usize,
}

impl Default for ParseCoordinator {
    fn default() -> Self {
        Self::new(crate::activity::DEFAULT_MAX_RECENT_CALLS)
    }
}

impl ParseCoordinator {
    pub fn new(max_recent_calls: usize) -> Self {
        Self::with_reader(OffsetReader::default(), max_recent_calls)
    }

    pub fn with_reader(reader: OffsetReader, max_recent_calls: usize) -> Self {
        Self {
            state: Mutex::new(TailState {
                path: None,
                offset: 0,
                aggregate: ActivityAggregate::new(max_recent_calls),
            }),
            flight: SingleFlight::new(),
            reader,
            max_recent_calls,
        }
    }

    pub fn set_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.lock();
        if state.path.as_deref() == Some(path.as_path()) {
            return;
        }
        info!(path = %path.display(), "tailing rollout");
        state.path = Some(path);
        state.offset = 0;
        state.aggregate = ActivityAggregate::new(self.max_recent_calls);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        if state.path.take().is_some() {
            info!("no active rollout");
        }
        state.offset = 0;
        state.aggregate = ActivityAggregate::new(self.max_recent_calls);
    }

    pub fn apply_change(&self, change: &SessionChange) {
        match change {
            SessionChange::Selected(candidate) => self.set_path(&candidate.path),
            SessionChange::Cleared => self.clear(),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn offset(&self) -> u64 {
        self.lock().offset
    }

    pub fn snapshot(&self) -> Option<ActivityAggregate> {
        let state = self.lock();
        state.path.as_ref().map(|_| state.aggregate.clone())
    }

    pub fn refresh(&self) -> Option<ActivityAggregate> {
        if let FlightRole::Leader { passes } = self.flight.run(|| self.refresh_once())
            && passes > 1
        {
            debug!(passes, "coalesced refresh requests");
        }
        self.snapshot()
    }

    fn refresh_once(&self) {
        let mut state = self.lock();
        let Some(path) = state.path.clone() else {
            return;
        };

        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rollout not readable; keeping cursor");
                return;
            }
        };
        if size < state.offset {
            info!(path = %path.display(), size, offset = state.offset, "rollout truncated; rebuilding");
            state.offset = 0;
            state.aggregate = ActivityAggregate::new(self.max_recent_calls);
        }

        let read = self.reader.read_from(&path, state.offset);
        if read.restarted {
            // Shrunk between the size check and the read.
            info!(path = %path.display(), "rollout truncated during read; rebuilding");
            state.aggregate = ActivityAggregate::new(self.max_recent_calls);
        }

        let mut lines = read.lines;
        let mut end_offset = read.end_offset;
        if let Some(line_start) = read.unterminated_from
            && lines.last().is_some_and(|line| !is_complete_json(line))
        {
            // Writer is mid-line; pick it up once it is finished.
            lines.pop();
            end_offset = line_start;
        }

        let mut interpreter = RecordInterpreter::new(&mut state.aggregate);
        for line in &lines {
            let _ = interpreter.fold_line(line);
        }
        let delta = interpreter.finish();
        state.aggregate.merge(delta);
        state.offset = end_offset;

        if let Some(err) = read.error {
            warn!(path = %path.display(), error = %err, offset = end_offset, "rollout read interrupted");
        }
        debug!(path = %path.display(), lines = lines.len(), offset = end_offset, "refreshed rollout");
    }

    fn lock(&self) -> MutexGuard<'_, TailState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ToolStatus;
    use std::io::Write as _;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open rollout");
        file.write_all(text.as_bytes()).expect("append");
    }

    fn fixture() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("rollout.jsonl");
        std::fs::write(&path, "").expect("create rollout");
        (tmp, path)
    }

    const SESSION: &str = r#"{"timestamp":"2026-01-15T10:00:00Z","type":"session_meta","payload":{"id":"s-1","cwd":"/work/app","timestamp":"2026-01-15T10:00:00Z","cli_version":"0.80.0"}}"#;

    fn call(id: &str, name: &str, at: &str) -> String {
        format!(
            r#"{{"timestamp":"{at}","type":"response_item","payload":{{"type":"function_call","name":"{name}","call_id":"{id}","arguments":"{{\"command\":[\"ls\"]}}"}}}}"#
        )
    }

    fn output(id: &str, at: &str) -> String {
        format!(
            r#"{{"timestamp":"{at}","type":"response_item","payload":{{"type":"function_call_output","call_id":"{id}","output":{{"success":true}}}}}}"#
        )
    }

    #[test]
    fn completion_in_a_later_refresh_finishes_the_same_call() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);

        append(
            &path,
            "{\"type\":\"response_item\",\"payload\":{\"type\":\"function_call\",\"name\":\"Read\",\"id\":\"c1\"}}\n",
        );
        let first = coordinator.refresh().expect("snapshot");
        assert_eq!(first.recent_calls.len(), 1);
        assert_eq!(first.recent_calls[0].name, "Read");
        assert_eq!(first.recent_calls[0].status, ToolStatus::Running);
        assert_eq!(first.running_count(), 1);

        append(
            &path,
            "{\"type\":\"response_item\",\"payload\":{\"type\":\"function_call_output\",\"call_id\":\"c1\",\"output\":{\"success\":true}}}\n",
        );
        let second = coordinator.refresh().expect("snapshot");
        assert_eq!(second.recent_calls.len(), 1);
        assert_eq!(second.recent_calls[0].status, ToolStatus::Completed);
        assert_eq!(second.total_calls, 1);
        assert_eq!(second.running_count(), 0);
    }

    #[test]
    fn duration_spans_refreshes() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);
        append(&path, &format!("{}\n", call("c1", "shell", "2026-01-15T10:00:00Z")));
        coordinator.refresh();
        append(&path, &format!("{}\n", output("c1", "2026-01-15T10:00:02.500Z")));
        let aggregate = coordinator.refresh().expect("snapshot");
        assert_eq!(aggregate.recent_calls[0].duration_ms, Some(2_500));
    }

    #[test]
    fn incremental_and_whole_file_parsing_agree() {
        let mut content = format!("{SESSION}\n");
        for i in 0..14 {
            let start = format!("2026-01-15T10:{:02}:00Z", i);
            let end = format!("2026-01-15T10:{:02}:30Z", i);
            content.push_str(&call(&format!("c{i}"), "shell", &start));
            content.push('\n');
            if i % 3 != 0 {
                content.push_str(&output(&format!("c{i}"), &end));
                content.push('\n');
            }
        }
        content.push_str(r#"{"timestamp":"2026-01-15T10:20:00Z","type":"event_msg","payload":{"type":"token_count","info":{"total_token_usage":{"input_tokens":900,"total_tokens":1000},"last_token_usage":{"input_tokens":90,"total_tokens":100},"model_context_window":200000}}}"#);
        content.push('\n');
        content.push_str(&output("c0", "2026-01-15T10:21:00Z"));
        content.push('\n');

        let (_whole_tmp, whole_path) = fixture();
        std::fs::write(&whole_path, &content).expect("write");
        let whole = ParseCoordinator::default();
        whole.set_path(&whole_path);
        let expected = whole.refresh().expect("snapshot");

        for step in [1usize, 7, 64, 333] {
            let (_tmp, path) = fixture();
            let incremental = ParseCoordinator::with_reader(OffsetReader::new(5), 10);
            incremental.set_path(&path);
            let bytes = content.as_bytes();
            for piece in bytes.chunks(step) {
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .expect("open");
                file.write_all(piece).expect("append");
                incremental.refresh();
            }
            let actual = incremental.refresh().expect("snapshot");
            assert_eq!(actual, expected, "chunk size {step}");
            assert_eq!(incremental.offset(), bytes.len() as u64);
        }
    }

    #[test]
    fn half_written_line_is_read_once_complete() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);
        let line = call("c1", "shell", "2026-01-15T10:00:00Z");
        let (head, tail) = line.split_at(line.len() / 2);

        append(&path, head);
        let partial = coordinator.refresh().expect("snapshot");
        assert_eq!(partial.total_calls, 0);
        assert_eq!(partial.skipped.total(), 0);
        assert_eq!(coordinator.offset(), 0);

        append(&path, &format!("{tail}\n"));
        let complete = coordinator.refresh().expect("snapshot");
        assert_eq!(complete.total_calls, 1);
        assert_eq!(coordinator.offset(), line.len() as u64 + 1);
    }

    #[test]
    fn complete_but_unterminated_line_is_not_folded_twice() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);
        append(&path, &call("c1", "shell", "2026-01-15T10:00:00Z"));
        assert_eq!(coordinator.refresh().expect("snapshot").total_calls, 1);

        append(&path, &format!("\n{}\n", call("c2", "shell", "2026-01-15T10:00:01Z")));
        let aggregate = coordinator.refresh().expect("snapshot");
        assert_eq!(aggregate.total_calls, 2);
        assert_eq!(aggregate.recent_calls.len(), 2);
    }

    #[test]
    fn truncation_resets_cursor_and_aggregate() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);
        append(&path, &format!("{SESSION}\n"));
        for i in 0..3 {
            append(&path, &format!("{}\n", call(&format!("c{i}"), "shell", "2026-01-15T10:00:00Z")));
        }
        assert_eq!(coordinator.refresh().expect("snapshot").total_calls, 3);

        std::fs::write(&path, "").expect("truncate");
        append(&path, &format!("{}\n", call("fresh", "Read", "2026-01-15T11:00:00Z")));
        let aggregate = coordinator.refresh().expect("snapshot");
        assert_eq!(aggregate.total_calls, 1);
        assert!(aggregate.session.is_none());
        assert_eq!(aggregate.recent_calls[0].id, "fresh");
        assert_eq!(
            coordinator.offset(),
            std::fs::metadata(&path).expect("meta").len()
        );
    }

    #[test]
    fn recent_calls_stay_bounded() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::new(4);
        coordinator.set_path(&path);
        for round in 0..5 {
            for i in 0..3 {
                let id = format!("r{round}-{i}");
                append(&path, &format!("{}\n", call(&id, "shell", "2026-01-15T10:00:00Z")));
            }
            let aggregate = coordinator.refresh().expect("snapshot");
            assert!(aggregate.recent_calls.len() <= 4);
        }
        let aggregate = coordinator.snapshot().expect("snapshot");
        assert_eq!(aggregate.total_calls, 15);
        let ids: Vec<&str> = aggregate.recent_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["r3-2", "r4-0", "r4-1", "r4-2"]);
    }

    #[test]
    fn latest_wins_fields_survive_quiet_refreshes() {
        let (_tmp, path) = fixture();
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&path);
        append(
            &path,
            concat!(
                r#"{"timestamp":"2026-01-15T10:00:00Z","type":"turn_context","payload":{"approval_policy":"on-request","sandbox_policy":{"type":"workspace-write"},"model":"gpt-5-codex"}}"#,
                "\n",
                r#"{"timestamp":"2026-01-15T10:00:01Z","type":"event_msg","payload":{"type":"plan_update","plan":[{"step":"a","status":"completed"},{"step":"b","status":"in_progress"}]}}"#,
                "\n"
            ),
        );
        coordinator.refresh();
        for i in 0..3 {
            append(&path, &format!("{}\n", call(&format!("c{i}"), "shell", "2026-01-15T10:01:00Z")));
            let aggregate = coordinator.refresh().expect("snapshot");
            assert_eq!(aggregate.approval_policy.as_deref(), Some("on-request"));
            assert_eq!(aggregate.sandbox_mode.as_deref(), Some("workspace-write"));
            let plan = aggregate.plan.expect("plan kept");
            assert_eq!((plan.completed, plan.total), (1, 2));
        }
    }

    #[test]
    fn switching_paths_discards_previous_state() {
        let tmp = TempDir::new().expect("temp dir");
        let first = tmp.path().join("a.jsonl");
        let second = tmp.path().join("b.jsonl");
        append(&first, &format!("{SESSION}\n{}\n", call("c1", "shell", "2026-01-15T10:00:00Z")));
        append(&second, &format!("{}\n", call("c9", "Read", "2026-01-15T10:00:00Z")));

        let coordinator = ParseCoordinator::default();
        coordinator.set_path(&first);
        coordinator.refresh();
        let offset = coordinator.offset();
        coordinator.set_path(&first);
        assert_eq!(coordinator.offset(), offset);

        coordinator.set_path(&second);
        assert_eq!(coordinator.path(), Some(second.clone()));
        assert_eq!(coordinator.offset(), 0);
        let aggregate = coordinator.refresh().expect("snapshot");
        assert!(aggregate.session.is_none());
        assert_eq!(aggregate.total_calls, 1);

        coordinator.clear();
        assert!(coordinator.path().is_none());
        assert!(coordinator.snapshot().is_none());
        assert!(coordinator.refresh().is_none());
    }

    #[test]
    fn out_of_order_timestamps_keep_the_latest_marker_in_any_chunking() {
        let lines = [
            r#"{"timestamp":"2026-01-15T10:00:10Z","type":"event_msg","payload":{"type":"context_compacted"}}"#.to_string(),
            r#"{"timestamp":"2026-01-15T10:00:05Z","type":"event_msg","payload":{"type":"context_compacted"}}"#.to_string(),
            r#"{"timestamp":"2026-01-15T10:00:20Z","type":"event_msg","payload":{"type":"agent_message","message":"done"}}"#.to_string(),
            r#"{"timestamp":"2026-01-15T10:00:15Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[]}}"#.to_string(),
            call("c1", "shell", "2026-01-15T10:01:00Z"),
            output("c1", "2026-01-15T10:00:50Z"),
        ];

        let (_whole_tmp, whole_path) = fixture();
        std::fs::write(&whole_path, format!("{}\n", lines.join("\n"))).expect("write");
        let whole = ParseCoordinator::default();
        whole.set_path(&whole_path);
        let expected = whole.refresh().expect("snapshot");

        let (_tmp, path) = fixture();
        let incremental = ParseCoordinator::default();
        incremental.set_path(&path);
        for line in &lines {
            append(&path, &format!("{line}\n"));
            incremental.refresh();
        }
        let actual = incremental.snapshot().expect("snapshot");

        assert_eq!(actual, expected);
        assert_eq!(expected.compaction_count, 2);
        assert_eq!(
            expected.last_compaction_at,
            crate::record::parse_utc_timestamp("2026-01-15T10:00:10Z")
        );
        assert_eq!(
            expected.last_assistant_message_at,
            crate::record::parse_utc_timestamp("2026-01-15T10:00:20Z")
        );
        assert_eq!(
            expected.last_tool_activity_at,
            crate::record::parse_utc_timestamp("2026-01-15T10:01:00Z")
        );
    }

    #[test]
    fn missing_file_keeps_cursor() {
        let tmp = TempDir::new().expect("temp dir");
        let coordinator = ParseCoordinator::default();
        coordinator.set_path(tmp.path().join("gone.jsonl"));
        let aggregate = coordinator.refresh().expect("snapshot");
        assert_eq!(aggregate.records, 0);
        assert_eq!(coordinator.offset(), 0);
    }

    #[test]
    fn concurrent_refreshes_settle_on_full_content() {
        let (_tmp, path) = fixture();
        let coordinator = Arc::new(ParseCoordinator::default());
        coordinator.set_path(&path);
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let coordinator = Arc::clone(&coordinator);
                let path = path.clone();
                thread::spawn(move || {
                    for i in 0..5 {
                        append(&path, &format!("{}\n", call(&format!("t{t}-{i}"), "shell", "2026-01-15T10:00:00Z")));
                        coordinator.refresh();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer");
        }
        let aggregate = coordinator.refresh().expect("snapshot");
        assert_eq!(aggregate.total_calls, 20);
        assert_eq!(aggregate.skipped.total(), 0);
    }
}
