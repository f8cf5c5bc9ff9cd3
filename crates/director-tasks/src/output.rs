//! Task output streams: structured events, the result, and debug lines.

use std::ops::Range;

use chrono::Utc;
use director_state::{OutputStream, StateStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaskResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Started,
    Finished,
    Failed,
}

/// One line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: i64,
    pub stage: String,
    pub task: String,
    pub index: usize,
    pub total: usize,
    pub state: EventState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Appends to the output streams of one task.
#[derive(Clone)]
pub struct TaskLogger {
    store: StateStore,
    task_id: u64,
}

impl TaskLogger {
    pub fn new(store: StateStore, task_id: u64) -> Self {
        Self { store, task_id }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    fn append(&self, stream: OutputStream, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        if let Err(e) = self.store.append_task_output(self.task_id, stream, &bytes) {
            warn!(task_id = self.task_id, stream = stream.as_str(), error = %e, "failed to write task output");
        }
    }

    pub fn event(&self, stage: &str, task: &str, index: usize, total: usize, state: EventState) {
        self.write_event(Event {
            time: Utc::now().timestamp(),
            stage: stage.to_string(),
            task: task.to_string(),
            index,
            total,
            state,
            progress: progress(state),
            tags: Vec::new(),
            error: None,
        });
    }

    pub fn event_failed(&self, stage: &str, task: &str, index: usize, total: usize, error: &str) {
        self.write_event(Event {
            time: Utc::now().timestamp(),
            stage: stage.to_string(),
            task: task.to_string(),
            index,
            total,
            state: EventState::Failed,
            progress: 100,
            tags: Vec::new(),
            error: Some(error.to_string()),
        });
    }

    pub fn write_event(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => self.append(OutputStream::Event, &line),
            Err(e) => warn!(task_id = self.task_id, error = %e, "failed to encode event"),
        }
    }

    /// Non-fatal notice surfaced to the user on the event stream.
    pub fn warning(&self, message: &str) {
        let line = serde_json::json!({
            "time": Utc::now().timestamp(),
            "type": "warning",
            "message": message,
        });
        self.append(OutputStream::Event, &line.to_string());
    }

    pub fn debug(&self, line: &str) {
        let stamped = format!("{} {line}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"));
        self.append(OutputStream::Debug, &stamped);
    }

    pub fn result(&self, text: &str) {
        self.append(OutputStream::Result, text);
    }
}

fn progress(state: EventState) -> u8 {
    match state {
        EventState::Started => 0,
        EventState::Finished | EventState::Failed => 100,
    }
}

/// A requested slice of a stream, as in an HTTP `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, both ends inclusive.
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last `n` bytes.
    Suffix(u64),
}

impl ByteRange {
    pub fn parse_header(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        match (start.trim(), end.trim()) {
            ("", "") => None,
            ("", n) => n.parse().ok().map(ByteRange::Suffix),
            (a, "") => a.parse().ok().map(ByteRange::From),
            (a, b) => {
                let (a, b) = (a.parse().ok()?, b.parse().ok()?);
                (a <= b).then_some(ByteRange::FromTo(a, b))
            }
        }
    }

    /// Byte offsets `start..end` within a stream of `len` bytes, clamped to
    /// the stream. `None` when the range starts past the end.
    pub fn resolve(self, len: u64) -> Option<Range<u64>> {
        let range = match self {
            ByteRange::FromTo(a, b) => a..b.saturating_add(1).min(len),
            ByteRange::From(a) => a..len,
            ByteRange::Suffix(n) => len.saturating_sub(n)..len,
        };
        (range.start < len || (len == 0 && range.start == 0)).then_some(range)
    }
}

/// A read from a task output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSlice {
    pub bytes: Vec<u8>,
    pub range: Range<u64>,
    pub total: u64,
}

/// Read a stream, or a byte range of it. `None` means the range is
/// unsatisfiable.
pub fn read_output(
    store: &StateStore,
    task_id: u64,
    stream: OutputStream,
    range: Option<ByteRange>,
) -> TaskResult<Option<OutputSlice>> {
    let all = store.read_task_output(task_id, stream)?;
    let total = all.len() as u64;
    let range = match range {
        Some(r) => match r.resolve(total) {
            Some(range) => range,
            None => return Ok(None),
        },
        None => 0..total,
    };
    let bytes = all[range.start as usize..range.end as usize].to_vec();
    Ok(Some(OutputSlice { bytes, range, total }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parsing() {
        assert_eq!(ByteRange::parse_header("bytes=0-9"), Some(ByteRange::FromTo(0, 9)));
        assert_eq!(ByteRange::parse_header("bytes=-100"), Some(ByteRange::Suffix(100)));
        assert_eq!(ByteRange::parse_header("bytes=5-"), Some(ByteRange::From(5)));
        assert_eq!(ByteRange::parse_header("bytes=9-1"), None);
        assert_eq!(ByteRange::parse_header("items=0-1"), None);
    }

    #[test]
    fn range_resolution_clamps() {
        assert_eq!(ByteRange::FromTo(2, 100).resolve(10), Some(2..10));
        assert_eq!(ByteRange::Suffix(4).resolve(10), Some(6..10));
        assert_eq!(ByteRange::Suffix(40).resolve(10), Some(0..10));
        assert_eq!(ByteRange::From(10).resolve(10), None);
    }

    #[test]
    fn events_are_json_lines_and_ranges_slice_them() {
        let store = StateStore::open_in_memory().unwrap();
        let logger = TaskLogger::new(store.clone(), 1);
        logger.event("Updating instance", "dea/0", 1, 2, EventState::Started);
        logger.event("Updating instance", "dea/0", 1, 2, EventState::Finished);
        logger.result("ok");

        let events = read_output(&store, 1, OutputStream::Event, None).unwrap().unwrap();
        let text = String::from_utf8(events.bytes).unwrap();
        let lines: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].state, EventState::Finished);
        assert_eq!(lines[1].progress, 100);

        let tail = read_output(&store, 1, OutputStream::Result, Some(ByteRange::Suffix(3)))
            .unwrap()
            .unwrap();
        assert_eq!(tail.bytes, b"ok\n");
        assert_eq!(tail.total, 3);
        assert!(read_output(&store, 1, OutputStream::Result, Some(ByteRange::From(50)))
            .unwrap()
            .is_none());
    }
}
