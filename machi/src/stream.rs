//! Stream Buffer and Output Sanitizer: streaming-chunk dedup/overlap
//! collapsing for provider output, plus extraction of the
//! `<<ORCH_FINAL>>`/`<<ORCH_TOOL_CALLS>>`-framed CLI protocol.

use std::time::{Duration, Instant};

/// How far back [`StreamBuffer::append`] scans for an overlapping
/// suffix/prefix between the previous chunk and the incoming one.
const OVERLAP_SCAN_CHARS: usize = 280;

/// Accumulates provider output chunks, collapsing exact repeats, prefix
/// extensions, and overlapping suffix/prefix pairs into a single delta
/// stream, and bounds its retained history.
pub struct StreamBuffer {
    pending: String,
    history: String,
    history_cap: usize,
    previous_chunk: String,
    last_flush_key: Option<String>,
    last_flush_at: Option<Instant>,
    flush_count: u64,
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("pending_len", &self.pending.len())
            .field("history_len", &self.history.len())
            .field("flush_count", &self.flush_count)
            .finish()
    }
}

impl StreamBuffer {
    /// Creates a buffer bounding its retained history to `history_cap`
    /// characters (the spec's default is 200_000).
    #[must_use]
    pub fn new(history_cap: usize) -> Self {
        Self {
            pending: String::new(),
            history: String::new(),
            history_cap,
            previous_chunk: String::new(),
            last_flush_key: None,
            last_flush_at: None,
            flush_count: 0,
        }
    }

    /// Appends raw provider output, computing only the genuinely new delta:
    /// exact repeats and prefix-of-previous are ignored; an incoming chunk
    /// that extends the previous one contributes only its tail; otherwise
    /// the longest suffix-of-previous that is a prefix-of-incoming (scanned
    /// up to [`OVERLAP_SCAN_CHARS`]) is trimmed before appending.
    pub fn append(&mut self, raw: &str) {
        if raw.is_empty() || raw == self.previous_chunk {
            return;
        }
        let delta: &str = if raw.starts_with(self.previous_chunk.as_str()) {
            &raw[self.previous_chunk.len()..]
        } else if self.previous_chunk.starts_with(raw) {
            ""
        } else {
            let scan = OVERLAP_SCAN_CHARS.min(self.previous_chunk.len());
            let mut overlap = 0;
            for len in (1..=scan).rev() {
                let suffix_start = self.previous_chunk.len() - len;
                if self.previous_chunk.is_char_boundary(suffix_start)
                    && raw.len() >= len
                    && raw.is_char_boundary(len)
                    && self.previous_chunk[suffix_start..] == raw[..len]
                {
                    overlap = len;
                    break;
                }
            }
            &raw[overlap..]
        };

        if delta.is_empty() {
            self.previous_chunk = raw.to_owned();
            return;
        }

        self.pending.push_str(delta);
        self.history.push_str(delta);
        if self.history.len() > self.history_cap {
            let excess = self.history.len() - self.history_cap;
            let mut cut = excess;
            while cut < self.history.len() && !self.history.is_char_boundary(cut) {
                cut += 1;
            }
            self.history.drain(..cut);
        }
        self.previous_chunk = raw.to_owned();
    }

    /// True iff the pending buffer is non-empty, at least `min_chars`, and
    /// at least `interval` has elapsed since the last flush (or there has
    /// never been one).
    #[must_use]
    pub fn should_flush(&self, interval: Duration, min_chars: usize) -> bool {
        if self.pending.is_empty() || self.pending.len() < min_chars {
            return false;
        }
        self.last_flush_at
            .is_none_or(|at| at.elapsed() >= interval)
    }

    /// Drains and returns the pending buffer, unless its whitespace-
    /// normalized lowercased form is identical to the last flush (in which
    /// case `None` is returned and the buffer is left untouched so it can
    /// accumulate further before the next attempt).
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let key = normalize_for_dedup(&self.pending);
        if self.last_flush_key.as_deref() == Some(key.as_str()) {
            return None;
        }
        let content = std::mem::take(&mut self.pending);
        self.last_flush_key = Some(key);
        self.last_flush_at = Some(Instant::now());
        self.flush_count += 1;
        Some(content)
    }

    /// The full bounded history accumulated so far.
    #[must_use]
    pub fn full_content(&self) -> &str {
        &self.history
    }

    /// Number of successful (non-deduped) flushes.
    #[must_use]
    pub const fn flush_count(&self) -> u64 {
        self.flush_count
    }
}

fn normalize_for_dedup(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

const FINAL_START: &str = "<<ORCH_FINAL>>";
const FINAL_END: &str = "<<ORCH_FINAL_END>>";
const TOOL_CALLS_START: &str = "<<ORCH_TOOL_CALLS>>";
const TOOL_CALLS_END: &str = "<<ORCH_TOOL_CALLS_END>>";

/// A tool call requested by a CLI provider through the `<<ORCH_TOOL_CALLS>>`
/// framing.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FramedToolCall {
    /// The provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    pub arguments: serde_json::Value,
}

#[derive(Debug, serde::Deserialize)]
struct ToolCallsEnvelope {
    tool_calls: Vec<FramedToolCall>,
}

/// Extracts the last `<<ORCH_FINAL>>...<<ORCH_FINAL_END>>` block from `text`.
/// If only a start marker is present (streaming mid-flight), returns the
/// in-progress body since that marker instead.
#[must_use]
pub fn extract_final(text: &str) -> Option<String> {
    if let Some(last_start) = text.rfind(FINAL_START) {
        let after_start = last_start + FINAL_START.len();
        if let Some(end_rel) = text[after_start..].find(FINAL_END) {
            return Some(text[after_start..after_start + end_rel].trim().to_owned());
        }
        return Some(text[after_start..].trim().to_owned());
    }
    None
}

/// Extracts and parses the last `<<ORCH_TOOL_CALLS>>{...}<<ORCH_TOOL_CALLS_END>>`
/// block. Returns `None` if absent or malformed.
#[must_use]
pub fn extract_tool_calls(text: &str) -> Option<Vec<FramedToolCall>> {
    let last_start = text.rfind(TOOL_CALLS_START)?;
    let after_start = last_start + TOOL_CALLS_START.len();
    let end_rel = text[after_start..].find(TOOL_CALLS_END)?;
    let body = text[after_start..after_start + end_rel].trim();
    let envelope: ToolCallsEnvelope = serde_json::from_str(body).ok()?;
    Some(envelope.tool_calls)
}

/// One line of a JSON-event-stream CLI's output.
#[derive(Debug, serde::Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    item: Option<StreamItem>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamItem {
    #[serde(rename = "type", default)]
    item_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// Reconstructs final text from a JSON-line event stream by walking lines in
/// order, tracking the last complete text so each `item.completed` line
/// (for `agent_message|assistant_message|message|reasoning` items) yields
/// only its incremental delta.
#[must_use]
pub fn reconstruct_from_json_lines(text: &str) -> String {
    let mut last_full_text = String::new();
    let mut out = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<StreamLine>(line) else {
            continue;
        };
        if parsed.kind != "item.completed" {
            continue;
        }
        let Some(item) = parsed.item else { continue };
        if !matches!(
            item.item_type.as_str(),
            "agent_message" | "assistant_message" | "message" | "reasoning"
        ) {
            continue;
        }
        let Some(full) = item.text else { continue };
        if let Some(delta) = full.strip_prefix(last_full_text.as_str()) {
            out.push_str(delta);
        } else {
            out.push_str(&full);
        }
        last_full_text = full;
    }
    out
}

/// Known provider error line prefixes, scanned to detect and surface/retry
/// provider failures rather than treating them as normal output.
const ERROR_PREFIXES: &[&str] = &[
    "error calling",
    "not logged in",
    "please run /login",
    "stream disconnected",
];

/// Scans `text` line by line for a known provider error prefix, returning the
/// first matching raw line.
#[must_use]
pub fn detect_provider_error(text: &str) -> Option<&str> {
    text.lines().find(|line| {
        let lower = line.to_lowercase();
        ERROR_PREFIXES.iter().any(|p| lower.contains(p))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_chunk_produces_identical_history_to_once() {
        let mut once = StreamBuffer::new(1000);
        once.append("abc");
        let mut repeated = StreamBuffer::new(1000);
        for _ in 0..5 {
            repeated.append("abc");
        }
        assert_eq!(once.full_content(), repeated.full_content());
    }

    #[test]
    fn overlapping_chunks_collapse() {
        let mut buf = StreamBuffer::new(1000);
        buf.append("abcdef");
        buf.append("defghi");
        assert_eq!(buf.full_content(), "abcdefghi");
    }

    #[test]
    fn prefix_extension_appends_only_tail() {
        let mut buf = StreamBuffer::new(1000);
        buf.append("hel");
        buf.append("hello");
        assert_eq!(buf.full_content(), "hello");
    }

    #[test]
    fn shrinking_chunk_contributes_nothing() {
        let mut buf = StreamBuffer::new(1000);
        buf.append("hello");
        buf.append("hel");
        assert_eq!(buf.full_content(), "hello");
    }

    #[test]
    fn flush_never_repeats_same_normalized_content() {
        let mut buf = StreamBuffer::new(1000);
        buf.append("Hello World");
        let first = buf.flush();
        assert_eq!(first.as_deref(), Some("Hello World"));
        buf.append("  hello   world  ");
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn history_is_bounded() {
        let mut buf = StreamBuffer::new(5);
        buf.append("abcdefgh");
        assert!(buf.full_content().len() <= 5);
        assert!(buf.full_content().ends_with("defgh"));
    }

    #[test]
    fn should_flush_respects_min_chars_and_interval() {
        let mut buf = StreamBuffer::new(1000);
        assert!(!buf.should_flush(Duration::from_millis(0), 5));
        buf.append("ab");
        assert!(!buf.should_flush(Duration::from_millis(0), 5));
        buf.append("cdef");
        assert!(buf.should_flush(Duration::from_millis(0), 5));
    }

    #[test]
    fn final_marker_picks_last_block() {
        let text = format!(
            "noise {FINAL_START} old {FINAL_END} more noise {FINAL_START} new answer {FINAL_END}"
        );
        assert_eq!(extract_final(&text).as_deref(), Some("new answer"));
    }

    #[test]
    fn final_marker_partial_stream_returns_in_progress_body() {
        let text = format!("{FINAL_START} partial answer so far");
        assert_eq!(extract_final(&text).as_deref(), Some("partial answer so far"));
    }

    #[test]
    fn no_marker_returns_none() {
        assert_eq!(extract_final("just plain text"), None);
    }

    #[test]
    fn tool_calls_block_parses() {
        let text = format!(
            r#"{TOOL_CALLS_START}{{"tool_calls":[{{"id":"1","name":"read_file","arguments":{{"path":"a"}}}}]}}{TOOL_CALLS_END}"#
        );
        let calls = extract_tool_calls(&text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn json_line_stream_reconstructs_incremental_deltas() {
        let text = [
            r#"{"type":"thread.started"}"#,
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"Hello"}}"#,
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"Hello world"}}"#,
        ]
        .join("\n");
        assert_eq!(reconstruct_from_json_lines(&text), "Hello world");
    }

    #[test]
    fn provider_error_prefix_detected() {
        let text = "banner\nerror calling claude: timeout\nmore";
        assert_eq!(
            detect_provider_error(text),
            Some("error calling claude: timeout")
        );
    }

    #[test]
    fn no_provider_error_returns_none() {
        assert_eq!(detect_provider_error("all good here"), None);
    }
}
