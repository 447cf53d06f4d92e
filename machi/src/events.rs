//! Workflow Event Log: an append-only record of everything the orchestration
//! router and its tools do, plus a projection of the current state of each
//! background task derived from that log.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, ToSql, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Errors raised by the event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// I/O failure creating the event log directory or reading a detail file.
    #[error("event log io error: {0}")]
    Io(#[from] std::io::Error),
    /// SQLite failure on the event store.
    #[error("event log storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// Event payload failed to serialize or deserialize.
    #[error("event log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Background blocking task panicked or was cancelled.
    #[error("event log task error: {0}")]
    Task(String),
}

type EventResult<T> = Result<T, EventLogError>;

/// The kind of thing a workflow event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task was created and queued.
    TaskCreated,
    /// A task transitioned to running.
    TaskStarted,
    /// A task emitted a progress note.
    TaskProgress,
    /// A task finished successfully.
    TaskCompleted,
    /// A task finished with an error.
    TaskFailed,
    /// A task was cancelled before completion.
    TaskCancelled,
    /// A tool call was invoked.
    ToolInvoked,
    /// A tool call finished.
    ToolCompleted,
    /// An approval was requested.
    ApprovalRequested,
    /// An approval was granted or denied.
    ApprovalResolved,
    /// A scheduled cron job fired.
    CronFired,
    /// Free-form operator or system note.
    Note,
}

/// Who or what originated an event, for provenance and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Produced by a reply going out to a channel.
    Outbound,
    /// Produced by a message coming in from a channel.
    Inbound,
    /// Produced by the runtime itself (scheduler, watchdog, tool dispatch).
    #[default]
    System,
}

/// A single immutable entry in the workflow event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Globally unique id for this event, used for dedupe on append.
    pub event_id: String,
    /// The run this event belongs to, if the task spans a multi-step run.
    pub run_id: Option<String>,
    /// The task this event belongs to, if any.
    pub task_id: Option<String>,
    /// The agent (orchestrator or subagent) that produced this event, if any.
    pub agent_id: Option<String>,
    /// What happened.
    pub kind: EventKind,
    /// Short human-readable summary, used to derive a task's display title.
    pub summary: Option<String>,
    /// Free-form JSON payload describing the event.
    pub payload: serde_json::Value,
    /// The channel provider this event is associated with (`"telegram"`, `"cli"`, ...).
    pub provider: Option<String>,
    /// The logical channel within the provider, if distinct from `chat_id`.
    pub channel: Option<String>,
    /// The chat/conversation this event is associated with.
    pub chat_id: Option<String>,
    /// The thread within the chat, if any.
    pub thread_id: Option<String>,
    /// Where this event originated from.
    pub source: EventSource,
    /// Path to an out-of-line detail blob (e.g. full tool output) too large to
    /// inline in `payload`.
    pub detail_file: Option<String>,
    /// RFC 3339 timestamp supplied by the caller (the log never calls the clock
    /// itself, so tests and replays can control time precisely).
    pub recorded_at: String,
}

impl WorkflowEvent {
    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the originating agent id.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Sets the display summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Sets the channel provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the logical channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Sets the chat id.
    #[must_use]
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Sets the thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Sets the event source.
    #[must_use]
    pub const fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// Sets a path to an out-of-line detail blob.
    #[must_use]
    pub fn with_detail_file(mut self, detail_file: impl Into<String>) -> Self {
        self.detail_file = Some(detail_file.into());
        self
    }
}

/// Outcome of an [`EventLog::append`] call.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// `true` if `event_id` already existed and this append was a no-op.
    pub deduped: bool,
    /// The event as it now stands in the log (the caller's event, either way:
    /// appends are keyed by `event_id` and never overwrite an existing row).
    pub event: WorkflowEvent,
}

/// Current projected state of a task, derived by folding its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not yet started.
    Pending,
    /// Actively running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Blocked on a human approval decision.
    WaitingApproval,
}

impl TaskState {
    /// Whether this state is a final resting state a task never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A point-in-time projection of one task's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProjection {
    /// The task id.
    pub task_id: String,
    /// Display title: the first summary seen, trimmed to 120 chars, or a
    /// `Workflow:<task_id>` fallback if no event ever carried a summary.
    pub title: String,
    /// Current state, derived from the most recent lifecycle event.
    pub state: TaskState,
    /// Monotonically increasing turn counter, bumped by one per event.
    pub current_turn: u64,
    /// Declared turn budget, if any event's payload carried `max_turns`.
    pub max_turns: Option<u64>,
    /// The most recently recorded step label, if any event's payload carried `step`.
    pub current_step: Option<String>,
    /// Provenance and payload fields merged across this task's events, later
    /// events overwriting earlier ones for the same key.
    pub memory_workflow: serde_json::Value,
    /// Timestamp of the most recently recorded event for this task.
    pub last_event_at: String,
    /// Number of events recorded for this task.
    pub event_count: u64,
    /// The last non-empty progress note, if any.
    pub last_progress: Option<String>,
}

/// Filter accepted by [`EventLog::list`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to a single event kind.
    pub kind: Option<EventKind>,
    /// Restrict to a single task.
    pub task_id: Option<String>,
    /// Restrict to a single run.
    pub run_id: Option<String>,
    /// Restrict to a single agent.
    pub agent_id: Option<String>,
    /// Restrict to a single chat.
    pub chat_id: Option<String>,
    /// Restrict to a single source.
    pub source: Option<EventSource>,
    /// Maximum rows to return. Defaults to 100.
    pub limit: Option<u32>,
    /// Rows to skip before the limit window. Defaults to 0.
    pub offset: Option<u32>,
}

const EVENT_COLUMNS: &str = "event_id, run_id, task_id, agent_id, kind, summary, payload, \
     provider, channel, chat_id, thread_id, source, detail_file, recorded_at";

/// Append-only, single-writer-serialized workflow event store.
#[derive(Clone)]
pub struct EventLog {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    /// Opens (or creates) an event log backed by `events.db` under `dir`.
    pub fn open(dir: impl AsRef<std::path::Path>) -> EventResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("events.db"))?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory event log. Intended for tests.
    pub fn in_memory() -> EventResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EventResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                run_id TEXT,
                task_id TEXT,
                agent_id TEXT,
                kind TEXT NOT NULL,
                summary TEXT,
                payload TEXT NOT NULL,
                provider TEXT,
                channel TEXT,
                chat_id TEXT,
                thread_id TEXT,
                source TEXT NOT NULL,
                detail_file TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS events_task_id_idx ON events(task_id, recorded_at);
            CREATE INDEX IF NOT EXISTS events_run_id_idx ON events(run_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Appends `event` to the log. Idempotent: if `event.event_id` already
    /// exists, `deduped` is `true` and the store is left untouched.
    ///
    /// # Errors
    /// Returns an error if the underlying store cannot be written to.
    pub async fn append(&self, event: &WorkflowEvent) -> EventResult<AppendOutcome> {
        let kind_str = kind_to_str(event.kind)?;
        let source_str = source_to_str(event.source)?;
        let payload = serde_json::to_string(&event.payload)?;
        let guard = self.conn.lock().await;
        let rows = guard.execute(
            "INSERT OR IGNORE INTO events
                (event_id, run_id, task_id, agent_id, kind, summary, payload,
                 provider, channel, chat_id, thread_id, source, detail_file, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.event_id,
                event.run_id,
                event.task_id,
                event.agent_id,
                kind_str,
                event.summary,
                payload,
                event.provider,
                event.channel,
                event.chat_id,
                event.thread_id,
                source_str,
                event.detail_file,
                event.recorded_at,
            ],
        )?;
        Ok(AppendOutcome {
            deduped: rows == 0,
            event: event.clone(),
        })
    }

    /// Returns every event recorded for `task_id`, oldest first.
    pub async fn events_for_task(&self, task_id: &str) -> EventResult<Vec<WorkflowEvent>> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE task_id = ?1 ORDER BY recorded_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![task_id], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|r| r.map_err(EventLogError::from))
            .collect()
    }

    /// Returns events matching `filter`, newest first, honoring `limit`/`offset`.
    ///
    /// # Errors
    /// Returns an error if the underlying store cannot be read.
    pub async fn list(&self, filter: EventFilter) -> EventResult<Vec<WorkflowEvent>> {
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(kind) = filter.kind {
            clauses.push("kind = ?");
            values.push(Box::new(kind_to_str(kind)?));
        }
        if let Some(task_id) = filter.task_id {
            clauses.push("task_id = ?");
            values.push(Box::new(task_id));
        }
        if let Some(run_id) = filter.run_id {
            clauses.push("run_id = ?");
            values.push(Box::new(run_id));
        }
        if let Some(agent_id) = filter.agent_id {
            clauses.push("agent_id = ?");
            values.push(Box::new(agent_id));
        }
        if let Some(chat_id) = filter.chat_id {
            clauses.push("chat_id = ?");
            values.push(Box::new(chat_id));
        }
        if let Some(source) = filter.source {
            clauses.push("source = ?");
            values.push(Box::new(source_to_str(source)?));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events {where_clause} \
             ORDER BY recorded_at DESC, rowid DESC LIMIT {limit} OFFSET {offset}"
        );

        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|r| r.map_err(EventLogError::from))
            .collect()
    }

    /// Reads the contents of the most recent `detail_file` recorded for
    /// `task_id`, if any event carried one.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or the referenced file
    /// cannot be opened.
    pub async fn read_task_detail(&self, task_id: &str) -> EventResult<Option<String>> {
        let guard = self.conn.lock().await;
        let path: Option<String> = guard
            .query_row(
                "SELECT detail_file FROM events
                 WHERE task_id = ?1 AND detail_file IS NOT NULL
                 ORDER BY recorded_at DESC, rowid DESC LIMIT 1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(guard);
        let Some(path) = path else { return Ok(None) };
        Ok(Some(tokio::fs::read_to_string(path).await?))
    }

    /// Folds every event for `task_id` into its current projected state.
    /// Returns `None` if no events exist for that task.
    pub async fn project_task(&self, task_id: &str) -> EventResult<Option<TaskProjection>> {
        let events = self.events_for_task(task_id).await?;
        Ok(fold_projection(task_id, &events))
    }

    /// Returns projections for every task that has at least one event,
    /// most-recently-updated first.
    pub async fn all_task_projections(&self) -> EventResult<Vec<TaskProjection>> {
        let guard = self.conn.lock().await;
        let task_ids: Vec<String> = {
            let mut stmt = guard.prepare("SELECT DISTINCT task_id FROM events WHERE task_id IS NOT NULL")?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        drop(guard);

        let mut projections = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            if let Some(projection) = self.project_task(&task_id).await? {
                projections.push(projection);
            }
        }
        projections.sort_by(|a, b| b.last_event_at.cmp(&a.last_event_at));
        Ok(projections)
    }

    /// Returns the most recent `limit` events across all tasks, newest first.
    pub async fn recent(&self, limit: u32) -> EventResult<Vec<WorkflowEvent>> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY recorded_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|r| r.map_err(EventLogError::from))
            .collect()
    }
}

fn kind_to_str(kind: EventKind) -> EventResult<String> {
    Ok(serde_json::to_value(kind)?
        .as_str()
        .expect("EventKind serializes to a string")
        .to_owned())
}

fn source_to_str(source: EventSource) -> EventResult<String> {
    Ok(serde_json::to_value(source)?
        .as_str()
        .expect("EventSource serializes to a string")
        .to_owned())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<WorkflowEvent, EventLogError>> {
    let kind_str: String = row.get(4)?;
    let payload_str: String = row.get(6)?;
    let source_str: String = row.get(11)?;
    Ok((|| {
        let kind: EventKind = serde_json::from_value(serde_json::Value::String(kind_str))?;
        let source: EventSource = serde_json::from_value(serde_json::Value::String(source_str))?;
        let payload: serde_json::Value = serde_json::from_str(&payload_str)?;
        Ok(WorkflowEvent {
            event_id: row.get(0)?,
            run_id: row.get(1)?,
            task_id: row.get(2)?,
            agent_id: row.get(3)?,
            kind,
            summary: row.get(5)?,
            payload,
            provider: row.get(7)?,
            channel: row.get(8)?,
            chat_id: row.get(9)?,
            thread_id: row.get(10)?,
            source,
            detail_file: row.get(12)?,
            recorded_at: row.get(13)?,
        })
    })())
}

fn fold_projection(task_id: &str, events: &[WorkflowEvent]) -> Option<TaskProjection> {
    let last = events.last()?;
    let mut state = TaskState::Pending;
    let mut last_progress = None;
    let mut title = None;
    let mut max_turns = None;
    let mut current_step = None;
    let mut memory = serde_json::Map::new();

    for event in events {
        match event.kind {
            EventKind::TaskCreated => state = TaskState::Pending,
            EventKind::TaskStarted => state = TaskState::Running,
            EventKind::TaskCompleted => state = TaskState::Completed,
            EventKind::TaskFailed => state = TaskState::Failed,
            EventKind::TaskCancelled => state = TaskState::Cancelled,
            EventKind::ApprovalRequested => state = TaskState::WaitingApproval,
            EventKind::ApprovalResolved => {
                if state == TaskState::WaitingApproval {
                    state = TaskState::Running;
                }
            }
            EventKind::TaskProgress => {
                if let Some(note) = event.payload.get("note").and_then(|v| v.as_str()) {
                    last_progress = Some(note.to_owned());
                }
            }
            _ => {}
        }

        if title.is_none()
            && let Some(summary) = &event.summary
        {
            let trimmed: String = summary.chars().take(120).collect();
            title = Some(trimmed);
        }
        if let Some(turns) = event.payload.get("max_turns").and_then(serde_json::Value::as_u64) {
            max_turns = Some(turns);
        }
        if let Some(step) = event.payload.get("step").and_then(|v| v.as_str()) {
            current_step = Some(step.to_owned());
        }

        for (key, value) in [
            ("run_id", event.run_id.clone().map(serde_json::Value::String)),
            ("agent_id", event.agent_id.clone().map(serde_json::Value::String)),
            ("provider", event.provider.clone().map(serde_json::Value::String)),
            ("channel", event.channel.clone().map(serde_json::Value::String)),
            ("chat_id", event.chat_id.clone().map(serde_json::Value::String)),
            ("thread_id", event.thread_id.clone().map(serde_json::Value::String)),
            ("detail_file", event.detail_file.clone().map(serde_json::Value::String)),
        ] {
            if let Some(value) = value {
                memory.insert(key.to_owned(), value);
            }
        }
        if let serde_json::Value::Object(fields) = &event.payload {
            for (key, value) in fields {
                memory.insert(key.clone(), value.clone());
            }
        }
    }

    Some(TaskProjection {
        task_id: task_id.to_owned(),
        title: title.unwrap_or_else(|| format!("Workflow:{task_id}")),
        state,
        current_turn: events.len() as u64,
        max_turns,
        current_step,
        memory_workflow: serde_json::Value::Object(memory),
        last_event_at: last.recorded_at.clone(),
        event_count: events.len() as u64,
        last_progress,
    })
}

/// Convenience builder for [`WorkflowEvent`] used by call sites that don't want
/// to construct the struct literal by hand. Optional fields can be layered on
/// with the `with_*` builder methods.
#[must_use]
pub fn event(
    event_id: impl Into<String>,
    task_id: Option<String>,
    kind: EventKind,
    payload: serde_json::Value,
    recorded_at: impl Into<String>,
) -> WorkflowEvent {
    WorkflowEvent {
        event_id: event_id.into(),
        run_id: None,
        task_id,
        agent_id: None,
        kind,
        summary: None,
        payload,
        provider: None,
        channel: None,
        chat_id: None,
        thread_id: None,
        source: EventSource::System,
        detail_file: None,
        recorded_at: recorded_at.into(),
    }
}

/// Parses a map of label -> value progress note into the conventional payload
/// shape used by [`EventKind::TaskProgress`] events.
#[must_use]
pub fn progress_payload(note: impl Into<String>, extra: HashMap<String, serde_json::Value>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("note".to_owned(), serde_json::Value::String(note.into()));
    for (k, v) in extra {
        map.insert(k, v);
    }
    serde_json::Value::Object(map)
}
