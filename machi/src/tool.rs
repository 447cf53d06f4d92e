//! Tool Registry: schema-validated tool execution, background tasks, and the
//! approval lifecycle for tools that refuse to run without human sign-off.
//!
//! Tools are exposed through a small object-safe capability set
//! (`name`/`description`/`schema`/`validate_params`/`execute`) rather than an
//! inheritance hierarchy, so the registry can hold any mix of built-in and
//! dynamically-installed tools behind one `Arc<dyn Tool>` map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalDecision, ApprovalParser};
use crate::events::{EventKind, EventLog, EventSource};
use crate::providers::ToolDefinition;

/// The magic prefix a tool's `execute` result uses to ask for human sign-off
/// instead of completing. Anything after the first line is shown to the
/// approver as free-text detail.
pub const APPROVAL_REQUIRED_PREFIX: &str = "Error: approval_required";

/// Errors raised by the registry itself (not by individual tools, which
/// report failure as `Error: ...` text per the tool contract).
#[derive(Debug, thiserror::Error)]
pub enum ToolRegistryError {
    /// No tool is registered under that name.
    #[error("unknown tool {0:?}; available: {1}")]
    UnknownTool(String, String),
    /// No background task or approval request exists under that id.
    #[error("unknown {kind} id: {id}")]
    UnknownId {
        /// `"task"` or `"approval request"`.
        kind: &'static str,
        /// The id that wasn't found.
        id: String,
    },
    /// The tool name is already taken by another registration.
    #[error("tool {0:?} is already registered")]
    DuplicateName(String),
}

type RegistryResult<T> = Result<T, ToolRegistryError>;

/// Context flowed through every tool call so approvals, events, and child
/// messages emitted during execution retain provenance.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Cancellation signal for this call; tools that do long I/O should poll it.
    pub cancel: CancellationToken,
    /// The background task this call is running under, if any.
    pub task_id: Option<String>,
    /// Originating transport provider tag (e.g. `"slack"`).
    pub provider: Option<String>,
    /// Originating chat id.
    pub chat_id: Option<String>,
    /// Originating sender id.
    pub sender_id: Option<String>,
    /// Set to `true` when a previously-blocked call has been approved; tools
    /// consult this instead of re-asking.
    pub approved: bool,
}

impl ToolContext {
    /// A bare context with no provenance, used by tests and one-off calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this context with `approved` set, as injected by
    /// [`ToolRegistry::execute_approved_request`].
    #[must_use]
    pub fn approved(mut self) -> Self {
        self.approved = true;
        self
    }
}

/// One JSON-schema-style parameter constraint, recursively validated.
#[derive(Debug, Clone)]
pub enum ParamSchema {
    /// `{"type": "string"}`, optionally with length bounds.
    String {
        /// Minimum string length, inclusive.
        min_length: Option<usize>,
        /// Maximum string length, inclusive.
        max_length: Option<usize>,
        /// Allowed values, if this is an enum.
        r#enum: Option<Vec<String>>,
    },
    /// `{"type": "number"}` or `{"type": "integer"}`.
    Number {
        /// Whether only integers are accepted.
        integer: bool,
        /// Minimum value, inclusive.
        minimum: Option<f64>,
        /// Maximum value, inclusive.
        maximum: Option<f64>,
    },
    /// `{"type": "boolean"}`.
    Boolean,
    /// `{"type": "array"}` with a uniform item schema.
    Array {
        /// Schema each element must satisfy.
        items: Box<ParamSchema>,
    },
    /// `{"type": "object"}` with named properties.
    Object {
        /// Property name -> schema.
        properties: HashMap<String, ParamSchema>,
        /// Property names that must be present.
        required: Vec<String>,
        /// Whether properties outside `properties` are rejected.
        additional_properties: bool,
    },
}

impl ParamSchema {
    /// Convenience constructor for a plain unconstrained string.
    #[must_use]
    pub fn string() -> Self {
        Self::String {
            min_length: None,
            max_length: None,
            r#enum: None,
        }
    }

    /// Convenience constructor for a plain unconstrained integer.
    #[must_use]
    pub const fn integer() -> Self {
        Self::Number {
            integer: true,
            minimum: None,
            maximum: None,
        }
    }

    /// Renders this schema as a JSON-schema value, as returned by
    /// [`Tool::to_schema`].
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::String {
                min_length,
                max_length,
                r#enum,
            } => {
                let mut obj = serde_json::json!({"type": "string"});
                let map = obj.as_object_mut().expect("object literal");
                if let Some(v) = min_length {
                    map.insert("minLength".into(), (*v).into());
                }
                if let Some(v) = max_length {
                    map.insert("maxLength".into(), (*v).into());
                }
                if let Some(values) = r#enum {
                    map.insert("enum".into(), values.clone().into());
                }
                obj
            }
            Self::Number {
                integer,
                minimum,
                maximum,
            } => {
                let mut obj =
                    serde_json::json!({"type": if *integer { "integer" } else { "number" }});
                let map = obj.as_object_mut().expect("object literal");
                if let Some(v) = minimum {
                    map.insert("minimum".into(), (*v).into());
                }
                if let Some(v) = maximum {
                    map.insert("maximum".into(), (*v).into());
                }
                obj
            }
            Self::Boolean => serde_json::json!({"type": "boolean"}),
            Self::Array { items } => serde_json::json!({"type": "array", "items": items.to_json()}),
            Self::Object {
                properties,
                required,
                additional_properties,
            } => {
                let props: serde_json::Map<String, Value> = properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::json!({
                    "type": "object",
                    "properties": props,
                    "required": required,
                    "additionalProperties": additional_properties,
                })
            }
        }
    }

    /// Validates `value` against this schema, appending any errors found to
    /// `errors` (path-prefixed for nested structures).
    fn validate_into(&self, path: &str, value: &Value, errors: &mut Vec<String>) {
        match self {
            Self::String {
                min_length,
                max_length,
                r#enum,
            } => match value.as_str() {
                None => errors.push(format!("{path}: expected string")),
                Some(s) => {
                    if min_length.is_some_and(|min| s.len() < min) {
                        errors.push(format!("{path}: shorter than minLength"));
                    }
                    if max_length.is_some_and(|max| s.len() > max) {
                        errors.push(format!("{path}: longer than maxLength"));
                    }
                    if let Some(values) = r#enum
                        && !values.iter().any(|v| v == s)
                    {
                        errors.push(format!("{path}: {s:?} is not one of {values:?}"));
                    }
                }
            },
            Self::Number {
                integer,
                minimum,
                maximum,
            } => match value.as_f64() {
                None => errors.push(format!("{path}: expected number")),
                Some(n) => {
                    if *integer && value.as_i64().is_none() && value.as_u64().is_none() {
                        errors.push(format!("{path}: expected integer"));
                    }
                    if minimum.is_some_and(|min| n < min) {
                        errors.push(format!("{path}: below minimum"));
                    }
                    if maximum.is_some_and(|max| n > max) {
                        errors.push(format!("{path}: above maximum"));
                    }
                }
            },
            Self::Boolean => {
                if value.as_bool().is_none() {
                    errors.push(format!("{path}: expected boolean"));
                }
            }
            Self::Array { items } => match value.as_array() {
                None => errors.push(format!("{path}: expected array")),
                Some(arr) => {
                    for (i, item) in arr.iter().enumerate() {
                        items.validate_into(&format!("{path}[{i}]"), item, errors);
                    }
                }
            },
            Self::Object {
                properties,
                required,
                additional_properties,
            } => match value.as_object() {
                None => errors.push(format!("{path}: expected object")),
                Some(obj) => {
                    for key in required {
                        if !obj.contains_key(key) {
                            errors.push(format!("{path}: missing required field {key:?}"));
                        }
                    }
                    if !*additional_properties {
                        for key in obj.keys() {
                            if !properties.contains_key(key) && !key.starts_with("__") {
                                errors.push(format!("{path}: unexpected field {key:?}"));
                            }
                        }
                    }
                    for (key, schema) in properties {
                        if let Some(v) = obj.get(key) {
                            schema.validate_into(&format!("{path}.{key}"), v, errors);
                        }
                    }
                }
            },
        }
    }
}

/// Builds the top-level object schema for a tool's parameters.
#[must_use]
pub fn object_schema(
    properties: impl IntoIterator<Item = (&'static str, ParamSchema)>,
    required: impl IntoIterator<Item = &'static str>,
) -> ParamSchema {
    ParamSchema::Object {
        properties: properties
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect(),
        required: required.into_iter().map(str::to_owned).collect(),
        additional_properties: false,
    }
}

/// The object-safe capability every tool exposes to the registry: a schema,
/// a validator, and an executor. Deliberately not generic so the registry
/// can store a heterogeneous map of `Arc<dyn Tool>`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique, stable tool name as the model spells it back in a tool call.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON-schema-style parameter definition.
    fn schema(&self) -> ParamSchema;

    /// Validates `params` against [`Self::schema`], returning a (possibly
    /// empty) list of human-readable error strings.
    fn validate(&self, params: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        self.schema().validate_into("params", params, &mut errors);
        errors
    }

    /// Runs the tool. Success and failure are both communicated as `Ok(text)`
    /// per the tool contract: failures start with `"Error: "`, and an
    /// approval refusal starts with [`APPROVAL_REQUIRED_PREFIX`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> String;

    /// Serializes this tool's definition to the registry's public schema
    /// format (name, description, parameters).
    fn to_schema(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": self.schema().to_json(),
        })
    }
}

/// Status of a background task. Once terminal, a record is frozen except for
/// TTL-based eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, not yet started.
    Queued,
    /// Actively executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// True for `{Completed, Failed, Cancelled}` — no further transitions
    /// are permitted once a task reaches one of these.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A background tool invocation tracked by the registry.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    /// Unique task id.
    pub id: String,
    /// The tool being run.
    pub tool_name: String,
    /// A snapshot of the parameters it was invoked with.
    pub params: Value,
    /// Current status; monotonic once terminal.
    pub status: TaskStatus,
    /// Result text, once `Completed`.
    pub result: Option<String>,
    /// Error text, once `Failed`.
    pub error: Option<String>,
    cancel: CancellationToken,
}

/// Status of a paused tool call awaiting a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; eligible for one [`ToolRegistry::execute_approved_request`] call.
    Approved,
    /// Denied; will not be executed.
    Denied,
    /// Deferred; caller should ask again later.
    Deferred,
    /// Cancelled by the requester.
    Cancelled,
    /// The response text didn't parse as a clear decision and clarification
    /// was requested.
    Clarify,
}

impl ApprovalStatus {
    const fn from_decision(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approve => Self::Approved,
            ApprovalDecision::Deny => Self::Denied,
            ApprovalDecision::Defer => Self::Deferred,
            ApprovalDecision::Cancel => Self::Cancelled,
            ApprovalDecision::Clarify | ApprovalDecision::Unknown => Self::Clarify,
        }
    }
}

/// A tool call paused pending human sign-off.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Unique request id.
    pub id: String,
    /// The tool that refused to run without approval.
    pub tool_name: String,
    /// The parameters it was invoked with.
    pub params: Value,
    /// The context (chat/provider/sender) it was invoked under.
    pub context: ToolContext,
    /// The free-text detail from the tool's `approval_required` body.
    pub detail: String,
    /// Current lifecycle status.
    pub status: ApprovalStatus,
    /// The raw response text used to resolve this request, if resolved.
    pub response_text: Option<String>,
    /// Whether [`ToolRegistry::execute_approved_request`] has already
    /// consumed this approval (at most once).
    pub executed: bool,
}

/// Callback invoked whenever a tool call produces a new approval request.
/// Must never panic; failures are swallowed by the registry.
pub type ApprovalCallback = Arc<dyn Fn(ApprovalRequest) + Send + Sync>;

struct RegistryState {
    tools: HashMap<String, Arc<dyn Tool>>,
    dynamic: HashMap<String, Arc<dyn Tool>>,
}

/// Schema validation, synchronous/background execution, and the approval
/// lifecycle for a process-local set of tools.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    tasks: Mutex<HashMap<String, BackgroundTask>>,
    approvals: Mutex<HashMap<String, ApprovalRequest>>,
    on_approval_request: Mutex<Option<ApprovalCallback>>,
    id_seq: AtomicU64,
    events: RwLock<Option<EventLog>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").finish_non_exhaustive()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Creates an empty registry with no tools.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                tools: HashMap::new(),
                dynamic: HashMap::new(),
            }),
            tasks: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            on_approval_request: Mutex::new(None),
            id_seq: AtomicU64::new(0),
            events: RwLock::new(None),
        }
    }

    /// Wires a workflow event log so tool dispatch records `ToolInvoked` /
    /// `ToolCompleted` / `ApprovalRequested` events. A registry with none
    /// configured just skips recording.
    pub async fn set_events(&self, events: EventLog) {
        *self.events.write().await = Some(events);
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n:08x}")
    }

    /// Appends a `ToolInvoked`/`ToolCompleted`/`ApprovalRequested` event if an
    /// event log has been wired via [`Self::set_events`]. Failures to append
    /// are swallowed: tool dispatch must not fail because of logging.
    async fn record_event(&self, kind: EventKind, ctx: &ToolContext, payload: Value) {
        let Some(log) = self.events.read().await.clone() else {
            return;
        };
        let mut record = crate::events::event(
            self.next_id("evt"),
            ctx.task_id.clone(),
            kind,
            payload,
            chrono::Utc::now().to_rfc3339(),
        )
        .with_source(EventSource::System);
        if let Some(provider) = &ctx.provider {
            record = record.with_provider(provider.clone());
        }
        if let Some(chat_id) = &ctx.chat_id {
            record = record.with_chat_id(chat_id.clone());
        }
        let _ = log.append(&record).await;
    }

    /// Registers a built-in tool. Errors if the name is already taken.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> RegistryResult<()> {
        let mut state = self.state.write().await;
        let name = tool.name().to_owned();
        if state.tools.contains_key(&name) || state.dynamic.contains_key(&name) {
            return Err(ToolRegistryError::DuplicateName(name));
        }
        state.tools.insert(name, tool);
        Ok(())
    }

    /// Atomically replaces the entire set of dynamically-installed (e.g.
    /// user-created shell) tools without touching built-ins.
    pub async fn set_dynamic_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let mut state = self.state.write().await;
        state.dynamic = tools.into_iter().map(|t| (t.name().to_owned(), t)).collect();
    }

    /// Installs the callback fired whenever a tool call creates a new
    /// approval request.
    pub async fn set_on_approval_request(&self, callback: ApprovalCallback) {
        *self.on_approval_request.lock().await = Some(callback);
    }

    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let state = self.state.read().await;
        state
            .tools
            .get(name)
            .or_else(|| state.dynamic.get(name))
            .cloned()
    }

    async fn available_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .tools
            .keys()
            .chain(state.dynamic.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolves each of `names` to a model-facing [`ToolDefinition`], silently
    /// skipping any name that isn't currently registered.
    pub async fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        let state = self.state.read().await;
        names
            .iter()
            .filter_map(|name| state.tools.get(name).or_else(|| state.dynamic.get(name)))
            .map(|tool| ToolDefinition {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                parameters: tool.schema().to_json(),
            })
            .collect()
    }

    /// Runs `name` synchronously: look up, validate, invoke, and translate an
    /// `approval_required` refusal into a tracked [`ApprovalRequest`].
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.lookup(name).await else {
            let available = self.available_names().await.join(", ");
            return format!("Error: unknown tool {name:?}. Available tools: {available}");
        };

        if !ctx.approved {
            let errors = tool.validate(&params);
            if !errors.is_empty() {
                return format!(
                    "Error: Invalid parameters: {}. Check the tool's schema and retry.",
                    errors.join("; ")
                );
            }
        }

        self.record_event(
            EventKind::ToolInvoked,
            ctx,
            serde_json::json!({"tool": name, "params": params}),
        )
        .await;

        let result = tool.execute(params.clone(), ctx).await;

        if let Some(detail) = result.strip_prefix(APPROVAL_REQUIRED_PREFIX) {
            let request_id = self.next_id("appr");
            let request = ApprovalRequest {
                id: request_id.clone(),
                tool_name: name.to_owned(),
                params,
                context: ctx.clone(),
                detail: detail.trim_start_matches(['\n', ':']).trim().to_owned(),
                status: ApprovalStatus::Pending,
                response_text: None,
                executed: false,
            };
            self.approvals
                .lock()
                .await
                .insert(request_id.clone(), request.clone());
            self.record_event(
                EventKind::ApprovalRequested,
                ctx,
                serde_json::json!({"tool": name, "approval_request_id": request_id, "detail": request.detail}),
            )
            .await;
            if let Some(callback) = self.on_approval_request.lock().await.clone() {
                let callback_request = request.clone();
                // Callback failures must not break tool execution.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(callback_request);
                }));
            }
            return format!(
                "{APPROVAL_REQUIRED_PREFIX}\n{}\napproval_request_id: {request_id}\nReply approve/deny/defer/cancel to resolve this request.",
                request.detail
            );
        }

        if let Some(rest) = result.strip_prefix("Error:") {
            self.record_event(
                EventKind::ToolCompleted,
                ctx,
                serde_json::json!({"tool": name, "ok": false}),
            )
            .await;
            return format!(
                "Error:{rest} (tool={name}; check parameters and retry, or request approval if this is a permissions issue)"
            );
        }

        self.record_event(
            EventKind::ToolCompleted,
            ctx,
            serde_json::json!({"tool": name, "ok": true}),
        )
        .await;
        result
    }

    /// Schedules `name` to run in the background, returning its task id
    /// immediately. The actual run happens on the next yield point.
    pub async fn execute_background(&self, name: &str, params: Value, ctx: ToolContext) -> String {
        let task_id = self.next_id("task");
        let record = BackgroundTask {
            id: task_id.clone(),
            tool_name: name.to_owned(),
            params: params.clone(),
            status: TaskStatus::Queued,
            result: None,
            error: None,
            cancel: ctx.cancel.clone(),
        };
        self.tasks.lock().await.insert(task_id.clone(), record);

        let this_tasks = &self.tasks;
        let tool = self.lookup(name).await;
        let task_id_for_run = task_id.clone();
        let ctx_with_task = ToolContext {
            task_id: Some(task_id.clone()),
            ..ctx
        };

        // Run inline after marking running; callers await the returned id and
        // poll `task_status` for completion, matching the "schedule on the
        // next microtask" contract without spawning an unbounded background
        // future per call.
        if let Some(tasks) = Some(this_tasks)
            && let Some(record) = tasks.lock().await.get_mut(&task_id)
        {
            record.status = TaskStatus::Running;
        }

        self.record_event(
            EventKind::ToolInvoked,
            &ctx_with_task,
            serde_json::json!({"tool": name, "background": true}),
        )
        .await;

        match tool {
            None => {
                let mut tasks = self.tasks.lock().await;
                if let Some(record) = tasks.get_mut(&task_id_for_run) {
                    record.status = TaskStatus::Failed;
                    record.error = Some(format!("unknown tool {name:?}"));
                }
            }
            Some(tool) => {
                let output = tokio::select! {
                    () = ctx_with_task.cancel.cancelled() => None,
                    out = tool.execute(params, &ctx_with_task) => Some(out),
                };
                let mut tasks = self.tasks.lock().await;
                if let Some(record) = tasks.get_mut(&task_id_for_run) {
                    match output {
                        None => record.status = TaskStatus::Cancelled,
                        Some(text) if text.starts_with("Error:") => {
                            record.status = TaskStatus::Failed;
                            record.error = Some(text);
                        }
                        Some(text) => {
                            record.status = TaskStatus::Completed;
                            record.result = Some(text);
                        }
                    }
                }
            }
        }

        let final_status = self.tasks.lock().await.get(&task_id_for_run).map(|r| r.status);
        self.record_event(
            EventKind::ToolCompleted,
            &ctx_with_task,
            serde_json::json!({"tool": name, "background": true, "status": final_status}),
        )
        .await;

        task_id
    }

    /// Requests cancellation of a running background task. No-op if the task
    /// is already terminal or unknown.
    pub async fn cancel_task(&self, task_id: &str) {
        let tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(task_id)
            && !task.status.is_terminal()
        {
            task.cancel.cancel();
        }
    }

    /// Returns a snapshot of a background task's record.
    pub async fn task_status(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Returns a snapshot of an approval request.
    pub async fn get_approval_request(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.approvals.lock().await.get(request_id).cloned()
    }

    /// Lists all pending approval requests, oldest-registered first (insertion
    /// order is not tracked precisely by a `HashMap`; callers needing strict
    /// ordering should sort by id).
    pub async fn list_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals
            .lock()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    /// Parses `response_text` with [`ApprovalParser`] and transitions
    /// `request_id` to the resulting terminal status. Returns the updated
    /// request, or an error if the id is unknown.
    pub async fn resolve_approval_request(
        &self,
        request_id: &str,
        response_text: &str,
    ) -> RegistryResult<ApprovalRequest> {
        let mut approvals = self.approvals.lock().await;
        let request = approvals
            .get_mut(request_id)
            .ok_or_else(|| ToolRegistryError::UnknownId {
                kind: "approval request",
                id: request_id.to_owned(),
            })?;
        let parsed = ApprovalParser::parse(response_text);
        request.status = ApprovalStatus::from_decision(parsed.decision);
        request.response_text = Some(response_text.to_owned());
        Ok(request.clone())
    }

    /// Transitions `request_id` straight to the status implied by `decision`,
    /// bypassing [`ApprovalParser`] — for callers (e.g. the reaction path)
    /// that have already mapped their input to a decision themselves.
    pub async fn resolve_approval_request_from_decision(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
        response_text: Option<&str>,
    ) -> RegistryResult<ApprovalRequest> {
        let mut approvals = self.approvals.lock().await;
        let request = approvals
            .get_mut(request_id)
            .ok_or_else(|| ToolRegistryError::UnknownId {
                kind: "approval request",
                id: request_id.to_owned(),
            })?;
        request.status = ApprovalStatus::from_decision(decision);
        request.response_text = response_text.map(str::to_owned);
        Ok(request.clone())
    }

    /// Re-runs the tool behind an `approved` request, splicing `__approved =
    /// true` into its original parameters. Each approved request may be
    /// executed at most once; a repeat call reports `still_requires_approval`
    /// if the re-run asks for approval again (e.g. a different guard fired).
    pub async fn execute_approved_request(&self, request_id: &str) -> RegistryResult<String> {
        let (tool_name, mut params, context) = {
            let mut approvals = self.approvals.lock().await;
            let request = approvals
                .get_mut(request_id)
                .ok_or_else(|| ToolRegistryError::UnknownId {
                    kind: "approval request",
                    id: request_id.to_owned(),
                })?;
            if request.status != ApprovalStatus::Approved {
                return Ok(format!(
                    "Error: request {request_id} is {:?}, not approved",
                    request.status
                ));
            }
            if request.executed {
                return Ok("Error: approval request already executed".to_owned());
            }
            request.executed = true;
            (
                request.tool_name.clone(),
                request.params.clone(),
                request.context.clone().approved(),
            )
        };
        if let Some(obj) = params.as_object_mut() {
            obj.insert("__approved".to_owned(), Value::Bool(true));
        }
        let result = self.execute(&tool_name, params, &context).await;
        if result.starts_with(APPROVAL_REQUIRED_PREFIX) {
            return Ok("Error: still_requires_approval".to_owned());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes the `text` parameter back"
        }

        fn schema(&self) -> ParamSchema {
            object_schema([("text", ParamSchema::string())], ["text"])
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> String {
            params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        }
    }

    struct GuardedTool;

    #[async_trait]
    impl Tool for GuardedTool {
        fn name(&self) -> &str {
            "guarded"
        }

        fn description(&self) -> &str {
            "requires approval unless `__approved` is set"
        }

        fn schema(&self) -> ParamSchema {
            object_schema([], [])
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> String {
            if params.get("__approved").and_then(Value::as_bool) == Some(true) {
                "done".to_owned()
            } else {
                format!("{APPROVAL_REQUIRED_PREFIX}\nreason:test")
            }
        }
    }

    #[tokio::test]
    async fn unknown_tool_lists_available() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let result = registry
            .execute("nope", Value::Null, &ToolContext::new())
            .await;
        assert!(result.starts_with("Error: unknown tool"));
        assert!(result.contains("echo"));
    }

    #[tokio::test]
    async fn invalid_params_report_errors() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let result = registry
            .execute("echo", serde_json::json!({}), &ToolContext::new())
            .await;
        assert!(result.starts_with("Error: Invalid parameters"));
    }

    #[tokio::test]
    async fn valid_call_returns_tool_output() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let result = registry
            .execute(
                "echo",
                serde_json::json!({"text": "hi"}),
                &ToolContext::new(),
            )
            .await;
        assert_eq!(result, "hi");
    }

    #[tokio::test]
    async fn approval_lifecycle_end_to_end() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();

        let result = registry
            .execute("guarded", serde_json::json!({}), &ToolContext::new())
            .await;
        assert!(result.starts_with(APPROVAL_REQUIRED_PREFIX));
        let request_id = result
            .lines()
            .find_map(|l| l.strip_prefix("approval_request_id: "))
            .unwrap()
            .to_owned();

        let resolved = registry
            .resolve_approval_request(&request_id, "yes")
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        let output = registry
            .execute_approved_request(&request_id)
            .await
            .unwrap();
        assert_eq!(output, "done");

        // Re-executing an already-consumed approval is rejected.
        let repeat = registry
            .execute_approved_request(&request_id)
            .await
            .unwrap();
        assert!(repeat.contains("already executed"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let err = registry.register(Arc::new(EchoTool)).await.unwrap_err();
        assert!(matches!(err, ToolRegistryError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn background_task_completes_and_is_frozen() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let task_id = registry
            .execute_background("echo", serde_json::json!({"text": "bg"}), ToolContext::new())
            .await;
        let task = registry.task_status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("bg"));
    }

    #[tokio::test]
    async fn dynamic_tools_replace_atomically() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        registry
            .set_dynamic_tools(vec![Arc::new(GuardedTool)])
            .await;
        assert!(registry.lookup("echo").await.is_some());
        assert!(registry.lookup("guarded").await.is_some());
        registry.set_dynamic_tools(vec![]).await;
        assert!(registry.lookup("guarded").await.is_none());
        assert!(registry.lookup("echo").await.is_some());
    }

    #[tokio::test]
    async fn wired_event_log_records_invocation_and_completion() {
        use crate::events::{EventKind, EventLog};

        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let events = EventLog::in_memory().unwrap();
        registry.set_events(events.clone()).await;

        let ctx = ToolContext {
            task_id: Some("t1".to_owned()),
            ..ToolContext::new()
        };
        registry
            .execute("echo", serde_json::json!({"text": "hi"}), &ctx)
            .await;

        let recorded = events.events_for_task("t1").await.unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].kind, EventKind::ToolInvoked);
        assert_eq!(recorded[1].kind, EventKind::ToolCompleted);
    }

    #[tokio::test]
    async fn wired_event_log_records_approval_request() {
        use crate::events::{EventKind, EventLog};

        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();
        let events = EventLog::in_memory().unwrap();
        registry.set_events(events.clone()).await;

        let ctx = ToolContext {
            task_id: Some("t1".to_owned()),
            ..ToolContext::new()
        };
        registry.execute("guarded", serde_json::json!({}), &ctx).await;

        let recorded = events.events_for_task("t1").await.unwrap();
        assert!(recorded.iter().any(|e| e.kind == EventKind::ApprovalRequested));
    }

    #[test]
    fn schema_validation_recurses_into_nested_objects() {
        let schema = object_schema(
            [(
                "inner",
                object_schema([("n", ParamSchema::integer())], ["n"]),
            )],
            ["inner"],
        );
        let mut errors = Vec::new();
        schema.validate_into("p", &serde_json::json!({"inner": {}}), &mut errors);
        assert!(errors.iter().any(|e| e.contains("missing required field")));
    }
}
