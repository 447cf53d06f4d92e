//! Subagent Registry: spawns short-lived controller/executor agent pairs,
//! each solving one assigned task with bounded iterations, cooperative
//! cancellation, and cascade-cancel to children.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::message::InboundMessage;
use crate::stream::{extract_tool_calls, StreamBuffer};
use crate::tool::{ToolContext, ToolRegistry};

/// Status of a subagent across its lifetime. Terminal states
/// (`Completed`/`Failed`/`Cancelled`) are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    /// Registered but not yet polled by the run loop.
    Idle,
    /// Actively iterating its controller/executor loop.
    Running,
    /// Finished with a final answer.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Parent process restarted and lost track of it.
    Offline,
}

impl SubagentStatus {
    /// True for `{Completed, Failed, Cancelled}`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of [`SubagentRegistry::wait_for_completion`].
#[derive(Debug, Clone)]
pub struct SubagentOutcome {
    /// Final status.
    pub status: SubagentStatus,
    /// Final answer or cancellation/error message.
    pub content: String,
}

/// A controller's structured decision for one iteration of the subagent loop.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControllerDecision {
    /// True if the task is solved; `final_answer` is then authoritative.
    #[serde(default)]
    pub done: bool,
    /// The single-turn prompt to hand the executor next, if not done.
    #[serde(default)]
    pub executor_prompt: Option<String>,
    /// The final answer, when `done`.
    #[serde(default)]
    pub final_answer: Option<String>,
    /// Why the controller made this call (diagnostic only).
    #[serde(default)]
    pub reason: Option<String>,
    /// Other agents this iteration wants to hand work off to.
    #[serde(default)]
    pub handoffs: Vec<Handoff>,
}

/// One controller-requested handoff to another named agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Handoff {
    /// The target agent's alias/mention.
    pub alias: String,
    /// The instruction to hand off.
    pub instruction: String,
}

/// The controller half of the loop: given the task, iteration count, and the
/// executor's last output, decides whether to continue and what to ask next.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Produces the next [`ControllerDecision`].
    async fn decide(
        &self,
        task: &str,
        iteration: u32,
        last_executor_output: Option<&str>,
    ) -> Result<ControllerDecision, String>;
}

/// A channel an [`Executor`] may use to report partial output as it's
/// produced, so the caller can forward progress before the full response
/// lands.
pub type ChunkSink = mpsc::UnboundedSender<String>;

/// The executor half of the loop: runs one prompt to completion, optionally
/// emitting a list of tool-call requests that the subagent loop will dispatch
/// before re-querying.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Runs `prompt` to completion, returning its raw text output. The
    /// subagent loop parses tool-call framing out of this text itself.
    /// Implementations that stream may send partial chunks to `chunks` as
    /// they arrive; callers that don't care about progress pass `None`.
    async fn run(&self, prompt: &str, chunks: Option<&ChunkSink>) -> Result<String, String>;
}

/// Receives subagent-originated outbound traffic — handoff mentions and the
/// final completion announcement — so an outer orchestrator (or test
/// harness) can react without the registry knowing about any transport.
pub trait SubagentBus: Send + Sync {
    /// Publishes one message onto the bus.
    fn publish(&self, message: InboundMessage);
}

/// A `Fn`-backed [`SubagentBus`].
pub struct FnSubagentBus<F>(pub F);

impl<F> std::fmt::Debug for FnSubagentBus<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSubagentBus").finish_non_exhaustive()
    }
}

impl<F: Fn(InboundMessage) + Send + Sync> SubagentBus for FnSubagentBus<F> {
    fn publish(&self, message: InboundMessage) {
        (self.0)(message);
    }
}

/// Receives forwarded stream chunks from a running subagent's executor turn.
pub trait StreamSink: Send + Sync {
    /// Called with one flushed chunk of `subagent_id`'s executor output.
    fn emit(&self, subagent_id: &str, chunk: String);
}

/// A `Fn`-backed [`StreamSink`].
pub struct FnStreamSink<F>(pub F);

impl<F> std::fmt::Debug for FnStreamSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStreamSink").finish_non_exhaustive()
    }
}

impl<F: Fn(&str, String) + Send + Sync> StreamSink for FnStreamSink<F> {
    fn emit(&self, subagent_id: &str, chunk: String) {
        (self.0)(subagent_id, chunk);
    }
}

/// A handle to a live or finished subagent.
pub struct SubagentHandle {
    /// Short stable id.
    pub id: String,
    /// The role this subagent was spawned to perform.
    pub role: String,
    /// Id of the subagent that spawned this one, if any.
    pub parent_id: Option<String>,
    /// Current status.
    pub status: SubagentStatus,
    /// When it was created.
    pub created_at: DateTime<Utc>,
    /// When `status` last changed.
    pub updated_at: DateTime<Utc>,
    /// The last error, if failed.
    pub last_error: Option<String>,
    /// The last (or final) result text.
    pub last_result: Option<String>,
    cancel: CancellationToken,
    completion: Option<oneshot::Receiver<SubagentOutcome>>,
}

impl std::fmt::Debug for SubagentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Default cap on controller/executor round-trips per subagent run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// Default cap on inner tool-call rounds per executor turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 5;

/// Default cap on concurrently-running subagents.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Minimum gap between forwarded stream chunks.
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(1500);
/// Minimum new content before a stream chunk is forwarded early.
const STREAM_FLUSH_MIN_CHARS: usize = 120;

/// Spawns and tracks short-lived controller/executor subagents.
pub struct SubagentRegistry {
    handles: Arc<Mutex<HashMap<String, Arc<Mutex<SubagentHandle>>>>>,
    id_seq: std::sync::atomic::AtomicU64,
    max_iterations: u32,
    max_tool_rounds: u32,
    tools: Option<Arc<ToolRegistry>>,
    bus: Option<Arc<dyn SubagentBus>>,
    stream: Option<Arc<dyn StreamSink>>,
    concurrency: Arc<Semaphore>,
}

impl std::fmt::Debug for SubagentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentRegistry").finish_non_exhaustive()
    }
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubagentRegistry {
    /// Creates a registry with the default iteration cap, tool-round cap,
    /// and concurrency cap, with no tool registry or bus wired.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_iterations(DEFAULT_MAX_ITERATIONS)
    }

    /// Creates a registry bounding every run to at most `max_iterations`
    /// controller/executor round-trips.
    #[must_use]
    pub fn with_max_iterations(max_iterations: u32) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            id_seq: std::sync::atomic::AtomicU64::new(0),
            max_iterations,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tools: None,
            bus: None,
            stream: None,
            concurrency: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
        }
    }

    /// Overrides the default cap of 8 concurrently-running subagents.
    /// [`Self::spawn`] rejects new spawns past this cap rather than queuing
    /// them.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.concurrency = Arc::new(Semaphore::new(max_concurrency));
        self
    }

    /// Wires a tool registry so the executor's inner tool-call loop (step 6
    /// of the run loop) can actually dispatch requested tool calls.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Wires a bus that receives handoff mentions and completion
    /// announcements.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn SubagentBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Wires a sink that receives forwarded executor stream chunks.
    #[must_use]
    pub fn with_stream(mut self, stream: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(stream);
        self
    }

    fn next_id(&self) -> String {
        let n = self
            .id_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("sa_{n:06x}")
    }

    /// Spawns a subagent to solve `task` using `controller` and `executor`,
    /// returning its id immediately; the run proceeds on a background task.
    ///
    /// Rejected (rather than queued) once `max_concurrency` concurrently
    /// running subagents are already tracked.
    pub async fn spawn(
        &self,
        role: impl Into<String>,
        parent_id: Option<String>,
        task: impl Into<String>,
        controller: Arc<dyn Controller>,
        executor: Arc<dyn Executor>,
    ) -> Result<String, String> {
        let permit = Arc::clone(&self.concurrency)
            .try_acquire_owned()
            .map_err(|_| "subagent concurrency limit reached".to_owned())?;

        let id = self.next_id();
        let role = role.into();
        let now = Utc::now();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(Mutex::new(SubagentHandle {
            id: id.clone(),
            role: role.clone(),
            parent_id: parent_id.clone(),
            status: SubagentStatus::Running,
            created_at: now,
            updated_at: now,
            last_error: None,
            last_result: None,
            cancel: cancel.clone(),
            completion: Some(rx),
        }));
        self.handles.lock().await.insert(id.clone(), Arc::clone(&handle));

        let task = task.into();
        let max_iterations = self.max_iterations;
        let max_tool_rounds = self.max_tool_rounds;
        let tools = self.tools.clone();
        let bus = self.bus.clone();
        let stream = self.stream.clone();
        let id_for_run = id.clone();
        let announce_target = parent_id.unwrap_or_else(|| id.clone());

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = run_loop(
                &id_for_run,
                &task,
                max_iterations,
                max_tool_rounds,
                &cancel,
                controller.as_ref(),
                executor.as_ref(),
                tools.as_deref(),
                bus.as_deref(),
                stream.as_deref(),
            )
            .await;
            {
                let mut h = handle.lock().await;
                h.status = outcome.status;
                h.updated_at = Utc::now();
                match outcome.status {
                    SubagentStatus::Failed => h.last_error = Some(outcome.content.clone()),
                    _ => h.last_result = Some(outcome.content.clone()),
                }
            }
            if let Some(bus) = &bus {
                let content = if outcome.status == SubagentStatus::Cancelled {
                    format!("Error: {}", outcome.content)
                } else {
                    outcome.content.clone()
                };
                bus.publish(announcement_message(&id_for_run, &role, &announce_target, &content));
            }
            let _ = tx.send(outcome);
        });

        Ok(id)
    }

    /// Waits for `id` to reach a terminal status, returning its outcome.
    /// Returns `None` if `id` is unknown or already consumed.
    pub async fn wait_for_completion(&self, id: &str) -> Option<SubagentOutcome> {
        let handle = self.handles.lock().await.get(id).cloned()?;
        let rx = handle.lock().await.completion.take();
        if let Some(rx) = rx {
            return rx.await.ok();
        }
        let h = handle.lock().await;
        if h.status.is_terminal() {
            return Some(SubagentOutcome {
                status: h.status,
                content: h
                    .last_result
                    .clone()
                    .or_else(|| h.last_error.clone())
                    .unwrap_or_default(),
            });
        }
        None
    }

    /// Cancels `id`. When `cascade`, also cancels every currently-tracked
    /// subagent whose `parent_id` is `id` (recursively).
    pub async fn cancel(&self, id: &str, cascade: bool) {
        let handles = self.handles.lock().await;
        let Some(handle) = handles.get(id).cloned() else {
            return;
        };
        drop(handles);

        {
            let h = handle.lock().await;
            h.cancel.cancel();
        }

        if cascade {
            let children: Vec<String> = {
                let handles = self.handles.lock().await;
                let mut out = Vec::new();
                for (child_id, child) in handles.iter() {
                    if child.lock().await.parent_id.as_deref() == Some(id) {
                        out.push(child_id.clone());
                    }
                }
                out
            };
            for child_id in children {
                Box::pin(self.cancel(&child_id, true)).await;
            }
        }
    }

    /// Returns the current status of `id`, if tracked.
    pub async fn status(&self, id: &str) -> Option<SubagentStatus> {
        let handles = self.handles.lock().await;
        let handle = handles.get(id)?;
        Some(handle.lock().await.status)
    }
}

fn handoff_message(from_id: &str, handoff: &Handoff) -> InboundMessage {
    InboundMessage {
        id: format!("handoff-{from_id}-{}", handoff.alias),
        provider: "subagent".to_owned(),
        sender_id: from_id.to_owned(),
        chat_id: handoff.alias.clone(),
        thread_id: None,
        text: format!("@{}: {}", handoff.alias, handoff.instruction),
        media: Vec::new(),
        timestamp: Utc::now().to_rfc3339(),
        metadata: serde_json::Map::new(),
    }
}

fn announcement_message(id: &str, role: &str, target: &str, content: &str) -> InboundMessage {
    InboundMessage {
        id: format!("announce-{id}"),
        provider: "subagent".to_owned(),
        sender_id: id.to_owned(),
        chat_id: target.to_owned(),
        thread_id: None,
        text: format!("[subagent:{role} {id}] {content}"),
        media: Vec::new(),
        timestamp: Utc::now().to_rfc3339(),
        metadata: serde_json::Map::new(),
    }
}

/// Flushes `buf` through `sink` if it's due (≥120 chars of new content or
/// ≥1.5s since the last flush), per the run loop's stream-forwarding step.
fn _flush_stream_buffer(buf: &mut StreamBuffer, sink: Option<&dyn StreamSink>, subagent_id: &str) {
    if !buf.should_flush(STREAM_FLUSH_INTERVAL, STREAM_FLUSH_MIN_CHARS) {
        return;
    }
    if let (Some(chunk), Some(sink)) = (buf.flush(), sink) {
        sink.emit(subagent_id, chunk);
    }
}

/// Runs one executor turn, forwarding any chunks it reports through `stream`
/// as they arrive (subject to the flush cadence), then flushing whatever
/// remains once the turn completes.
async fn run_executor_turn(
    executor: &dyn Executor,
    prompt: &str,
    subagent_id: &str,
    stream: Option<&dyn StreamSink>,
) -> Result<String, String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut buf = StreamBuffer::new(16_000);
    let run_fut = executor.run(prompt, Some(&tx));
    tokio::pin!(run_fut);

    let output = loop {
        tokio::select! {
            biased;
            Some(chunk) = rx.recv() => {
                buf.append(&chunk);
                _flush_stream_buffer(&mut buf, stream, subagent_id);
            }
            result = &mut run_fut => {
                while let Ok(chunk) = rx.try_recv() {
                    buf.append(&chunk);
                }
                break result;
            }
        }
    };

    if let Some(chunk) = buf.flush() {
        if let Some(sink) = stream {
            sink.emit(subagent_id, chunk);
        }
    }

    output
}

fn cancelled() -> SubagentOutcome {
    SubagentOutcome {
        status: SubagentStatus::Cancelled,
        content: "cancelled".to_owned(),
    }
}

fn failed(message: String) -> SubagentOutcome {
    SubagentOutcome {
        status: SubagentStatus::Failed,
        content: message,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    id: &str,
    task: &str,
    max_iterations: u32,
    max_tool_rounds: u32,
    cancel: &CancellationToken,
    controller: &dyn Controller,
    executor: &dyn Executor,
    tools: Option<&ToolRegistry>,
    bus: Option<&dyn SubagentBus>,
    stream: Option<&dyn StreamSink>,
) -> SubagentOutcome {
    let mut last_executor_output: Option<String> = None;
    let mut seen_handoffs: HashSet<String> = HashSet::new();

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return cancelled();
        }

        let decision = tokio::select! {
            () = cancel.cancelled() => return cancelled(),
            d = controller.decide(task, iteration, last_executor_output.as_deref()) => d,
        };

        let decision = match decision {
            Ok(d) => d,
            Err(message) => return failed(message),
        };

        for handoff in &decision.handoffs {
            let key = format!("{}\u{0}{}", handoff.alias, handoff.instruction);
            if seen_handoffs.insert(key) {
                if let Some(bus) = bus {
                    bus.publish(handoff_message(id, handoff));
                }
            }
        }

        if decision.done {
            return SubagentOutcome {
                status: SubagentStatus::Completed,
                content: decision.final_answer.unwrap_or_default(),
            };
        }

        let Some(prompt) = decision.executor_prompt else {
            return SubagentOutcome {
                status: SubagentStatus::Completed,
                content: last_executor_output.unwrap_or_default(),
            };
        };

        let output = tokio::select! {
            () = cancel.cancelled() => return cancelled(),
            out = run_executor_turn(executor, &prompt, id, stream) => out,
        };

        let mut text = match output {
            Ok(text) => text,
            Err(message) => return failed(message),
        };

        for _round in 0..max_tool_rounds {
            let Some(calls) = extract_tool_calls(&text) else {
                break;
            };
            if calls.is_empty() {
                break;
            }
            let Some(registry) = tools else {
                break;
            };
            if cancel.is_cancelled() {
                return cancelled();
            }

            let ctx = ToolContext {
                task_id: Some(id.to_owned()),
                cancel: cancel.clone(),
                ..ToolContext::new()
            };
            let mut results_block = String::from("[TOOL_RESULTS]\n");
            for call in &calls {
                let result = registry.execute(&call.name, call.arguments.clone(), &ctx).await;
                results_block.push_str(&format!("{}: {result}\n", call.name));
            }
            let follow_up = format!("{results_block}\nContinue the task using these results.");

            let next = tokio::select! {
                () = cancel.cancelled() => return cancelled(),
                out = run_executor_turn(executor, &follow_up, id, stream) => out,
            };
            text = match next {
                Ok(text) => text,
                Err(message) => return failed(message),
            };
        }

        last_executor_output = Some(text);
    }

    SubagentOutcome {
        status: SubagentStatus::Completed,
        content: last_executor_output.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Tool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct OneShotController;

    #[async_trait::async_trait]
    impl Controller for OneShotController {
        async fn decide(
            &self,
            _task: &str,
            _iteration: u32,
            _last: Option<&str>,
        ) -> Result<ControllerDecision, String> {
            Ok(ControllerDecision {
                done: true,
                final_answer: Some("42".to_owned()),
                ..Default::default()
            })
        }
    }

    struct NoopExecutor;

    #[async_trait::async_trait]
    impl Executor for NoopExecutor {
        async fn run(&self, _prompt: &str, _chunks: Option<&ChunkSink>) -> Result<String, String> {
            Ok(String::new())
        }
    }

    struct HangingController;

    #[async_trait::async_trait]
    impl Controller for HangingController {
        async fn decide(
            &self,
            _task: &str,
            _iteration: u32,
            _last: Option<&str>,
        ) -> Result<ControllerDecision, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn spawn_and_wait_returns_final_answer() {
        let registry = SubagentRegistry::new();
        let id = registry
            .spawn(
                "tester",
                None,
                "answer the question",
                Arc::new(OneShotController),
                Arc::new(NoopExecutor),
            )
            .await
            .unwrap();
        let outcome = registry.wait_for_completion(&id).await.unwrap();
        assert_eq!(outcome.status, SubagentStatus::Completed);
        assert_eq!(outcome.content, "42");
    }

    #[tokio::test]
    async fn cascade_cancel_reaches_children() {
        let registry = SubagentRegistry::new();
        let parent = registry
            .spawn(
                "parent",
                None,
                "t",
                Arc::new(HangingController),
                Arc::new(NoopExecutor),
            )
            .await
            .unwrap();
        let child = registry
            .spawn(
                "child",
                Some(parent.clone()),
                "t",
                Arc::new(HangingController),
                Arc::new(NoopExecutor),
            )
            .await
            .unwrap();

        registry.cancel(&parent, true).await;

        let parent_outcome = registry.wait_for_completion(&parent).await.unwrap();
        let child_outcome = registry.wait_for_completion(&child).await.unwrap();
        assert_eq!(parent_outcome.status, SubagentStatus::Cancelled);
        assert_eq!(child_outcome.status, SubagentStatus::Cancelled);
    }

    #[tokio::test]
    async fn controller_error_fails_the_run() {
        struct FailingController;
        #[async_trait::async_trait]
        impl Controller for FailingController {
            async fn decide(
                &self,
                _task: &str,
                _iteration: u32,
                _last: Option<&str>,
            ) -> Result<ControllerDecision, String> {
                Err("boom".to_owned())
            }
        }
        let registry = SubagentRegistry::new();
        let id = registry
            .spawn("t", None, "task", Arc::new(FailingController), Arc::new(NoopExecutor))
            .await
            .unwrap();
        let outcome = registry.wait_for_completion(&id).await.unwrap();
        assert_eq!(outcome.status, SubagentStatus::Failed);
        assert_eq!(outcome.content, "boom");
    }

    #[tokio::test]
    async fn run_ends_after_max_iterations_without_done() {
        struct NeverDoneController(AtomicU32);
        #[async_trait::async_trait]
        impl Controller for NeverDoneController {
            async fn decide(
                &self,
                _task: &str,
                _iteration: u32,
                _last: Option<&str>,
            ) -> Result<ControllerDecision, String> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(ControllerDecision {
                    done: false,
                    executor_prompt: Some("keep going".to_owned()),
                    ..Default::default()
                })
            }
        }
        let registry = SubagentRegistry::with_max_iterations(3);
        let counter = Arc::new(NeverDoneController(AtomicU32::new(0)));
        let id = registry
            .spawn("t", None, "task", counter.clone(), Arc::new(NoopExecutor))
            .await
            .unwrap();
        let outcome = registry.wait_for_completion(&id).await.unwrap();
        assert_eq!(outcome.status, SubagentStatus::Completed);
        assert_eq!(counter.0.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn spawn_rejects_past_concurrency_cap() {
        let registry = SubagentRegistry::new().with_max_concurrency(1);
        let first = registry
            .spawn("a", None, "t", Arc::new(HangingController), Arc::new(NoopExecutor))
            .await;
        assert!(first.is_ok());
        let second = registry
            .spawn("b", None, "t", Arc::new(HangingController), Arc::new(NoopExecutor))
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn new_handoffs_are_published_once_each() {
        struct HandoffController(AtomicU32);
        #[async_trait::async_trait]
        impl Controller for HandoffController {
            async fn decide(
                &self,
                _task: &str,
                iteration: u32,
                _last: Option<&str>,
            ) -> Result<ControllerDecision, String> {
                self.0.fetch_add(1, Ordering::Relaxed);
                if iteration < 2 {
                    return Ok(ControllerDecision {
                        done: false,
                        executor_prompt: Some("go".to_owned()),
                        handoffs: vec![Handoff {
                            alias: "reviewer".to_owned(),
                            instruction: "look at this".to_owned(),
                        }],
                        ..Default::default()
                    });
                }
                Ok(ControllerDecision {
                    done: true,
                    final_answer: Some("done".to_owned()),
                    ..Default::default()
                })
            }
        }

        let published = Arc::new(StdMutex::new(Vec::new()));
        let published_clone = published.clone();
        let bus = Arc::new(FnSubagentBus(move |message: InboundMessage| {
            published_clone.lock().unwrap().push(message);
        }));

        let registry = SubagentRegistry::new().with_bus(bus);
        let id = registry
            .spawn(
                "t",
                None,
                "task",
                Arc::new(HandoffController(AtomicU32::new(0))),
                Arc::new(NoopExecutor),
            )
            .await
            .unwrap();
        let outcome = registry.wait_for_completion(&id).await.unwrap();
        assert_eq!(outcome.status, SubagentStatus::Completed);

        let messages = published.lock().unwrap();
        let handoffs: Vec<_> = messages.iter().filter(|m| m.chat_id == "reviewer").collect();
        assert_eq!(handoffs.len(), 1, "the identical handoff should be deduplicated across iterations");
        assert!(messages.iter().any(|m| m.text.contains("done")), "completion should publish an announcement");
    }

    struct ToolCallingExecutor {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Executor for ToolCallingExecutor {
        async fn run(&self, prompt: &str, _chunks: Option<&ChunkSink>) -> Result<String, String> {
            if prompt.contains("[TOOL_RESULTS]") {
                return Ok("final answer after tool use".to_owned());
            }
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(r#"<<ORCH_TOOL_CALLS>>{"tool_calls":[{"id":"1","name":"echo","arguments":{"text":"hi"}}]}<<ORCH_TOOL_CALLS_END>>"#.to_owned())
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "echoes text"
        }
        fn schema(&self) -> crate::tool::ParamSchema {
            crate::tool::object_schema([], [])
        }
        async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> String {
            params.get("text").and_then(serde_json::Value::as_str).unwrap_or_default().to_owned()
        }
    }

    #[tokio::test]
    async fn executor_tool_calls_are_dispatched_through_the_registry() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let registry = Arc::new(registry);

        let subagents = SubagentRegistry::new().with_tools(registry);
        let id = subagents
            .spawn(
                "t",
                None,
                "task",
                Arc::new(OneShotControllerWithPrompt),
                Arc::new(ToolCallingExecutor { calls: AtomicU32::new(0) }),
            )
            .await
            .unwrap();
        let outcome = subagents.wait_for_completion(&id).await.unwrap();
        assert_eq!(outcome.status, SubagentStatus::Completed);
        assert_eq!(outcome.content, "final answer after tool use");
    }

    struct OneShotControllerWithPrompt;

    #[async_trait::async_trait]
    impl Controller for OneShotControllerWithPrompt {
        async fn decide(
            &self,
            _task: &str,
            iteration: u32,
            last: Option<&str>,
        ) -> Result<ControllerDecision, String> {
            if iteration == 0 {
                return Ok(ControllerDecision {
                    done: false,
                    executor_prompt: Some("go".to_owned()),
                    ..Default::default()
                });
            }
            Ok(ControllerDecision {
                done: true,
                final_answer: Some(last.unwrap_or_default().to_owned()),
                ..Default::default()
            })
        }
    }
}
