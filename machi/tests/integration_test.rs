//! Integration tests exercising the router, tool registry, secret vault, and
//! event log together rather than in isolation.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use orkestra::cron::{CronScheduler, Job, Schedule};
use orkestra::error::AgentError;
use orkestra::events::{event, EventKind, EventLog};
use orkestra::message::{ChatMessage, ChatMessageToolCall, InboundMessage};
use orkestra::ops::{FnResumeSink, OpsRuntime};
use orkestra::providers::{GenerateOptions, Model, ModelResponse};
use orkestra::router::{Mode, Router, RouterRequest, Skill};
use orkestra::secrets::SecretVault;
use orkestra::tool::{object_schema, ParamSchema, Tool, ToolContext, ToolRegistry};

/// A scripted model that calls the `echo` tool on its first turn and gives a
/// plain-text answer on every turn after, to drive the tool-dispatch path a
/// text-only mock can't exercise.
#[derive(Debug)]
struct ToolCallingModel;

#[async_trait]
impl Model for ToolCallingModel {
    fn model_id(&self) -> &str {
        "tool-calling-mock"
    }

    async fn generate(&self, messages: Vec<ChatMessage>, _options: GenerateOptions) -> Result<ModelResponse, AgentError> {
        let already_called = messages.iter().any(|m| m.tool_calls.is_some());
        let message = if already_called {
            ChatMessage::assistant("the tool said: ping")
        } else {
            ChatMessage::assistant_with_tool_calls(vec![ChatMessageToolCall::new(
                "call-1",
                "echo",
                serde_json::json!({"message": "ping"}),
            )])
        };
        Ok(ModelResponse::new(message))
    }
}

fn inbound(text: &str) -> InboundMessage {
    InboundMessage {
        id: "m1".to_owned(),
        provider: "cli".to_owned(),
        sender_id: "u1".to_owned(),
        chat_id: "c1".to_owned(),
        thread_id: None,
        text: text.to_owned(),
        media: Vec::new(),
        timestamp: "2026-01-01T00:00:00Z".to_owned(),
        metadata: serde_json::Map::new(),
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the message parameter back."
    }

    fn schema(&self) -> ParamSchema {
        object_schema([("message", ParamSchema::string())], ["message"])
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> String {
        params.get("message").and_then(Value::as_str).unwrap_or_default().to_owned()
    }
}

/// A router with tools available asks the model, runs the requested tool,
/// and feeds the result back for a final answer.
#[tokio::test]
async fn router_executes_tool_then_answers() {
    let secrets = Arc::new(SecretVault::in_memory().unwrap());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool)).await.unwrap();

    let router = Router::new(Arc::new(ToolCallingModel), None, registry, secrets).with_skills(vec![Skill {
        id: "echoing".to_owned(),
        always_applicable: false,
        keywords: vec!["echo".to_owned()],
        required_tools: vec!["echo".to_owned()],
    }]);
    let request = RouterRequest {
        history: Vec::new(),
        inbound: inbound("please echo ping for me, this needs tool help right now"),
        available_tools: vec!["echo".to_owned()],
        cancel: CancellationToken::new(),
    };

    let result = router.execute(request).await;
    assert_eq!(result.mode, Some(Mode::Once));
    assert_eq!(result.tool_calls_count, 1);
    assert_eq!(result.reply.as_deref(), Some("the tool said: ping"));
}

/// A request referencing a secret the vault can resolve passes the gate and
/// reaches the model; referencing one that's missing never does.
#[tokio::test]
async fn secret_gate_allows_known_secrets_through() {
    let vault = SecretVault::in_memory().unwrap();
    vault.put("api_token", "sekret-value").await.unwrap();
    let report = vault.inspect_references("use {{secret:api_token}} please").await.unwrap();
    assert!(report.is_clean());

    let report = vault.inspect_references("use {{secret:absent_one}} please").await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.missing_keys, vec!["absent_one".to_owned()]);
}

/// The ops runtime resumes a task stuck in `Running` past its retry window,
/// driven entirely off what the event log projects — no direct coupling to
/// whatever appended the events.
#[tokio::test]
async fn ops_runtime_resumes_stale_task_recorded_by_event_log() {
    let events = EventLog::in_memory().unwrap();
    let task_id = "task:cli:c1:reminder";
    let now = chrono::Utc::now();
    events
        .append(&event(
            "e1",
            Some(task_id.to_owned()),
            EventKind::TaskStarted,
            serde_json::json!({}),
            (now - chrono::Duration::minutes(10)).to_rfc3339(),
        ))
        .await
        .unwrap();

    let resumed = Arc::new(AtomicU32::new(0));
    let resumed_for_sink = resumed.clone();
    let sink = FnResumeSink(move |_msg: InboundMessage| {
        resumed_for_sink.fetch_add(1, Ordering::SeqCst);
    });

    let ops = OpsRuntime::new(events, Arc::new(sink)).with_recovery_retry(std::time::Duration::from_secs(60));
    let resumed_count = ops.watchdog_tick(now).await;

    assert_eq!(resumed_count, 1);
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
    assert_eq!(ops.resumes_issued(), 1);
}

/// A cron job registered through the scheduler fires once its time arrives
/// and is gone from the due set afterward.
#[tokio::test]
async fn cron_scheduler_fires_registered_job_once_due() {
    let scheduler = CronScheduler::in_memory().unwrap();
    let now = chrono::Utc::now();
    scheduler
        .register_at(
            Job::new("daily-standup", Schedule::At(now + chrono::Duration::seconds(1)), Value::Null),
            now,
        )
        .await
        .unwrap();

    let due_before = scheduler.tick(now).await.unwrap();
    assert!(due_before.is_empty());

    let due_after = scheduler.tick(now + chrono::Duration::seconds(2)).await.unwrap();
    assert_eq!(due_after.len(), 1);
    assert_eq!(due_after[0].id, "daily-standup");
}
