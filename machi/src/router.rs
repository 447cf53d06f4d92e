//! Orchestration Router: classifies each inbound message into a dispatch
//! mode (`once`/`agent`/`task`) and runs the matching executor loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::{ChatMessage, InboundMessage};
use crate::providers::{GenerateOptions, Model};
use crate::secrets::SecretVault;
use crate::tool::{ToolContext, ToolRegistry};

/// A named capability bundle: always offered, or offered when `keywords`
/// match the request text, contributing the tool names it requires to the
/// per-request tool selection.
#[derive(Debug, Clone)]
pub struct Skill {
    /// Stable identifier, for logging/diagnostics.
    pub id: String,
    /// Offered on every request regardless of keyword match.
    pub always_applicable: bool,
    /// Substrings (matched case-insensitively) that recommend this skill.
    pub keywords: Vec<String>,
    /// Tool names this skill needs; intersected against what's actually
    /// registered before being offered to the model.
    pub required_tools: Vec<String>,
}

/// Built-in keyword → tool-name rules applied on top of skill selection, for
/// tools that don't warrant a whole skill (e.g. scheduling a reminder just
/// needs `cron`, not a bundle of instructions).
fn category_tool_rules() -> &'static [(&'static [&'static str], &'static str)] {
    &[
        (&["remind me", "schedule", "every day", "every week", "cron"], "cron"),
        (&["secret", "credential", "api key", "password"], "secret"),
        (&["read file", "write file", "edit file", "list dir", "directory"], "fs"),
    ]
}

/// Phase 3: resolves always-applicable plus keyword-recommended skills,
/// unions their required tools with the built-in category keyword rules,
/// and intersects the result with `available`. An empty result (no skill or
/// keyword hit) means a direct, tool-free response.
fn select_tools(text: &str, skills: &[Skill], available: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut selected = std::collections::HashSet::new();

    for skill in skills {
        let matches = skill.always_applicable || skill.keywords.iter().any(|kw| lower.contains(kw.as_str()));
        if matches {
            selected.extend(skill.required_tools.iter().cloned());
        }
    }
    for (keywords, tool_name) in category_tool_rules() {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            selected.insert((*tool_name).to_owned());
        }
    }

    let mut resolved: Vec<String> = available.iter().filter(|name| selected.contains(*name)).cloned().collect();
    resolved.sort();
    resolved.dedup();
    resolved
}

/// The two exact-match tokens an executor response can emit to hand a
/// `once` dispatch up to a heavier loop. Matched only at the start of the
/// (trimmed) response so the words can still appear mid-answer without
/// triggering escalation.
const ESCALATE_TASK: &str = "NEED_TASK_LOOP";
const ESCALATE_AGENT: &str = "NEED_AGENT_LOOP";

const DEFAULT_AGENT_LOOP_MAX_TURNS: u32 = 8;
const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 4000;

/// Dispatch mode chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A single request/response turn.
    Once,
    /// A bounded iterate-until-done loop.
    Agent,
    /// A `plan -> execute -> finalize` task loop.
    Task,
}

/// Everything the router needs to handle one inbound message.
#[derive(Debug)]
pub struct RouterRequest {
    /// Recent conversation history, oldest first (callers should cap this at
    /// a small window; the router does not trim it further).
    pub history: Vec<ChatMessage>,
    /// The message being routed.
    pub inbound: InboundMessage,
    /// Names of tools actually registered and eligible for this request;
    /// Phase 3 selection narrows this further per mode before any tool
    /// schema reaches the model.
    pub available_tools: Vec<String>,
    /// Cooperative cancellation for the whole dispatch.
    pub cancel: CancellationToken,
}

/// Outcome of one [`Router::execute`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterResult {
    /// The text to send back to the channel, if any.
    pub reply: Option<String>,
    /// The mode the request was ultimately dispatched under.
    pub mode: Option<Mode>,
    /// How many tool calls were dispatched while handling this request.
    pub tool_calls_count: u32,
    /// True if any content was streamed to the caller's stream handler.
    pub streamed: bool,
    /// True if the agent already emitted channel output via a tool call and
    /// the transport should not additionally send `reply`.
    pub suppress_reply: bool,
    /// Set if dispatch failed outright (after any fallback retry).
    pub error: Option<String>,
}

/// Classifies keyword-triggered direct mode hints (spec phase 4) ahead of an
/// orchestrator classification call.
fn direct_mode_hint(text: &str) -> Option<Mode> {
    let lower = text.to_lowercase();
    let scheduling = ["remind me", "schedule", "every day", "every week", "at 9am", "cron"];
    if scheduling.iter().any(|kw| lower.contains(kw)) {
        return Some(Mode::Once);
    }
    let task_words = ["approve", "approval", "step by step", "first,", "then,", "workflow"];
    if task_words.iter().any(|kw| lower.contains(kw)) {
        return Some(Mode::Task);
    }
    let agent_words = ["keep going until", "iterate until", "until it works", "don't stop until"];
    if agent_words.iter().any(|kw| lower.contains(kw)) {
        return Some(Mode::Agent);
    }
    if count_list_items(text) >= 3 {
        return Some(Mode::Task);
    }
    None
}

fn count_list_items(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed
                    .split_once('.')
                    .is_some_and(|(head, _)| !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}

/// Strips an escalation token from the start of a trimmed response, if
/// present, returning the target mode.
fn escalation_mode(text: &str) -> Option<Mode> {
    let trimmed = text.trim_start();
    if trimmed.starts_with(ESCALATE_TASK) {
        Some(Mode::Task)
    } else if trimmed.starts_with(ESCALATE_AGENT) {
        Some(Mode::Agent)
    } else {
        None
    }
}

fn request_tool_context(request: &RouterRequest) -> ToolContext {
    ToolContext {
        cancel: request.cancel.clone(),
        task_id: None,
        provider: Some(request.inbound.provider.clone()),
        chat_id: Some(request.inbound.chat_id.clone()),
        sender_id: Some(request.inbound.sender_id.clone()),
        approved: false,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("... [truncated]");
    truncated
}

/// Classifies mode, dispatches the matching loop, and retries once against a
/// fallback model on primary failure.
pub struct Router {
    orchestrator: Arc<dyn Model>,
    fallback: Option<Arc<dyn Model>>,
    tools: Arc<ToolRegistry>,
    secrets: Arc<SecretVault>,
    agent_loop_max_turns: u32,
    max_tool_result_chars: usize,
    skills: Vec<Skill>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Builds a router over `orchestrator`, optionally retrying through
    /// `fallback` once on primary failure.
    #[must_use]
    pub fn new(
        orchestrator: Arc<dyn Model>,
        fallback: Option<Arc<dyn Model>>,
        tools: Arc<ToolRegistry>,
        secrets: Arc<SecretVault>,
    ) -> Self {
        Self {
            orchestrator,
            fallback,
            tools,
            secrets,
            agent_loop_max_turns: DEFAULT_AGENT_LOOP_MAX_TURNS,
            max_tool_result_chars: DEFAULT_MAX_TOOL_RESULT_CHARS,
            skills: Vec::new(),
        }
    }

    /// Overrides the default 8-turn agent loop bound.
    #[must_use]
    pub const fn with_agent_loop_max_turns(mut self, max_turns: u32) -> Self {
        self.agent_loop_max_turns = max_turns;
        self
    }

    /// Registers the skill bundles Phase 3 selection draws from.
    #[must_use]
    pub fn with_skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    async fn generate_with_fallback(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> Result<ChatMessage, crate::error::AgentError> {
        match self.orchestrator.generate(messages.clone(), options.clone()).await {
            Ok(response) => Ok(response.message),
            Err(primary_err) => match &self.fallback {
                Some(fallback) => fallback
                    .generate(messages, options)
                    .await
                    .map(|r| r.message),
                None => Err(primary_err),
            },
        }
    }

    /// Runs phases 2 (secret gate) through 5 (dispatch) for `request`.
    pub async fn execute(&self, request: RouterRequest) -> RouterResult {
        if request.cancel.is_cancelled() {
            return RouterResult {
                error: Some("cancelled".to_owned()),
                ..Default::default()
            };
        }

        // Phase 2: secret gate.
        let report = match self.secrets.inspect_references(&request.inbound.text).await {
            Ok(report) => report,
            Err(err) => {
                return RouterResult {
                    error: Some(err.to_string()),
                    ..Default::default()
                };
            }
        };
        if !report.is_clean() {
            let mut notice = String::from("This request references secrets I can't resolve:");
            for name in &report.missing_keys {
                notice.push_str(&format!("\n- missing: {name}"));
            }
            for token in &report.invalid_ciphertexts {
                notice.push_str(&format!("\n- invalid: {token}"));
            }
            return RouterResult {
                reply: Some(notice),
                mode: Some(Mode::Once),
                ..Default::default()
            };
        }

        // Phase 3: skill & tool selection. Only `once` dispatch actually
        // narrows to this subset; `agent`/`task` loops get the full
        // available set since they're expected to need it.
        let once_tools = select_tools(&request.inbound.text, &self.skills, &request.available_tools);

        // Phase 4: mode classification.
        let mode = match direct_mode_hint(&request.inbound.text) {
            Some(mode) => mode,
            None if request.inbound.text.len() < 80 => Mode::Once,
            None => self.classify_mode(&request).await.unwrap_or(Mode::Once),
        };

        // Phase 5: dispatch, with one escalation hop if a `once` dispatch
        // asks for a heavier loop.
        let mut result = self.dispatch(mode, &request, &once_tools).await;
        if mode == Mode::Once
            && let Some(escalated) = result.reply.as_deref().and_then(escalation_mode)
        {
            result = self.dispatch(escalated, &request, &once_tools).await;
        }
        result
    }

    async fn classify_mode(&self, request: &RouterRequest) -> Option<Mode> {
        let prompt = format!(
            "Classify the dispatch mode for this request as JSON {{\"mode\": \"once|task|agent\"}}.\n\nRequest: {}",
            request.inbound.text
        );
        let response = self
            .generate_with_fallback(vec![ChatMessage::user(prompt)], GenerateOptions::new())
            .await
            .ok()?;
        let text = response.text_content()?;
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
        match parsed.get("mode")?.as_str()? {
            "task" => Some(Mode::Task),
            "agent" => Some(Mode::Agent),
            _ => Some(Mode::Once),
        }
    }

    async fn dispatch(&self, mode: Mode, request: &RouterRequest, once_tools: &[String]) -> RouterResult {
        match mode {
            Mode::Once if once_tools.is_empty() => self.dispatch_once_direct(request).await,
            Mode::Once => self.dispatch_once_with_tools(request, once_tools).await,
            Mode::Agent => self.dispatch_agent(request).await,
            Mode::Task => self.dispatch_task(request).await,
        }
    }

    async fn dispatch_once_direct(&self, request: &RouterRequest) -> RouterResult {
        let overlay = "Answer directly and concisely. If this request truly needs a multi-step \
            workflow, respond with exactly NEED_TASK_LOOP or NEED_AGENT_LOOP and nothing else.";
        let mut messages = request.history.clone();
        messages.push(ChatMessage::system(overlay));
        messages.push(ChatMessage::user(request.inbound.text.clone()));

        match self.generate_with_fallback(messages, GenerateOptions::new()).await {
            Ok(message) => RouterResult {
                reply: message.text_content(),
                mode: Some(Mode::Once),
                ..Default::default()
            },
            Err(err) => RouterResult {
                error: Some(err.to_string()),
                mode: Some(Mode::Once),
                ..Default::default()
            },
        }
    }

    async fn dispatch_once_with_tools(&self, request: &RouterRequest, tool_names: &[String]) -> RouterResult {
        let mut messages = request.history.clone();
        messages.push(ChatMessage::user(request.inbound.text.clone()));

        let definitions = self.tools.definitions_for(tool_names).await;
        let options = GenerateOptions {
            tools: if definitions.is_empty() { None } else { Some(definitions) },
            ..GenerateOptions::new()
        };

        let first = match self.generate_with_fallback(messages.clone(), options).await {
            Ok(message) => message,
            Err(err) => {
                return RouterResult {
                    error: Some(err.to_string()),
                    mode: Some(Mode::Once),
                    ..Default::default()
                };
            }
        };

        if !first.has_tool_calls() {
            return RouterResult {
                reply: first.text_content(),
                mode: Some(Mode::Once),
                ..Default::default()
            };
        }

        let ctx = request_tool_context(request);
        let mut tool_calls_count = 0;
        let mut results_block = String::from("[TOOL_RESULTS]\n");
        for call in first.tool_calls.iter().flatten() {
            let result = self.tools.execute(call.name(), call.arguments().clone(), &ctx).await;
            results_block.push_str(&format!(
                "{}: {}\n",
                call.name(),
                truncate(&result, self.max_tool_result_chars)
            ));
            tool_calls_count += 1;
        }

        messages.push(ChatMessage::assistant_with_tool_calls(
            first.tool_calls.clone().unwrap_or_default(),
        ));
        messages.push(ChatMessage::user(format!(
            "{results_block}\nGive a concise final answer for the user, or respond with exactly \
             NEED_TASK_LOOP or NEED_AGENT_LOOP if this truly needs a heavier loop."
        )));

        match self.generate_with_fallback(messages, GenerateOptions::new()).await {
            Ok(message) => RouterResult {
                reply: message.text_content(),
                mode: Some(Mode::Once),
                tool_calls_count,
                ..Default::default()
            },
            Err(err) => RouterResult {
                error: Some(err.to_string()),
                mode: Some(Mode::Once),
                tool_calls_count,
                ..Default::default()
            },
        }
    }

    /// Runs the iterate-until-done loop, bounded by `agent_loop_max_turns`.
    /// Exits early (with `suppress_reply`) once a tool call named
    /// `request_file` or carrying `"phase": "done"` in its arguments has
    /// been observed.
    async fn dispatch_agent(&self, request: &RouterRequest) -> RouterResult {
        let ctx = request_tool_context(request);

        let mut messages = request.history.clone();
        messages.push(ChatMessage::user(request.inbound.text.clone()));
        let mut tool_calls_count = 0;
        let mut file_requested = false;
        let mut done_sent = false;
        let mut last_text = None;

        for _ in 0..self.agent_loop_max_turns {
            if request.cancel.is_cancelled() {
                return RouterResult {
                    error: Some("cancelled".to_owned()),
                    mode: Some(Mode::Agent),
                    tool_calls_count,
                    ..Default::default()
                };
            }

            let response = match self.generate_with_fallback(messages.clone(), GenerateOptions::new()).await {
                Ok(message) => message,
                Err(err) => {
                    return RouterResult {
                        error: Some(err.to_string()),
                        mode: Some(Mode::Agent),
                        tool_calls_count,
                        ..Default::default()
                    };
                }
            };

            if !response.has_tool_calls() {
                last_text = response.text_content();
                break;
            }

            messages.push(response.clone());
            for call in response.tool_calls.iter().flatten() {
                if call.name() == "request_file" {
                    file_requested = true;
                }
                if call.arguments().get("phase").and_then(|v| v.as_str()) == Some("done") {
                    done_sent = true;
                }
                let result = self.tools.execute(call.name(), call.arguments().clone(), &ctx).await;
                messages.push(ChatMessage::tool_response(
                    call.id.clone(),
                    truncate(&result, self.max_tool_result_chars),
                ));
                tool_calls_count += 1;
            }

            if file_requested || done_sent {
                break;
            }
        }

        RouterResult {
            reply: last_text,
            mode: Some(Mode::Agent),
            tool_calls_count,
            suppress_reply: done_sent,
            ..Default::default()
        }
    }

    /// Runs `plan -> execute -> finalize`. `execute` reuses the agent loop
    /// and layers the task-specific exit conditions described in the
    /// executor contract: a file request or an in-flight approval both
    /// short-circuit finalization.
    async fn dispatch_task(&self, request: &RouterRequest) -> RouterResult {
        let plan_prompt = format!(
            "Produce a short numbered plan (no more than 5 steps) for this request, then stop:\n\n{}",
            request.inbound.text
        );
        let plan = self
            .generate_with_fallback(vec![ChatMessage::user(plan_prompt)], GenerateOptions::new())
            .await
            .ok()
            .and_then(|m| m.text_content())
            .unwrap_or_default();

        let mut execute_request_text = request.inbound.clone();
        execute_request_text.text = format!("Plan:\n{plan}\n\nNow execute it.\n\n{}", request.inbound.text);
        let execute_request = RouterRequest {
            history: request.history.clone(),
            inbound: execute_request_text,
            available_tools: request.available_tools.clone(),
            cancel: request.cancel.clone(),
        };
        let mut result = self.dispatch_agent(&execute_request).await;
        result.mode = Some(Mode::Task);

        if let Some(reply) = &result.reply
            && reply.contains("approval_required")
        {
            result.reply = Some("Waiting on an approval before I can continue.".to_owned());
            result.suppress_reply = false;
            return result;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockModel;
    use crate::secrets::SecretVault;

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

    #[test]
    fn escalation_token_matches_only_at_start() {
        assert_eq!(escalation_mode("NEED_TASK_LOOP please"), Some(Mode::Task));
        assert_eq!(escalation_mode("I think we NEED_TASK_LOOP here"), None);
        assert_eq!(escalation_mode("  NEED_AGENT_LOOP"), Some(Mode::Agent));
    }

    #[test]
    fn direct_hints_classify_scheduling_and_lists() {
        assert_eq!(direct_mode_hint("remind me tomorrow"), Some(Mode::Once));
        assert_eq!(
            direct_mode_hint("1. do a\n2. do b\n3. do c"),
            Some(Mode::Task)
        );
    }

    #[tokio::test]
    async fn secret_gate_blocks_before_model_call() {
        let vault = Arc::new(SecretVault::in_memory().unwrap());
        let model = Arc::new(MockModel::new(vec!["should not be called".to_string()]));
        let router = Router::new(model, None, Arc::new(ToolRegistry::new()), vault);
        let request = RouterRequest {
            history: Vec::new(),
            inbound: inbound("use {{secret:missing_one}} now"),
            available_tools: Vec::new(),
            cancel: CancellationToken::new(),
        };
        let result = router.execute(request).await;
        assert!(result.reply.unwrap().contains("missing_one"));
    }

    #[test]
    fn select_tools_is_empty_without_a_skill_or_category_hit() {
        let selected = select_tools("tell me a joke", &[], &["echo".to_owned()]);
        assert!(selected.is_empty());
    }

    #[test]
    fn select_tools_picks_up_always_applicable_skills() {
        let skills = vec![Skill {
            id: "core".to_owned(),
            always_applicable: true,
            keywords: Vec::new(),
            required_tools: vec!["fs".to_owned()],
        }];
        let selected = select_tools("anything at all", &skills, &["fs".to_owned(), "cron".to_owned()]);
        assert_eq!(selected, vec!["fs".to_owned()]);
    }

    #[test]
    fn select_tools_matches_category_keyword_rules() {
        let selected = select_tools("remind me to stretch", &[], &["cron".to_owned(), "echo".to_owned()]);
        assert_eq!(selected, vec!["cron".to_owned()]);
    }

    #[test]
    fn select_tools_never_offers_a_tool_outside_available() {
        let skills = vec![Skill {
            id: "core".to_owned(),
            always_applicable: true,
            keywords: Vec::new(),
            required_tools: vec!["fs".to_owned()],
        }];
        let selected = select_tools("anything", &skills, &[]);
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn no_skill_hit_skips_tool_offering_even_when_available() {
        let vault = Arc::new(SecretVault::in_memory().unwrap());
        let model = Arc::new(MockModel::new(vec!["direct reply, no tools offered".to_string()]));
        let router = Router::new(model, None, Arc::new(ToolRegistry::new()), vault);
        let request = RouterRequest {
            history: Vec::new(),
            inbound: inbound("just chatting here, nothing fancy, long enough to skip the short path"),
            available_tools: vec!["echo".to_owned()],
            cancel: CancellationToken::new(),
        };
        let result = router.execute(request).await;
        assert_eq!(result.reply.as_deref(), Some("direct reply, no tools offered"));
    }

    #[tokio::test]
    async fn short_direct_request_dispatches_once() {
        let vault = Arc::new(SecretVault::in_memory().unwrap());
        let model = Arc::new(MockModel::new(vec!["hello there".to_string()]));
        let router = Router::new(model, None, Arc::new(ToolRegistry::new()), vault);
        let request = RouterRequest {
            history: Vec::new(),
            inbound: inbound("hi"),
            available_tools: Vec::new(),
            cancel: CancellationToken::new(),
        };
        let result = router.execute(request).await;
        assert_eq!(result.mode, Some(Mode::Once));
        assert_eq!(result.reply.as_deref(), Some("hello there"));
    }
}
