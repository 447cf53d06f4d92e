//! Approval Service & Parser: turns free-text or reaction input into one of
//! five decisions, and resolves pending [`crate::tool::ApprovalRequest`]s
//! raised by the tool registry.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::tool::{ApprovalRequest, ToolRegistry};

/// The five disjoint decisions a response to an approval request can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalDecision {
    /// Go ahead.
    Approve,
    /// Don't.
    Deny,
    /// Ask again later.
    Defer,
    /// Abandon the request entirely.
    Cancel,
    /// The responder wants an explanation before deciding.
    Clarify,
    /// No decision could be confidently extracted.
    Unknown,
}

/// The outcome of parsing one piece of text or one reaction name.
#[derive(Debug, Clone)]
pub struct ParsedDecision {
    /// The decision extracted.
    pub decision: ApprovalDecision,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// The input, lowercased and whitespace-trimmed.
    pub normalized: String,
}

fn token_sets() -> &'static [(ApprovalDecision, &'static [&'static str])] {
    &[
        (
            ApprovalDecision::Approve,
            &[
                "yes", "ok", "okay", "approve", "allow", "go", "승인", "허용", "✅", "👍", "🟢",
                "🙆", "👌",
            ],
        ),
        (
            ApprovalDecision::Deny,
            &[
                "no", "deny", "reject", "stop", "block", "거절", "불가", "금지", "❌", "👎",
                "🔴", "🙅", "⛔",
            ],
        ),
        (
            ApprovalDecision::Defer,
            &[
                "later", "hold", "wait", "보류", "대기", "나중에", "⏸️", "⏳", "🤔",
            ],
        ),
        (
            ApprovalDecision::Cancel,
            &["cancel", "abort", "취소", "중단"],
        ),
        (
            ApprovalDecision::Clarify,
            &["why", "reason", "explain", "왜", "이유", "설명"],
        ),
    ]
}

/// Stateless text/reaction decision parser.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalParser;

impl ApprovalParser {
    /// Scores every decision's token set against `input` by substring-match
    /// count, picks the highest-scoring decision, and derives a confidence
    /// from the gap to the runner-up. Ties (including all-zero scores, e.g.
    /// empty input) produce [`ApprovalDecision::Unknown`] with confidence 0.
    #[must_use]
    pub fn parse(input: &str) -> ParsedDecision {
        let normalized = input.trim().to_lowercase();
        if normalized.is_empty() {
            return ParsedDecision {
                decision: ApprovalDecision::Unknown,
                confidence: 0.0,
                normalized,
            };
        }

        let mut scores: Vec<(ApprovalDecision, usize)> = token_sets()
            .iter()
            .map(|(decision, tokens)| {
                let score = tokens
                    .iter()
                    .filter(|tok| normalized.contains(**tok))
                    .count();
                (*decision, score)
            })
            .collect();
        scores.sort_by(|a, b| b.1.cmp(&a.1));

        let (top_decision, top_score) = scores[0];
        let second_score = scores.get(1).map_or(0, |(_, s)| *s);

        if top_score == 0 || top_score == second_score {
            return ParsedDecision {
                decision: ApprovalDecision::Unknown,
                confidence: 0.0,
                normalized,
            };
        }

        let confidence = (0.5 + 0.2 * f64::from((top_score - second_score) as u32)).min(1.0);
        ParsedDecision {
            decision: top_decision,
            confidence,
            normalized,
        }
    }
}

/// Maps a Slack reaction name (without colons) to a decision, per the public
/// reaction vocabulary. Returns `None` for reactions with no mapping.
#[must_use]
pub fn decision_from_reaction(name: &str) -> Option<ApprovalDecision> {
    match name {
        "white_check_mark" | "thumbsup" | "+1" => Some(ApprovalDecision::Approve),
        "thumbsdown" | "-1" | "x" => Some(ApprovalDecision::Deny),
        n if n.starts_with("hourglass") => Some(ApprovalDecision::Defer),
        "octagonal_sign" => Some(ApprovalDecision::Cancel),
        _ => None,
    }
}

/// Pulls an explicit `appr_xxxxxxxx` token out of free text, if the
/// responder quoted the request id back (e.g. by replying to the prompt
/// that printed it).
fn extract_request_id(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_'))
        .find(|tok| tok.starts_with("appr_") && tok.len() > "appr_".len())
        .map(str::to_owned)
}

async fn most_recent_pending(
    registry: &ToolRegistry,
    provider: &str,
    chat_id: &str,
) -> Option<ApprovalRequest> {
    registry
        .list_pending_approvals()
        .await
        .into_iter()
        .filter(|r| {
            r.context.provider.as_deref() == Some(provider) && r.context.chat_id.as_deref() == Some(chat_id)
        })
        .max_by(|a, b| a.id.cmp(&b.id))
}

/// Resolves a pending approval from free text: uses an explicit
/// `appr_xxxxxxxx` request id if the text names one, otherwise binds to the
/// most recently raised pending request for `(provider, chat_id)`. Returns
/// `None` if no request id could be determined or the id is unknown.
pub async fn resolve_from_text(
    registry: &ToolRegistry,
    provider: &str,
    chat_id: &str,
    text: &str,
) -> Option<ApprovalRequest> {
    let request_id = match extract_request_id(text) {
        Some(id) => id,
        None => most_recent_pending(registry, provider, chat_id).await?.id,
    };
    registry.resolve_approval_request(&request_id, text).await.ok()
}

/// Resolves a pending approval from a reaction name: maps the reaction to a
/// decision via [`decision_from_reaction`], then binds it to the most
/// recently raised pending request for `(provider, chat_id)`. Returns `None`
/// if the reaction has no mapping or no pending request matches.
pub async fn resolve_from_reaction(
    registry: &ToolRegistry,
    provider: &str,
    chat_id: &str,
    reaction_name: &str,
) -> Option<ApprovalRequest> {
    let decision = decision_from_reaction(reaction_name)?;
    let request = most_recent_pending(registry, provider, chat_id).await?;
    registry
        .resolve_approval_request_from_decision(&request.id, decision, Some(reaction_name))
        .await
        .ok()
}

/// Bounded, TTL-pruned dedup set for the reaction path: prevents a single
/// reaction from re-triggering the same decision on every poll.
#[derive(Debug)]
pub struct ReactionSeenSet {
    seen: Mutex<HashSet<String>>,
}

impl Default for ReactionSeenSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactionSeenSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Builds the dedup key `(provider, chat, request, decision, sorted
    /// reaction names)` and returns `true` the first time it's seen.
    pub fn mark_if_new(
        &self,
        provider: &str,
        chat_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
        mut reaction_names: Vec<String>,
    ) -> bool {
        reaction_names.sort();
        let key = format!(
            "{provider}|{chat_id}|{request_id}|{decision:?}|{}",
            reaction_names.join(",")
        );
        self.seen.lock().expect("not poisoned").insert(key)
    }

    /// Drops all remembered keys. Call periodically to bound memory.
    pub fn prune(&self) {
        self.seen.lock().expect("not poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{object_schema, ParamSchema, Tool, ToolContext, APPROVAL_REQUIRED_PREFIX};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

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

    fn ctx_for(provider: &str, chat_id: &str) -> ToolContext {
        ToolContext {
            provider: Some(provider.to_owned()),
            chat_id: Some(chat_id.to_owned()),
            ..ToolContext::new()
        }
    }

    #[tokio::test]
    async fn resolve_from_text_binds_to_most_recent_pending_for_the_chat() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();

        let result = registry.execute("guarded", serde_json::json!({}), &ctx_for("slack", "c1")).await;
        assert!(result.starts_with(APPROVAL_REQUIRED_PREFIX));

        let resolved = resolve_from_text(&registry, "slack", "c1", "yes go ahead").await.unwrap();
        assert_eq!(resolved.status, crate::tool::ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn resolve_from_text_honors_an_explicit_request_id() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();

        let first = registry.execute("guarded", serde_json::json!({}), &ctx_for("slack", "c1")).await;
        let first_id = first.lines().find_map(|l| l.strip_prefix("approval_request_id: ")).unwrap().to_owned();
        let _second = registry.execute("guarded", serde_json::json!({}), &ctx_for("slack", "c1")).await;

        let resolved = resolve_from_text(&registry, "slack", "c1", &format!("deny {first_id}")).await.unwrap();
        assert_eq!(resolved.id, first_id);
        assert_eq!(resolved.status, crate::tool::ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn resolve_from_reaction_maps_and_binds() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();
        registry.execute("guarded", serde_json::json!({}), &ctx_for("slack", "c1")).await;

        let resolved = resolve_from_reaction(&registry, "slack", "c1", "white_check_mark").await.unwrap();
        assert_eq!(resolved.status, crate::tool::ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn resolve_from_text_ignores_other_chats() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(GuardedTool)).await.unwrap();
        registry.execute("guarded", serde_json::json!({}), &ctx_for("slack", "c1")).await;

        assert!(resolve_from_text(&registry, "slack", "other-chat", "yes").await.is_none());
    }

    #[test]
    fn approve_with_emoji_is_high_confidence() {
        let parsed = ApprovalParser::parse("✅ go");
        assert_eq!(parsed.decision, ApprovalDecision::Approve);
        assert!(parsed.confidence >= 0.7);
    }

    #[test]
    fn clarify_question_is_detected() {
        let parsed = ApprovalParser::parse("? why");
        assert_eq!(parsed.decision, ApprovalDecision::Clarify);
    }

    #[test]
    fn empty_input_is_unknown_zero_confidence() {
        let parsed = ApprovalParser::parse("");
        assert_eq!(parsed.decision, ApprovalDecision::Unknown);
        assert_eq!(parsed.confidence, 0.0);
    }

    #[test]
    fn deny_tokens_are_recognized() {
        assert_eq!(ApprovalParser::parse("no, reject that").decision, ApprovalDecision::Deny);
        assert_eq!(ApprovalParser::parse("거절").decision, ApprovalDecision::Deny);
    }

    #[test]
    fn tie_is_unknown() {
        // "no" matches Deny; "wait" matches Defer: one token each, a tie.
        let parsed = ApprovalParser::parse("no wait");
        assert_eq!(parsed.decision, ApprovalDecision::Unknown);
    }

    #[test]
    fn reaction_mapping_covers_vocabulary() {
        assert_eq!(
            decision_from_reaction("white_check_mark"),
            Some(ApprovalDecision::Approve)
        );
        assert_eq!(decision_from_reaction("x"), Some(ApprovalDecision::Deny));
        assert_eq!(
            decision_from_reaction("hourglass_flowing_sand"),
            Some(ApprovalDecision::Defer)
        );
        assert_eq!(decision_from_reaction("unknown_emoji"), None);
    }

    #[test]
    fn reaction_seen_set_dedupes_identical_firings() {
        let set = ReactionSeenSet::new();
        let names = vec!["thumbsup".to_owned()];
        assert!(set.mark_if_new("slack", "c1", "r1", ApprovalDecision::Approve, names.clone()));
        assert!(!set.mark_if_new("slack", "c1", "r1", ApprovalDecision::Approve, names));
    }
}
