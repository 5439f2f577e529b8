//! Per-guardrail `Decision` and the folded `PipelineResult` (§3, §4.5).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The action a single guardrail (or the folded pipeline result) recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Warn,
    Block,
}

/// What a guardrail does when it errors, times out, or (for remote-backed
/// variants) cannot reach its classifier. See spec.md §4.1 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Allow,
    Block,
    Warn,
}

impl OnError {
    /// Build the `Decision` this policy produces when a guardrail faults.
    pub fn to_decision(self, guardrail_name: &str, guardrail_kind: &str, cause: &str) -> Decision {
        let action = match self {
            OnError::Allow => Action::Allow,
            OnError::Block => Action::Block,
            OnError::Warn => Action::Warn,
        };
        Decision {
            action,
            confidence: 0.0,
            reason: format!("error: {cause}"),
            details: serde_json::Value::Null,
            guardrail_name: guardrail_name.to_string(),
            guardrail_kind: guardrail_kind.to_string(),
        }
    }
}

/// The outcome of a single guardrail's `analyze` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: f32,
    pub reason: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub guardrail_name: String,
    pub guardrail_kind: String,
}

impl Decision {
    pub fn allow(guardrail_name: impl Into<String>, guardrail_kind: impl Into<String>) -> Self {
        Decision {
            action: Action::Allow,
            confidence: 0.0,
            reason: String::new(),
            details: serde_json::Value::Null,
            guardrail_name: guardrail_name.into(),
            guardrail_kind: guardrail_kind.into(),
        }
    }
}

/// Which side of a turn a `PipelineResult` was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Input,
    Output,
}

/// The folded outcome of running a configured guardrail list over one piece
/// of content (spec.md §3, folding rule in §4.5 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub blocked: bool,
    pub warnings: Vec<String>,
    pub reasons: Vec<String>,
    pub details: BTreeMap<String, Decision>,
    pub kind: Kind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
}

impl PipelineResult {
    /// Fold an ordered sequence of per-guardrail decisions into one result,
    /// following the deterministic rule in spec.md §4.5 step 5: declaration
    /// order is preserved in `reasons` and `warnings`.
    pub fn fold(kind: Kind, conversation_id: Option<Uuid>, decisions: Vec<Decision>) -> Self {
        let mut blocked = false;
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();
        let mut details = BTreeMap::new();

        for decision in decisions {
            match decision.action {
                Action::Block => {
                    blocked = true;
                    reasons.push(decision.reason.clone());
                }
                Action::Warn => warnings.push(decision.reason.clone()),
                Action::Allow => {}
            }
            details.insert(decision.guardrail_name.clone(), decision);
        }

        PipelineResult {
            blocked,
            warnings,
            reasons,
            details,
            kind,
            conversation_id,
        }
    }

    /// Build a short-circuit result for a rate-limit rejection (spec.md
    /// §4.5 step 2) — not a guardrail decision, so `details` carries a
    /// synthetic `rate_limit` entry instead of a real `Decision`.
    pub fn rate_limited(kind: Kind, conversation_id: Option<Uuid>, scope: &str) -> Self {
        let reason = format!("Rate limit exceeded: {scope}");
        let mut details = BTreeMap::new();
        details.insert(
            "rate_limit".to_string(),
            Decision {
                action: Action::Block,
                confidence: 1.0,
                reason: reason.clone(),
                details: serde_json::json!({ "scope": scope }),
                guardrail_name: "rate_limit".to_string(),
                guardrail_kind: "rate_limit".to_string(),
            },
        );
        PipelineResult {
            blocked: true,
            warnings: vec![],
            reasons: vec![reason],
            details,
            kind,
            conversation_id,
        }
    }

    /// Same as `rate_limited`, but carries the limiter's full structured
    /// outcome (limit/remaining/reset) so the HTTP layer can populate
    /// `X-RateLimit-*` and `Retry-After` headers (spec.md §6).
    pub fn rate_limited_detailed(
        kind: Kind,
        conversation_id: Option<Uuid>,
        scope: &str,
        outcome: &crate::rate_limiter::RateLimitOutcome,
    ) -> Self {
        let reason = outcome
            .reason
            .clone()
            .unwrap_or_else(|| format!("Rate limit exceeded: {scope}"));
        let mut details = BTreeMap::new();
        details.insert(
            "rate_limit".to_string(),
            Decision {
                action: Action::Block,
                confidence: 1.0,
                reason: reason.clone(),
                details: serde_json::json!({
                    "scope": scope,
                    "limit": outcome.limit,
                    "remaining": outcome.remaining,
                    "reset_after_secs": outcome.reset_after.map(|d| d.as_secs()),
                }),
                guardrail_name: "rate_limit".to_string(),
                guardrail_kind: "rate_limit".to_string(),
            },
        );
        PipelineResult {
            blocked: true,
            warnings: vec![],
            reasons: vec![reason],
            details,
            kind,
            conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(name: &str, action: Action, reason: &str) -> Decision {
        Decision {
            action,
            confidence: 0.5,
            reason: reason.to_string(),
            details: serde_json::Value::Null,
            guardrail_name: name.to_string(),
            guardrail_kind: "test".to_string(),
        }
    }

    #[test]
    fn fold_blocks_when_any_guardrail_blocks() {
        let decisions = vec![
            decision("a", Action::Allow, ""),
            decision("b", Action::Block, "bad content"),
        ];
        let result = PipelineResult::fold(Kind::Input, None, decisions);
        assert!(result.blocked);
        assert_eq!(result.reasons, vec!["bad content".to_string()]);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn fold_preserves_declaration_order_in_reasons() {
        let decisions = vec![
            decision("a", Action::Block, "first"),
            decision("b", Action::Block, "second"),
        ];
        let result = PipelineResult::fold(Kind::Input, None, decisions);
        assert_eq!(result.reasons, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn fold_collects_warnings_without_blocking() {
        let decisions = vec![decision("a", Action::Warn, "mild")];
        let result = PipelineResult::fold(Kind::Input, None, decisions);
        assert!(!result.blocked);
        assert_eq!(result.warnings, vec!["mild".to_string()]);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn blocked_iff_some_detail_blocks() {
        // Testable property 1: blocked <-> exists a Block decision.
        let decisions = vec![decision("a", Action::Allow, ""), decision("b", Action::Warn, "w")];
        let result = PipelineResult::fold(Kind::Input, None, decisions);
        let any_block = result.details.values().any(|d| d.action == Action::Block);
        assert_eq!(result.blocked, any_block);
    }
}
