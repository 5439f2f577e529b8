//! The `Pipeline` orchestrator (spec.md §4.5, C5).
//!
//! Sequences a configured list of guardrails over one message and folds
//! their verdicts via `PipelineResult::fold` rather than an early-return
//! chain, so every guardrail runs and contributes to the final decision.

use crate::conversation::Conversation;
use crate::decision::{Kind, PipelineResult};
use crate::error::{Error, Result};
use crate::guardrails::Guardrail;
use crate::principal::Principal;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant as TokioInstant;
use uuid::Uuid;

/// Content above this size is rejected outright (spec.md §4.5 step 1: "must
/// not be null"; this extends the same fail-fast input validation to an
/// obviously-malformed oversized payload, since an unbounded guardrail
/// fan-out over an attacker-sized body is itself a resource-exhaustion
/// vector).
const MAX_CONTENT_CHARS: usize = 200_000;

/// Runs the configured input/output guardrail lists over content, coordinated
/// with the rate limiter, conversation bookkeeping, and audit trail (spec.md
/// §4.5). One `Pipeline` is built per preset (or explicit spec) and shared
/// across requests.
pub struct Pipeline {
    input: Vec<Arc<dyn Guardrail>>,
    output: Vec<Arc<dyn Guardrail>>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<crate::audit::AuditTrail>,
}

impl Pipeline {
    pub fn new(
        input: Vec<Arc<dyn Guardrail>>,
        output: Vec<Arc<dyn Guardrail>>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<crate::audit::AuditTrail>,
    ) -> Self {
        Pipeline {
            input,
            output,
            rate_limiter,
            audit,
        }
    }

    pub fn guardrail_count(&self) -> usize {
        self.input.len() + self.output.len()
    }

    pub async fn check_input(
        &self,
        content: &str,
        conversation: Option<&Conversation>,
        principal: Option<&Principal>,
    ) -> Result<PipelineResult> {
        self.check(Kind::Input, &self.input, content, conversation, principal).await
    }

    pub async fn check_output(
        &self,
        content: &str,
        conversation: Option<&Conversation>,
        principal: Option<&Principal>,
    ) -> Result<PipelineResult> {
        self.check(Kind::Output, &self.output, content, conversation, principal).await
    }

    async fn check(
        &self,
        kind: Kind,
        guardrails: &[Arc<dyn Guardrail>],
        content: &str,
        conversation: Option<&Conversation>,
        principal: Option<&Principal>,
    ) -> Result<PipelineResult> {
        // Step 1: input validation. `&str` has no null representation, so
        // the only live failure mode (spec.md §8) is an oversized payload;
        // an empty string is a valid, non-null content value and must still
        // run the configured guardrails (e.g. a length guard below its
        // minimum).
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(Error::InvalidInput(format!(
                "content exceeds maximum size of {MAX_CONTENT_CHARS} characters"
            )));
        }

        let request_id = Uuid::new_v4();
        let conversation_id = conversation.map(|c| c.conversation_id);

        // Step 2: rate limiting. Principal scope first, then per-conversation.
        if let Some(principal) = principal {
            let scope = principal.rate_limit_key();
            let outcome = self.rate_limiter.check_and_record_detailed(&scope, principal.role.as_deref(), &scope);
            if outcome.exceeded {
                let result = PipelineResult::rate_limited_detailed(kind, conversation_id, &scope, &outcome);
                self.emit_rate_limit_audit(&scope, conversation_id, Some(&principal.id), request_id).await;
                return Ok(result);
            }
        }
        if let Some(conversation) = conversation {
            let outcome = conversation.rate_limit_outcome().await;
            if outcome.exceeded {
                let scope = format!("conv:{}", conversation.conversation_id);
                let result = PipelineResult::rate_limited_detailed(kind, conversation_id, &scope, &outcome);
                self.emit_rate_limit_audit(&scope, conversation_id, None, request_id).await;
                return Ok(result);
            }
        }

        // Step 3: conversation bookkeeping.
        if let Some(conversation) = conversation {
            match kind {
                Kind::Input => {
                    conversation.add_prompt(content.to_string(), None).await;
                }
                Kind::Output => {
                    let has_open_prompt = conversation
                        .get_incomplete_turns()
                        .await
                        .last()
                        .is_some();
                    if has_open_prompt {
                        // Fall back to appending an empty-prompt turn if the
                        // last turn is already complete — mirrors
                        // `add_response_only`'s contract.
                        if conversation.add_response(content.to_string(), None).await.is_err() {
                            conversation.add_response_only(content.to_string()).await;
                        }
                    } else {
                        conversation.add_response_only(content.to_string()).await;
                    }
                }
            }
        }

        // Step 4: guardrail fan-out, in declaration order, bounded overall by
        // `overall_deadline` (spec.md §5) regardless of how many guardrails
        // are configured — each guardrail still gets its own `timeout()`,
        // clamped to whatever's left of the overall budget.
        let fan_out_deadline = TokioInstant::now() + overall_deadline(guardrails);
        let mut decisions = Vec::with_capacity(guardrails.len());
        for guardrail in guardrails.iter().filter(|g| g.enabled()) {
            let now = TokioInstant::now();
            if now >= fan_out_deadline {
                decisions.push(guardrail.on_error().to_decision(
                    guardrail.name(),
                    guardrail.kind(),
                    "overall deadline exceeded",
                ));
                continue;
            }
            let budget = guardrail.timeout().min(fan_out_deadline - now);
            let decision = match tokio::time::timeout(budget, guardrail.analyze(content, conversation)).await {
                Ok(decision) => decision,
                Err(_) => guardrail.on_error().to_decision(guardrail.name(), guardrail.kind(), "timed out"),
            };
            decisions.push(decision);
        }

        // Step 7 (emitted here, before the decisions are consumed by fold,
        // so audit records preserve guardrail declaration order rather than
        // `details`'s name-sorted order): one prompt/response record plus
        // one guardrail_decision record per guardrail that ran, all sharing
        // one request_id.
        self.emit_content_audit(kind, content, conversation_id, principal, request_id).await;
        for decision in &decisions {
            self.emit_decision_audit(decision, conversation_id, principal, request_id).await;
        }

        // Step 5: fold.
        let result = PipelineResult::fold(kind, conversation_id, decisions);

        // Step 6: annotate conversation.
        if let Some(conversation) = conversation {
            let side = match kind {
                Kind::Input => "input",
                Kind::Output => "output",
            };
            conversation.annotate_last_turn(side, &result).await;
        }

        Ok(result)
    }

    async fn emit_content_audit(
        &self,
        kind: Kind,
        content: &str,
        conversation_id: Option<Uuid>,
        principal: Option<&Principal>,
        request_id: Uuid,
    ) {
        if !self.audit.is_enabled().await {
            return;
        }
        let timestamp = chrono::Utc::now();
        let user_id = principal.map(|p| p.id.clone());
        let record = match kind {
            Kind::Input => crate::audit::AuditRecord::Prompt {
                timestamp,
                conversation_id,
                user_id,
                request_id: Some(request_id),
                text: content.to_string(),
            },
            Kind::Output => crate::audit::AuditRecord::Response {
                timestamp,
                conversation_id,
                user_id,
                request_id: Some(request_id),
                text: content.to_string(),
            },
        };
        self.audit.record(record).await;
    }

    async fn emit_decision_audit(
        &self,
        decision: &crate::decision::Decision,
        conversation_id: Option<Uuid>,
        principal: Option<&Principal>,
        request_id: Uuid,
    ) {
        if !self.audit.is_enabled().await {
            return;
        }
        self.audit
            .record(crate::audit::AuditRecord::GuardrailDecision {
                timestamp: chrono::Utc::now(),
                conversation_id,
                user_id: principal.map(|p| p.id.clone()),
                request_id: Some(request_id),
                guardrail_name: decision.guardrail_name.clone(),
                action: decision.action,
                reason: decision.reason.clone(),
                confidence: decision.confidence,
            })
            .await;
    }

    async fn emit_rate_limit_audit(&self, scope: &str, conversation_id: Option<Uuid>, user_id: Option<&str>, request_id: Uuid) {
        if !self.audit.is_enabled().await {
            return;
        }
        self.audit
            .record(crate::audit::AuditRecord::RateLimitExceeded {
                timestamp: chrono::Utc::now(),
                conversation_id,
                user_id: user_id.map(str::to_string),
                request_id: Some(request_id),
                scope: scope.to_string(),
            })
            .await;
    }
}

/// The overall per-request deadline (spec.md §5): max of guardrail timeouts
/// plus slack. `check()` clamps each guardrail's own timeout to whatever's
/// left of this budget, so the fan-out as a whole is bounded regardless of
/// how many guardrails are configured.
pub fn overall_deadline(guardrails: &[Arc<dyn Guardrail>]) -> Duration {
    const SLACK: Duration = Duration::from_millis(250);
    guardrails.iter().map(|g| g.timeout()).max().unwrap_or(Duration::from_secs(5)) + SLACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Action, Decision, OnError};
    use crate::guardrails::HealthStatus;
    use crate::principal::Principal;
    use crate::rate_limiter::WindowLimits;
    use async_trait::async_trait;

    struct AlwaysBlock;

    #[async_trait]
    impl Guardrail for AlwaysBlock {
        fn name(&self) -> &str {
            "always_block"
        }
        fn kind(&self) -> &str {
            "test"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn on_error(&self) -> OnError {
            OnError::Allow
        }
        async fn analyze(&self, _content: &str, _conversation: Option<&Conversation>) -> Decision {
            Decision {
                action: Action::Block,
                confidence: 1.0,
                reason: "always blocks".to_string(),
                details: serde_json::Value::Null,
                guardrail_name: self.name().to_string(),
                guardrail_kind: self.kind().to_string(),
            }
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus::healthy()
        }
    }

    struct AlwaysAllow;

    #[async_trait]
    impl Guardrail for AlwaysAllow {
        fn name(&self) -> &str {
            "always_allow"
        }
        fn kind(&self) -> &str {
            "test"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn on_error(&self) -> OnError {
            OnError::Allow
        }
        async fn analyze(&self, _content: &str, _conversation: Option<&Conversation>) -> Decision {
            Decision::allow(self.name(), self.kind())
        }
    }

    struct TimedGuardrail {
        name: &'static str,
        run_for: Duration,
        own_timeout: Duration,
    }

    #[async_trait]
    impl Guardrail for TimedGuardrail {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> &str {
            "test"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn timeout(&self) -> Duration {
            self.own_timeout
        }
        fn on_error(&self) -> OnError {
            OnError::Allow
        }
        async fn analyze(&self, _content: &str, _conversation: Option<&Conversation>) -> Decision {
            tokio::time::sleep(self.run_for).await;
            Decision::allow(self.name(), self.kind())
        }
    }

    fn test_pipeline(input: Vec<Arc<dyn Guardrail>>) -> Pipeline {
        Pipeline::new(
            input,
            vec![],
            Arc::new(RateLimiter::new(WindowLimits::new())),
            Arc::new(crate::audit::AuditTrail::new()),
        )
    }

    #[tokio::test]
    async fn empty_content_still_runs_guardrails() {
        let pipeline = test_pipeline(vec![Arc::new(AlwaysAllow)]);
        let result = pipeline.check_input("", None, None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn oversized_content_is_invalid_input() {
        let pipeline = test_pipeline(vec![]);
        let huge = "a".repeat(MAX_CONTENT_CHARS + 1);
        let err = pipeline.check_input(&huge, None, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn blocking_guardrail_blocks_the_result() {
        let pipeline = test_pipeline(vec![Arc::new(AlwaysAllow), Arc::new(AlwaysBlock)]);
        let result = pipeline.check_input("hello", None, None).await.unwrap();
        assert!(result.blocked);
        assert_eq!(result.reasons, vec!["always blocks".to_string()]);
    }

    #[tokio::test]
    async fn allow_only_pipeline_does_not_block() {
        let pipeline = test_pipeline(vec![Arc::new(AlwaysAllow)]);
        let result = pipeline.check_input("hello", None, None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn rate_limit_short_circuits_before_guardrails_run() {
        let limiter = Arc::new(RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 1)));
        let pipeline = Pipeline::new(
            vec![Arc::new(AlwaysBlock)],
            vec![],
            limiter,
            Arc::new(crate::audit::AuditTrail::new()),
        );
        let principal = Principal::new("user-1");
        let first = pipeline.check_input("hi", None, Some(&principal)).await.unwrap();
        assert!(!first.blocked || first.reasons != vec!["always blocks".to_string()]);
        // Second call exceeds the limit: should short-circuit to a rate_limit
        // reason, not the guardrail's "always blocks" reason.
        let second = pipeline.check_input("hi", None, Some(&principal)).await.unwrap();
        assert!(second.blocked);
        assert!(second.details.contains_key("rate_limit"));
    }

    #[tokio::test]
    async fn conversation_scoped_rate_limit_carries_header_details() {
        use crate::conversation::{ConversationRateLimit, Participant, ParticipantType};

        let conversation = Conversation::new(
            Participant::new("u", ParticipantType::Human),
            Participant::new("a", ParticipantType::AiModel),
            None,
            Some(ConversationRateLimit {
                turns_per_minute: Some(1),
                turns_per_hour: None,
            }),
        );
        let pipeline = test_pipeline(vec![Arc::new(AlwaysAllow)]);

        let first = pipeline.check_input("hi", Some(&conversation), None).await.unwrap();
        assert!(!first.blocked);

        let second = pipeline.check_input("hi again", Some(&conversation), None).await.unwrap();
        assert!(second.blocked);
        let detail = &second.details["rate_limit"].details;
        assert!(detail.get("limit").and_then(|v| v.as_u64()).is_some());
        assert!(detail.get("remaining").and_then(|v| v.as_u64()).is_some());
        assert!(detail.get("reset_after_secs").and_then(|v| v.as_u64()).is_some());
    }

    #[tokio::test]
    async fn conversation_is_annotated_with_input_result() {
        let conversation = Conversation::human_ai("user-1", "gpt-4");
        let pipeline = test_pipeline(vec![Arc::new(AlwaysAllow)]);
        pipeline.check_input("hello", Some(&conversation), None).await.unwrap();

        let history = conversation.get_history(None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prompt, "hello");
        assert!(history[0].guardrail_results["input"].is_object());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_clamps_a_guardrail_within_its_own_timeout() {
        // Two guardrails each individually budget 5s and each take 4.9s to
        // run. `overall_deadline` for this list is 5s + 250ms slack; after
        // the first consumes 4.9s of it, the second is left with ~0.35s —
        // far under its own 5s `timeout()` — so it must be cut short by the
        // shared deadline rather than allowed to run to completion.
        let first = TimedGuardrail {
            name: "first",
            run_for: Duration::from_millis(4900),
            own_timeout: Duration::from_secs(5),
        };
        let second = TimedGuardrail {
            name: "second",
            run_for: Duration::from_millis(4900),
            own_timeout: Duration::from_secs(5),
        };
        let pipeline = test_pipeline(vec![Arc::new(first), Arc::new(second)]);

        let result = pipeline.check_input("hi", None, None).await.unwrap();
        let second_detail = &result.details["second"];
        assert_eq!(second_detail.reason, "error: timed out");
    }

    #[tokio::test]
    async fn check_output_without_open_prompt_appends_empty_prompt_turn() {
        let conversation = Conversation::human_ai("user-1", "gpt-4");
        let pipeline = Pipeline::new(
            vec![],
            vec![Arc::new(AlwaysAllow)],
            Arc::new(RateLimiter::new(WindowLimits::new())),
            Arc::new(crate::audit::AuditTrail::new()),
        );
        pipeline.check_output("hi there", Some(&conversation), None).await.unwrap();
        let history = conversation.get_history(None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prompt, "");
        assert_eq!(history[0].response.as_deref(), Some("hi there"));
    }
}
