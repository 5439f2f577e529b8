//! The `Conversation` / `Turn` model (spec.md §3, §4.3).
//!
//! A conversation is a durable, append-only sequence of turns shared by the
//! pipeline and (potentially) multiple concurrent callers. Mutations are
//! serialized through a single `tokio::sync::Mutex` guarding the turn
//! vector, wrapped behind a narrow async API rather than exposing the raw
//! lock to callers. Reads take a snapshot (a clone of the turn vector) so
//! pipeline fan-out never holds the lock across a guardrail call.

use crate::rate_limiter::RateLimitOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    Human,
    Bot,
    Agent,
    AiModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub participant_type: ParticipantType,
}

impl Participant {
    pub fn new(id: impl Into<String>, participant_type: ParticipantType) -> Self {
        Participant {
            id: id.into(),
            participant_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub provider: Option<String>,
}

/// Per-conversation rate-limit configuration (spec.md §4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConversationRateLimit {
    pub turns_per_minute: Option<u32>,
    pub turns_per_hour: Option<u32>,
}

/// One prompt/response exchange. `response` is set at most once, by
/// `add_response`; `prompt` is set exactly once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub speaker: String,
    pub speaker_type: ParticipantType,
    pub listener: String,
    pub listener_type: ParticipantType,
    pub prompt: String,
    pub response: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Populated by the pipeline after a guardrail fan-out over this turn's
    /// prompt and/or response (spec.md §4.5 step 6).
    #[serde(default)]
    pub guardrail_results: Value,
}

impl Turn {
    pub fn is_complete(&self) -> bool {
        self.response.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("cannot add a response: conversation has no turns")]
    Empty,
    #[error("cannot add a response: the last turn already has one")]
    AlreadyComplete,
}

/// An ordered, durable sequence of turns between two typed participants.
pub struct Conversation {
    pub conversation_id: Uuid,
    pub initiator: Participant,
    pub responder: Participant,
    pub model: Option<ModelMetadata>,
    pub rate_limit: Option<ConversationRateLimit>,
    pub created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

struct Inner {
    turns: Vec<Turn>,
    last_activity: DateTime<Utc>,
    // Sliding window of prompt timestamps (monotonic `Instant`s — wall clock
    // can jump, and the rate limiter only needs relative spacing) used by
    // `check_rate_limit`, mirroring the windowed-eviction approach in
    // `crate::rate_limiter`.
    rate_window: VecDeque<Instant>,
}

impl Conversation {
    pub fn new(
        initiator: Participant,
        responder: Participant,
        model: Option<ModelMetadata>,
        rate_limit: Option<ConversationRateLimit>,
    ) -> Self {
        let now = Utc::now();
        Conversation {
            conversation_id: Uuid::new_v4(),
            initiator,
            responder,
            model,
            rate_limit,
            created_at: now,
            inner: Mutex::new(Inner {
                turns: Vec::new(),
                last_activity: now,
                rate_window: VecDeque::new(),
            }),
        }
    }

    // ── Factories (spec.md §6) ────────────────────────────────

    pub fn human_ai(user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Conversation::new(
            Participant::new(user_id, ParticipantType::Human),
            Participant::new("assistant", ParticipantType::AiModel),
            Some(ModelMetadata {
                model_id: model_id.into(),
                provider: None,
            }),
            None,
        )
    }

    pub fn bot_to_bot(initiator_id: impl Into<String>, responder_id: impl Into<String>) -> Self {
        Conversation::new(
            Participant::new(initiator_id, ParticipantType::Bot),
            Participant::new(responder_id, ParticipantType::Bot),
            None,
            None,
        )
    }

    pub fn agent_to_agent(initiator_id: impl Into<String>, responder_id: impl Into<String>) -> Self {
        Conversation::new(
            Participant::new(initiator_id, ParticipantType::Agent),
            Participant::new(responder_id, ParticipantType::Agent),
            None,
            None,
        )
    }

    pub fn human_to_human(initiator_id: impl Into<String>, responder_id: impl Into<String>) -> Self {
        Conversation::new(
            Participant::new(initiator_id, ParticipantType::Human),
            Participant::new(responder_id, ParticipantType::Human),
            None,
            None,
        )
    }

    // ── Mutation ──────────────────────────────────────────────

    pub async fn add_prompt(&self, text: impl Into<String>, metadata: Option<Value>) -> Turn {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let turn = Turn {
            turn_id: Uuid::new_v4(),
            timestamp: now,
            speaker: self.initiator.id.clone(),
            speaker_type: self.initiator.participant_type,
            listener: self.responder.id.clone(),
            listener_type: self.responder.participant_type,
            prompt: text.into(),
            response: None,
            metadata: metadata.unwrap_or(Value::Null),
            guardrail_results: Value::Null,
        };
        inner.turns.push(turn.clone());
        inner.last_activity = now;
        inner.rate_window.push_back(Instant::now());
        turn
    }

    pub async fn add_response(
        &self,
        text: impl Into<String>,
        metadata: Option<Value>,
    ) -> Result<Turn, ConversationError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let last = inner.turns.last_mut().ok_or(ConversationError::Empty)?;
        if last.response.is_some() {
            return Err(ConversationError::AlreadyComplete);
        }
        last.response = Some(text.into());
        if let Some(meta) = metadata {
            last.metadata = meta;
        }
        let turn = last.clone();
        inner.last_activity = now;
        Ok(turn)
    }

    /// Appends an empty-prompt turn and immediately attaches a response —
    /// used when the pipeline checks output content with no open prompt
    /// (spec.md §4.5 step 3).
    pub async fn add_response_only(&self, text: impl Into<String>) -> Turn {
        self.add_prompt(String::new(), None).await;
        self.add_response(text, None)
            .await
            .expect("just-added prompt turn has no response yet")
    }

    pub async fn add_turn(
        &self,
        prompt: impl Into<String>,
        response: Option<String>,
        metadata: Option<Value>,
    ) -> Turn {
        self.add_prompt(prompt, metadata).await;
        match response {
            Some(r) => self
                .add_response(r, None)
                .await
                .expect("just-added prompt turn has no response yet"),
            None => self.inner.lock().await.turns.last().unwrap().clone(),
        }
    }

    pub async fn add_exchange(
        &self,
        prompt: impl Into<String>,
        response: impl Into<String>,
        metadata: Option<Value>,
    ) -> Turn {
        self.add_turn(prompt, Some(response.into()), metadata).await
    }

    /// Writes a `PipelineResult` into the last turn's
    /// `metadata.guardrail_results`, keyed by side (`"input"`/`"output"`) so
    /// one side never clobbers the other (spec.md §4.5 step 6).
    pub async fn annotate_last_turn(&self, side: &str, result: &crate::decision::PipelineResult) {
        let mut inner = self.inner.lock().await;
        if let Some(turn) = inner.turns.last_mut() {
            if !turn.guardrail_results.is_object() {
                turn.guardrail_results = Value::Object(Default::default());
            }
            turn.guardrail_results[side] = serde_json::to_value(result).unwrap_or(Value::Null);
        }
    }

    // ── Reads ─────────────────────────────────────────────────

    pub async fn get_history(&self, limit: Option<usize>) -> Vec<Turn> {
        let inner = self.inner.lock().await;
        match limit {
            Some(n) if n < inner.turns.len() => inner.turns[inner.turns.len() - n..].to_vec(),
            _ => inner.turns.clone(),
        }
    }

    pub async fn get_complete_turns(&self) -> Vec<Turn> {
        self.inner
            .lock()
            .await
            .turns
            .iter()
            .filter(|t| t.is_complete())
            .cloned()
            .collect()
    }

    pub async fn get_incomplete_turns(&self) -> Vec<Turn> {
        self.inner
            .lock()
            .await
            .turns
            .iter()
            .filter(|t| !t.is_complete())
            .cloned()
            .collect()
    }

    pub async fn get_turn_count(&self) -> usize {
        self.inner.lock().await.turns.len()
    }

    pub async fn get_duration(&self) -> chrono::Duration {
        let inner = self.inner.lock().await;
        inner.last_activity - self.created_at
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.inner.lock().await.last_activity
    }

    /// Evaluates the per-conversation rate limit against the sliding window
    /// of prompt timestamps, using the same windowed-eviction algorithm as
    /// `crate::rate_limiter::RateLimiter` (§4.4).
    pub async fn check_rate_limit(&self) -> bool {
        !self.is_rate_limited().await
    }

    pub async fn is_rate_limited(&self) -> bool {
        self.rate_limit_outcome().await.exceeded
    }

    /// Like `is_rate_limited`, but returns the same structured outcome
    /// `RateLimiter` does — `{exceeded, limit, remaining, reset_after}` —
    /// so a conversation-scoped 429 can populate `X-RateLimit-*` /
    /// `Retry-After` exactly like a principal-scoped one (spec.md §6).
    pub async fn rate_limit_outcome(&self) -> RateLimitOutcome {
        let Some(limit) = self.rate_limit else {
            return RateLimitOutcome::allowed();
        };
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let max_window_secs = limit
            .turns_per_hour
            .map(|_| 3600)
            .or(limit.turns_per_minute.map(|_| 60))
            .unwrap_or(60);
        while let Some(&front) = inner.rate_window.front() {
            if now.duration_since(front).as_secs() > max_window_secs as u64 {
                inner.rate_window.pop_front();
            } else {
                break;
            }
        }

        let mut tightest: Option<(u32, u32, Duration)> = None;
        if let Some(per_minute) = limit.turns_per_minute {
            let count = inner
                .rate_window
                .iter()
                .filter(|t| now.duration_since(**t).as_secs() < 60)
                .count() as u32;
            if count >= per_minute {
                let reset_after = inner
                    .rate_window
                    .iter()
                    .filter(|t| now.duration_since(**t).as_secs() < 60)
                    .map(|t| Duration::from_secs(60).saturating_sub(now.duration_since(*t)))
                    .min()
                    .unwrap_or(Duration::from_secs(60));
                tightest = Some((per_minute, count, reset_after));
            }
        }
        if let Some(per_hour) = limit.turns_per_hour {
            let count = inner
                .rate_window
                .iter()
                .filter(|t| now.duration_since(**t).as_secs() < 3600)
                .count() as u32;
            if count >= per_hour {
                let reset_after = inner
                    .rate_window
                    .iter()
                    .filter(|t| now.duration_since(**t).as_secs() < 3600)
                    .map(|t| Duration::from_secs(3600).saturating_sub(now.duration_since(*t)))
                    .min()
                    .unwrap_or(Duration::from_secs(3600));
                let tighter = match &tightest {
                    Some((_, _, best)) => reset_after < *best,
                    None => true,
                };
                if tighter {
                    tightest = Some((per_hour, count, reset_after));
                }
            }
        }

        match tightest {
            Some((limit_val, count, reset_after)) => RateLimitOutcome {
                exceeded: true,
                reason: None,
                limit: Some(limit_val),
                remaining: Some(limit_val.saturating_sub(count)),
                reset_after: Some(reset_after),
            },
            None => RateLimitOutcome::allowed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_prompt_then_response_completes_turn() {
        let convo = Conversation::human_ai("user-1", "gpt-4");
        convo.add_prompt("hello", None).await;
        assert_eq!(convo.get_incomplete_turns().await.len(), 1);
        convo.add_response("hi there", None).await.unwrap();
        assert_eq!(convo.get_complete_turns().await.len(), 1);
    }

    #[tokio::test]
    async fn add_response_without_prompt_fails() {
        let convo = Conversation::human_ai("user-1", "gpt-4");
        let err = convo.add_response("hi", None).await.unwrap_err();
        assert!(matches!(err, ConversationError::Empty));
    }

    #[tokio::test]
    async fn add_response_twice_fails() {
        let convo = Conversation::human_ai("user-1", "gpt-4");
        convo.add_prompt("hello", None).await;
        convo.add_response("hi", None).await.unwrap();
        let err = convo.add_response("again", None).await.unwrap_err();
        assert!(matches!(err, ConversationError::AlreadyComplete));
    }

    #[tokio::test]
    async fn new_prompt_after_complete_turn_opens_a_new_incomplete_turn() {
        let convo = Conversation::human_ai("user-1", "gpt-4");
        convo.add_exchange("hi", "hello", None).await;
        convo.add_prompt("how are you", None).await;
        assert_eq!(convo.get_turn_count().await, 2);
        assert_eq!(convo.get_incomplete_turns().await.len(), 1);
    }

    #[tokio::test]
    async fn per_conversation_rate_limit_trips() {
        let convo = Conversation::new(
            Participant::new("u", ParticipantType::Human),
            Participant::new("a", ParticipantType::AiModel),
            None,
            Some(ConversationRateLimit {
                turns_per_minute: Some(2),
                turns_per_hour: None,
            }),
        );
        convo.add_prompt("one", None).await;
        assert!(!convo.is_rate_limited().await);
        convo.add_prompt("two", None).await;
        assert!(convo.is_rate_limited().await);
    }

    #[tokio::test]
    async fn annotate_last_turn_writes_guardrail_results_per_side() {
        use crate::decision::{Kind, PipelineResult};

        let convo = Conversation::human_ai("user-1", "gpt-4");
        convo.add_prompt("hello", None).await;
        let result = PipelineResult::fold(Kind::Input, Some(convo.conversation_id), vec![]);
        convo.annotate_last_turn("input", &result).await;

        let history = convo.get_history(None).await;
        assert!(history[0].guardrail_results["input"].is_object());
    }
}
