//! Handlers for the three routes spec.md §6 names: `POST /v1/check`,
//! `GET /v1/rules`, `GET /health`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, ModelMetadata, Participant, ParticipantType};
use crate::decision::Action;
use crate::error::Error;
use crate::principal::Principal;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckContext {
    pub user_id: Option<String>,
    pub bot_id: Option<String>,
    pub user_type: Option<String>,
    pub bot_type: Option<String>,
    pub user_name: Option<String>,
    pub bot_name: Option<String>,
    pub bot_model: Option<String>,
    pub session_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub text: String,
    pub kind: CheckKind,
    pub preset: Option<String>,
    pub context: Option<CheckContext>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Prompt,
    Response,
}

#[derive(Debug, Serialize)]
pub struct CheckResponseMetadata {
    pub guardrails_triggered: Vec<String>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub action: &'static str,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: CheckResponseMetadata,
}

fn participant_type(s: Option<&str>, default: ParticipantType) -> ParticipantType {
    match s.map(str::to_lowercase).as_deref() {
        Some("human") => ParticipantType::Human,
        Some("bot") => ParticipantType::Bot,
        Some("agent") => ParticipantType::Agent,
        Some("ai_model") | Some("aimodel") => ParticipantType::AiModel,
        _ => default,
    }
}

fn build_conversation(ctx: &CheckContext) -> Conversation {
    let user_id = ctx.user_name.clone().or_else(|| ctx.user_id.clone()).unwrap_or_else(|| "user".to_string());
    let bot_id = ctx.bot_name.clone().or_else(|| ctx.bot_id.clone()).unwrap_or_else(|| "assistant".to_string());
    let initiator = Participant::new(user_id, participant_type(ctx.user_type.as_deref(), ParticipantType::Human));
    let responder = Participant::new(bot_id, participant_type(ctx.bot_type.as_deref(), ParticipantType::AiModel));
    let model = ctx.bot_model.clone().map(|model_id| ModelMetadata { model_id, provider: None });
    Conversation::new(initiator, responder, model, None)
}

/// `POST /v1/check` (spec.md §6).
pub async fn check(State(state): State<Arc<AppState>>, Json(req): Json<CheckRequest>) -> impl IntoResponse {
    let started = Instant::now();
    let preset = req.preset.as_deref().unwrap_or(&state.default_preset);

    let pipeline = match state.pipeline_for(preset) {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };

    let conversation = req.context.as_ref().and_then(|ctx| {
        ctx.session_id
            .as_ref()
            .map(|sid| state.conversation_for(sid, || build_conversation(ctx)))
    });
    let principal = req.context.as_ref().and_then(|ctx| {
        ctx.user_id.as_ref().map(|uid| match &ctx.role {
            Some(role) => Principal::with_role(uid.clone(), role.clone()),
            None => Principal::new(uid.clone()),
        })
    });

    let result = match req.kind {
        CheckKind::Prompt => {
            pipeline
                .check_input(&req.text, conversation.as_deref(), principal.as_ref())
                .await
        }
        CheckKind::Response => {
            pipeline
                .check_output(&req.text, conversation.as_deref(), principal.as_ref())
                .await
        }
    };

    let result = match result {
        Ok(r) => r,
        Err(err) => return err.into_response(),
    };

    let processing_time_ms = started.elapsed().as_millis() as u64;
    let guardrails_triggered: Vec<String> = result
        .details
        .values()
        .filter(|d| d.action != Action::Allow)
        .map(|d| d.guardrail_name.clone())
        .collect();

    let action = if result.blocked {
        "block"
    } else if !result.warnings.is_empty() {
        "warn"
    } else {
        "allow"
    };

    let body = Json(CheckResponse {
        action,
        reasons: result.reasons.clone(),
        warnings: result.warnings.clone(),
        metadata: CheckResponseMetadata {
            guardrails_triggered,
            processing_time_ms,
        },
    });

    if result.blocked && result.details.contains_key("rate_limit") {
        let detail = &result.details["rate_limit"];
        let mut headers = HeaderMap::new();
        if let Some(limit) = detail.details.get("limit").and_then(|v| v.as_u64()) {
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
        }
        if let Some(remaining) = detail.details.get("remaining").and_then(|v| v.as_u64()) {
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
        }
        if let Some(reset_after) = detail.details.get("reset_after_secs").and_then(|v| v.as_u64()) {
            headers.insert("x-ratelimit-reset", HeaderValue::from(reset_after));
            headers.insert("retry-after", HeaderValue::from(reset_after));
        }
        return (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response();
    }

    (StatusCode::OK, body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RulesQuery {
    pub preset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    #[serde(flatten)]
    pub spec: crate::guardrails::registry::PipelineSpec,
    pub version: String,
}

/// `GET /v1/rules?preset=<name>` (spec.md §6).
pub async fn rules(State(state): State<Arc<AppState>>, Query(q): Query<RulesQuery>) -> impl IntoResponse {
    let name = q.preset.as_deref().unwrap_or(&state.default_preset);
    match crate::preset::load_preset(name) {
        Ok(spec) => {
            let version = crate::preset::version_of(&spec);
            Json(RulesResponse { spec, version }).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pipeline_available: bool,
    pub guardrail_count: usize,
    pub api_key_configured: bool,
}

/// `GET /health` (spec.md §6).
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = state.pipeline_for(&state.default_preset).ok();
    let guardrail_count = pipeline.as_ref().map(|p| p.guardrail_count()).unwrap_or(0);
    Json(HealthResponse {
        status: if pipeline.is_some() { "ok" } else { "degraded" },
        pipeline_available: pipeline.is_some(),
        guardrail_count,
        api_key_configured: state.classifier_api_key_configured,
    })
}
