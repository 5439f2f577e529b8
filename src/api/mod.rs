//! The HTTP surface (spec.md §6): `POST /v1/check`, `GET /v1/rules`, `GET /health`.
//!
//! A `Router::new()` built from route declarations nested under one
//! prefix, handed a shared state struct, with no org/auth-role layer.
//! Per spec.md §1 the HTTP server itself is an external collaborator —
//! only its contract (§6) is part of the core; this module is the thin
//! adapter that satisfies that contract over the library's `Pipeline`.

pub mod handlers;

use crate::conversation::Conversation;
use crate::guardrails::registry::{PipelineCache, Registry, RegistryContext};
use crate::rate_limiter::RateLimiter;
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared application state for the `stinger-server` binary's router.
/// Holds the process-wide registry, the per-preset pipeline cache (spec.md
/// §5: "safe under concurrent readers and occasional writers"), the
/// process-wide rate limiter and audit trail, and a session table mapping
/// an HTTP caller's `sessionId` to the `Conversation` it threads across
/// calls (the HTTP layer's only stateful concession — `Conversation`
/// itself has no opinion on how a caller obtains one).
pub struct AppState {
    pub registry: Registry,
    pub cache: PipelineCache,
    pub registry_ctx: RegistryContext,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<crate::audit::AuditTrail>,
    pub default_preset: String,
    pub classifier_api_key_configured: bool,
    sessions: DashMap<String, Arc<Conversation>>,
}

impl AppState {
    pub fn new(
        registry: Registry,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<crate::audit::AuditTrail>,
        default_preset: impl Into<String>,
        registry_ctx: RegistryContext,
        classifier_api_key_configured: bool,
    ) -> Self {
        AppState {
            registry,
            cache: PipelineCache::new(),
            registry_ctx,
            rate_limiter,
            audit,
            default_preset: default_preset.into(),
            classifier_api_key_configured,
            sessions: DashMap::new(),
        }
    }

    /// Builds (or reuses, via `self.cache`) the `Pipeline` for `preset`.
    pub fn pipeline_for(&self, preset: &str) -> crate::error::Result<crate::pipeline::Pipeline> {
        let spec = crate::preset::load_preset(preset)?;
        let built = self
            .cache
            .get_or_build(preset, &self.registry, &spec, &self.registry_ctx)?;
        let (input, output) = built.as_ref().clone();
        Ok(crate::pipeline::Pipeline::new(
            input,
            output,
            self.rate_limiter.clone(),
            self.audit.clone(),
        ))
    }

    /// Looks up the `Conversation` for a session id, creating it with the
    /// given factory on first use. Conversations persist for the lifetime
    /// of the process (spec.md §3: "never destroyed by the pipeline").
    pub fn conversation_for(&self, session_id: &str, make: impl FnOnce() -> Conversation) -> Arc<Conversation> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/check", post(handlers::check))
        .route("/v1/rules", get(handlers::rules))
        .route("/health", get(handlers::health))
        .with_state(state)
}
