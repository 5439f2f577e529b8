//! The `Guardrail` capability and its built-in variants (spec.md §4.1).
//!
//! Local, pattern-based checkers built around precompiled `Regex`/
//! `RegexSet` statics, plus remote-classifier variants that wrap a single
//! HTTP call behind a timeout and an `on_error` degrade policy. Every
//! guardrail — local or remote — implements the same `async_trait`
//! contract, since remote calls must suspend; local guardrails simply
//! never await.

pub mod code_gen;
pub mod injection;
pub mod keyword;
pub mod length;
pub mod pii;
pub mod regex_guard;
pub mod registry;
pub mod remote;
pub mod toxicity;
pub mod topic;
pub mod url_filter;

use crate::conversation::Conversation;
use crate::decision::Decision;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub checked: u64,
    pub errored: u64,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        HealthStatus {
            status: HealthState::Healthy,
            last_error: None,
            checked: 0,
            errored: 0,
        }
    }
}

/// The capability set every guardrail variant implements (spec.md §4.1).
/// `analyze` must be side-effect-free with respect to `conversation` — it
/// may read turns but never mutate them; the pipeline owns all writes.
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn enabled(&self) -> bool;
    fn timeout(&self) -> Duration;
    fn on_error(&self) -> crate::decision::OnError;

    async fn analyze(&self, content: &str, conversation: Option<&Conversation>) -> Decision;

    async fn health(&self) -> HealthStatus {
        HealthStatus::healthy()
    }
}

/// Runs `guardrail.analyze` under its declared timeout, converting a
/// timeout into the guardrail's own `on_error` policy (spec.md §4.1, §4.5
/// step 4).
pub async fn analyze_with_timeout(
    guardrail: &dyn Guardrail,
    content: &str,
    conversation: Option<&Conversation>,
) -> Decision {
    match tokio::time::timeout(guardrail.timeout(), guardrail.analyze(content, conversation)).await {
        Ok(decision) => decision,
        Err(_) => guardrail
            .on_error()
            .to_decision(guardrail.name(), guardrail.kind(), "timed out"),
    }
}
