//! Remote-classifier capability and the generic guardrail wrapper around it
//! (spec.md §4.1, §6).
//!
//! `RemoteClassifier` is the external collaborator contract; a single HTTP
//! implementation (`HttpClassifier`) is provided using `reqwest` for the
//! upstream call. The wrapper degrades to a configured local sibling
//! guardrail on failure rather than only falling back to a static
//! `on_error` action, per spec.md §4.1's "degrade to `allow` or to a
//! pattern-based sibling" clause.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierTask {
    Moderation,
    Injection,
    Pii,
    Toxicity,
    CodeGen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierResult {
    /// Risk score in `[0, 100]`.
    pub score: f32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    BadResponse(String),
}

/// The external `RemoteClassifier` capability (spec.md §6). Only its
/// contract belongs to the core; concrete providers are out of scope.
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        task: ClassifierTask,
        options: &serde_json::Value,
    ) -> Result<ClassifierResult, ClassifierError>;
}

/// A single HTTP-backed implementation using `reqwest`, speaking a small
/// JSON protocol: `POST {endpoint} {text, task, options} -> {score, labels, raw}`.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        HttpClassifier {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl RemoteClassifier for HttpClassifier {
    async fn classify(
        &self,
        text: &str,
        task: ClassifierTask,
        options: &serde_json::Value,
    ) -> Result<ClassifierResult, ClassifierError> {
        let mut req = self.client.post(&self.endpoint).json(&json!({
            "text": text,
            "task": task,
            "options": options,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout
            } else {
                ClassifierError::Transport(e.to_string())
            }
        })?;
        resp.json::<ClassifierResult>()
            .await
            .map_err(|e| ClassifierError::BadResponse(e.to_string()))
    }
}

/// Wraps any pattern-based guardrail with an optional remote call, blending
/// per spec.md §4.1: on remote failure, apply `on_error`, optionally
/// falling back to `local_sibling`'s verdict instead of a bare allow/block.
pub struct RemoteClassifierGuardrail {
    name: String,
    kind: String,
    on_error: OnError,
    task: ClassifierTask,
    classifier: Arc<dyn RemoteClassifier>,
    local_sibling: Option<Arc<dyn Guardrail>>,
    block_threshold: f32,
    warn_threshold: f32,
    request_timeout: Duration,
}

impl RemoteClassifierGuardrail {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        task: ClassifierTask,
        classifier: Arc<dyn RemoteClassifier>,
        on_error: OnError,
        warn_threshold: f32,
        block_threshold: f32,
    ) -> Self {
        RemoteClassifierGuardrail {
            name: name.into(),
            kind: kind.into(),
            on_error,
            task,
            classifier,
            local_sibling: None,
            block_threshold,
            warn_threshold,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_local_sibling(mut self, sibling: Arc<dyn Guardrail>) -> Self {
        self.local_sibling = Some(sibling);
        self
    }
}

#[async_trait]
impl Guardrail for RemoteClassifierGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn enabled(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.request_timeout
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn analyze(&self, content: &str, conversation: Option<&Conversation>) -> Decision {
        match self.classifier.classify(content, self.task, &json!({})).await {
            Ok(result) => {
                let confidence = result.score / 100.0;
                let action = if confidence >= self.block_threshold {
                    Action::Block
                } else if confidence >= self.warn_threshold {
                    Action::Warn
                } else {
                    Action::Allow
                };
                if action == Action::Allow {
                    return Decision::allow(&self.name, self.kind());
                }
                Decision {
                    action,
                    confidence,
                    reason: format!("remote classifier flagged content: {}", result.labels.join(", ")),
                    details: json!({ "score": result.score, "labels": result.labels }),
                    guardrail_name: self.name.clone(),
                    guardrail_kind: self.kind.clone(),
                }
            }
            Err(cause) => {
                if let Some(sibling) = &self.local_sibling {
                    let mut decision = sibling.analyze(content, conversation).await;
                    decision.guardrail_name = self.name.clone();
                    decision.guardrail_kind = self.kind.clone();
                    decision.reason = format!("remote unavailable ({cause}), degraded to local sibling: {}", decision.reason);
                    return decision;
                }
                self.on_error.to_decision(&self.name, &self.kind, &cause.to_string())
            }
        }
    }
}
