//! Pattern-based PII detector and its shared pattern catalog (spec.md §4.1).
//!
//! The `BUILTIN_PATTERNS` table is shared by both this guardrail and
//! `crate::audit::redact` so the set of things considered "PII" never
//! drifts between enforcement and redaction.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::time::Duration;

pub struct PiiPattern {
    pub name: &'static str,
    pub regex: &'static Lazy<Regex>,
    pub replacement: &'static str,
}

static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap());
static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\b").unwrap()
});
static IBAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b").unwrap());
static PASSPORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{6,9}\b").unwrap());
static AWS_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bAKIA[0-9A-Z]{16}\b").unwrap());

pub static BUILTIN_PATTERNS: &[PiiPattern] = &[
    PiiPattern {
        name: "ssn",
        regex: &SSN_RE,
        replacement: "[REDACTED_SSN]",
    },
    PiiPattern {
        name: "email",
        regex: &EMAIL_RE,
        replacement: "[REDACTED_EMAIL]",
    },
    PiiPattern {
        name: "credit_card",
        regex: &CREDIT_CARD_RE,
        replacement: "[REDACTED_CREDIT_CARD]",
    },
    PiiPattern {
        name: "phone",
        regex: &PHONE_RE,
        replacement: "[REDACTED_PHONE]",
    },
    PiiPattern {
        name: "ipv4",
        regex: &IPV4_RE,
        replacement: "[REDACTED_IP]",
    },
    PiiPattern {
        name: "iban",
        regex: &IBAN_RE,
        replacement: "[REDACTED_IBAN]",
    },
    PiiPattern {
        name: "passport",
        regex: &PASSPORT_RE,
        replacement: "[REDACTED_PASSPORT]",
    },
    PiiPattern {
        name: "aws_key",
        regex: &AWS_KEY_RE,
        replacement: "[REDACTED_AWS_KEY]",
    },
];

pub struct PiiGuardrail {
    name: String,
    on_error: OnError,
    block: bool,
    /// Subset of `BUILTIN_PATTERNS` names to check; empty = all.
    categories: Vec<String>,
}

impl PiiGuardrail {
    pub fn new(name: impl Into<String>, categories: Vec<String>, block: bool, on_error: OnError) -> Self {
        PiiGuardrail {
            name: name.into(),
            on_error,
            block,
            categories,
        }
    }

    fn active_patterns(&self) -> impl Iterator<Item = &'static PiiPattern> {
        BUILTIN_PATTERNS
            .iter()
            .filter(move |p| self.categories.is_empty() || self.categories.iter().any(|c| c == p.name))
    }
}

#[async_trait]
impl Guardrail for PiiGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "pii"
    }

    fn enabled(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn analyze(&self, content: &str, _conversation: Option<&Conversation>) -> Decision {
        let hits: Vec<&str> = self
            .active_patterns()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.name)
            .collect();
        if hits.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }
        Decision {
            action: if self.block { Action::Block } else { Action::Warn },
            confidence: 1.0,
            reason: format!("detected PII: {}", hits.join(", ")),
            details: json!({ "categories": hits }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}
